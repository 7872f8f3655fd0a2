//! Stage 4: narration through the Fish Audio text-to-speech API.

use crate::config::{resolve_api_key, FishAudioConfig};
use crate::error::GuideError;
use crate::layout::write_atomic;
use crate::pipeline::retry::with_backoff;
use crate::services::SpeechSynthesizer;
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SERVICE: &str = "fish-audio";

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    model: &'a str,
    voice: &'a str,
    format: &'a str,
}

/// Client for `POST {base_url}/v1/tts`.
#[derive(Debug, Clone)]
pub struct FishAudioClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    format: String,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl FishAudioClient {
    /// Build a client; the key comes from the config or `FISH_AUDIO_API_KEY`.
    pub fn new(
        config: &FishAudioConfig,
        request_timeout_secs: u64,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self, GuideError> {
        let api_key =
            resolve_api_key(config.api_key.as_deref(), "FISH_AUDIO_API_KEY", SERVICE)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|source| GuideError::Http {
                service: SERVICE,
                source,
            })?;
        Ok(Self {
            http,
            api_key,
            endpoint: format!("{}/v1/tts", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            format: config.format.clone(),
            max_retries,
            retry_backoff_ms,
        })
    }

    async fn request_audio(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, GuideError> {
        let body = TtsRequest {
            text,
            model: &self.model,
            voice: voice_id,
            format: &self.format,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| GuideError::Http {
                service: SERVICE,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.to_lowercase().contains("voice") {
                return Err(GuideError::InvalidVoice {
                    voice_id: voice_id.to_string(),
                });
            }
            return Err(GuideError::TtsApiError {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|source| GuideError::Http {
            service: SERVICE,
            source,
        })?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for FishAudioClient {
    async fn synthesize(&self, text: &str, voice_id: &str, dest: &Path) -> Result<(), GuideError> {
        debug!("Synthesizing {} characters with voice {}", text.chars().count(), voice_id);
        let audio = with_backoff("fish-audio tts", self.max_retries, self.retry_backoff_ms, || {
            self.request_audio(text, voice_id)
        })
        .await?;
        write_atomic(dest, &audio).await?;
        info!(
            "Audio saved to {} ({:.1} KB)",
            dest.display(),
            audio.len() as f64 / 1024.0
        );
        Ok(())
    }
}

/// Split an instruction file into `(title, description)`.
///
/// The title is everything before the first blank line. A file without a
/// blank line is all description.
pub fn split_instruction(contents: &str) -> (Option<&str>, &str) {
    let contents = contents.trim();
    match contents.split_once("\n\n") {
        Some((title, description)) => {
            let title = title.trim();
            ((!title.is_empty()).then_some(title), description.trim())
        }
        None => (None, contents),
    }
}

/// Text to narrate for an instruction file: the description, or the title
/// when the description is empty.
pub fn narration_text(contents: &str) -> &str {
    match split_instruction(contents) {
        (Some(title), "") => title,
        (_, description) => description,
    }
}

/// Read an instruction file and narrate it into `dest`.
pub async fn synthesize_instruction_file(
    synth: &dyn SpeechSynthesizer,
    instruction_path: &Path,
    voice_id: &str,
    dest: &Path,
) -> Result<(), GuideError> {
    let contents = tokio::fs::read_to_string(instruction_path)
        .await
        .map_err(|e| GuideError::io(instruction_path, e))?;
    let text = narration_text(&contents);
    if text.is_empty() {
        return Err(GuideError::Internal(format!(
            "instruction file {} is empty",
            instruction_path.display()
        )));
    }
    synth.synthesize(text, voice_id, dest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> FishAudioClient {
        let config = FishAudioConfig {
            api_key: Some("fa_test".into()),
            base_url: server.uri(),
            ..FishAudioConfig::default()
        };
        FishAudioClient::new(&config, 10, 2, 1).unwrap()
    }

    #[test]
    fn split_title_and_description() {
        let (title, desc) = split_instruction("Remove cover\n\nUnscrew the four screws.\n");
        assert_eq!(title, Some("Remove cover"));
        assert_eq!(desc, "Unscrew the four screws.");
    }

    #[test]
    fn file_without_blank_line_is_description() {
        let (title, desc) = split_instruction("Just press the button.");
        assert_eq!(title, None);
        assert_eq!(desc, "Just press the button.");
    }

    #[test]
    fn empty_description_narrates_title() {
        assert_eq!(narration_text("Attach the leg\n\n"), "Attach the leg");
        assert_eq!(narration_text("Attach the leg\n\nUse bolt A."), "Use bolt A.");
    }

    #[tokio::test]
    async fn synthesize_posts_payload_and_saves_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tts"))
            .and(header("authorization", "Bearer fa_test"))
            .and(body_json(json!({
                "text": "Unscrew the four screws.",
                "model": "fish-speech-1",
                "voice": "en_US-male-2",
                "format": "mp3"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3audio".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc-1.mp3");
        client(&server)
            .synthesize("Unscrew the four screws.", "en_US-male-2", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"ID3audio");
    }

    #[tokio::test]
    async fn voice_complaint_is_invalid_voice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tts"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Unknown Voice id"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = client(&server)
            .synthesize("hi", "xx-robot", &dir.path().join("a.mp3"))
            .await
            .unwrap_err();
        match err {
            GuideError::InvalidVoice { voice_id } => assert_eq!(voice_id, "xx-robot"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn other_failures_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tts"))
            .respond_with(ResponseTemplate::new(402).set_body_string("payment required"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.mp3");
        let err = client(&server).synthesize("hi", "v", &dest).await.unwrap_err();
        match err {
            GuideError::TtsApiError { status, body } => {
                assert_eq!(status, 402);
                assert_eq!(body, "payment required");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn instruction_file_is_narrated_by_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tts"))
            .and(body_json(json!({
                "text": "Slide the tray out.",
                "model": "fish-speech-1",
                "voice": "zh_CN-female-1",
                "format": "mp3"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mp3".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let instruction = dir.path().join("abc-2.txt");
        std::fs::write(&instruction, "Open tray\n\nSlide the tray out.").unwrap();
        let dest = dir.path().join("abc-2.mp3");

        let synth = client(&server);
        synthesize_instruction_file(&synth, &instruction, "zh_CN-female-1", &dest)
            .await
            .unwrap();
        assert!(dest.exists());
    }
}
