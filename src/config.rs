//! Configuration types for manual processing.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. The two hosted asset services carry their
//! own sub-configs ([`TripoConfig`], [`FishAudioConfig`]) because they are
//! independently optional: a run with `generate_3d = false` never looks at
//! the Tripo settings.

use crate::error::GuideError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default narration voice, as accepted by the Fish Audio `voice` field.
pub const DEFAULT_VOICE_ID: &str = "zh_CN-female-1";

/// Configuration for processing one manual.
///
/// # Example
/// ```rust
/// use threedocs::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .volume_dir("/srv/threedocs/volume")
///     .voice_id("en_US-female-1")
///     .generate_3d(false)
///     .build()
///     .unwrap();
/// assert!(config.generate_tts);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory holding uploaded PDFs and every derived artifact. Default: `volume`.
    pub volume_dir: PathBuf,

    /// SQLite database file. Default: `volume/instructions.db`.
    pub database_path: PathBuf,

    /// Voice used for narration. Default: [`DEFAULT_VOICE_ID`].
    pub voice_id: String,

    /// Synthesize narration for each step. Default: true.
    pub generate_tts: bool,

    /// Generate a 3D model for each step image. Default: true.
    pub generate_3d: bool,

    /// Maximum in-flight requests per asset group. Default: 4.
    ///
    /// TTS and 3D groups run side by side, so the total number of open
    /// requests can reach twice this value.
    pub concurrency: usize,

    /// Encoded images smaller than this are treated as icons and dropped. Default: 1024.
    pub min_image_bytes: usize,

    /// Images above this size are re-encoded before the vision call. Default: 1 MiB.
    pub max_vision_image_bytes: usize,

    /// Images per vision request; 0 sends every image in one request. Default: 0.
    pub images_per_request: usize,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai", "anthropic").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for the vision call. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens the vision model may generate. Default: 8192.
    ///
    /// The response holds one JSON entry per image; manuals with fifty
    /// images easily pass 4 000 tokens.
    pub max_tokens: usize,

    /// Maximum retry attempts on a transient API failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-request timeout for hosted services in seconds. Default: 180.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Custom system prompt for the vision call. If None, uses the built-in one.
    pub system_prompt: Option<String>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// 3D generation service settings.
    pub tripo: TripoConfig,

    /// Text-to-speech service settings.
    pub fish_audio: FishAudioConfig,

    /// Optional per-stage progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            volume_dir: PathBuf::from("volume"),
            database_path: PathBuf::from("volume").join("instructions.db"),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            generate_tts: true,
            generate_3d: true,
            concurrency: 4,
            min_image_bytes: 1024,
            max_vision_image_bytes: 1024 * 1024,
            images_per_request: 0,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.2,
            max_tokens: 8192,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 180,
            download_timeout_secs: 120,
            system_prompt: None,
            password: None,
            tripo: TripoConfig::default(),
            fish_audio: FishAudioConfig::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("volume_dir", &self.volume_dir)
            .field("database_path", &self.database_path)
            .field("voice_id", &self.voice_id)
            .field("generate_tts", &self.generate_tts)
            .field("generate_3d", &self.generate_3d)
            .field("concurrency", &self.concurrency)
            .field("min_image_bytes", &self.min_image_bytes)
            .field("max_vision_image_bytes", &self.max_vision_image_bytes)
            .field("images_per_request", &self.images_per_request)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("tripo", &self.tripo)
            .field("fish_audio", &self.fish_audio)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set the volume directory. The database path follows it unless set explicitly afterwards.
    pub fn volume_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.config.database_path = dir.join("instructions.db");
        self.config.volume_dir = dir;
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    pub fn voice_id(mut self, voice: impl Into<String>) -> Self {
        self.config.voice_id = voice.into();
        self
    }

    pub fn generate_tts(mut self, v: bool) -> Self {
        self.config.generate_tts = v;
        self
    }

    pub fn generate_3d(mut self, v: bool) -> Self {
        self.config.generate_3d = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn min_image_bytes(mut self, n: usize) -> Self {
        self.config.min_image_bytes = n;
        self
    }

    pub fn max_vision_image_bytes(mut self, n: usize) -> Self {
        self.config.max_vision_image_bytes = n.max(16 * 1024);
        self
    }

    pub fn images_per_request(mut self, n: usize) -> Self {
        self.config.images_per_request = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn tripo(mut self, tripo: TripoConfig) -> Self {
        self.config.tripo = tripo;
        self
    }

    pub fn fish_audio(mut self, fish: FishAudioConfig) -> Self {
        self.config.fish_audio = fish;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, GuideError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(GuideError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.voice_id.trim().is_empty() {
            return Err(GuideError::InvalidConfig("Voice ID must not be empty".into()));
        }
        if c.tripo.poll_interval_ms == 0 {
            return Err(GuideError::InvalidConfig(
                "Tripo poll interval must be > 0 ms".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Service configs ──────────────────────────────────────────────────────

/// Settings for the Tripo 3D generation API.
#[derive(Clone)]
pub struct TripoConfig {
    /// API key. Falls back to `TRIPO_API_KEY` when the client is built.
    pub api_key: Option<String>,
    /// OpenAPI base URL, without trailing slash.
    pub base_url: String,
    /// Delay between task status polls. Default: 2000 ms.
    pub poll_interval_ms: u64,
    /// Give up on a task after this long. Default: 600 s.
    pub task_timeout_secs: u64,
}

impl Default for TripoConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.tripo3d.ai/v2/openapi".to_string(),
            poll_interval_ms: 2000,
            task_timeout_secs: 600,
        }
    }
}

impl fmt::Debug for TripoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TripoConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("task_timeout_secs", &self.task_timeout_secs)
            .finish()
    }
}

/// Settings for the Fish Audio text-to-speech API.
#[derive(Clone)]
pub struct FishAudioConfig {
    /// API key. Falls back to `FISH_AUDIO_API_KEY` when the client is built.
    pub api_key: Option<String>,
    /// Service root, without trailing slash.
    pub base_url: String,
    /// Speech model. Default: `fish-speech-1`.
    pub model: String,
    /// Audio container requested from the service. Default: `mp3`.
    pub format: String,
}

impl Default for FishAudioConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.fish.audio".to_string(),
            model: "fish-speech-1".to_string(),
            format: "mp3".to_string(),
        }
    }
}

impl fmt::Debug for FishAudioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FishAudioConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("format", &self.format)
            .finish()
    }
}

/// Resolve an API key from an explicit value or an environment variable.
pub(crate) fn resolve_api_key(
    explicit: Option<&str>,
    env_var: &str,
    provider: &str,
) -> Result<String, GuideError> {
    if let Some(key) = explicit.filter(|k| !k.trim().is_empty()) {
        return Ok(key.to_string());
    }
    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(GuideError::ProviderNotConfigured {
            provider: provider.to_string(),
            hint: format!("Set {env_var} or pass the key explicitly."),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.volume_dir, PathBuf::from("volume"));
        assert_eq!(c.database_path, PathBuf::from("volume/instructions.db"));
        assert_eq!(c.voice_id, DEFAULT_VOICE_ID);
        assert!(c.generate_tts && c.generate_3d);
        assert_eq!(c.min_image_bytes, 1024);
        assert_eq!(c.max_vision_image_bytes, 1024 * 1024);
        assert_eq!(c.fish_audio.model, "fish-speech-1");
    }

    #[test]
    fn volume_dir_moves_database() {
        let c = PipelineConfig::builder().volume_dir("/data").build().unwrap();
        assert_eq!(c.database_path, PathBuf::from("/data/instructions.db"));

        let c = PipelineConfig::builder()
            .volume_dir("/data")
            .database_path("/db/steps.db")
            .build()
            .unwrap();
        assert_eq!(c.database_path, PathBuf::from("/db/steps.db"));
    }

    #[test]
    fn builder_clamps_concurrency() {
        let c = PipelineConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn empty_voice_is_rejected() {
        let err = PipelineConfig::builder().voice_id("  ").build().unwrap_err();
        assert!(matches!(err, GuideError::InvalidConfig(_)));
    }

    #[test]
    fn debug_redacts_keys() {
        let tripo = TripoConfig {
            api_key: Some("tsk_secret".into()),
            ..TripoConfig::default()
        };
        let rendered = format!("{tripo:?}");
        assert!(!rendered.contains("tsk_secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn explicit_key_wins() {
        let key = resolve_api_key(Some("abc"), "THREEDOCS_TEST_UNSET_KEY", "tripo").unwrap();
        assert_eq!(key, "abc");
    }

    #[test]
    fn missing_key_is_provider_not_configured() {
        let err = resolve_api_key(None, "THREEDOCS_TEST_DEFINITELY_UNSET", "fish-audio").unwrap_err();
        match err {
            GuideError::ProviderNotConfigured { provider, hint } => {
                assert_eq!(provider, "fish-audio");
                assert!(hint.contains("THREEDOCS_TEST_DEFINITELY_UNSET"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
