//! Stage 2: ask a vision-language model which images are steps.
//!
//! This module builds the request and runs it; prompt text lives in
//! [`crate::prompts`] and reply repair in [`crate::pipeline::postprocess`].
//!
//! ## Batching
//!
//! With `images_per_request = 0` the whole manual goes out in one request,
//! which gives the model every image for context. Large manuals can exceed a
//! provider's per-request image limit; a positive value splits the images
//! into consecutive batches, each sent with the full manual text and labelled
//! with absolute indices so the replies can be concatenated.
//!
//! ## Retry Strategy
//!
//! Every provider failure is retried through
//! [`crate::pipeline::retry::retry_when`] (doubling waits, capped). A reply
//! that cannot be parsed counts as a failure. Once retries run out the batch
//! fails with [`GuideError::VisionFailed`] carrying the last error.

use crate::config::PipelineConfig;
use crate::error::GuideError;
use crate::layout::VolumeLayout;
use crate::output::{ExtractedManual, ImageMatch, StepAnalysis};
use crate::pipeline::retry::retry_when;
use crate::pipeline::{encode, postprocess};
use crate::prompts::{user_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::services::StepAnalyzer;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1-nano";

/// [`StepAnalyzer`] backed by an edgequake-llm provider.
pub struct VisionStepAnalyzer {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    options: CompletionOptions,
    max_retries: u32,
    retry_backoff_ms: u64,
    max_image_bytes: usize,
    images_per_request: usize,
    concurrency: usize,
}

impl VisionStepAnalyzer {
    /// Analyzer over an already constructed provider.
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            options: build_options(config),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            max_image_bytes: config.max_vision_image_bytes,
            images_per_request: config.images_per_request,
            concurrency: config.concurrency,
        }
    }

    /// Resolve the provider from the config and environment, then build.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, GuideError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }

    async fn request_batch(
        &self,
        manual_text: &str,
        range: Range<usize>,
        images: Vec<ImageData>,
    ) -> Result<Vec<ImageMatch>, GuideError> {
        let start = Instant::now();
        let prompt = user_prompt(manual_text, range.len(), range.start);
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user_with_images(&prompt, images),
        ];
        let label = format!("Images {}..{}", range.start, range.end);

        let analysis = retry_when(&label, self.max_retries, self.retry_backoff_ms, |_| true, || {
            self.chat_once(&messages, &label, start)
        })
        .await
        .map_err(|e| GuideError::VisionFailed {
            retries: self.max_retries,
            message: match e {
                GuideError::VisionFailed { message, .. } => message,
                other => other.to_string(),
            },
        })?;

        Ok(rebase_indices(analysis.matches, &range))
    }
    /// One provider call; both transport errors and unparseable replies fail.
    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        label: &str,
        start: Instant,
    ) -> Result<StepAnalysis, GuideError> {
        let response = self
            .provider
            .chat(messages, Some(&self.options))
            .await
            .map_err(|e| GuideError::VisionFailed {
                retries: 0,
                message: e.to_string(),
            })?;
        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            label,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        postprocess::parse_response(&response.content)
    }
}

#[async_trait]
impl StepAnalyzer for VisionStepAnalyzer {
    async fn analyze(
        &self,
        manual: &ExtractedManual,
        layout: &VolumeLayout,
    ) -> Result<StepAnalysis, GuideError> {
        if manual.images.is_empty() {
            info!("No images to analyze");
            return Ok(StepAnalysis::default());
        }

        let max_bytes = self.max_image_bytes;
        let paths: Vec<PathBuf> = manual
            .images
            .iter()
            .map(|img| layout.path(&img.filename))
            .collect();
        let encoded: Vec<ImageData> = stream::iter(paths.into_iter().map(move |path| async move {
            encode::encode_for_vision(&path, max_bytes).await
        }))
        .buffered(self.concurrency)
        .try_collect()
        .await?;

        let ranges = batch_ranges(encoded.len(), self.images_per_request);
        info!(
            "Analyzing {} images in {} request(s)",
            encoded.len(),
            ranges.len()
        );

        let text = manual.text.as_str();
        let batches: Vec<Vec<ImageMatch>> = stream::iter(ranges.into_iter().map(|range| {
            let images = encoded[range.clone()].to_vec();
            self.request_batch(text, range, images)
        }))
        .buffered(self.concurrency)
        .try_collect()
        .await?;

        let matches: Vec<ImageMatch> = batches.into_iter().flatten().collect();
        info!(
            "Vision analysis: {} matches, {} instructional",
            matches.len(),
            matches.iter().filter(|m| m.is_instruction).count()
        );
        Ok(StepAnalysis { matches })
    }
}

/// Build `CompletionOptions` from the pipeline config.
fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Consecutive index ranges of at most `per_request` images (all at once when 0).
pub(crate) fn batch_ranges(count: usize, per_request: usize) -> Vec<Range<usize>> {
    if count == 0 {
        return Vec::new();
    }
    let size = if per_request == 0 { count } else { per_request };
    (0..count)
        .step_by(size)
        .map(|start| start..(start + size).min(count))
        .collect()
}

/// Make every match's `image_index` absolute for its batch.
///
/// Models sometimes number from zero within a batch despite the labels; an
/// index that is not in `range` but fits the batch is shifted, anything else
/// falls back to the match's position.
pub(crate) fn rebase_indices(matches: Vec<ImageMatch>, range: &Range<usize>) -> Vec<ImageMatch> {
    matches
        .into_iter()
        .enumerate()
        .map(|(pos, mut m)| {
            m.image_index = match m.image_index {
                Some(i) if range.contains(&i) => Some(i),
                Some(i) if i < range.len() => Some(range.start + i),
                _ if pos < range.len() => Some(range.start + pos),
                _ => None,
            };
            m
        })
        .collect()
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, GuideError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        GuideError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn default_model_for(provider_name: &str) -> &'static str {
    if provider_name.eq_ignore_ascii_case("gemini") {
        DEFAULT_GEMINI_MODEL
    } else {
        DEFAULT_OPENAI_MODEL
    }
}

/// Resolve the vision provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **Gemini** when `GEMINI_API_KEY` is set.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, GuideError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or_else(|| default_model_for(name));
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL);
            return create_vision_provider("gemini", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| GuideError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY, or ANTHROPIC_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ExtractedImage;
    use edgequake_llm::MockProvider;

    #[test]
    fn build_options_defaults() {
        let config = PipelineConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.max_tokens, Some(8192));
    }

    #[test]
    fn zero_per_request_is_one_batch() {
        assert_eq!(batch_ranges(7, 0), vec![0..7]);
        assert!(batch_ranges(0, 0).is_empty());
    }

    #[test]
    fn batches_cover_every_image_once() {
        assert_eq!(batch_ranges(7, 3), vec![0..3, 3..6, 6..7]);
        assert_eq!(batch_ranges(6, 3), vec![0..3, 3..6]);
    }

    fn at(index: Option<usize>) -> ImageMatch {
        ImageMatch {
            image_index: index,
            ..ImageMatch::default()
        }
    }

    #[test]
    fn absolute_indices_are_kept() {
        let out = rebase_indices(vec![at(Some(4)), at(Some(5))], &(3..6));
        assert_eq!(out[0].image_index, Some(4));
        assert_eq!(out[1].image_index, Some(5));
    }

    #[test]
    fn relative_indices_are_shifted() {
        let out = rebase_indices(vec![at(Some(0)), at(Some(2))], &(3..6));
        assert_eq!(out[0].image_index, Some(3));
        assert_eq!(out[1].image_index, Some(5));
    }

    #[test]
    fn missing_indices_use_position() {
        let out = rebase_indices(vec![at(None), at(Some(99)), at(None), at(None)], &(3..6));
        let idx: Vec<_> = out.iter().map(|m| m.image_index).collect();
        assert_eq!(idx, vec![Some(3), Some(4), Some(5), None]);
    }

    #[test]
    fn gemini_gets_its_own_default_model() {
        assert_eq!(default_model_for("gemini"), DEFAULT_GEMINI_MODEL);
        assert_eq!(default_model_for("openai"), DEFAULT_OPENAI_MODEL);
    }

    async fn manual_with_images(dir: &std::path::Path, count: usize) -> ExtractedManual {
        let mut images = Vec::new();
        for index in 0..count {
            let filename = format!("img-{index}.png");
            tokio::fs::write(dir.join(&filename), [index as u8; 16])
                .await
                .unwrap();
            images.push(ExtractedImage {
                index,
                filename,
                page_number: 0,
                position: None,
                byte_len: 16,
            });
        }
        ExtractedManual {
            images,
            text: "Page 1:\nAssemble the frame.\n".into(),
            ..ExtractedManual::default()
        }
    }

    fn analyzer(mock: MockProvider, max_retries: u32) -> VisionStepAnalyzer {
        let provider: Arc<dyn LLMProvider> = Arc::new(mock);
        let config = PipelineConfig::builder()
            .images_per_request(2)
            .concurrency(1)
            .max_retries(max_retries)
            .retry_backoff_ms(0)
            .build()
            .unwrap();
        VisionStepAnalyzer::new(provider, &config)
    }

    #[tokio::test]
    async fn batches_retry_and_merge_into_steps() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VolumeLayout::new(dir.path());
        let manual = manual_with_images(dir.path(), 3).await;

        let mock = MockProvider::new();
        mock.add_response("not json at all").await;
        mock.add_response(
            "```json\n{\"matches\":[{\"image_index\":0,\"is_instruction\":true,\"instruction_title\":\"A\"},{\"image_index\":1,\"is_instruction\":false}]}\n```",
        )
        .await;
        mock.add_response(
            "[{\"image_index\":0,\"is_instruction\":true,\"instruction_description\":\"C\"}]",
        )
        .await;

        let analysis = analyzer(mock, 2).analyze(&manual, &layout).await.unwrap();
        let steps: Vec<_> = analysis
            .steps(manual.images.len())
            .into_iter()
            .map(|s| (s.step, s.image_index, s.title, s.description))
            .collect();
        assert_eq!(
            steps,
            vec![
                (1, 0, "A".to_string(), String::new()),
                (2, 2, "Step 2".to_string(), "C".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VolumeLayout::new(dir.path());
        let manual = manual_with_images(dir.path(), 1).await;

        // An empty queue answers with plain text, which never parses.
        let err = analyzer(MockProvider::new(), 2)
            .analyze(&manual, &layout)
            .await
            .unwrap_err();
        match err {
            GuideError::VisionFailed { retries, message } => {
                assert_eq!(retries, 2);
                assert!(!message.is_empty());
            }
            other => panic!("expected VisionFailed, got {other:?}"),
        }
    }
}
