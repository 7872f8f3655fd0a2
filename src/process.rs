//! Manual processing entry points.
//!
//! A run walks the five stages in order: hash the PDF, and when the hash is
//! new, extract images and text, analyze them into steps, and store the
//! steps; then generate whatever narration and 3D assets are still missing.
//!
//! ## Caching
//!
//! Every derived file is named from the content hash, and the step database
//! is keyed by it, so a second upload of the same manual costs one hash and
//! one lookup. Asset generation still runs on cache hits: an asset is only
//! produced when its file is absent, which makes a re-run the way to retry
//! failed steps.
//!
//! ## Asset fan-out
//!
//! Narration and 3D generation are independent per step and per kind. The
//! two groups run side by side, each with at most `concurrency` requests in
//! flight. A failed step is reported in [`ProcessReport::failures`] and does
//! not stop the others.

use crate::config::PipelineConfig;
use crate::error::{AssetKind, GuideError, StepError};
use crate::hash::ContentHash;
use crate::layout::VolumeLayout;
use crate::output::{ExtractedManual, PlannedStep, ProcessReport, StepAnalysis, StepRecord};
use crate::pipeline::extract::PdfiumExtractor;
use crate::pipeline::tripo::TripoClient;
use crate::pipeline::tts::{synthesize_instruction_file, FishAudioClient};
use crate::pipeline::vision::VisionStepAnalyzer;
use crate::pipeline::input;
use crate::progress::{NoopProgressCallback, PipelineProgressCallback, Stage};
use crate::services::{ManualExtractor, ModelGenerator, SpeechSynthesizer, StepAnalyzer};
use crate::store::{DocumentInfo, StepStore};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Process a PDF file path or URL with the default service implementations.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(ProcessReport)` once the steps are stored, even if some assets
/// failed (check `report.failures`).
///
/// # Errors
/// Returns `Err(GuideError)` only for fatal errors:
/// - File not found / not a PDF / download failed
/// - PDF engine unavailable or the PDF cannot be opened
/// - Vision analysis failed after all retries
/// - Database errors
pub async fn process_manual(
    input: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<ProcessReport, GuideError> {
    Pipeline::new(config.clone()).process(input.as_ref()).await
}

/// Save an uploaded PDF into the volume, then process it.
///
/// The file name must end in `.pdf`.
pub async fn process_upload(
    bytes: &[u8],
    filename: &str,
    config: &PipelineConfig,
) -> Result<ProcessReport, GuideError> {
    Pipeline::new(config.clone())
        .process_upload(bytes, filename)
        .await
}

/// The processing pipeline with swappable stage implementations.
///
/// Stages without an explicit implementation use the built-in one
/// ([`PdfiumExtractor`], [`VisionStepAnalyzer`], [`TripoClient`],
/// [`FishAudioClient`]), constructed only when the stage has work.
pub struct Pipeline {
    config: PipelineConfig,
    extractor: Option<Arc<dyn ManualExtractor>>,
    analyzer: Option<Arc<dyn StepAnalyzer>>,
    model_generator: Option<Arc<dyn ModelGenerator>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            extractor: None,
            analyzer: None,
            model_generator: None,
            synthesizer: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ManualExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn StepAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_model_generator(mut self, generator: Arc<dyn ModelGenerator>) -> Self {
        self.model_generator = Some(generator);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// True when a local `input_str` is already stored, so a run would skip
    /// extraction and analysis. URLs are never known without downloading.
    pub async fn is_processed(&self, input_str: &str) -> Result<bool, GuideError> {
        if input::is_url(input_str) || !self.config.database_path.exists() {
            return Ok(false);
        }
        let resolved = input::resolve_local(Path::new(input_str))?;
        let hash = ContentHash::of_file(resolved.path()).await?;
        let store = StepStore::open(&self.config.database_path).await?;
        store.is_processed(&hash).await
    }

    /// Process a local path or HTTP(S) URL.
    pub async fn process(&self, input_str: &str) -> Result<ProcessReport, GuideError> {
        info!("Starting processing: {}", input_str);
        let resolved = input::resolve_input(input_str, self.config.download_timeout_secs).await?;
        self.process_path(resolved.path(), &resolved.display_name(), None)
            .await
    }

    /// Save an upload into the volume, then process it.
    pub async fn process_upload(
        &self,
        bytes: &[u8],
        filename: &str,
    ) -> Result<ProcessReport, GuideError> {
        let layout = VolumeLayout::new(&self.config.volume_dir);
        let path = input::save_upload(bytes, filename, &layout).await?;
        self.process_path(&path, filename, Some(filename)).await
    }

    /// Process a PDF that is already on disk.
    ///
    /// `pdf_filename` is the PDF's name inside the volume, when it lives there.
    pub async fn process_path(
        &self,
        pdf_path: &Path,
        pdf_name: &str,
        pdf_filename: Option<&str>,
    ) -> Result<ProcessReport, GuideError> {
        let start = Instant::now();
        let noop = NoopProgressCallback;
        let cb: &dyn PipelineProgressCallback = match self.config.progress_callback {
            Some(ref cb) => cb.as_ref(),
            None => &noop,
        };

        // ── Stage 0: Hash ────────────────────────────────────────────────
        cb.on_stage(Stage::Hashing);
        let hash = ContentHash::of_file(pdf_path).await?;
        info!("PDF {} has hash {}", pdf_name, hash.key());

        let layout = VolumeLayout::new(&self.config.volume_dir);
        layout.ensure().await?;
        let store = StepStore::open(&self.config.database_path).await?;

        // ── Stages 1-3 (skipped on cache hit) ────────────────────────────
        let cached = store.is_processed(&hash).await?;
        if cached {
            let count = store.steps(&hash).await?.len();
            info!("Cache hit for {}: {} stored steps", hash.key(), count);
            cb.on_cache_hit(&hash.key(), count);
        } else {
            cb.on_stage(Stage::Extracting);
            let manual = self.extract(pdf_path, &hash, &layout).await?;

            cb.on_stage(Stage::Analyzing);
            let analysis = self.analyze(&manual, &layout).await?;
            let planned = analysis.steps(manual.images.len());
            info!(
                "{} of {} images are instructional steps",
                planned.len(),
                manual.images.len()
            );

            cb.on_stage(Stage::Storing);
            let records = write_instructions(&layout, &hash, pdf_name, &manual, &planned).await?;
            let doc = DocumentInfo {
                pdf_name,
                pdf_filename,
                image_count: manual.images.len(),
            };
            store.record_analysis(&hash, &doc, &records).await?;
        }

        // ── Stage 4: Assets ──────────────────────────────────────────────
        cb.on_stage(Stage::GeneratingAssets);
        let steps = store.steps(&hash).await?;
        let ctx = AssetContext {
            hash: &hash,
            layout: &layout,
            store: &store,
            cb,
            voice_id: &self.config.voice_id,
            concurrency: self.config.concurrency,
        };
        let AssetOutcome {
            voices,
            models,
            failures,
        } = self.generate_assets(&ctx, &steps).await;

        let tts_files_generated = self.config.generate_tts.then_some(voices);
        let models_generated = self.config.generate_3d.then_some(models);

        cb.on_complete(steps.len(), failures.len());
        let report = ProcessReport {
            pdf_hash: hash.key(),
            pdf_name: pdf_name.to_string(),
            cached,
            steps_processed: steps.len(),
            tts_files_generated,
            models_generated,
            failures,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Processed {}: {} steps, {} failures in {}ms",
            report.pdf_name,
            report.steps_processed,
            report.failures.len(),
            report.duration_ms
        );
        Ok(report)
    }

    async fn extract(
        &self,
        pdf_path: &Path,
        hash: &ContentHash,
        layout: &VolumeLayout,
    ) -> Result<ExtractedManual, GuideError> {
        match self.extractor {
            Some(ref extractor) => extractor.extract(pdf_path, hash, layout).await,
            None => {
                PdfiumExtractor::new(self.config.min_image_bytes, self.config.password.clone())
                    .extract(pdf_path, hash, layout)
                    .await
            }
        }
    }

    async fn analyze(
        &self,
        manual: &ExtractedManual,
        layout: &VolumeLayout,
    ) -> Result<StepAnalysis, GuideError> {
        if manual.images.is_empty() {
            info!("No images extracted; skipping vision analysis");
            return Ok(StepAnalysis::default());
        }
        match self.analyzer {
            Some(ref analyzer) => analyzer.analyze(manual, layout).await,
            None => {
                VisionStepAnalyzer::from_config(&self.config)?
                    .analyze(manual, layout)
                    .await
            }
        }
    }

    fn synthesizer(&self) -> Result<Arc<dyn SpeechSynthesizer>, GuideError> {
        if let Some(ref s) = self.synthesizer {
            return Ok(Arc::clone(s));
        }
        let c = &self.config;
        Ok(Arc::new(FishAudioClient::new(
            &c.fish_audio,
            c.api_timeout_secs,
            c.max_retries,
            c.retry_backoff_ms,
        )?))
    }

    fn model_generator(&self) -> Result<Arc<dyn ModelGenerator>, GuideError> {
        if let Some(ref g) = self.model_generator {
            return Ok(Arc::clone(g));
        }
        let c = &self.config;
        Ok(Arc::new(TripoClient::new(
            &c.tripo,
            c.api_timeout_secs,
            c.max_retries,
            c.retry_backoff_ms,
        )?))
    }

    /// Generate missing voice and model files.
    async fn generate_assets(&self, ctx: &AssetContext<'_>, steps: &[StepRecord]) -> AssetOutcome {
        let voice_pending = if self.config.generate_tts {
            ctx.pending(steps, AssetKind::Voice).await
        } else {
            Vec::new()
        };
        let model_pending = if self.config.generate_3d {
            ctx.pending(steps, AssetKind::Model).await
        } else {
            Vec::new()
        };

        let total = voice_pending.len() + model_pending.len();
        ctx.cb.on_assets_start(total);
        if total == 0 {
            debug!("All assets present");
            return AssetOutcome::default();
        }
        info!(
            "Generating {} voice and {} model files",
            voice_pending.len(),
            model_pending.len()
        );

        let voices = async {
            if voice_pending.is_empty() {
                return Vec::new();
            }
            match self.synthesizer() {
                Ok(synth) => ctx.run_voices(synth, &voice_pending).await,
                Err(e) => ctx.fail_all(&voice_pending, AssetKind::Voice, &e),
            }
        };
        let models = async {
            if model_pending.is_empty() {
                return Vec::new();
            }
            match self.model_generator() {
                Ok(generator) => ctx.run_models(generator, &model_pending).await,
                Err(e) => ctx.fail_all(&model_pending, AssetKind::Model, &e),
            }
        };

        let (mut failures, model_failures) = tokio::join!(voices, models);
        let outcome = AssetOutcome {
            voices: voice_pending.len() - failures.len(),
            models: model_pending.len() - model_failures.len(),
            failures: Vec::new(),
        };
        failures.extend(model_failures);
        failures.sort_by_key(|f| (f.step, f.kind == AssetKind::Model));
        AssetOutcome { failures, ..outcome }
    }
}

/// What one run's asset fan-out produced.
#[derive(Default)]
struct AssetOutcome {
    /// Voice files written by this run.
    voices: usize,
    /// Model files written by this run.
    models: usize,
    failures: Vec<StepError>,
}

/// Shared state for one manual's asset generation.
struct AssetContext<'a> {
    hash: &'a ContentHash,
    layout: &'a VolumeLayout,
    store: &'a StepStore,
    cb: &'a dyn PipelineProgressCallback,
    voice_id: &'a str,
    concurrency: usize,
}

impl AssetContext<'_> {
    fn filename(&self, kind: AssetKind, step: u32) -> String {
        match kind {
            AssetKind::Voice => VolumeLayout::voice_filename(self.hash, step),
            AssetKind::Model => VolumeLayout::model_filename(self.hash, step),
        }
    }

    /// Steps whose `kind` file is absent. Files already on disk but missing
    /// from the database are recorded on the way.
    async fn pending<'s>(&self, steps: &'s [StepRecord], kind: AssetKind) -> Vec<&'s StepRecord> {
        let mut pending = Vec::new();
        for step in steps {
            let source = match kind {
                AssetKind::Voice => &step.instruction_filename,
                AssetKind::Model => &step.image_filename,
            };
            if source.is_none() {
                continue;
            }

            let filename = self.filename(kind, step.step);
            if !self.layout.exists(&filename) {
                pending.push(step);
                continue;
            }

            let recorded = match kind {
                AssetKind::Voice => &step.voice_filename,
                AssetKind::Model => &step.model_filename,
            };
            if recorded.as_deref() != Some(filename.as_str()) {
                if let Err(e) = self
                    .store
                    .set_asset_filename(self.hash, step.step, kind, &filename)
                    .await
                {
                    warn!("Step {}: could not record existing {}: {}", step.step, filename, e);
                }
            }
        }
        pending
    }

    async fn run_voices(
        &self,
        synth: Arc<dyn SpeechSynthesizer>,
        steps: &[&StepRecord],
    ) -> Vec<StepError> {
        stream::iter(steps.iter().map(|step| {
            let synth = Arc::clone(&synth);
            async move {
                let result = self.voice_for(synth.as_ref(), step).await;
                self.finish(AssetKind::Voice, step.step, result).await
            }
        }))
        .buffer_unordered(self.concurrency)
        .filter_map(|r| async move { r })
        .collect()
        .await
    }

    async fn run_models(
        &self,
        generator: Arc<dyn ModelGenerator>,
        steps: &[&StepRecord],
    ) -> Vec<StepError> {
        stream::iter(steps.iter().map(|step| {
            let generator = Arc::clone(&generator);
            async move {
                let result = self.model_for(generator.as_ref(), step).await;
                self.finish(AssetKind::Model, step.step, result).await
            }
        }))
        .buffer_unordered(self.concurrency)
        .filter_map(|r| async move { r })
        .collect()
        .await
    }

    async fn voice_for(
        &self,
        synth: &dyn SpeechSynthesizer,
        step: &StepRecord,
    ) -> Result<String, GuideError> {
        let instruction = step
            .instruction_filename
            .as_deref()
            .ok_or_else(|| GuideError::Internal("step has no instruction file".into()))?;
        if !self.layout.exists(instruction) {
            let contents = instruction_text(
                step.title.as_deref().unwrap_or_default(),
                step.description.as_deref().unwrap_or_default(),
            );
            self.layout.write(instruction, contents.as_bytes()).await?;
        }

        let filename = self.filename(AssetKind::Voice, step.step);
        synthesize_instruction_file(
            synth,
            &self.layout.path(instruction),
            self.voice_id,
            &self.layout.path(&filename),
        )
        .await?;
        Ok(filename)
    }

    async fn model_for(
        &self,
        generator: &dyn ModelGenerator,
        step: &StepRecord,
    ) -> Result<String, GuideError> {
        let image = step
            .image_filename
            .as_deref()
            .ok_or_else(|| GuideError::Internal("step has no image".into()))?;
        let filename = self.filename(AssetKind::Model, step.step);
        generator
            .image_to_model(&self.layout.path(image), &self.layout.path(&filename))
            .await?;
        Ok(filename)
    }

    /// Record a finished asset, or turn the error into a [`StepError`].
    async fn finish(
        &self,
        kind: AssetKind,
        step: u32,
        result: Result<String, GuideError>,
    ) -> Option<StepError> {
        let outcome = match result {
            Ok(filename) => self
                .store
                .set_asset_filename(self.hash, step, kind, &filename)
                .await
                .map(|()| filename),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(filename) => {
                self.cb.on_asset_complete(kind, step, &filename);
                None
            }
            Err(e) => {
                warn!("Step {}: {} generation failed: {}", step, kind, e);
                self.cb.on_asset_error(kind, step, &e.to_string());
                Some(StepError {
                    step,
                    kind,
                    detail: e.to_string(),
                })
            }
        }
    }

    fn fail_all(&self, steps: &[&StepRecord], kind: AssetKind, err: &GuideError) -> Vec<StepError> {
        warn!("Cannot generate {} files: {}", kind, err);
        steps
            .iter()
            .map(|step| {
                self.cb.on_asset_error(kind, step.step, &err.to_string());
                StepError {
                    step: step.step,
                    kind,
                    detail: err.to_string(),
                }
            })
            .collect()
    }
}

/// Contents of an instruction file: title, blank line, description.
pub(crate) fn instruction_text(title: &str, description: &str) -> String {
    format!("{}\n\n{}", title.trim(), description.trim())
}

/// Write one instruction file per planned step and build the rows to store.
async fn write_instructions(
    layout: &VolumeLayout,
    hash: &ContentHash,
    pdf_name: &str,
    manual: &ExtractedManual,
    planned: &[PlannedStep],
) -> Result<Vec<StepRecord>, GuideError> {
    let mut records = Vec::with_capacity(planned.len());
    for p in planned {
        let image = manual.images.get(p.image_index);
        let instruction_filename = VolumeLayout::instruction_filename(hash, p.step);
        layout
            .write(
                &instruction_filename,
                instruction_text(&p.title, &p.description).as_bytes(),
            )
            .await?;

        records.push(StepRecord {
            step: p.step,
            pdf_name: pdf_name.to_string(),
            image_filename: image.map(|i| i.filename.clone()),
            instruction_filename: Some(instruction_filename),
            model_filename: None,
            voice_filename: None,
            title: Some(p.title.clone()),
            description: Some(p.description.clone()),
            reference: p.reference.clone(),
            confidence: p.confidence,
            page_number: image.map(|i| i.page_number),
            y_percentage: image.and_then(|i| i.position).map(|pos| pos.y_percentage),
        });
    }
    Ok(records)
}
