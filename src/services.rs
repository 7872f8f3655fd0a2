//! Seams between the pipeline and the outside world.
//!
//! Each stage that touches a PDF engine or a hosted service sits behind a
//! trait so [`crate::process::Pipeline`] can be driven with the real
//! clients in production and with in-process fakes in tests.

use crate::error::GuideError;
use crate::hash::ContentHash;
use crate::layout::VolumeLayout;
use crate::output::{ExtractedManual, StepAnalysis};
use async_trait::async_trait;
use std::path::Path;

/// Stage 1: pull images and page text out of a PDF into the volume.
#[async_trait]
pub trait ManualExtractor: Send + Sync {
    async fn extract(
        &self,
        pdf_path: &Path,
        hash: &ContentHash,
        layout: &VolumeLayout,
    ) -> Result<ExtractedManual, GuideError>;
}

/// Stage 2: decide which images are steps and describe them.
#[async_trait]
pub trait StepAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        manual: &ExtractedManual,
        layout: &VolumeLayout,
    ) -> Result<StepAnalysis, GuideError>;
}

/// Stage 3: turn a step image into a 3D model file at `dest`.
#[async_trait]
pub trait ModelGenerator: Send + Sync {
    async fn image_to_model(&self, image: &Path, dest: &Path) -> Result<(), GuideError>;
}

/// Stage 4: narrate `text` with `voice_id` into an audio file at `dest`.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str, dest: &Path) -> Result<(), GuideError>;
}
