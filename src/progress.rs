//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as a manual moves through extraction, analysis, storage and asset
//! generation.
//!
//! # Example
//!
//! ```rust
//! use threedocs::{AssetKind, PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     assets: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_asset_complete(&self, _kind: AssetKind, step: u32, filename: &str) {
//!         let done = self.assets.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("step {step}: {filename} ({done} assets so far)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { assets: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::AssetKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Coarse pipeline stage, reported once when the stage begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Hashing,
    Extracting,
    Analyzing,
    Storing,
    GeneratingAssets,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Hashing => "Hashing PDF",
            Stage::Extracting => "Extracting images and text",
            Stage::Analyzing => "Analyzing images",
            Stage::Storing => "Storing steps",
            Stage::GeneratingAssets => "Generating assets",
        };
        f.write_str(label)
    }
}

/// Called by the pipeline as it processes a manual.
///
/// Implementations must be `Send + Sync`: asset events arrive from
/// concurrently running voice and model tasks. All methods have default
/// no-op implementations so callers only override what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called when a stage begins.
    fn on_stage(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when the content hash matched a processed manual.
    ///
    /// Extraction, analysis and storage are skipped for cache hits.
    fn on_cache_hit(&self, pdf_hash: &str, steps: usize) {
        let _ = (pdf_hash, steps);
    }

    /// Called once before asset generation with the number of pending assets.
    fn on_assets_start(&self, pending: usize) {
        let _ = pending;
    }

    /// Called when an asset file has been written (or was already present).
    fn on_asset_complete(&self, kind: AssetKind, step: u32, filename: &str) {
        let _ = (kind, step, filename);
    }

    /// Called when an asset could not be generated.
    fn on_asset_error(&self, kind: AssetKind, step: u32, error: &str) {
        let _ = (kind, step, error);
    }

    /// Called once after every stage has finished.
    fn on_complete(&self, steps: usize, failures: usize) {
        let _ = (steps, failures);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        stages: Mutex<Vec<Stage>>,
        completes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_stage(&self, stage: Stage) {
            self.stages.lock().unwrap().push(stage);
        }

        fn on_asset_complete(&self, _kind: AssetKind, _step: u32, _filename: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_asset_error(&self, _kind: AssetKind, _step: u32, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage(Stage::Hashing);
        cb.on_cache_hit("0123456789abcdef", 3);
        cb.on_assets_start(6);
        cb.on_asset_complete(AssetKind::Voice, 1, "x-1.mp3");
        cb.on_asset_error(AssetKind::Model, 2, "boom");
        cb.on_complete(3, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_stage(Stage::Extracting);
        tracker.on_stage(Stage::Analyzing);
        tracker.on_asset_complete(AssetKind::Voice, 1, "a");
        tracker.on_asset_complete(AssetKind::Model, 1, "b");
        tracker.on_asset_error(AssetKind::Model, 2, "c");

        assert_eq!(
            *tracker.stages.lock().unwrap(),
            vec![Stage::Extracting, Stage::Analyzing]
        );
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_labels_are_human_readable() {
        assert_eq!(Stage::GeneratingAssets.to_string(), "Generating assets");
    }
}
