//! # threedocs
//!
//! Turn product manuals into step-by-step guides with narration and 3D models.
//!
//! ## Why this crate?
//!
//! A printed manual already contains the guide: the instructional pictures
//! and the text around them. This crate pulls the pictures out of the PDF,
//! asks a vision-language model which of them are steps and what each step
//! says, and then generates, per step, a spoken narration and a 3D model of
//! the pictured part. Everything is keyed by the PDF's content hash, so the
//! same manual is never analyzed twice.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 0. Hash     SHA-256 of the bytes; cache check against the step database
//!  ├─ 1. Extract  embedded images + page text via pdfium (spawn_blocking)
//!  ├─ 2. Analyze  one vision call over text + images → numbered steps
//!  ├─ 3. Store    instruction files + SQLite rows
//!  └─ 4. Assets   concurrent TTS (Fish Audio) and image-to-3D (Tripo)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use threedocs::{process_manual, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Vision provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / …
//!     // TRIPO_API_KEY and FISH_AUDIO_API_KEY are read when assets are due.
//!     let config = PipelineConfig::builder().volume_dir("volume").build()?;
//!     let report = process_manual("manual.pdf", &config).await?;
//!     println!("{} steps under key {}", report.steps_processed, report.pdf_hash);
//!     for failure in &report.failures {
//!         eprintln!("{failure}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `threedocs` binary (clap + anyhow + indicatif + tracing-subscriber + dotenvy) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! threedocs = { version = "0.1", default-features = false }
//! ```
//!
//! ## Volume Layout
//!
//! | File | Contents |
//! |------|----------|
//! | `{key}-img-{NNN}.png` | extracted image, document order |
//! | `{key}-manual.txt` | page text, `Page N:` headed |
//! | `{key}-{step}.txt` | step title, blank line, description |
//! | `{key}-{step}.mp3` | narration |
//! | `{key}-{step}.glb` | 3D model |
//! | `instructions.db` | SQLite step database |
//!
//! `{key}` is the first 16 hex characters of the PDF's SHA-256.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod hash;
pub mod layout;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod services;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{FishAudioConfig, PipelineConfig, PipelineConfigBuilder, TripoConfig};
pub use error::{AssetKind, GuideError, StepError};
pub use hash::ContentHash;
pub use layout::VolumeLayout;
pub use output::{
    Confidence, DocumentRecord, ExtractedImage, ExtractedManual, ImageMatch, ImagePosition,
    PlannedStep, ProcessReport, StepAnalysis, StepRecord,
};
pub use process::{process_manual, process_upload, Pipeline};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback, Stage};
pub use services::{ManualExtractor, ModelGenerator, SpeechSynthesizer, StepAnalyzer};
pub use store::StepStore;
