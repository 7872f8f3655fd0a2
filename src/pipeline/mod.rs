//! Pipeline stages for turning a manual into a narrated 3D guide.
//!
//! Each submodule implements one step or one external service, so each can
//! be tested alone and swapped through the traits in [`crate::services`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ encode ──▶ vision ──▶ postprocess ──▶ (store)
//! (path/URL/  (pdfium)   (size     (VLM)      (JSON repair)
//!  upload)                budget)
//!
//!                 step image ──▶ tripo ──▶ {key}-{step}.glb
//!           instruction file ──▶ tts   ──▶ {key}-{step}.mp3
//! ```
//!
//! 1. [`input`]: resolve the user-supplied path, URL or upload to a local PDF
//! 2. [`engine`]: locate or download the pdfium library
//! 3. [`extract`]: pull images and page text; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 4. [`encode`]: fit each image to the request budget and base64-wrap it
//! 5. [`vision`]: the step-analysis call with retry/backoff
//! 6. [`postprocess`]: deterministic repair of the model's JSON reply
//! 7. [`tripo`] / [`tts`]: hosted asset generation, retried via [`retry`]

pub mod encode;
pub mod engine;
pub mod extract;
pub mod input;
pub mod postprocess;
pub mod retry;
pub mod tripo;
pub mod tts;
pub mod vision;
