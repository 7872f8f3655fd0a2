//! Error types for the threedocs library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`GuideError`]: **Fatal**: the manual cannot be processed at all
//!   (bad input file, engine missing, vision call failed, database broken).
//!   Returned as `Err(GuideError)` from the top-level `process*` functions.
//!
//! * [`StepError`]: **Non-fatal**: one step's narration or 3D model could
//!   not be generated, but the guide itself is stored. Collected into
//!   [`crate::output::ProcessReport::failures`] so callers can retry later;
//!   the next run regenerates only what is still missing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the threedocs library.
#[derive(Debug, Error)]
pub enum GuideError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// An uploaded file name was rejected before anything was written.
    #[error("Invalid upload '{filename}': {reason}")]
    InvalidUpload { filename: String, reason: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy, or run\n\
`threedocs process` once with network access so the engine can be cached.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Vision errors ─────────────────────────────────────────────────────
    /// A hosted service is not initialised (missing API key etc.).
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The vision model kept failing after all retries.
    #[error("Vision model call failed after {retries} retries: {message}")]
    VisionFailed { retries: u32, message: String },

    /// The vision model answered, but not with the expected JSON shape.
    #[error("Could not parse vision response as step JSON: {detail}\nRaw response starts with: {excerpt:?}")]
    UnparseableResponse { detail: String, excerpt: String },

    // ── 3D generation errors ──────────────────────────────────────────────
    /// The 3D API rejected a request or returned a non-zero code.
    #[error("3D API error ({status}): {message}")]
    ModelApiError { status: u16, message: String },

    /// A 3D task finished in a status other than `success`.
    #[error("3D task {task_id} ended with status '{status}'")]
    ModelTaskFailed { task_id: String, status: String },

    /// A 3D task did not finish within the configured window.
    #[error("3D task {task_id} still unfinished after {secs}s")]
    ModelTaskTimeout { task_id: String, secs: u64 },

    /// A finished 3D task carried no downloadable model.
    #[error("3D task {task_id} completed without a model URL")]
    ModelMissing { task_id: String },

    /// Multiview generation needs at least one view besides the front.
    #[error("Multiview generation needs at least one of left/back/right besides the front view")]
    MultiviewNeedsViews,

    // ── TTS errors ────────────────────────────────────────────────────────
    /// The TTS service rejected the configured voice.
    #[error("Invalid voice ID: {voice_id}")]
    InvalidVoice { voice_id: String },

    /// The TTS service returned a non-success status.
    #[error("TTS API error ({status}): {body}")]
    TtsApiError { status: u16, body: String },

    // ── Transport / storage ───────────────────────────────────────────────
    /// A request to a hosted service failed before a response arrived.
    #[error("HTTP request to {service} failed: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The step database returned an error.
    #[error("Step database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Reading or writing a volume file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GuideError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GuideError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether another attempt at the same call could plausibly succeed.
    ///
    /// Rate limits, server errors and transport failures are transient;
    /// bad credentials, rejected voices and malformed requests are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            GuideError::Http { source, .. } => !source.is_builder(),
            GuideError::ModelApiError { status, .. } | GuideError::TtsApiError { status, .. } => {
                *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

/// Which per-step asset a [`StepError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Narration audio (`{key}-{step}.mp3`).
    Voice,
    /// 3D model (`{key}-{step}.glb`).
    Model,
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetKind::Voice => f.write_str("voice"),
            AssetKind::Model => f.write_str("model"),
        }
    }
}

/// A non-fatal error for a single step asset.
///
/// The step row stays in the database; only the asset filename remains
/// empty so a later run picks it up again.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("Step {step}: {kind} generation failed: {detail}")]
pub struct StepError {
    pub step: u32,
    pub kind: AssetKind,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_display() {
        let e = StepError {
            step: 4,
            kind: AssetKind::Model,
            detail: "task failed".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("Step 4"), "got: {msg}");
        assert!(msg.contains("model"), "got: {msg}");
    }

    #[test]
    fn invalid_voice_display() {
        let e = GuideError::InvalidVoice {
            voice_id: "xx_XX-robot".into(),
        };
        assert!(e.to_string().contains("xx_XX-robot"));
    }

    #[test]
    fn server_errors_are_retryable() {
        let e = GuideError::TtsApiError {
            status: 503,
            body: "busy".into(),
        };
        assert!(e.is_retryable());
        let e = GuideError::ModelApiError {
            status: 429,
            message: "slow down".into(),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let e = GuideError::TtsApiError {
            status: 401,
            body: "bad key".into(),
        };
        assert!(!e.is_retryable());
        assert!(!GuideError::InvalidVoice {
            voice_id: "v".into()
        }
        .is_retryable());
    }

    #[test]
    fn asset_kind_serialises_lowercase() {
        let json = serde_json::to_string(&AssetKind::Voice).unwrap();
        assert_eq!(json, "\"voice\"");
    }
}
