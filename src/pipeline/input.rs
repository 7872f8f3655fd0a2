//! Input resolution: turn a path, URL or uploaded buffer into a local PDF.
//!
//! Every input ends up as a file path pdfium can open. Local files are
//! validated in place; URLs are downloaded into a `TempDir` that lives as
//! long as the [`ResolvedInput`]; uploads are written into the volume under
//! their own name. In all three cases the `%PDF` magic bytes are checked
//! before anything is hashed or stored.

use crate::error::GuideError;
use crate::layout::VolumeLayout;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// The resolved input: either a local path or a downloaded temp file.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; PDF downloaded to a temp directory kept alive here.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// File name shown in reports and stored as `pdf_name`.
    pub fn display_name(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manual.pdf".to_string())
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a local PDF file path.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, GuideError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(Path::new(input))
    }
}

/// Resolve a local file path, validating existence and PDF magic bytes.
pub fn resolve_local(path: &Path) -> Result<ResolvedInput, GuideError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(GuideError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != PDF_MAGIC {
                return Err(GuideError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(GuideError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(GuideError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Save an uploaded PDF into the volume and return its path.
///
/// The name must be a bare file name ending in `.pdf`; directory components
/// are rejected rather than stripped so a caller cannot write outside the
/// volume by accident.
pub async fn save_upload(
    bytes: &[u8],
    filename: &str,
    layout: &VolumeLayout,
) -> Result<PathBuf, GuideError> {
    validate_upload_name(filename)?;

    if bytes.len() < 4 || &bytes[..4] != PDF_MAGIC {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(GuideError::NotAPdf {
            path: PathBuf::from(filename),
            magic,
        });
    }

    layout.ensure().await?;
    let path = layout.write(filename, bytes).await?;
    info!("Uploaded file saved: {} ({} bytes)", filename, bytes.len());
    Ok(path)
}

fn validate_upload_name(filename: &str) -> Result<(), GuideError> {
    let reject = |reason: &str| GuideError::InvalidUpload {
        filename: filename.to_string(),
        reason: reason.to_string(),
    };

    if !filename.to_ascii_lowercase().ends_with(".pdf") {
        return Err(reject("only PDF files are supported"));
    }
    let as_path = Path::new(filename);
    if as_path.components().count() != 1 || filename.contains(['/', '\\']) || filename.starts_with('.') {
        return Err(reject("file name must not contain directory components"));
    }
    Ok(())
}

/// Download a URL to a temporary directory and return the path.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, GuideError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| GuideError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            GuideError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            GuideError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(GuideError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = filename_from_url(url);
    let temp_dir = TempDir::new().map_err(|e| GuideError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| GuideError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    if bytes.len() >= 4 && &bytes[..4] != PDF_MAGIC {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(GuideError::NotAPdf {
            path: file_path,
            magic,
        });
    }

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| GuideError::io(&file_path, e))?;

    info!("Downloaded to: {}", file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/manual.pdf"));
        assert!(is_url("http://example.com/manual.pdf"));
        assert!(!is_url("/tmp/manual.pdf"));
        assert!(!is_url("manual.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_from_url_prefers_last_segment() {
        assert_eq!(filename_from_url("https://x.org/docs/xps-13.pdf"), "xps-13.pdf");
        assert_eq!(filename_from_url("https://x.org/docs/"), "downloaded.pdf");
        assert_eq!(filename_from_url("https://x.org/download"), "downloaded.pdf");
    }

    #[test]
    fn local_non_pdf_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        std::fs::write(&path, b"hello world").unwrap();
        match resolve_local(&path) {
            Err(GuideError::NotAPdf { magic, .. }) => assert_eq!(&magic, b"hell"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected NotAPdf"),
        }
    }

    #[test]
    fn local_missing_is_not_found() {
        assert!(matches!(
            resolve_local(Path::new("/definitely/not/here.pdf")),
            Err(GuideError::FileNotFound { .. })
        ));
    }

    #[test]
    fn local_pdf_resolves_with_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service-manual.pdf");
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        let resolved = resolve_local(&path).unwrap();
        assert_eq!(resolved.display_name(), "service-manual.pdf");
    }

    #[tokio::test]
    async fn upload_is_written_into_volume() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VolumeLayout::new(dir.path().join("volume"));
        let path = save_upload(b"%PDF-1.4 body", "manual.pdf", &layout)
            .await
            .unwrap();
        assert_eq!(path, layout.path("manual.pdf"));
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF-1.4 body");
    }

    #[tokio::test]
    async fn upload_rejects_wrong_extension_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VolumeLayout::new(dir.path());

        for name in ["manual.docx", "../escape.pdf", "sub/dir.pdf", ".pdf"] {
            let err = save_upload(b"%PDF-1.4", name, &layout).await.unwrap_err();
            assert!(
                matches!(err, GuideError::InvalidUpload { .. }),
                "{name}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn upload_rejects_non_pdf_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VolumeLayout::new(dir.path());
        let err = save_upload(b"PK\x03\x04zip", "manual.pdf", &layout)
            .await
            .unwrap_err();
        assert!(matches!(err, GuideError::NotAPdf { .. }));
        assert!(!layout.exists("manual.pdf"));
    }
}
