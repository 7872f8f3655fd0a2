//! PDF engine provisioning: find, fetch and bind the pdfium shared library.
//!
//! Lookup order for [`bind_pdfium`]:
//!
//! 1. `PDFIUM_LIB_PATH` pointing at an existing library file;
//! 2. the per-version cache directory filled by [`ensure_engine`];
//! 3. the system library search path.
//!
//! [`ensure_engine`] downloads the platform archive from
//! bblanchon/pdfium-binaries once and unpacks only the library file. The
//! cache directory defaults to `{cache_dir}/threedocs/pdfium-{VERSION}` and
//! can be moved with `THREEDOCS_PDFIUM_CACHE_DIR`.

use crate::error::GuideError;
use futures::StreamExt;
use pdfium_render::prelude::Pdfium;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The pdfium-binaries release tag used for downloads.
pub const PDFIUM_VERSION: &str = "7690";

const RELEASE_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

/// `(os, arch) → (archive, path inside archive, file name on disk)`.
const PLATFORMS: &[(&str, &str, &str, &str, &str)] = &[
    ("macos", "aarch64", "pdfium-mac-arm64.tgz", "lib/libpdfium.dylib", "libpdfium.dylib"),
    ("macos", "x86_64", "pdfium-mac-x64.tgz", "lib/libpdfium.dylib", "libpdfium.dylib"),
    ("linux", "x86_64", "pdfium-linux-x64.tgz", "lib/libpdfium.so", "libpdfium.so"),
    ("linux", "aarch64", "pdfium-linux-arm64.tgz", "lib/libpdfium.so", "libpdfium.so"),
    ("windows", "x86_64", "pdfium-win-x64.tgz", "bin/pdfium.dll", "pdfium.dll"),
    ("windows", "aarch64", "pdfium-win-arm64.tgz", "bin/pdfium.dll", "pdfium.dll"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Platform {
    archive: &'static str,
    member: &'static str,
    lib_name: &'static str,
}

fn platform_for(os: &str, arch: &str) -> Option<Platform> {
    PLATFORMS
        .iter()
        .find(|(o, a, ..)| *o == os && *a == arch)
        .map(|&(_, _, archive, member, lib_name)| Platform {
            archive,
            member,
            lib_name,
        })
}

fn current_platform() -> Result<Platform, GuideError> {
    let (os, arch) = (std::env::consts::OS, std::env::consts::ARCH);
    platform_for(os, arch).ok_or_else(|| {
        GuideError::PdfiumBindingFailed(format!("no prebuilt pdfium for {os}/{arch}"))
    })
}

/// Directory holding the cached library for [`PDFIUM_VERSION`].
pub fn engine_cache_dir() -> PathBuf {
    let base = std::env::var_os("THREEDOCS_PDFIUM_CACHE_DIR")
        .map(PathBuf::from)
        .or_else(|| dirs::cache_dir().map(|d| d.join("threedocs")))
        .unwrap_or_else(|| std::env::temp_dir().join("threedocs"));
    base.join(format!("pdfium-{PDFIUM_VERSION}"))
}

/// Path of a usable library without touching the network, if any.
pub fn cached_library_path() -> Option<PathBuf> {
    if let Some(p) = std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from) {
        if p.is_file() {
            return Some(p);
        }
    }
    let platform = current_platform().ok()?;
    let p = engine_cache_dir().join(platform.lib_name);
    p.is_file().then_some(p)
}

/// Make sure the library is on disk, downloading it if necessary.
///
/// `on_progress` receives `(bytes_downloaded, total_bytes)` during the download.
pub async fn ensure_engine(
    on_progress: Option<&(dyn Fn(u64, Option<u64>) + Send + Sync)>,
) -> Result<PathBuf, GuideError> {
    if let Some(p) = cached_library_path() {
        debug!("Using cached pdfium at {}", p.display());
        return Ok(p);
    }

    let platform = current_platform()?;
    let dir = engine_cache_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| GuideError::io(&dir, e))?;

    let url = format!(
        "{}/chromium%2F{}/{}",
        RELEASE_URL, PDFIUM_VERSION, platform.archive
    );
    info!("Downloading pdfium engine from {}", url);
    let archive = download_archive(&url, on_progress).await?;

    let dest = dir.join(platform.lib_name);
    let dest_clone = dest.clone();
    tokio::task::spawn_blocking(move || unpack_member(&archive, platform.member, &dest_clone))
        .await
        .map_err(|e| GuideError::Internal(format!("Unpack task panicked: {e}")))??;

    info!("pdfium engine cached at {}", dest.display());
    Ok(dest)
}

async fn download_archive(
    url: &str,
    on_progress: Option<&(dyn Fn(u64, Option<u64>) + Send + Sync)>,
) -> Result<Vec<u8>, GuideError> {
    let failed = |reason: String| GuideError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .user_agent(concat!("threedocs/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let total = response.content_length();
    let mut buf = Vec::with_capacity(total.unwrap_or(32 * 1024 * 1024) as usize);
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| failed(e.to_string()))?;
        buf.extend_from_slice(&chunk);
        if let Some(cb) = on_progress {
            cb(buf.len() as u64, total);
        }
    }
    Ok(buf)
}

/// Extract the single `member` of a `.tgz` archive to `dest`.
fn unpack_member(archive: &[u8], member: &str, dest: &Path) -> Result<(), GuideError> {
    let unpack_err = |detail: String| GuideError::PdfiumBindingFailed(format!("unpack: {detail}"));

    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(archive));
    let entries = tar.entries().map_err(|e| unpack_err(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| unpack_err(e.to_string()))?;
        let is_member = entry
            .path()
            .map(|p| p.to_string_lossy() == member)
            .unwrap_or(false);
        if is_member {
            entry.unpack(dest).map_err(|e| unpack_err(e.to_string()))?;
            return Ok(());
        }
    }
    Err(unpack_err(format!("'{member}' not found in archive")))
}

/// Bind pdfium for the current thread's use.
///
/// Blocking; call from `spawn_blocking`.
pub fn bind_pdfium() -> Result<Pdfium, GuideError> {
    let bindings = match cached_library_path() {
        Some(path) => Pdfium::bind_to_library(&path).map_err(|e| {
            GuideError::PdfiumBindingFailed(format!("{}: {e}", path.display()))
        })?,
        None => Pdfium::bind_to_system_library()
            .map_err(|e| GuideError::PdfiumBindingFailed(format!("system library: {e}")))?,
    };
    Ok(Pdfium::new(bindings))
}
