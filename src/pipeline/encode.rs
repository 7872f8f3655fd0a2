//! Image encoding: extracted step image → base64 `ImageData` for the VLM.
//!
//! Vision APIs reject request bodies that are too large, and a manual can
//! carry a dozen full-resolution photographs. Images at or under the budget
//! are sent as-is (PNG); larger ones are re-encoded as JPEG at quality 85,
//! then repeatedly downscaled by 0.8 at quality 60 until they fit.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;
use tracing::debug;

use crate::error::GuideError;

/// Images smaller than this on either side are not shrunk further.
const MIN_DIMENSION: u32 = 64;

/// Read an image from disk and encode it for the vision request.
pub async fn encode_for_vision(path: &Path, max_bytes: usize) -> Result<ImageData, GuideError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| GuideError::io(path, e))?;
    let path_buf = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let (payload, mime) = fit_to_budget(&bytes, max_bytes).map_err(|e| GuideError::Internal(
            format!("cannot encode {}: {e}", path_buf.display()),
        ))?;
        let b64 = STANDARD.encode(&payload);
        debug!(
            "Encoded {} → {} bytes ({}), {} bytes base64",
            path_buf.display(),
            payload.len(),
            mime,
            b64.len()
        );
        Ok(ImageData::new(b64, mime).with_detail("high"))
    })
    .await
    .map_err(|e| GuideError::Internal(format!("Encode task panicked: {e}")))?
}

/// Bytes and MIME type that fit within `max_bytes` where possible.
///
/// When the image cannot be shrunk below the budget, the smallest attempt is
/// returned and the provider gets to decide.
pub(crate) fn fit_to_budget(
    bytes: &[u8],
    max_bytes: usize,
) -> Result<(Vec<u8>, &'static str), image::ImageError> {
    if bytes.len() <= max_bytes {
        let mime = match image::guess_format(bytes) {
            Ok(image::ImageFormat::Jpeg) => "image/jpeg",
            _ => "image/png",
        };
        return Ok((bytes.to_vec(), mime));
    }

    let mut img = image::load_from_memory(bytes)?;
    let mut out = encode_jpeg(&img, 85)?;
    debug!(
        "Image {} bytes over budget {}, JPEG q85 → {} bytes",
        bytes.len(),
        max_bytes,
        out.len()
    );

    while out.len() > max_bytes {
        let (w, h) = (img.width(), img.height());
        let (nw, nh) = ((w as f32 * 0.8) as u32, (h as f32 * 0.8) as u32);
        if nw < MIN_DIMENSION || nh < MIN_DIMENSION {
            break;
        }
        img = img.resize_exact(nw, nh, FilterType::Triangle);
        out = encode_jpeg(&img, 60)?;
        debug!("Downscaled to {}x{} → {} bytes", nw, nh, out.len());
    }

    Ok((out, "image/jpeg"))
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    // JPEG has no alpha channel.
    let rgb = img.to_rgb8();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(&rgb)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn noise(w: u32, h: u32) -> DynamicImage {
        let mut state = 0x2545F491u32;
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let b = state.to_le_bytes();
            Rgb([b[0], b[1], b[2]])
        }))
    }

    #[test]
    fn small_png_passes_through() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([255, 0, 0])));
        let bytes = png_bytes(&img);
        let (out, mime) = fit_to_budget(&bytes, 1024 * 1024).unwrap();
        assert_eq!(out, bytes);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn oversized_image_is_reencoded_under_budget() {
        let bytes = png_bytes(&noise(512, 512));
        let budget = 60 * 1024;
        assert!(bytes.len() > budget);

        let (out, mime) = fit_to_budget(&bytes, budget).unwrap();
        assert_eq!(mime, "image/jpeg");
        assert!(out.len() <= budget, "got {} bytes", out.len());
        assert_eq!(&out[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn impossible_budget_returns_smallest_attempt() {
        let bytes = png_bytes(&noise(128, 128));
        let (out, mime) = fit_to_budget(&bytes, 10).unwrap();
        assert_eq!(mime, "image/jpeg");
        assert!(out.len() < bytes.len());
    }

    #[tokio::test]
    async fn encode_reads_file_and_sets_detail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.png");
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([0, 128, 0])));
        std::fs::write(&path, png_bytes(&img)).unwrap();

        let data = encode_for_vision(&path, 1024 * 1024).await.unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[..4], b"\x89PNG");
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = encode_for_vision(Path::new("/no/such/step.png"), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, GuideError::Io { .. }));
    }
}
