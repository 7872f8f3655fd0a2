//! Stage 1: extract embedded images and page text via pdfium.
//!
//! pdfium is not async-safe, so the whole document walk happens inside
//! `spawn_blocking`. Images are decoded by pdfium and re-encoded as PNG;
//! the `min_image_bytes` filter applies to the PNG size.
//!
//! PDF user space has its origin at the bottom-left, so an image's distance
//! from the top of the page is `page_height - bounds.top`.

use crate::error::GuideError;
use crate::hash::ContentHash;
use crate::layout::VolumeLayout;
use crate::output::{ExtractedImage, ExtractedManual, ImagePosition};
use crate::pipeline::engine;
use crate::services::ManualExtractor;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info, warn};

/// [`ManualExtractor`] backed by pdfium-render.
#[derive(Debug, Clone)]
pub struct PdfiumExtractor {
    min_image_bytes: usize,
    password: Option<String>,
}

impl PdfiumExtractor {
    pub fn new(min_image_bytes: usize, password: Option<String>) -> Self {
        Self {
            min_image_bytes,
            password,
        }
    }
}

#[async_trait]
impl ManualExtractor for PdfiumExtractor {
    async fn extract(
        &self,
        pdf_path: &Path,
        hash: &ContentHash,
        layout: &VolumeLayout,
    ) -> Result<ExtractedManual, GuideError> {
        layout.ensure().await?;

        let path = pdf_path.to_path_buf();
        let password = self.password.clone();
        let min_bytes = self.min_image_bytes;
        let hash = *hash;

        let walked = tokio::task::spawn_blocking(move || {
            walk_document(&path, password.as_deref(), min_bytes)
        })
        .await
        .map_err(|e| GuideError::Internal(format!("Extraction task panicked: {e}")))??;

        let mut images = Vec::with_capacity(walked.images.len());
        for (index, raw) in walked.images.into_iter().enumerate() {
            let filename = VolumeLayout::image_filename(&hash, index, "png");
            layout.write(&filename, &raw.png).await?;
            match raw.position {
                Some(pos) => debug!(
                    "Extracted image {} from page {}: {} ({:.1} KB) at {:.1}% from top",
                    index,
                    raw.page_number + 1,
                    filename,
                    raw.png.len() as f64 / 1024.0,
                    pos.y_percentage
                ),
                None => debug!(
                    "Extracted image {} from page {}: {} ({:.1} KB)",
                    index,
                    raw.page_number + 1,
                    filename,
                    raw.png.len() as f64 / 1024.0
                ),
            }
            images.push(ExtractedImage {
                index,
                filename,
                page_number: raw.page_number,
                position: raw.position,
                byte_len: raw.png.len(),
            });
        }

        let text = walked.pages_text.join("\n");
        let text_filename = VolumeLayout::manual_text_filename(&hash);
        layout.write(&text_filename, text.as_bytes()).await?;

        info!(
            "Extraction complete: {} images ({} with position), {} characters of text",
            images.len(),
            images.iter().filter(|i| i.position.is_some()).count(),
            text.len()
        );

        Ok(ExtractedManual {
            images,
            text_filename,
            text,
            page_count: walked.page_count,
        })
    }
}

struct RawImage {
    page_number: usize,
    position: Option<ImagePosition>,
    png: Vec<u8>,
}

struct WalkedDocument {
    page_count: usize,
    pages_text: Vec<String>,
    images: Vec<RawImage>,
}

fn open_error(pdf_path: &Path, password: Option<&str>, e: PdfiumError) -> GuideError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            GuideError::WrongPassword {
                path: pdf_path.to_path_buf(),
            }
        } else {
            GuideError::PasswordRequired {
                path: pdf_path.to_path_buf(),
            }
        }
    } else {
        GuideError::CorruptPdf {
            path: pdf_path.to_path_buf(),
            detail: err_str,
        }
    }
}

/// Blocking walk over every page: text first, then image objects in paint order.
fn walk_document(
    pdf_path: &Path,
    password: Option<&str>,
    min_image_bytes: usize,
) -> Result<WalkedDocument, GuideError> {
    let pdfium = engine::bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| open_error(pdf_path, password, e))?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    info!("Processing PDF {}: {} pages", pdf_path.display(), page_count);

    let mut pages_text = Vec::new();
    let mut images = Vec::new();

    for (page_number, page) in pages.iter().enumerate() {
        match page.text() {
            Ok(text) => {
                if let Some(block) = page_text_block(page_number, &text.all()) {
                    pages_text.push(block);
                }
            }
            Err(e) => warn!("Page {}: text extraction failed: {:?}", page_number + 1, e),
        }

        let page_height = page.height().value;

        for object in page.objects().iter() {
            let Some(image_object) = object.as_image_object() else {
                continue;
            };

            let decoded = match image_object.get_raw_image() {
                Ok(img) => img,
                Err(e) => {
                    warn!("Page {}: could not decode image: {:?}", page_number + 1, e);
                    continue;
                }
            };

            let png = match encode_png(&decoded) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Page {}: could not encode image: {}", page_number + 1, e);
                    continue;
                }
            };

            if png.len() < min_image_bytes {
                debug!(
                    "Skipping small image from page {} ({:.2} KB)",
                    page_number + 1,
                    png.len() as f64 / 1024.0
                );
                continue;
            }

            let position = object
                .bounds()
                .ok()
                .and_then(|b| position_from_top(page_number, page_height, b.top().value));

            images.push(RawImage {
                page_number,
                position,
                png,
            });
        }
    }

    Ok(WalkedDocument {
        page_count,
        pages_text,
        images,
    })
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// `Page N:` block for a page, or None when the page has no text.
pub(crate) fn page_text_block(page_number: usize, text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(format!("Page {}:\n{}\n", page_number + 1, text))
    }
}

/// Position of an image whose top edge sits at `top` in PDF user space.
pub(crate) fn position_from_top(
    page_number: usize,
    page_height: f32,
    top: f32,
) -> Option<ImagePosition> {
    if !(page_height > 0.0) || !top.is_finite() {
        return None;
    }
    let from_top = page_height - top;
    Some(ImagePosition {
        page_number,
        y_percentage: (from_top / page_height * 100.0).clamp(0.0, 100.0),
    })
}
