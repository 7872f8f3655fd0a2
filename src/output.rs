//! Data carried between pipeline stages and returned to callers.

use crate::error::StepError;
use serde::{Deserialize, Serialize};

// ── Extraction ───────────────────────────────────────────────────────────

/// Where an image sits on its page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImagePosition {
    /// 0-indexed page number.
    pub page_number: usize,
    /// Distance from the top of the page to the image's top edge, 0–100.
    pub y_percentage: f32,
}

/// One image pulled out of the PDF and saved to the volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedImage {
    /// Position in document order, counting only kept images.
    pub index: usize,
    /// File name inside the volume directory.
    pub filename: String,
    /// 0-indexed page the image came from.
    pub page_number: usize,
    /// Position on the page, when pdfium could report bounds.
    pub position: Option<ImagePosition>,
    /// Encoded size on disk.
    pub byte_len: usize,
}

/// Everything stage 1 produced for a manual.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedManual {
    pub images: Vec<ExtractedImage>,
    /// File name of the saved page text.
    pub text_filename: String,
    /// Page text, `Page N:` headed, blank pages omitted.
    pub text: String,
    pub page_count: usize,
}

// ── Vision analysis ──────────────────────────────────────────────────────

/// How sure the model was about a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
            Confidence::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            "low" => Confidence::Low,
            _ => Confidence::Unknown,
        }
    }
}

/// The model's verdict for a single image.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageMatch {
    /// 0-indexed position of the image in the request.
    #[serde(default)]
    pub image_index: Option<usize>,
    #[serde(default)]
    pub is_instruction: bool,
    #[serde(default)]
    pub instruction_title: Option<String>,
    #[serde(default)]
    pub instruction_description: Option<String>,
    #[serde(default)]
    pub instruction_reference: Option<String>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Parsed vision response for the whole manual.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepAnalysis {
    #[serde(default)]
    pub matches: Vec<ImageMatch>,
}

impl StepAnalysis {
    /// Instructional matches as numbered steps, in image order.
    ///
    /// A match's `image_index` is used when it points at one of the
    /// `image_count` images; otherwise its position in the reply is. Each
    /// image yields at most one step (the first match naming it wins), and
    /// steps are numbered from 1 without gaps.
    pub fn steps(&self, image_count: usize) -> Vec<PlannedStep> {
        let mut seen = vec![false; image_count];
        let mut picked: Vec<(usize, &ImageMatch)> = Vec::new();

        for (pos, m) in self.matches.iter().enumerate() {
            let index = match m.image_index {
                Some(i) if i < image_count => i,
                _ if pos < image_count => pos,
                _ => continue,
            };
            if seen[index] {
                continue;
            }
            seen[index] = true;
            if m.is_instruction {
                picked.push((index, m));
            }
        }
        picked.sort_by_key(|(index, _)| *index);

        picked
            .into_iter()
            .enumerate()
            .map(|(n, (image_index, m))| {
                let step = n as u32 + 1;
                let title = m
                    .instruction_title
                    .clone()
                    .unwrap_or_else(|| format!("Step {step}"));
                PlannedStep {
                    step,
                    image_index,
                    description: m.instruction_description.clone().unwrap_or_default(),
                    title,
                    reference: m.instruction_reference.clone(),
                    confidence: m.confidence,
                }
            })
            .collect()
    }
}

/// An instructional image promoted to a numbered step, before storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// 1-indexed step number.
    pub step: u32,
    /// Index into [`ExtractedManual::images`].
    pub image_index: usize,
    pub title: String,
    pub description: String,
    pub reference: Option<String>,
    pub confidence: Confidence,
}

// ── Storage ──────────────────────────────────────────────────────────────

/// A stored step row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub pdf_name: String,
    pub image_filename: Option<String>,
    pub instruction_filename: Option<String>,
    pub model_filename: Option<String>,
    pub voice_filename: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub confidence: Confidence,
    pub page_number: Option<usize>,
    pub y_percentage: Option<f32>,
}

/// A processed manual as listed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Full hex digest.
    pub pdf_hash: String,
    pub pdf_name: String,
    pub image_count: usize,
    pub step_count: usize,
    pub processed_at: String,
}

// ── Report ───────────────────────────────────────────────────────────────

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    /// Short hash key shared by every derived file.
    pub pdf_hash: String,
    pub pdf_name: String,
    /// True when extraction and analysis were skipped.
    pub cached: bool,
    /// Number of instructional steps stored for this manual.
    pub steps_processed: usize,
    /// Voice files written by this run (0 on a fully cached run), or None
    /// when TTS was disabled.
    pub tts_files_generated: Option<usize>,
    /// Model files written by this run, or None when 3D was disabled.
    pub models_generated: Option<usize>,
    /// Per-step asset failures.
    pub failures: Vec<StepError>,
    pub duration_ms: u64,
}

impl ProcessReport {
    /// True when every requested asset exists.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_accepts_unknown_words() {
        let m: ImageMatch =
            serde_json::from_str(r#"{"image_index": 2, "is_instruction": true, "confidence": "very high"}"#)
                .unwrap();
        assert_eq!(m.confidence, Confidence::Unknown);
        assert_eq!(m.image_index, Some(2));
    }

    #[test]
    fn confidence_parse_is_case_insensitive() {
        assert_eq!(Confidence::parse(" High "), Confidence::High);
        assert_eq!(Confidence::parse("LOW"), Confidence::Low);
        assert_eq!(Confidence::parse(""), Confidence::Unknown);
    }

    fn m(index: Option<usize>, instruction: bool, title: &str) -> ImageMatch {
        ImageMatch {
            image_index: index,
            is_instruction: instruction,
            instruction_title: Some(title.to_string()),
            ..ImageMatch::default()
        }
    }

    #[test]
    fn steps_follow_image_order_and_skip_non_instructions() {
        let analysis = StepAnalysis {
            matches: vec![
                m(Some(2), true, "c"),
                m(Some(0), true, "a"),
                m(Some(1), false, "logo"),
            ],
        };
        let steps = analysis.steps(3);
        assert_eq!(steps.len(), 2);
        assert_eq!((steps[0].step, steps[0].image_index, steps[0].title.as_str()), (1, 0, "a"));
        assert_eq!((steps[1].step, steps[1].image_index, steps[1].title.as_str()), (2, 2, "c"));
    }

    #[test]
    fn out_of_range_index_falls_back_to_position() {
        let analysis = StepAnalysis {
            matches: vec![m(Some(0), false, "x"), m(Some(9), true, "b"), m(None, true, "c")],
        };
        let steps = analysis.steps(3);
        let images: Vec<usize> = steps.iter().map(|s| s.image_index).collect();
        assert_eq!(images, vec![1, 2]);
    }

    #[test]
    fn duplicate_indices_keep_first_match() {
        let analysis = StepAnalysis {
            matches: vec![m(Some(0), true, "first"), m(Some(0), true, "second")],
        };
        let steps = analysis.steps(2);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].title, "first");
    }

    #[test]
    fn missing_title_gets_step_label() {
        let analysis = StepAnalysis {
            matches: vec![ImageMatch {
                image_index: Some(0),
                is_instruction: true,
                ..ImageMatch::default()
            }],
        };
        let steps = analysis.steps(1);
        assert_eq!(steps[0].title, "Step 1");
        assert_eq!(steps[0].description, "");
    }

    #[test]
    fn no_images_means_no_steps() {
        let analysis = StepAnalysis {
            matches: vec![m(Some(0), true, "a")],
        };
        assert!(analysis.steps(0).is_empty());
    }

    #[test]
    fn match_fields_default_when_missing() {
        let m: ImageMatch = serde_json::from_str("{}").unwrap();
        assert!(!m.is_instruction);
        assert!(m.instruction_title.is_none());
        assert_eq!(m.confidence, Confidence::Unknown);
    }
}
