//! Prompts for the step-analysis vision call.
//!
//! Callers can override the system prompt via
//! [`crate::config::PipelineConfigBuilder::system_prompt`]; the constant here
//! is used only when no override is provided. The user prompt is always
//! built here because the pipeline depends on its JSON contract.

/// Default system prompt for classifying manual images as steps.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert technical writer analysing images from a product manual.

You receive the text of the manual followed by a numbered sequence of images taken from it. For each image decide whether it illustrates an assembly, installation, repair or usage step, and if so describe that step.

Follow these rules precisely:

1. ONE ENTRY PER IMAGE
   - Return exactly one match per image, in the order the images were given
   - Use the image_index given next to each image

2. INSTRUCTIONAL IMAGES
   - Set is_instruction to true only if the image shows an action the reader performs
   - Logos, covers, product photos, warning icons and decorative images are NOT instructions
   - instruction_title: a short imperative title (e.g. "Attach the side panel")
   - instruction_description: one to three sentences a narrator could read aloud
   - instruction_reference: the step number, section or page printed in the manual, or "N/A"

3. CONFIDENCE
   - "high" when the manual text clearly describes the pictured action
   - "medium" when the action is evident from the image alone
   - "low" when you are guessing

4. OUTPUT FORMAT
   - Output ONLY a JSON object of this shape:
     {"matches": [{"image_index": 0, "is_instruction": true, "instruction_title": "...", "instruction_description": "...", "instruction_reference": "...", "confidence": "high", "reasoning": "..."}]}
   - Do NOT wrap in ```json fences
   - Do NOT add commentary before or after the JSON
   - Write titles and descriptions in the language of the manual text"#;

/// Upper bound on manual text sent with each request, in characters.
pub const MAX_MANUAL_CHARS: usize = 60_000;

/// Build the user message text for a batch of images.
///
/// `offset` is the index of the first image in this batch; images are
/// labelled with their absolute index so matches can be merged across batches.
pub fn user_prompt(manual_text: &str, image_count: usize, offset: usize) -> String {
    let text = truncate_chars(manual_text.trim(), MAX_MANUAL_CHARS);
    let last = offset + image_count.saturating_sub(1);
    let labels = (offset..offset + image_count)
        .map(|i| format!("image_index {i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let manual = if text.is_empty() {
        "(The manual has no extractable text; rely on the images.)".to_string()
    } else {
        format!("\"\"\"{}\"\"\"", text)
    };

    format!(
        "Manual text:\n{manual}\n\n\
The following {image_count} images are attached in order as {labels}.\n\
Return one match per image with image_index between {offset} and {last}."
    )
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_names_every_field() {
        for field in [
            "image_index",
            "is_instruction",
            "instruction_title",
            "instruction_description",
            "instruction_reference",
            "confidence",
            "reasoning",
        ] {
            assert!(DEFAULT_SYSTEM_PROMPT.contains(field), "missing {field}");
        }
    }

    #[test]
    fn user_prompt_labels_absolute_indices() {
        let p = user_prompt("Page 1:\nOpen the box.\n", 3, 4);
        assert!(p.contains("image_index 4, image_index 5, image_index 6"));
        assert!(p.contains("between 4 and 6"));
        assert!(p.contains("Open the box."));
    }

    #[test]
    fn user_prompt_handles_textless_manual() {
        let p = user_prompt("   ", 1, 0);
        assert!(p.contains("no extractable text"));
    }

    #[test]
    fn long_text_is_truncated_on_char_boundary() {
        let text = "é".repeat(MAX_MANUAL_CHARS + 10);
        let p = user_prompt(&text, 1, 0);
        assert_eq!(p.matches('é').count(), MAX_MANUAL_CHARS);
    }
}
