//! Post-processing: deterministic cleanup of the vision model's reply.
//!
//! The prompt asks for bare JSON, but hosted models regularly wrap it in
//! ` ```json ` fences, prepend a sentence of narration, or sprinkle
//! zero-width characters into strings. None of that changes the meaning of
//! the answer, so it is repaired here instead of being treated as a failure.
//!
//! ## Rule Order
//!
//! Invisible characters go first so fence detection sees clean input; fences
//! are stripped before the object scan so a fenced reply is parsed as-is;
//! field normalisation runs last, on the deserialised matches.

use crate::error::GuideError;
use crate::output::{ImageMatch, StepAnalysis};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Parse a raw vision reply into a [`StepAnalysis`].
///
/// Accepts `{"matches": [...]}` or a bare `[...]` array, with or without
/// fences and surrounding prose.
pub fn parse_response(raw: &str) -> Result<StepAnalysis, GuideError> {
    let s = remove_invisible_chars(raw);
    let s = strip_json_fences(&s);

    let parsed = serde_json::from_str::<Reply>(s.trim()).or_else(|first_err| {
        match outermost_json(&s) {
            Some(inner) => serde_json::from_str::<Reply>(inner),
            None => Err(first_err),
        }
    });

    let reply = parsed.map_err(|e| GuideError::UnparseableResponse {
        detail: e.to_string(),
        excerpt: excerpt(raw),
    })?;

    let mut matches = match reply {
        Reply::Object(a) => a.matches,
        Reply::Array(m) => m,
    };
    for m in &mut matches {
        normalise_match(m);
    }
    Ok(StepAnalysis { matches })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply {
    Object(StepAnalysis),
    Array(Vec<ImageMatch>),
}

// ── Rule 1: Strip invisible Unicode ──────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 2: Strip outer code fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap());

static RE_INNER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)```").unwrap());

fn strip_json_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(caps) = RE_OUTER_FENCES.captures(trimmed) {
        return caps[1].to_string();
    }
    // Narration before or after a fenced block.
    if let Some(caps) = RE_INNER_FENCE.captures(trimmed) {
        return caps[1].to_string();
    }
    trimmed.to_string()
}

// ── Rule 3: Outermost JSON value ─────────────────────────────────────────

/// Slice from the first `{` (or `[`) to its last matching closer.
fn outermost_json(input: &str) -> Option<&str> {
    let obj = span(input, '{', '}');
    let arr = span(input, '[', ']');
    match (obj, arr) {
        (Some(o), Some(a)) => {
            if a.0 < o.0 {
                Some(&input[a.0..=a.1])
            } else {
                Some(&input[o.0..=o.1])
            }
        }
        (Some(o), None) => Some(&input[o.0..=o.1]),
        (None, Some(a)) => Some(&input[a.0..=a.1]),
        (None, None) => None,
    }
}

fn span(input: &str, open: char, close: char) -> Option<(usize, usize)> {
    let start = input.find(open)?;
    let end = input.rfind(close)?;
    (end > start).then_some((start, end))
}

// ── Rule 4: Field normalisation ──────────────────────────────────────────

fn normalise_match(m: &mut ImageMatch) {
    for field in [
        &mut m.instruction_title,
        &mut m.instruction_description,
        &mut m.instruction_reference,
        &mut m.reasoning,
    ] {
        *field = field.take().and_then(|v| clean_field(&v));
    }
}

/// Trimmed value, or None for blanks and placeholder answers.
pub(crate) fn clean_field(value: &str) -> Option<String> {
    let v = value.trim();
    let placeholder = v.is_empty()
        || v.eq_ignore_ascii_case("n/a")
        || v.eq_ignore_ascii_case("na")
        || v.eq_ignore_ascii_case("none")
        || v.eq_ignore_ascii_case("null");
    (!placeholder).then(|| v.to_string())
}

fn excerpt(raw: &str) -> String {
    raw.chars().take(200).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Confidence;

    const BODY: &str = r#"{"matches": [
        {"image_index": 0, "is_instruction": true, "instruction_title": "Remove cover",
         "instruction_description": "Unscrew the four screws.", "instruction_reference": "N/A",
         "confidence": "high", "reasoning": "Shows a screwdriver"},
        {"image_index": 1, "is_instruction": false, "confidence": "low"}
    ]}"#;

    #[test]
    fn test_plain_json() {
        let a = parse_response(BODY).unwrap();
        assert_eq!(a.matches.len(), 2);
        assert_eq!(a.matches[0].confidence, Confidence::High);
        assert_eq!(a.matches[0].instruction_reference, None);
        assert!(!a.matches[1].is_instruction);
    }

    #[test]
    fn test_strip_fences() {
        let fenced = format!("```json\n{BODY}\n```");
        assert_eq!(parse_response(&fenced).unwrap().matches.len(), 2);

        let bare = format!("```\n{BODY}\n```");
        assert_eq!(parse_response(&bare).unwrap().matches.len(), 2);
    }

    #[test]
    fn test_narration_around_fence() {
        let wrapped = format!("Here is the analysis:\n```json\n{BODY}\n```\nLet me know!");
        assert_eq!(parse_response(&wrapped).unwrap().matches.len(), 2);
    }

    #[test]
    fn test_narration_without_fence() {
        let wrapped = format!("Sure. {BODY} Hope this helps.");
        assert_eq!(parse_response(&wrapped).unwrap().matches.len(), 2);
    }

    #[test]
    fn test_bare_array() {
        let raw = r#"[{"image_index": 3, "is_instruction": true, "instruction_title": "Tighten"}]"#;
        let a = parse_response(raw).unwrap();
        assert_eq!(a.matches[0].image_index, Some(3));
        assert_eq!(a.matches[0].instruction_title.as_deref(), Some("Tighten"));
    }

    #[test]
    fn test_remove_invisible() {
        let raw = format!("\u{FEFF}{}", BODY.replace("Remove cover", "Remove\u{200B} cover"));
        let a = parse_response(&raw).unwrap();
        assert_eq!(a.matches[0].instruction_title.as_deref(), Some("Remove cover"));
    }

    #[test]
    fn test_placeholders_become_none() {
        assert_eq!(clean_field("N/A"), None);
        assert_eq!(clean_field("  none "), None);
        assert_eq!(clean_field(""), None);
        assert_eq!(clean_field(" Page 4 "), Some("Page 4".to_string()));
    }

    #[test]
    fn test_garbage_is_unparseable() {
        let err = parse_response("I cannot help with that.").unwrap_err();
        match err {
            GuideError::UnparseableResponse { excerpt, .. } => {
                assert!(excerpt.starts_with("I cannot"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_matches() {
        let a = parse_response(r#"{"matches": []}"#).unwrap();
        assert!(a.matches.is_empty());
    }
}
