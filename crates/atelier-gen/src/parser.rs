//! Tolerant response parsing
//!
//! Endpoints return an interleaved sequence of text and image fragments with
//! no guaranteed schema on the text. The rules:
//!
//! - a text fragment that reads as metadata (a JSON object, or `key: value`
//!   lines) describes the *next* image
//! - an image with no pending metadata is still accepted, labelled by its
//!   position (`upper`, `lower`, `outerwear`, then `extra-N`)
//! - text that is not metadata is ignored
//!
//! Valid image data is never discarded because the text around it was
//! malformed. [`ParseResult::used_positional_fallback`] records when the
//! positional path was taken.

use crate::backend::Fragment;
use crate::error::BackendError;
use crate::mode::{ExtractionScope, GarmentAnalysis, GarmentLayer, GarmentType, Output};
use serde_json::{Map, Value};

/// Categories assigned by position when no metadata is available
pub const POSITIONAL_CATEGORIES: [&str; 3] = ["upper", "lower", "outerwear"];

/// Outcome of parsing one candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseResult {
    /// Outputs in arrival order
    pub outputs: Vec<Output>,
    /// At least one output was labelled by position
    pub used_positional_fallback: bool,
    /// Metadata fragments that never met an image
    pub ignored_metadata: usize,
}

impl ParseResult {
    /// Whether the response contained any image
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Metadata {
    category: Option<String>,
    name: Option<String>,
    view: Option<String>,
}

impl Metadata {
    fn is_empty(&self) -> bool {
        self.category.is_none() && self.name.is_none() && self.view.is_none()
    }
}

/// Category for the image at `index` when nothing better is known
#[must_use]
pub fn positional_category(index: usize) -> String {
    POSITIONAL_CATEGORIES
        .get(index)
        .map_or_else(|| format!("extra-{}", index + 1), |c| (*c).to_string())
}

/// Parse the fragments of one candidate into outputs
#[must_use]
pub fn parse_fragments(fragments: Vec<Fragment>) -> ParseResult {
    let mut result = ParseResult::default();
    let mut pending: Option<Metadata> = None;

    for fragment in fragments {
        match fragment {
            Fragment::Text(text) => {
                if let Some(meta) = parse_metadata(&text) {
                    if pending.replace(meta).is_some() {
                        result.ignored_metadata += 1;
                    }
                }
            }
            Fragment::Binary(payload) => {
                if payload.is_empty() {
                    continue;
                }
                let index = result.outputs.len();
                let meta = pending.take().unwrap_or_default();
                let positional = meta.category.is_none();
                if positional {
                    result.used_positional_fallback = true;
                }
                result.outputs.push(Output {
                    payload,
                    category: meta.category.unwrap_or_else(|| positional_category(index)),
                    name: meta.name,
                    view: meta.view,
                    positional,
                });
            }
        }
    }

    if pending.is_some() {
        result.ignored_metadata += 1;
    }
    result
}

fn parse_metadata(text: &str) -> Option<Metadata> {
    let trimmed = strip_fences(text);
    if trimmed.is_empty() {
        return None;
    }

    if let Some(object) = extract_json_object(trimmed) {
        let meta = Metadata {
            category: string_field(&object, &["category", "type", "garment", "label", "layer"]),
            name: string_field(&object, &["name", "title"]),
            view: string_field(&object, &["view", "angle", "view_label", "viewLabel"]),
        };
        return (!meta.is_empty()).then_some(meta);
    }

    let mut meta = Metadata::default();
    for line in trimmed.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_start_matches(['-', '*']).trim().to_ascii_lowercase();
        let value = value.trim().trim_matches(['"', '\'', '*']).trim();
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "category" | "type" | "garment" | "label" | "layer" => {
                meta.category = Some(normalize(value));
            }
            "name" | "title" => meta.name = Some(value.to_string()),
            "view" | "angle" => meta.view = Some(normalize(value)),
            _ => {}
        }
    }
    (!meta.is_empty()).then_some(meta)
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace(' ', "-")
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match object.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(if *k == "name" || *k == "title" {
            s.trim().to_string()
        } else {
            normalize(s)
        }),
        _ => None,
    })
}

fn strip_fences(text: &str) -> &str {
    let mut t = text.trim();
    if let Some(rest) = t.strip_prefix("```") {
        // Drop the info string (e.g. `json`) on the opening fence line
        t = rest.split_once('\n').map_or("", |(_, body)| body);
        t = t.trim_end().strip_suffix("```").unwrap_or(t);
    }
    t.trim()
}

fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parse the classifier's text answer into an analysis
///
/// Field names and values are matched loosely; an unrecognised garment type
/// becomes [`GarmentType::Unknown`] rather than an error.
///
/// # Errors
/// Returns `BackendError::Malformed` when the text holds no JSON object
pub fn parse_analysis(text: &str) -> Result<GarmentAnalysis, BackendError> {
    let body = strip_fences(text);
    let object = extract_json_object(body)
        .ok_or_else(|| BackendError::Malformed(format!("no analysis object in: {}", preview(body))))?;

    let garment_type = ["garment_type", "garmentType", "type", "category"]
        .iter()
        .find_map(|k| object.get(*k).and_then(Value::as_str))
        .map_or(GarmentType::Unknown, GarmentType::from_label);

    let mut layers: Vec<GarmentLayer> = object
        .get("layers")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(GarmentLayer::from_label)
                .collect()
        })
        .unwrap_or_default();
    layers.dedup();

    let recommended_scope = ["recommended_scope", "recommendedScope", "scope", "mode"]
        .iter()
        .find_map(|k| object.get(*k).and_then(Value::as_str))
        .and_then(scope_from_label)
        .unwrap_or(if layers.len() > 1 || garment_type == GarmentType::FullOutfit {
            ExtractionScope::Outfit
        } else {
            ExtractionScope::Single
        });

    #[allow(clippy::cast_possible_truncation)]
    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .map(|c| c.clamp(0.0, 1.0) as f32);

    Ok(GarmentAnalysis {
        garment_type,
        recommended_scope,
        layers,
        confidence,
    })
}

fn scope_from_label(label: &str) -> Option<ExtractionScope> {
    match label.trim().to_ascii_lowercase().as_str() {
        "single" | "item" | "single_item" | "single-item" => Some(ExtractionScope::Single),
        "outfit" | "full" | "all" | "full_outfit" | "full-outfit" | "layers" => {
            Some(ExtractionScope::Outfit)
        }
        _ => None,
    }
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}
