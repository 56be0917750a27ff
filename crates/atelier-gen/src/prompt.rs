//! Instruction text sent with each request
//!
//! Each instruction asks the model to label every image it returns. The
//! parser treats those labels as hints only.

use crate::backend::Task;
use crate::mode::{ExtractionScope, GenerationMode, ScopeSelection};
use atelier_asset::Feature;
use std::fmt::Write as _;

const ANALYZE: &str = "Classify the clothing in this image. Reply with one JSON object: \
{\"garment_type\": string, \"recommended_scope\": \"single\" | \"outfit\", \
\"layers\": [\"outerwear\" | \"top\" | \"bottom\"], \"confidence\": number}.";

const LABEL_HINT: &str = "Before each image, write one line of JSON: \
{\"category\": string, \"name\": string, \"view\": string}.";

/// Build the instruction for a task
#[must_use]
pub fn instruction_for(task: &Task) -> String {
    match task {
        Task::Analyze => ANALYZE.to_string(),
        Task::Generate { mode, layer } => {
            let mut out = String::new();
            match (mode.feature, layer) {
                (_, Some(layer)) => {
                    let _ = write!(
                        out,
                        "Extract only the {} garment as a clean product image on a plain background.",
                        layer.label()
                    );
                }
                (Feature::CatalogForge, None) => {
                    let _ = write!(
                        out,
                        "Produce {} catalog photograph(s) of this garment, one per view.",
                        mode.views
                    );
                }
                (Feature::AssetExtraction, None) => {
                    out.push_str(match mode.scope {
                        ScopeSelection::Fixed(ExtractionScope::Outfit) => {
                            "Extract every garment in this outfit as separate product images."
                        }
                        _ => "Extract the main garment as a clean product image on a plain background.",
                    });
                }
            }
            push_mode_details(&mut out, mode);
            out.push(' ');
            out.push_str(LABEL_HINT);
            out
        }
    }
}

fn push_mode_details(out: &mut String, mode: &GenerationMode) {
    if let Some(hint) = mode.garment_hint {
        let _ = write!(out, " The garment is a {hint:?}.");
    }
    if let Some(style) = &mode.style {
        let _ = write!(out, " Style: {style}.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{GarmentLayer, GarmentType};

    #[test]
    fn analyze_asks_for_json() {
        assert!(instruction_for(&Task::Analyze).contains("recommended_scope"));
    }

    #[test]
    fn part_instruction_names_layer_and_hint() {
        let task = Task::Generate {
            mode: GenerationMode::extraction()
                .with_garment_hint(GarmentType::Top)
                .with_style("studio"),
            layer: Some(GarmentLayer::Outerwear),
        };
        let text = instruction_for(&task);
        assert!(text.contains("outerwear"));
        assert!(text.contains("Top"));
        assert!(text.contains("studio"));
        assert!(text.contains("category"));
    }

    #[test]
    fn catalog_instruction_mentions_views() {
        let task = Task::Generate {
            mode: GenerationMode::catalog(2),
            layer: None,
        };
        assert!(instruction_for(&task).contains("Produce 2"));
    }
}
