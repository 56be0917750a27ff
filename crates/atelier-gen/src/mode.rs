//! Pipeline modes, analysis results and outputs
//!
//! The analysis result decides how many outputs an item will produce, which
//! is what lets credits be estimated before any costly generation runs.

use atelier_asset::{Feature, Payload};
use serde::{Deserialize, Serialize};

/// Maximum number of layers a single outfit is decomposed into
pub const MAX_LAYERS: usize = 3;

/// Maximum catalog views generated for one item
pub const MAX_VIEWS: u8 = 3;

/// Coarse garment classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GarmentType {
    Top,
    Bottom,
    Dress,
    Outerwear,
    Footwear,
    Accessory,
    FullOutfit,
    #[default]
    Unknown,
}

impl GarmentType {
    /// Parse a loosely formatted label from model output
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        let norm = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "top" | "shirt" | "t_shirt" | "blouse" | "sweater" | "upper" => Self::Top,
            "bottom" | "pants" | "trousers" | "skirt" | "shorts" | "jeans" | "lower" => Self::Bottom,
            "dress" | "gown" | "jumpsuit" => Self::Dress,
            "outerwear" | "jacket" | "coat" | "blazer" | "outer" => Self::Outerwear,
            "footwear" | "shoes" | "sneakers" | "boots" => Self::Footwear,
            "accessory" | "bag" | "hat" | "scarf" => Self::Accessory,
            "full_outfit" | "outfit" | "full_body" | "look" => Self::FullOutfit,
            _ => Self::Unknown,
        }
    }
}

/// A separable garment layer of an outfit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GarmentLayer {
    Outerwear,
    Top,
    Bottom,
}

impl GarmentLayer {
    /// Label used as the output category
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Outerwear => "outerwear",
            Self::Top => "top",
            Self::Bottom => "bottom",
        }
    }

    /// Parse a loosely formatted layer label
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match GarmentType::from_label(label) {
            GarmentType::Outerwear => Some(Self::Outerwear),
            GarmentType::Top => Some(Self::Top),
            GarmentType::Bottom => Some(Self::Bottom),
            _ => None,
        }
    }
}

/// How much of the source an extraction covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionScope {
    /// One garment, one output
    #[default]
    Single,
    /// Every detected layer, one output per layer
    Outfit,
}

/// Scope selection in the batch mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "scope")]
pub enum ScopeSelection {
    /// Follow the analysis recommendation
    #[default]
    Auto,
    /// Force a scope
    Fixed(ExtractionScope),
}

/// Structured classification of a source image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarmentAnalysis {
    /// Dominant garment type
    pub garment_type: GarmentType,
    /// Scope the classifier recommends
    pub recommended_scope: ExtractionScope,
    /// Layers detected, outermost first
    #[serde(default)]
    pub layers: Vec<GarmentLayer>,
    /// Classifier confidence in [0, 1], when reported
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl GarmentAnalysis {
    /// Analysis for a single garment
    #[must_use]
    pub fn single(garment_type: GarmentType) -> Self {
        Self {
            garment_type,
            recommended_scope: ExtractionScope::Single,
            layers: Vec::new(),
            confidence: None,
        }
    }

    /// Analysis for a layered outfit
    #[must_use]
    pub fn outfit(layers: Vec<GarmentLayer>) -> Self {
        Self {
            garment_type: GarmentType::FullOutfit,
            recommended_scope: ExtractionScope::Outfit,
            layers,
            confidence: None,
        }
    }
}

/// Pipeline configuration shared by all items of a batch unless overridden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMode {
    /// Feature the batch belongs to
    pub feature: Feature,
    /// Extraction scope selection
    #[serde(default)]
    pub scope: ScopeSelection,
    /// Garment-type selector; overrides the classifier when set
    #[serde(default)]
    pub garment_hint: Option<GarmentType>,
    /// Catalog views per item (catalog forge only)
    #[serde(default = "default_views")]
    pub views: u8,
    /// Free-form style directive (background, lighting)
    #[serde(default)]
    pub style: Option<String>,
}

fn default_views() -> u8 {
    1
}

impl GenerationMode {
    /// Asset extraction following the classifier
    #[must_use]
    pub fn extraction() -> Self {
        Self {
            feature: Feature::AssetExtraction,
            scope: ScopeSelection::Auto,
            garment_hint: None,
            views: 1,
            style: None,
        }
    }

    /// Catalog forge producing `views` images per item
    #[must_use]
    pub fn catalog(views: u8) -> Self {
        Self {
            feature: Feature::CatalogForge,
            scope: ScopeSelection::Fixed(ExtractionScope::Single),
            garment_hint: None,
            views: views.clamp(1, MAX_VIEWS),
            style: None,
        }
    }

    /// With a fixed scope
    #[must_use]
    pub fn with_scope(mut self, scope: ExtractionScope) -> Self {
        self.scope = ScopeSelection::Fixed(scope);
        self
    }

    /// With a garment-type selector
    #[must_use]
    pub fn with_garment_hint(mut self, hint: GarmentType) -> Self {
        self.garment_hint = Some(hint);
        self
    }

    /// With a style directive
    #[must_use]
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Decide how an analysed item will be generated
    #[must_use]
    pub fn plan(&self, analysis: &GarmentAnalysis) -> GenerationPlan {
        if self.feature == Feature::CatalogForge {
            return GenerationPlan::Single {
                expected_outputs: u32::from(self.views.clamp(1, MAX_VIEWS)),
            };
        }

        let scope = match self.scope {
            ScopeSelection::Auto => analysis.recommended_scope,
            ScopeSelection::Fixed(scope) => scope,
        };

        match scope {
            ExtractionScope::Single => GenerationPlan::Single {
                expected_outputs: 1,
            },
            ExtractionScope::Outfit => {
                let mut layers: Vec<GarmentLayer> = Vec::with_capacity(MAX_LAYERS);
                for layer in &analysis.layers {
                    if !layers.contains(layer) && layers.len() < MAX_LAYERS {
                        layers.push(*layer);
                    }
                }
                if layers.is_empty() {
                    layers = vec![GarmentLayer::Top, GarmentLayer::Bottom];
                }
                GenerationPlan::Layered { layers }
            }
        }
    }
}

impl Default for GenerationMode {
    fn default() -> Self {
        Self::extraction()
    }
}

/// How one item is turned into outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationPlan {
    /// One call, which may return several images
    Single { expected_outputs: u32 },
    /// One independent call per layer, fanned out with bounded concurrency
    Layered { layers: Vec<GarmentLayer> },
}

impl GenerationPlan {
    /// Number of outputs the plan is expected to produce
    #[must_use]
    pub fn expected_outputs(&self) -> u32 {
        match self {
            Self::Single { expected_outputs } => *expected_outputs,
            Self::Layered { layers } => u32::try_from(layers.len()).unwrap_or(u32::MAX),
        }
    }
}

/// One generated image and what it depicts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// The image
    pub payload: Payload,
    /// Category, e.g. `upper`, `top`, `front`
    pub category: String,
    /// Optional display name
    pub name: Option<String>,
    /// Optional view label, e.g. `front`, `back`
    pub view: Option<String>,
    /// Whether the category came from position rather than metadata
    pub positional: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garment_labels_are_forgiving() {
        assert_eq!(GarmentType::from_label("T-Shirt"), GarmentType::Top);
        assert_eq!(GarmentType::from_label(" Jeans "), GarmentType::Bottom);
        assert_eq!(GarmentType::from_label("full body"), GarmentType::FullOutfit);
        assert_eq!(GarmentType::from_label("spaceship"), GarmentType::Unknown);
        assert_eq!(GarmentLayer::from_label("jacket"), Some(GarmentLayer::Outerwear));
        assert_eq!(GarmentLayer::from_label("dress"), None);
    }

    #[test]
    fn auto_scope_follows_analysis() {
        let mode = GenerationMode::extraction();
        let single = GarmentAnalysis::single(GarmentType::Top);
        assert_eq!(mode.plan(&single).expected_outputs(), 1);

        let outfit = GarmentAnalysis::outfit(vec![
            GarmentLayer::Outerwear,
            GarmentLayer::Top,
            GarmentLayer::Bottom,
        ]);
        assert_eq!(mode.plan(&outfit).expected_outputs(), 3);
    }

    #[test]
    fn fixed_scope_overrides_analysis() {
        let mode = GenerationMode::extraction().with_scope(ExtractionScope::Single);
        let outfit = GarmentAnalysis::outfit(vec![GarmentLayer::Top, GarmentLayer::Bottom]);
        assert_eq!(mode.plan(&outfit), GenerationPlan::Single { expected_outputs: 1 });
    }

    #[test]
    fn outfit_plan_dedups_and_defaults_layers() {
        let mode = GenerationMode::extraction().with_scope(ExtractionScope::Outfit);
        let dup = GarmentAnalysis::outfit(vec![GarmentLayer::Top, GarmentLayer::Top]);
        assert_eq!(
            mode.plan(&dup),
            GenerationPlan::Layered {
                layers: vec![GarmentLayer::Top]
            }
        );

        let none = GarmentAnalysis::single(GarmentType::Unknown);
        assert_eq!(mode.plan(&none).expected_outputs(), 2);
    }

    #[test]
    fn catalog_views_are_clamped() {
        let analysis = GarmentAnalysis::single(GarmentType::Dress);
        assert_eq!(GenerationMode::catalog(0).plan(&analysis).expected_outputs(), 1);
        assert_eq!(GenerationMode::catalog(9).plan(&analysis).expected_outputs(), 3);
    }

    #[test]
    fn mode_serde_defaults() {
        let mode: GenerationMode =
            serde_json::from_str(r#"{"feature":"catalog-forge"}"#).unwrap();
        assert_eq!(mode.views, 1);
        assert_eq!(mode.scope, ScopeSelection::Auto);
    }
}
