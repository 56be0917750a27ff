//! Generation backend abstraction
//!
//! A backend is one candidate model behind the external endpoint. It knows
//! nothing about fallback or parsing: it sends one request and hands back
//! the raw, interleaved response.

use crate::error::BackendError;
use crate::mode::{GarmentLayer, GenerationMode};
use async_trait::async_trait;
use atelier_asset::Payload;

/// What a request asks the model to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Classify the source (garment type, recommended scope)
    Analyze,
    /// Produce output images
    Generate {
        /// Pipeline mode
        mode: GenerationMode,
        /// Restrict generation to one layer of a multi-part item
        layer: Option<GarmentLayer>,
    },
}

impl Task {
    /// Short label for logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Generate { layer: None, .. } => "generate",
            Self::Generate { layer: Some(_), .. } => "generate-part",
        }
    }
}

/// One request to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// What to do
    pub task: Task,
    /// Source image
    pub source: Payload,
    /// Instruction text sent alongside the image
    pub instruction: String,
}

/// One piece of a candidate answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Free-form text; may carry metadata for the next binary
    Text(String),
    /// An image
    Binary(Payload),
}

/// One candidate answer: an ordered sequence of fragments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidate {
    /// Fragments in the order the endpoint returned them
    pub fragments: Vec<Fragment>,
}

/// Raw backend response
///
/// Zero candidates is how endpoints express a safety refusal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    /// Candidate answers
    pub candidates: Vec<Candidate>,
    /// Reason the endpoint gave for returning nothing, if any
    pub block_reason: Option<String>,
}

impl RawResponse {
    /// Response with a single candidate
    #[must_use]
    pub fn single(fragments: Vec<Fragment>) -> Self {
        Self {
            candidates: vec![Candidate { fragments }],
            block_reason: None,
        }
    }

    /// Empty response with a refusal reason
    #[must_use]
    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            candidates: Vec::new(),
            block_reason: Some(reason.into()),
        }
    }

    /// Fragments of the first candidate, or a refusal
    ///
    /// # Errors
    /// Returns `BackendError::Refused` when the response has no candidates
    pub fn into_fragments(self) -> Result<Vec<Fragment>, BackendError> {
        match self.candidates.into_iter().next() {
            Some(candidate) => Ok(candidate.fragments),
            None => Err(BackendError::Refused {
                reason: self
                    .block_reason
                    .unwrap_or_else(|| "no candidates returned".to_string()),
            }),
        }
    }
}

/// One candidate model behind the generation endpoint
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Name used in logs and attempt summaries
    fn name(&self) -> &str;

    /// Send one request
    async fn invoke(&self, request: &GenerationRequest) -> Result<RawResponse, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_candidates_is_a_refusal() {
        let err = RawResponse::refused("SAFETY").into_fragments().unwrap_err();
        assert_eq!(
            err,
            BackendError::Refused {
                reason: "SAFETY".into()
            }
        );

        let err = RawResponse::default().into_fragments().unwrap_err();
        assert!(matches!(err, BackendError::Refused { .. }));
    }

    #[test]
    fn first_candidate_wins() {
        let raw = RawResponse {
            candidates: vec![
                Candidate {
                    fragments: vec![Fragment::Text("a".into())],
                },
                Candidate {
                    fragments: vec![Fragment::Text("b".into())],
                },
            ],
            block_reason: None,
        };
        assert_eq!(raw.into_fragments().unwrap(), vec![Fragment::Text("a".into())]);
    }

    #[test]
    fn task_labels() {
        assert_eq!(Task::Analyze.label(), "analyze");
        let task = Task::Generate {
            mode: GenerationMode::extraction(),
            layer: Some(GarmentLayer::Top),
        };
        assert_eq!(task.label(), "generate-part");
    }
}
