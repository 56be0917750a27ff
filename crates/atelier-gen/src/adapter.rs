//! Generation adapter with ordered model fallback
//!
//! # Protocol
//!
//! Candidates are tried strictly in order. A candidate that errors, refuses,
//! or answers without anything usable is logged and skipped; the first one
//! that produces at least one output wins. Later candidates exist for
//! availability only, they are never compared against earlier ones.
//!
//! Multi-part items are decomposed into one independent adapter invocation
//! per layer, run with small bounded concurrency. A partial success is
//! returned as such and the caller decides whether to accept it.

use crate::backend::{Fragment, GenerationBackend, GenerationRequest, Task};
use crate::error::{Attempt, BackendError, GenerationError, GenerationResult};
use crate::mode::{GarmentAnalysis, GarmentLayer, GenerationMode, GenerationPlan, Output};
use crate::parser::{parse_analysis, parse_fragments, ParseResult};
use crate::prompt::instruction_for;
use atelier_asset::Payload;
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// Upper bound on concurrent calls for the parts of one item
pub const MAX_PART_CONCURRENCY: usize = 5;

/// Outputs of one item, plus how they were obtained
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    /// Outputs in plan order
    pub outputs: Vec<Output>,
    /// Some output was labelled by position rather than metadata
    pub used_positional_fallback: bool,
    /// Layers that were planned but produced nothing
    pub missing_parts: Vec<GarmentLayer>,
}

impl Generation {
    /// Whether some planned parts are missing
    #[inline]
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.missing_parts.is_empty()
    }

    /// Number of outputs produced
    #[inline]
    #[must_use]
    pub fn output_count(&self) -> u32 {
        u32::try_from(self.outputs.len()).unwrap_or(u32::MAX)
    }
}

/// Calls the generation endpoint through an ordered list of backends
#[derive(Clone)]
pub struct GenerationAdapter {
    backends: Vec<Arc<dyn GenerationBackend>>,
}

impl std::fmt::Debug for GenerationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationAdapter")
            .field("backends", &self.backend_names())
            .finish()
    }
}

impl GenerationAdapter {
    /// Create an adapter trying `backends` in order
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn GenerationBackend>>) -> Self {
        Self { backends }
    }

    /// Backend names in fallback order
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Classify a source image
    ///
    /// # Errors
    /// Returns `GenerationError::Exhausted` if no backend produced a
    /// readable analysis
    pub async fn analyze(&self, source: &Payload) -> GenerationResult<GarmentAnalysis> {
        self.with_fallback(source, Task::Analyze, |fragments| {
            let text: Vec<String> = fragments
                .into_iter()
                .filter_map(|f| match f {
                    Fragment::Text(t) => Some(t),
                    Fragment::Binary(_) => None,
                })
                .collect();
            if text.is_empty() {
                return Err(BackendError::NoUsableContent("analysis had no text".into()));
            }
            parse_analysis(&text.join("\n"))
        })
        .await
    }

    /// Generate outputs for a source in one call
    ///
    /// # Errors
    /// Returns `GenerationError::Exhausted` if no backend returned an image
    pub async fn generate(
        &self,
        source: &Payload,
        mode: &GenerationMode,
    ) -> GenerationResult<Vec<Output>> {
        Ok(self.generate_parsed(source, mode, None).await?.outputs)
    }

    /// Generate with the full parse report, optionally for one layer
    ///
    /// # Errors
    /// Returns `GenerationError::Exhausted` if no backend returned an image
    pub async fn generate_parsed(
        &self,
        source: &Payload,
        mode: &GenerationMode,
        layer: Option<GarmentLayer>,
    ) -> GenerationResult<ParseResult> {
        let task = Task::Generate {
            mode: mode.clone(),
            layer,
        };
        self.with_fallback(source, task, |fragments| {
            let parsed = parse_fragments(fragments);
            if parsed.is_empty() {
                Err(BackendError::NoUsableContent("response held no image".into()))
            } else {
                Ok(parsed)
            }
        })
        .await
    }

    /// Generate each layer with an independent call, at most `concurrency`
    /// at a time
    ///
    /// Returns outputs in layer order along with the per-layer failures.
    pub async fn generate_parts(
        &self,
        source: &Payload,
        mode: &GenerationMode,
        layers: &[GarmentLayer],
        concurrency: usize,
    ) -> (Generation, Vec<(GarmentLayer, GenerationError)>) {
        let limit = concurrency.clamp(1, MAX_PART_CONCURRENCY);
        let results: Vec<(GarmentLayer, GenerationResult<ParseResult>)> =
            stream::iter(layers.iter().copied())
                .map(|layer| async move {
                    (layer, self.generate_parsed(source, mode, Some(layer)).await)
                })
                .buffered(limit)
                .collect()
                .await;

        let mut generation = Generation::default();
        let mut failures = Vec::new();
        for (layer, result) in results {
            match result {
                Ok(parsed) => {
                    generation.used_positional_fallback |= parsed.used_positional_fallback;
                    // One image per layer call; extra images are alternates
                    if let Some(mut output) = parsed.outputs.into_iter().next() {
                        if output.positional {
                            output.category = layer.label().to_string();
                        }
                        generation.outputs.push(output);
                    }
                }
                Err(e) => {
                    tracing::warn!(layer = layer.label(), error = %e, "layer generation failed");
                    generation.missing_parts.push(layer);
                    failures.push((layer, e));
                }
            }
        }
        (generation, failures)
    }

    /// Run a plan for one item
    ///
    /// Never returns more outputs than the plan expects; images beyond that
    /// are dropped. A layered plan that produced some but not all layers succeeds with
    /// [`Generation::is_partial`] set.
    ///
    /// # Errors
    /// Returns `GenerationError` when nothing at all was produced
    pub async fn execute(
        &self,
        source: &Payload,
        mode: &GenerationMode,
        plan: &GenerationPlan,
        concurrency: usize,
    ) -> GenerationResult<Generation> {
        match plan {
            GenerationPlan::Single { expected_outputs } => {
                let mut outputs = self.generate_parsed(source, mode, None).await?.outputs;
                let planned = usize::try_from(*expected_outputs).unwrap_or(usize::MAX);
                if outputs.len() > planned {
                    tracing::debug!(
                        planned,
                        returned = outputs.len(),
                        "dropping images beyond the plan"
                    );
                    outputs.truncate(planned);
                }
                Ok(Generation {
                    used_positional_fallback: outputs.iter().any(|o| o.positional),
                    outputs,
                    missing_parts: Vec::new(),
                })
            }
            GenerationPlan::Layered { layers } => {
                let (generation, failures) =
                    self.generate_parts(source, mode, layers, concurrency).await;
                if generation.outputs.is_empty() {
                    return Err(merge_failures(failures));
                }
                Ok(generation)
            }
        }
    }

    async fn with_fallback<T, F>(
        &self,
        source: &Payload,
        task: Task,
        mut accept: F,
    ) -> GenerationResult<T>
    where
        F: FnMut(Vec<Fragment>) -> Result<T, BackendError>,
    {
        if self.backends.is_empty() {
            return Err(GenerationError::NoBackends);
        }
        if source.is_empty() {
            return Err(GenerationError::EmptySource);
        }

        let request = GenerationRequest {
            instruction: instruction_for(&task),
            task,
            source: source.clone(),
        };
        let label = request.task.label();
        let mut attempts = Vec::new();

        for backend in &self.backends {
            let outcome = match backend.invoke(&request).await {
                Ok(raw) => raw.into_fragments().and_then(&mut accept),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(value) => {
                    tracing::debug!(
                        backend = backend.name(),
                        task = label,
                        failed_before = attempts.len(),
                        "backend produced output"
                    );
                    return Ok(value);
                }
                Err(error) => {
                    tracing::warn!(
                        backend = backend.name(),
                        task = label,
                        error = %error,
                        "backend attempt failed, trying next"
                    );
                    attempts.push(Attempt {
                        backend: backend.name().to_string(),
                        error,
                    });
                }
            }
        }

        Err(GenerationError::Exhausted { attempts })
    }
}

fn merge_failures(failures: Vec<(GarmentLayer, GenerationError)>) -> GenerationError {
    let mut attempts = Vec::new();
    for (_, error) in failures {
        match error {
            GenerationError::Exhausted { attempts: more } => attempts.extend(more),
            other => return other,
        }
    }
    GenerationError::Exhausted { attempts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawResponse;
    use crate::mode::GarmentType;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        name: String,
        replies: Mutex<VecDeque<Result<RawResponse, BackendError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &str, replies: Vec<Result<RawResponse, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationBackend for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(&self, _request: &GenerationRequest) -> Result<RawResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Unavailable("script exhausted".into())))
        }
    }

    fn chain(backends: &[&Arc<Scripted>]) -> GenerationAdapter {
        GenerationAdapter::new(
            backends
                .iter()
                .map(|b| Arc::clone(b) as Arc<dyn GenerationBackend>)
                .collect(),
        )
    }

    fn image() -> RawResponse {
        RawResponse::single(vec![Fragment::Binary(Payload::png(b"out".to_vec()))])
    }

    fn source() -> Payload {
        Payload::png(b"src".to_vec())
    }

    #[tokio::test]
    async fn first_success_stops_the_chain() {
        let a = Scripted::new("a", vec![Ok(image())]);
        let b = Scripted::new("b", vec![Ok(image())]);
        let adapter = chain(&[&a, &b]);

        let outputs = adapter
            .generate(&source(), &GenerationMode::extraction())
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn refusal_and_text_only_fall_through() {
        let a = Scripted::new("a", vec![Ok(RawResponse::refused("SAFETY"))]);
        let b = Scripted::new(
            "b",
            vec![Ok(RawResponse::single(vec![Fragment::Text("sorry".into())]))],
        );
        let c = Scripted::new("c", vec![Ok(image())]);
        let adapter = chain(&[&a, &b, &c]);

        let outputs = adapter
            .generate(&source(), &GenerationMode::extraction())
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(c.calls(), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_every_attempt() {
        let a = Scripted::new("a", vec![Err(BackendError::Unavailable("503".into()))]);
        let b = Scripted::new("b", vec![Ok(RawResponse::default())]);
        let adapter = chain(&[&a, &b]);

        let err = adapter
            .generate(&source(), &GenerationMode::extraction())
            .await
            .unwrap_err();
        match &err {
            GenerationError::Exhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].backend, "a");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_outage());
    }

    #[tokio::test]
    async fn no_backends_and_empty_source() {
        let adapter = GenerationAdapter::new(Vec::new());
        assert_eq!(
            adapter.analyze(&source()).await.unwrap_err(),
            GenerationError::NoBackends
        );

        let adapter = chain(&[&Scripted::new("a", vec![])]);
        assert_eq!(
            adapter
                .generate(&Payload::png(Vec::new()), &GenerationMode::extraction())
                .await
                .unwrap_err(),
            GenerationError::EmptySource
        );
    }

    #[tokio::test]
    async fn analysis_falls_back_on_malformed_text() {
        let a = Scripted::new(
            "a",
            vec![Ok(RawResponse::single(vec![Fragment::Text("a shirt".into())]))],
        );
        let b = Scripted::new(
            "b",
            vec![Ok(RawResponse::single(vec![Fragment::Text(
                r#"{"garment_type":"top"}"#.into(),
            )]))],
        );
        let adapter = chain(&[&a, &b]);
        let analysis = adapter.analyze(&source()).await.unwrap();
        assert_eq!(analysis.garment_type, GarmentType::Top);
    }

    #[tokio::test]
    async fn layered_plan_accepts_partial_success() {
        let a = Scripted::new(
            "a",
            vec![
                Ok(image()),
                Err(BackendError::Unavailable("503".into())),
                Ok(image()),
            ],
        );
        let adapter = chain(&[&a]);
        let plan = GenerationPlan::Layered {
            layers: vec![GarmentLayer::Outerwear, GarmentLayer::Top, GarmentLayer::Bottom],
        };

        // Concurrency 1 keeps the scripted replies aligned with layer order
        let generation = adapter
            .execute(&source(), &GenerationMode::extraction(), &plan, 1)
            .await
            .unwrap();
        assert_eq!(generation.output_count(), 2);
        assert!(generation.is_partial());
        assert_eq!(generation.missing_parts, vec![GarmentLayer::Top]);
        assert_eq!(generation.outputs[0].category, "outerwear");
        assert_eq!(generation.outputs[1].category, "bottom");
    }

    #[tokio::test]
    async fn single_plan_keeps_only_planned_outputs() {
        let four = RawResponse::single(
            (0u8..4)
                .map(|i| Fragment::Binary(Payload::png(vec![i; 3])))
                .collect(),
        );
        let a = Scripted::new("a", vec![Ok(four)]);
        let adapter = chain(&[&a]);
        let plan = GenerationPlan::Single { expected_outputs: 1 };

        let generation = adapter
            .execute(&source(), &GenerationMode::extraction(), &plan, 1)
            .await
            .unwrap();
        assert_eq!(generation.output_count(), 1);
        assert_eq!(generation.outputs[0].payload, Payload::png(vec![0; 3]));
        assert!(!generation.is_partial());
    }

    #[tokio::test]
    async fn layered_plan_with_no_outputs_fails() {
        let a = Scripted::new(
            "a",
            vec![
                Err(BackendError::Unavailable("503".into())),
                Err(BackendError::Unavailable("503".into())),
            ],
        );
        let adapter = chain(&[&a]);
        let plan = GenerationPlan::Layered {
            layers: vec![GarmentLayer::Top, GarmentLayer::Bottom],
        };
        let err = adapter
            .execute(&source(), &GenerationMode::extraction(), &plan, 2)
            .await
            .unwrap_err();
        assert!(err.is_outage());
    }
}
