//! Atelier Core - resumable, credit-gated batch generation
//!
//! The pipeline that:
//! - Queues user-submitted sources as work items
//! - Classifies each item and admits the batch against the user's credits
//! - Generates outputs one item at a time through the generation adapter
//! - Persists outputs durably before charging for them
//! - Snapshots progress so a reload resumes where it stopped
//!
//! # Example
//!
//! ```rust,ignore
//! use atelier_core::prelude::*;
//!
//! # async fn example(parts: Collaborators) -> Result<(), BatchError> {
//! let orchestrator = BatchOrchestrator::new(PipelineConfig::new(), parts);
//! orchestrator.restore().await?;
//!
//! orchestrator
//!     .enqueue(Payload::png(photo), GenerationMode::extraction())
//!     .await?;
//! let report = orchestrator.start_batch().await?;
//!
//! println!("{} succeeded, {} credits", report.succeeded.len(), report.credits_debited);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod orchestrator;
pub mod reconciler;
pub mod snapshot;
pub mod types;

pub use config::{GenerationConfig, PipelineConfig};
pub use error::{BatchError, BatchResult, ConfigError, CreditError, PipelineError};
pub use events::{BatchEvent, EventBus, EVENT_CAPACITY};
pub use ledger::{
    BalanceCheck, CreditLedgerGateway, CreditService, CreditTransaction, DebitReceipt,
    DebitRequest, MemoryCreditService,
};
pub use orchestrator::{BatchOrchestrator, BatchReport, Collaborators, RestoreReport};
pub use reconciler::{OptimisticList, TempId};
pub use snapshot::{BatchSnapshot, ItemSnapshot};
pub use types::{
    Batch, BatchEpoch, ItemId, ItemOptions, ItemStatus, StoredOutput, TransitionError, WorkItem,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a batch
    pub use crate::{
        BatchError, BatchEvent, BatchOrchestrator, BatchReport, Collaborators,
        CreditLedgerGateway, ItemId, ItemStatus, PipelineConfig, WorkItem,
    };
    pub use atelier_asset::{Feature, Payload, UserId};
    pub use atelier_gen::GenerationMode;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use async_trait::async_trait;
    use atelier_asset::{Feature, Payload, UserId};
    use atelier_gen::{
        BackendError, Fragment, GenerationAdapter, GenerationBackend, GenerationMode,
        GenerationRequest, RawResponse, Task,
    };
    use atelier_store::{
        DurableAssetStore, LocalCache, MemoryObjectStorage, MemorySnapshotBackend,
    };
    use std::sync::Arc;

    /// Outfit analysis, then one image per requested layer
    struct Outfitter;

    #[async_trait]
    impl GenerationBackend for Outfitter {
        fn name(&self) -> &str {
            "outfitter"
        }

        async fn invoke(&self, request: &GenerationRequest) -> Result<RawResponse, BackendError> {
            Ok(match &request.task {
                Task::Analyze => RawResponse::single(vec![Fragment::Text(
                    r#"{"garment_type":"full_outfit","recommended_scope":"outfit","layers":["top","bottom"]}"#
                        .into(),
                )]),
                Task::Generate { layer, .. } => {
                    let tag = layer.map_or("single", |l| l.label());
                    RawResponse::single(vec![Fragment::Binary(Payload::png(
                        format!("{tag}-image").into_bytes(),
                    ))])
                }
            })
        }
    }

    #[tokio::test]
    async fn outfit_flow_charges_per_part() {
        let user = UserId::new("u1").unwrap();
        let credits = Arc::new(MemoryCreditService::new(10));
        let storage = Arc::new(MemoryObjectStorage::new());
        let parts = Collaborators {
            adapter: GenerationAdapter::new(vec![Arc::new(Outfitter)]),
            ledger: CreditLedgerGateway::new(credits.clone(), user.clone()),
            store: DurableAssetStore::new(storage.clone(), user, Feature::AssetExtraction),
            cache: LocalCache::new(1 << 20),
            snapshots: Arc::new(MemorySnapshotBackend::new()),
        };
        let orchestrator = BatchOrchestrator::new(PipelineConfig::new(), parts);

        let id = orchestrator
            .enqueue(Payload::png(b"look".to_vec()), GenerationMode::extraction())
            .await
            .unwrap();
        let report = orchestrator.start_batch().await.unwrap();

        assert_eq!(report.succeeded, vec![id]);
        assert_eq!(report.credits_debited, 2);
        assert_eq!(credits.current(), 8);
        assert_eq!(storage.len(), 2);

        let item = orchestrator.item(id).unwrap();
        let categories: Vec<_> = item.results.iter().map(|r| r.category.as_str()).collect();
        assert_eq!(categories, vec!["top", "bottom"]);
    }
}
