//! Batch orchestrator
//!
//! Owns the batch and drives every item through its lifecycle. All state
//! changes go through this type's methods; nothing else mutates items.
//!
//! # Run
//!
//! 1. Pending items (not `success`/`error`) are selected; completed items
//!    are never reprocessed
//! 2. Analysis pass: one item at a time, `queued -> analyzing -> queued`
//! 3. One pre-flight balance check for the credits the analyses imply
//! 4. Processing pass: one item at a time, generate -> store -> debit
//!
//! Per-item failures are recorded on the item and the pass continues.
//! Batch-level conditions (insufficient credits, endpoint outage) stop the
//! pass and are returned once.
//!
//! # Staleness
//!
//! Clearing the batch replaces its [`BatchEpoch`]. Work in flight under the
//! old epoch runs to completion but its results are discarded on arrival,
//! and its snapshot writes are dropped.

use crate::config::PipelineConfig;
use crate::error::{BatchError, BatchResult, PipelineError};
use crate::events::{BatchEvent, EventBus};
use crate::ledger::CreditLedgerGateway;
use crate::snapshot::BatchSnapshot;
use crate::types::{Batch, BatchEpoch, ItemId, ItemOptions, ItemStatus, StoredOutput, WorkItem};
use atelier_asset::{AssetKind, AssetRef, Payload, SessionKey, UserId};
use atelier_gen::{GarmentAnalysis, GarmentType, GenerationAdapter, GenerationMode};
use atelier_store::{
    AccessUrl, AccessUrlBook, DurableAssetStore, LocalCache, SnapshotBackend, SnapshotStore,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// External collaborators of one orchestrator
#[derive(Clone)]
pub struct Collaborators {
    /// Generation endpoint
    pub adapter: GenerationAdapter,
    /// Credit service
    pub ledger: CreditLedgerGateway,
    /// Durable storage, scoped to the user and feature
    pub store: DurableAssetStore,
    /// Device-local payload cache
    pub cache: LocalCache,
    /// Session snapshot persistence
    pub snapshots: Arc<dyn SnapshotBackend>,
}

/// Summary of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items that reached `success`
    pub succeeded: Vec<ItemId>,
    /// Items that reached `error`
    pub failed: Vec<ItemId>,
    /// Items left `queued` because analysis failed
    pub deferred: Vec<ItemId>,
    /// Successful items whose debit did not complete
    pub billing_issues: Vec<ItemId>,
    /// Credits charged during the run
    pub credits_debited: u64,
}

/// Summary of a restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Items loaded from the snapshot
    pub restored: usize,
    /// Items captured mid-flight and put back in the queue
    pub reset: Vec<ItemId>,
    /// Unfinished items whose source could not be rehydrated
    pub missing_sources: Vec<ItemId>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("adapter", &self.adapter)
            .field("ledger", &self.ledger)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

enum ItemOutcome {
    Succeeded { credits: u64, billing_issue: bool },
    Failed { outage: bool },
}

/// Clears the running flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> BatchResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BatchError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives a batch through analysis, credit admission and generation
pub struct BatchOrchestrator {
    config: PipelineConfig,
    user: UserId,
    session: SessionKey,
    adapter: GenerationAdapter,
    ledger: CreditLedgerGateway,
    store: DurableAssetStore,
    cache: LocalCache,
    snapshots: SnapshotStore<BatchSnapshot>,
    urls: Arc<AccessUrlBook>,
    // Never held across an await
    batch: Mutex<Batch>,
    persist_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
    events: EventBus,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let batch = self.batch.lock();
        f.debug_struct("BatchOrchestrator")
            .field("session", &self.session)
            .field("items", &batch.len())
            .field("epoch", &batch.epoch)
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    /// Create an orchestrator with an empty batch
    ///
    /// The user is taken from the durable store's namespace.
    #[must_use]
    pub fn new(config: PipelineConfig, parts: Collaborators) -> Self {
        let user = parts.store.user().clone();
        let session = SessionKey::new(&user, config.feature);
        let urls = Arc::new(AccessUrlBook::new(
            parts.store.clone(),
            config.access_url_ttl_secs,
            config.url_refresh_margin_secs,
        ));
        Self {
            batch: Mutex::new(Batch::new(config.default_mode())),
            snapshots: SnapshotStore::new(parts.snapshots, session.clone()),
            adapter: parts.adapter,
            ledger: parts.ledger,
            store: parts.store,
            cache: parts.cache,
            urls,
            user,
            session,
            config,
            persist_lock: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            events: EventBus::default(),
        }
    }

    /// Replace the access URL book (e.g. to inject a clock)
    #[must_use]
    pub fn with_url_book(mut self, urls: AccessUrlBook) -> Self {
        self.urls = Arc::new(urls);
        self
    }

    /// Session key snapshots are stored under
    #[inline]
    #[must_use]
    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Subscribe to progress events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Copy of every item, in insertion order
    #[must_use]
    pub fn items(&self) -> Vec<WorkItem> {
        self.batch.lock().items.values().cloned().collect()
    }

    /// Copy of one item
    #[must_use]
    pub fn item(&self, id: ItemId) -> Option<WorkItem> {
        self.batch.lock().get(id).cloned()
    }

    /// Batch mode
    #[must_use]
    pub fn mode(&self) -> GenerationMode {
        self.batch.lock().mode.clone()
    }

    /// Replace the batch mode for items without an override
    pub async fn set_mode(&self, mode: GenerationMode) {
        let epoch = {
            let mut batch = self.batch.lock();
            batch.mode = mode;
            batch.epoch
        };
        self.persist(epoch).await;
    }

    fn current_epoch(&self) -> BatchEpoch {
        self.batch.lock().epoch
    }

    fn source_key(&self, id: ItemId) -> String {
        format!("{}/source/{id}", self.session)
    }

    // ---- intake ----

    /// Add a source to the batch
    ///
    /// `mode` becomes the item's override when it differs from the batch
    /// mode.
    ///
    /// # Errors
    /// Returns `BatchError::EmptySource` for an empty payload
    pub async fn enqueue(&self, source: Payload, mode: GenerationMode) -> BatchResult<ItemId> {
        let override_mode = (mode != self.mode()).then_some(mode);
        self.enqueue_with(source, ItemOptions { mode: override_mode })
            .await
    }

    /// Add a source with per-item options
    ///
    /// # Errors
    /// Returns `BatchError::EmptySource` for an empty payload
    pub async fn enqueue_with(&self, source: Payload, options: ItemOptions) -> BatchResult<ItemId> {
        if source.is_empty() {
            return Err(BatchError::EmptySource);
        }
        let item = WorkItem::new(source.clone(), options.mode);
        let id = item.id;
        self.cache.put_local(&self.source_key(id), source).await;

        let epoch = {
            let mut batch = self.batch.lock();
            batch.items.insert(id, item);
            batch.epoch
        };
        tracing::debug!(item_id = %id, user_id = %self.user, "item enqueued");
        self.events.publish(BatchEvent::ItemEnqueued { id });
        self.persist(epoch).await;
        Ok(id)
    }

    /// Provide a new source for an item whose source went missing
    ///
    /// # Errors
    /// Returns `BatchError::UnknownItem`, `EmptySource`, or `InvalidState`
    /// if the item is being worked on
    pub async fn resupply_source(&self, id: ItemId, source: Payload) -> BatchResult<()> {
        if source.is_empty() {
            return Err(BatchError::EmptySource);
        }
        {
            let mut batch = self.batch.lock();
            let item = batch.items.get_mut(&id).ok_or(BatchError::UnknownItem(id))?;
            if item.status.is_active() {
                return Err(BatchError::InvalidState {
                    id,
                    status: item.status,
                });
            }
            item.source = Some(source.clone());
            item.source_missing = false;
        }
        self.cache.put_local(&self.source_key(id), source).await;
        self.persist(self.current_epoch()).await;
        Ok(())
    }

    // ---- runs ----

    /// Run every pending item
    ///
    /// # Errors
    /// Returns a `BatchError` for batch-level conditions only; per-item
    /// failures are recorded on the items
    pub async fn start_batch(&self) -> BatchResult<BatchReport> {
        let _guard = RunGuard::acquire(&self.running)?;
        self.run_pass(None).await
    }

    /// Re-run one failed item
    ///
    /// Takes the same `error -> queued` transition a resume does, then runs
    /// the ordinary pass restricted to this item.
    ///
    /// # Errors
    /// Returns `BatchError::InvalidState` unless the item is `error` or
    /// `queued`, plus any batch-level condition of the pass
    pub async fn retry_item(&self, id: ItemId) -> BatchResult<BatchReport> {
        let _guard = RunGuard::acquire(&self.running)?;
        let epoch = {
            let mut batch = self.batch.lock();
            let item = batch.items.get_mut(&id).ok_or(BatchError::UnknownItem(id))?;
            match item.status {
                ItemStatus::Queued => {}
                ItemStatus::Error => {
                    let from = item.status;
                    item.transition_to(ItemStatus::Queued)
                        .map_err(|_| BatchError::InvalidState { id, status: from })?;
                    self.events.publish(BatchEvent::StatusChanged {
                        id,
                        from,
                        to: ItemStatus::Queued,
                    });
                }
                status => return Err(BatchError::InvalidState { id, status }),
            }
            batch.epoch
        };
        tracing::info!(item_id = %id, "retrying item");
        self.persist(epoch).await;
        self.run_pass(Some(id)).await
    }

    async fn run_pass(&self, only: Option<ItemId>) -> BatchResult<BatchReport> {
        let (epoch, pending) = {
            let batch = self.batch.lock();
            let pending: Vec<ItemId> = batch
                .pending_ids()
                .into_iter()
                .filter(|id| only.map_or(true, |o| o == *id))
                .collect();
            (batch.epoch, pending)
        };
        let mut report = BatchReport::default();
        if pending.is_empty() {
            tracing::debug!("nothing to process");
            return Ok(report);
        }
        tracing::info!(items = pending.len(), user_id = %self.user, "starting batch pass");

        // Analysis pass
        let mut ready = Vec::with_capacity(pending.len());
        for id in pending {
            if self.analyze_item(id, epoch).await? {
                ready.push(id);
            } else {
                report.deferred.push(id);
            }
        }

        // Admission
        let required = self.required_credits(&ready);
        if required > 0 {
            let check = self
                .ledger
                .check_balance(required)
                .await
                .map_err(BatchError::BalanceCheck)?;
            if !check.is_sufficient() {
                let err = PipelineError::InsufficientCredits {
                    required,
                    available: check.available,
                };
                tracing::warn!(required, available = check.available, "batch aborted before generation");
                self.events.publish(BatchEvent::BatchHalted {
                    reason: err.user_message(),
                });
                return Err(BatchError::InsufficientCredits {
                    required,
                    available: check.available,
                });
            }
        }

        // Processing pass
        for id in ready {
            match self.process_item(id, epoch).await? {
                ItemOutcome::Succeeded {
                    credits,
                    billing_issue,
                } => {
                    report.succeeded.push(id);
                    report.credits_debited += credits;
                    if billing_issue {
                        report.billing_issues.push(id);
                    }
                }
                ItemOutcome::Failed { outage } => {
                    report.failed.push(id);
                    if outage && self.config.halt_on_outage {
                        let err = BatchError::EndpointOutage { item: id };
                        tracing::warn!(item_id = %id, "endpoint outage, halting pass");
                        self.events.publish(BatchEvent::BatchHalted {
                            reason: err.user_message(),
                        });
                        return Err(err);
                    }
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            credits = report.credits_debited,
            "batch pass finished"
        );
        Ok(report)
    }

    /// Returns whether the item is ready for processing
    async fn analyze_item(&self, id: ItemId, epoch: BatchEpoch) -> BatchResult<bool> {
        let source = {
            let batch = self.batch.lock();
            let Some(item) = batch.get(id) else {
                return Ok(false);
            };
            if item.analysis.is_some() || item.source.is_none() {
                // Already analysed, or will fail with re-upload guidance
                return Ok(true);
            }
            item.source.clone()
        };
        let Some(source) = source else {
            return Ok(true);
        };

        self.set_status(id, epoch, ItemStatus::Analyzing)?;
        self.persist(epoch).await;

        let result = self.adapter.analyze(&source).await;
        self.ensure_epoch(epoch)?;

        let ready = match result {
            Ok(analysis) => {
                tracing::debug!(item_id = %id, garment = ?analysis.garment_type, "item analysed");
                let mut batch = self.batch.lock();
                if let Some(item) = batch.items.get_mut(&id) {
                    item.analysis = Some(analysis);
                }
                true
            }
            Err(e) => {
                let err = PipelineError::AnalysisFailed(e);
                tracing::warn!(item_id = %id, error = %err, "analysis failed, item stays queued");
                false
            }
        };
        self.set_status(id, epoch, ItemStatus::Queued)?;
        self.persist(epoch).await;
        Ok(ready)
    }

    fn required_credits(&self, ids: &[ItemId]) -> u64 {
        let batch = self.batch.lock();
        let outputs: u64 = ids
            .iter()
            .filter_map(|id| batch.get(*id))
            .filter(|item| item.source.is_some())
            .map(|item| {
                let analysis = item.analysis.clone().unwrap_or_else(fallback_analysis);
                u64::from(item.effective_mode(&batch.mode).plan(&analysis).expected_outputs())
            })
            .sum();
        outputs * self.config.credits_per_output
    }

    async fn process_item(&self, id: ItemId, epoch: BatchEpoch) -> BatchResult<ItemOutcome> {
        let (source, mode, analysis, attempt) = {
            let mut batch = self.batch.lock();
            let batch_mode = batch.mode.clone();
            let Some(item) = batch.items.get_mut(&id) else {
                return Ok(ItemOutcome::Failed { outage: false });
            };
            item.attempt += 1;
            (
                item.source.clone(),
                item.effective_mode(&batch_mode).clone(),
                item.analysis.clone(),
                item.attempt,
            )
        };

        self.set_status(id, epoch, ItemStatus::Processing)?;
        self.persist(epoch).await;

        let Some(source) = source else {
            return self.fail_item(id, epoch, &PipelineError::SourceMissing).await;
        };

        let mut analysis = analysis.unwrap_or_else(fallback_analysis);
        if let Some(hint) = mode.garment_hint {
            analysis.garment_type = hint;
        }
        let plan = mode.plan(&analysis);
        let expected = plan.expected_outputs();

        // 1. generate
        let generation = self
            .adapter
            .execute(&source, &mode, &plan, self.config.part_concurrency())
            .await;
        self.ensure_epoch(epoch)?;
        let generation = match generation {
            Ok(generation) => generation,
            Err(e) => {
                let outage = e.is_outage();
                let err = PipelineError::GenerationFailed(e);
                let outcome = self.fail_item(id, epoch, &err).await?;
                return Ok(match outcome {
                    ItemOutcome::Failed { .. } => ItemOutcome::Failed { outage },
                    other => other,
                });
            }
        };
        if generation.is_partial() && !self.config.accept_partial_outputs {
            let err = PipelineError::PartialOutput {
                produced: generation.output_count(),
                expected,
            };
            return self.fail_item(id, epoch, &err).await;
        }
        if generation.used_positional_fallback {
            tracing::debug!(item_id = %id, "outputs labelled by position");
        }

        // 2. store
        let mut stored = Vec::with_capacity(generation.outputs.len());
        for (index, output) in generation.outputs.iter().enumerate() {
            let scope = format!("{id}/{index}");
            match self.store.put_scoped(&output.payload, AssetKind::Output, &scope).await {
                Ok(reference) => stored.push(StoredOutput {
                    reference,
                    category: output.category.clone(),
                    view: output.view.clone(),
                }),
                Err(e) => {
                    self.discard_outputs(&stored).await;
                    let err = PipelineError::StorageUploadFailed(e);
                    return self.fail_item(id, epoch, &err).await;
                }
            }
        }
        if self.current_epoch() != epoch {
            self.discard_outputs(&stored).await;
            return Err(BatchError::Cleared);
        }

        // 3. debit
        let units = u64::from(generation.output_count()) * self.config.credits_per_output;
        let requested = u64::from(expected) * self.config.credits_per_output;
        let key = format!("{id}:{attempt}");
        let reason = format!("{} x{}", mode.feature, generation.output_count());
        let billing_issue = match self.ledger.debit(&key, requested, units, &reason).await {
            Ok(_) => None,
            Err(e) => {
                let err = PipelineError::DebitFailed(e);
                tracing::error!(
                    item_id = %id,
                    user_id = %self.user,
                    units,
                    key = %key,
                    error = %err,
                    "debit failed for stored output, needs reconciliation"
                );
                Some(err.user_message())
            }
        };
        self.ensure_epoch(epoch)?;

        {
            let mut batch = self.batch.lock();
            let Some(item) = batch.items.get_mut(&id) else {
                return Err(BatchError::UnknownItem(id));
            };
            let from = item.status;
            item.transition_to(ItemStatus::Success)
                .map_err(|_| BatchError::InvalidState { id, status: from })?;
            item.results = stored;
            item.billing_issue.clone_from(&billing_issue);
            self.events.publish(BatchEvent::StatusChanged {
                id,
                from,
                to: ItemStatus::Success,
            });
        }
        if let Some(message) = &billing_issue {
            self.events.publish(BatchEvent::BillingIssue {
                id,
                message: message.clone(),
            });
        }
        tracing::info!(item_id = %id, outputs = generation.output_count(), units, "item succeeded");
        self.persist(epoch).await;

        Ok(ItemOutcome::Succeeded {
            credits: if billing_issue.is_some() { 0 } else { units },
            billing_issue: billing_issue.is_some(),
        })
    }

    async fn fail_item(
        &self,
        id: ItemId,
        epoch: BatchEpoch,
        err: &PipelineError,
    ) -> BatchResult<ItemOutcome> {
        tracing::warn!(item_id = %id, error = %err, "item failed");
        {
            let mut batch = self.batch.lock();
            if batch.epoch != epoch {
                return Err(BatchError::Cleared);
            }
            let Some(item) = batch.items.get_mut(&id) else {
                return Err(BatchError::UnknownItem(id));
            };
            let from = item.status;
            item.transition_to(ItemStatus::Error)
                .map_err(|_| BatchError::InvalidState { id, status: from })?;
            item.error = Some(err.user_message());
            if matches!(err, PipelineError::SourceMissing) {
                item.source_missing = true;
            }
            self.events.publish(BatchEvent::StatusChanged {
                id,
                from,
                to: ItemStatus::Error,
            });
        }
        self.persist(epoch).await;
        Ok(ItemOutcome::Failed { outage: false })
    }

    async fn discard_outputs(&self, stored: &[StoredOutput]) {
        for output in stored {
            if let Err(e) = self.store.delete(&output.reference).await {
                tracing::warn!(reference = %output.reference, error = %e, "failed to discard output");
            }
        }
    }

    fn set_status(&self, id: ItemId, epoch: BatchEpoch, to: ItemStatus) -> BatchResult<()> {
        let mut batch = self.batch.lock();
        if batch.epoch != epoch {
            return Err(BatchError::Cleared);
        }
        let item = batch.items.get_mut(&id).ok_or(BatchError::UnknownItem(id))?;
        let from = item.status;
        item.transition_to(to)
            .map_err(|_| BatchError::InvalidState { id, status: from })?;
        self.events.publish(BatchEvent::StatusChanged { id, from, to });
        Ok(())
    }

    fn ensure_epoch(&self, epoch: BatchEpoch) -> BatchResult<()> {
        if self.current_epoch() == epoch {
            Ok(())
        } else {
            tracing::debug!("batch cleared while a call was in flight, discarding result");
            Err(BatchError::Cleared)
        }
    }

    // ---- lifecycle ----

    /// Reset the workspace: drop every item and the snapshot
    ///
    /// Stored outputs are left in durable storage. A run in flight finishes
    /// its current call and discards the result.
    ///
    /// # Errors
    /// Returns `BatchError::Snapshot` if the snapshot cannot be removed
    pub async fn clear_batch(&self) -> BatchResult<()> {
        let _persist = self.persist_lock.lock().await;
        let (ids, epoch) = {
            let mut batch = self.batch.lock();
            let ids: Vec<ItemId> = batch.items.keys().copied().collect();
            batch.items.clear();
            batch.epoch = BatchEpoch::new();
            (ids, batch.epoch)
        };
        for id in &ids {
            self.cache.remove_local(&self.source_key(*id)).await;
        }
        self.urls.forget_all();
        self.snapshots.clear().await?;
        tracing::info!(items = ids.len(), session = %self.session, "batch cleared");
        self.events.publish(BatchEvent::BatchCleared { epoch });
        Ok(())
    }

    /// Rebuild the batch from the session snapshot
    ///
    /// Items captured mid-flight go back to `queued`. Sources of unfinished
    /// items are rehydrated from the local cache; those that cannot be are
    /// flagged and will fail with re-upload guidance when processed.
    ///
    /// # Errors
    /// Returns `BatchError::Snapshot` if the backend itself fails
    pub async fn restore(&self) -> BatchResult<RestoreReport> {
        let Some(snapshot) = self.snapshots.load().await? else {
            tracing::debug!(session = %self.session, "no snapshot to restore");
            return Ok(RestoreReport::default());
        };

        let mut restored = snapshot.into_batch();
        let mut report = RestoreReport {
            restored: restored.len(),
            ..RestoreReport::default()
        };

        for item in restored.items.values_mut() {
            if item.status.is_active() {
                item.status = ItemStatus::Queued;
                report.reset.push(item.id);
            }
            if item.status == ItemStatus::Success {
                continue;
            }
            match self.cache.get_local(&self.source_key(item.id)).await {
                Some(source) => {
                    item.source = Some(source);
                    item.source_missing = false;
                }
                None => {
                    item.source_missing = true;
                    report.missing_sources.push(item.id);
                }
            }
        }

        let epoch = restored.epoch;
        *self.batch.lock() = restored;
        tracing::info!(
            restored = report.restored,
            reset = report.reset.len(),
            missing = report.missing_sources.len(),
            "batch restored"
        );
        self.persist(epoch).await;
        Ok(report)
    }

    /// Write the full current projection now (page hide, unmount)
    ///
    /// # Errors
    /// Returns `BatchError::Snapshot` if the write fails
    pub async fn persist_now(&self) -> BatchResult<()> {
        let _persist = self.persist_lock.lock().await;
        let snapshot = BatchSnapshot::capture(&self.batch.lock());
        self.snapshots.save(&snapshot).await?;
        Ok(())
    }

    async fn persist(&self, epoch: BatchEpoch) {
        let _persist = self.persist_lock.lock().await;
        let snapshot = {
            let batch = self.batch.lock();
            if batch.epoch != epoch {
                return;
            }
            BatchSnapshot::capture(&batch)
        };
        if let Err(e) = self.snapshots.save(&snapshot).await {
            tracing::warn!(session = %self.session, error = %e, "snapshot write failed");
        }
    }

    /// Remove one item and its stored outputs
    ///
    /// # Errors
    /// Returns `BatchError::UnknownItem`, or `InvalidState` while the item
    /// is being worked on
    pub async fn remove_item(&self, id: ItemId) -> BatchResult<()> {
        let (item, epoch) = {
            let mut batch = self.batch.lock();
            match batch.get(id) {
                None => return Err(BatchError::UnknownItem(id)),
                Some(item) if item.status.is_active() => {
                    return Err(BatchError::InvalidState {
                        id,
                        status: item.status,
                    })
                }
                Some(_) => {}
            }
            let item = batch.items.shift_remove(&id).ok_or(BatchError::UnknownItem(id))?;
            (item, batch.epoch)
        };

        for reference in item.result_refs() {
            self.urls.forget(reference);
            if let Err(e) = self.store.delete(reference).await {
                tracing::warn!(reference = %reference, error = %e, "failed to delete output");
            }
        }
        self.cache.remove_local(&self.source_key(id)).await;
        self.events.publish(BatchEvent::ItemRemoved { id });
        self.persist(epoch).await;
        Ok(())
    }

    // ---- display ----

    /// Access URLs for an item's outputs, in output order
    ///
    /// # Errors
    /// Returns `BatchError::UnknownItem` or a storage error
    pub async fn display_urls(&self, id: ItemId) -> BatchResult<Vec<(AssetRef, AccessUrl)>> {
        let refs: Vec<AssetRef> = self
            .item(id)
            .ok_or(BatchError::UnknownItem(id))?
            .result_refs()
            .cloned()
            .collect();
        let mut urls = self.urls.urls_for(&refs).await?;
        Ok(refs
            .into_iter()
            .filter_map(|r| urls.remove(&r).map(|u| (r, u)))
            .collect())
    }

    /// A displayed output failed to load: issue a fresh URL for the same
    /// reference
    ///
    /// # Errors
    /// Returns a storage error if no URL can be issued
    pub async fn on_render_failure(&self, reference: &AssetRef) -> BatchResult<AccessUrl> {
        Ok(self.urls.on_render_failure(reference).await?)
    }

    /// Start proactive refresh of displayed URLs on the configured interval
    #[must_use]
    pub fn spawn_refresher(&self) -> JoinHandle<()> {
        Arc::clone(&self.urls).spawn_refresher(self.config.url_refresh_interval())
    }
}

fn fallback_analysis() -> GarmentAnalysis {
    GarmentAnalysis::single(GarmentType::Unknown)
}
