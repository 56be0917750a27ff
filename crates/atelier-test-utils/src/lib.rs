//! Testing utilities for the Atelier workspace
//!
//! Scripted collaborators that record every external call into one shared
//! journal, plus a harness that wires them into an orchestrator.

#![allow(missing_docs)]

use async_trait::async_trait;
use atelier_asset::{Feature, Payload, UserId};
use atelier_core::{
    BatchOrchestrator, Collaborators, CreditError, CreditLedgerGateway, CreditService,
    DebitReceipt, DebitRequest, MemoryCreditService, PipelineConfig,
};
use atelier_gen::{
    BackendError, Fragment, GenerationAdapter, GenerationBackend, GenerationRequest, RawResponse,
    Task,
};
use atelier_store::{
    DurableAssetStore, LocalCache, MemoryObjectStorage, MemorySnapshotBackend, ObjectError,
    ObjectStorage, SignedUrl,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// ---- journal ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Generate { backend: String, task: &'static str },
    Put { path: String },
    Delete { path: String },
    Debit { key: String, units: u64 },
}

impl JournalEntry {
    pub fn is_generate(&self) -> bool {
        matches!(self, Self::Generate { task, .. } if *task != "analyze")
    }

    pub fn is_analyze(&self) -> bool {
        matches!(self, Self::Generate { task: "analyze", .. })
    }

    pub fn is_put(&self) -> bool {
        matches!(self, Self::Put { .. })
    }

    pub fn is_debit(&self) -> bool {
        matches!(self, Self::Debit { .. })
    }
}

/// Ordered record of external calls, shared by every scripted collaborator
#[derive(Debug, Clone, Default)]
pub struct CallJournal(Arc<Mutex<Vec<JournalEntry>>>);

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&JournalEntry) -> bool) -> usize {
        self.0.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, pred: impl Fn(&JournalEntry) -> bool) -> Option<usize> {
        self.0.lock().iter().position(|e| pred(e))
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// ---- generation ----

pub type Reply = Result<RawResponse, BackendError>;

/// Lets a test stop a backend mid-call
#[derive(Debug, Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Backend answering from queued replies, then from defaults
pub struct ScriptedBackend {
    name: String,
    journal: CallJournal,
    analyze: Mutex<VecDeque<Reply>>,
    generate: Mutex<VecDeque<Reply>>,
    default_analyze: Mutex<Reply>,
    default_generate: Mutex<Reply>,
    gate: Mutex<Option<Arc<Gate>>>,
    calls: AtomicUsize,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl ScriptedBackend {
    /// Backend classifying everything as a single top and returning one image
    pub fn new(name: &str, journal: CallJournal) -> Self {
        Self {
            name: name.to_string(),
            journal,
            analyze: Mutex::new(VecDeque::new()),
            generate: Mutex::new(VecDeque::new()),
            default_analyze: Mutex::new(Ok(single_analysis())),
            default_generate: Mutex::new(Ok(image_reply(b"generated"))),
            gate: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_analyze(&self, reply: Reply) -> &Self {
        self.analyze.lock().push_back(reply);
        self
    }

    pub fn push_generate(&self, reply: Reply) -> &Self {
        self.generate.lock().push_back(reply);
        self
    }

    pub fn set_default_analyze(&self, reply: Reply) {
        *self.default_analyze.lock() = reply;
    }

    pub fn set_default_generate(&self, reply: Reply) {
        *self.default_generate.lock() = reply;
    }

    /// Hold every generate call until the gate is released
    pub fn set_gate(&self, gate: Arc<Gate>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn clear_gate(&self) {
        *self.gate.lock() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &GenerationRequest) -> Result<RawResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.journal.record(JournalEntry::Generate {
            backend: self.name.clone(),
            task: request.task.label(),
        });

        let analyze = matches!(request.task, Task::Analyze);
        if !analyze {
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }

        let (queue, default) = if analyze {
            (&self.analyze, &self.default_analyze)
        } else {
            (&self.generate, &self.default_generate)
        };
        let next = queue.lock().pop_front();
        next.unwrap_or_else(|| default.lock().clone())
    }
}

pub fn analysis_reply(json: &str) -> RawResponse {
    RawResponse::single(vec![Fragment::Text(json.to_string())])
}

pub fn single_analysis() -> RawResponse {
    analysis_reply(r#"{"garment_type":"top","recommended_scope":"single"}"#)
}

pub fn outfit_analysis() -> RawResponse {
    analysis_reply(
        r#"{"garment_type":"full_outfit","recommended_scope":"outfit","layers":["top","bottom"]}"#,
    )
}

pub fn image_reply(bytes: &[u8]) -> RawResponse {
    RawResponse::single(vec![Fragment::Binary(Payload::png(bytes.to_vec()))])
}

pub fn images_reply(images: &[&[u8]]) -> RawResponse {
    RawResponse::single(
        images
            .iter()
            .map(|bytes| Fragment::Binary(Payload::png(bytes.to_vec())))
            .collect(),
    )
}

pub fn outage() -> BackendError {
    BackendError::Unavailable("503 service unavailable".into())
}

pub fn refusal() -> BackendError {
    BackendError::Refused {
        reason: "SAFETY".into(),
    }
}

// ---- credits ----

/// In-memory account that journals debits and can be made to fail
#[derive(Debug)]
pub struct RecordingCreditService {
    inner: MemoryCreditService,
    journal: CallJournal,
    fail_debits: AtomicBool,
    balance_calls: AtomicUsize,
}

impl RecordingCreditService {
    pub fn new(balance: u64, journal: CallJournal) -> Self {
        Self {
            inner: MemoryCreditService::new(balance),
            journal,
            fail_debits: AtomicBool::new(false),
            balance_calls: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> u64 {
        self.inner.current()
    }

    pub fn top_up(&self, units: u64) {
        self.inner.top_up(units);
    }

    pub fn set_fail_debits(&self, fail: bool) {
        self.fail_debits.store(fail, Ordering::SeqCst);
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CreditService for RecordingCreditService {
    async fn balance(&self, user: &UserId) -> Result<u64, CreditError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.balance(user).await
    }

    async fn debit(&self, request: &DebitRequest) -> Result<DebitReceipt, CreditError> {
        if self.fail_debits.load(Ordering::SeqCst) {
            return Err(CreditError::Unavailable("ledger timeout".into()));
        }
        let receipt = self.inner.debit(request).await?;
        self.journal.record(JournalEntry::Debit {
            key: request.idempotency_key.clone(),
            units: request.units,
        });
        Ok(receipt)
    }
}

// ---- storage ----

/// Memory object storage that journals writes and can be made to fail
#[derive(Debug)]
pub struct JournalingStorage {
    pub inner: MemoryObjectStorage,
    journal: CallJournal,
    fail_puts: AtomicBool,
    puts_left: Mutex<Option<usize>>,
}

impl JournalingStorage {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            inner: MemoryObjectStorage::new(),
            journal,
            fail_puts: AtomicBool::new(false),
            puts_left: Mutex::new(None),
        }
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Accept the next `n` puts, then fail every later one
    pub fn fail_puts_after(&self, n: usize) {
        *self.puts_left.lock() = Some(n);
    }
}

#[async_trait]
impl ObjectStorage for JournalingStorage {
    async fn put_object(&self, path: &str, payload: &Payload) -> Result<(), ObjectError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ObjectError::Unavailable("bucket unreachable".into()));
        }
        let exhausted = match self.puts_left.lock().as_mut() {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        };
        if exhausted {
            return Err(ObjectError::Unavailable("bucket unreachable".into()));
        }
        self.inner.put_object(path, payload).await?;
        self.journal.record(JournalEntry::Put {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn signed_urls(
        &self,
        paths: &[String],
        ttl_secs: u64,
    ) -> Result<Vec<SignedUrl>, ObjectError> {
        self.inner.signed_urls(paths, ttl_secs).await
    }

    async fn delete_object(&self, path: &str) -> Result<(), ObjectError> {
        self.inner.delete_object(path).await?;
        self.journal.record(JournalEntry::Delete {
            path: path.to_string(),
        });
        Ok(())
    }
}

// ---- fixtures ----

pub fn test_user() -> UserId {
    UserId::new("user-1").unwrap()
}

/// Distinct source image number `n`
pub fn source(n: u32) -> Payload {
    Payload::png(format!("source-image-{n}").into_bytes())
}

// ---- harness ----

/// Orchestrator wired to scripted collaborators
pub struct Harness {
    pub orchestrator: BatchOrchestrator,
    pub config: PipelineConfig,
    pub backends: Vec<Arc<ScriptedBackend>>,
    pub credits: Arc<RecordingCreditService>,
    pub storage: Arc<JournalingStorage>,
    pub snapshots: Arc<MemorySnapshotBackend>,
    pub cache: LocalCache,
    pub journal: CallJournal,
}

impl Harness {
    /// The primary backend
    pub fn backend(&self) -> &Arc<ScriptedBackend> {
        &self.backends[0]
    }

    /// A fresh orchestrator over the same storage, snapshot and cache, as
    /// after a page reload
    pub fn reopen(&self) -> BatchOrchestrator {
        self.reopen_with_cache(self.cache.clone())
    }

    /// Reload on a device whose local cache is `cache`
    pub fn reopen_with_cache(&self, cache: LocalCache) -> BatchOrchestrator {
        build(
            self.config.clone(),
            &self.backends,
            &self.credits,
            &self.storage,
            &self.snapshots,
            cache,
        )
    }
}

fn build(
    config: PipelineConfig,
    backends: &[Arc<ScriptedBackend>],
    credits: &Arc<RecordingCreditService>,
    storage: &Arc<JournalingStorage>,
    snapshots: &Arc<MemorySnapshotBackend>,
    cache: LocalCache,
) -> BatchOrchestrator {
    let user = test_user();
    let chain: Vec<Arc<dyn GenerationBackend>> = backends
        .iter()
        .map(|b| Arc::clone(b) as Arc<dyn GenerationBackend>)
        .collect();
    let feature: Feature = config.feature;
    let parts = Collaborators {
        adapter: GenerationAdapter::new(chain),
        ledger: CreditLedgerGateway::new(
            Arc::clone(credits) as Arc<dyn CreditService>,
            user.clone(),
        ),
        store: DurableAssetStore::new(
            Arc::clone(storage) as Arc<dyn ObjectStorage>,
            user,
            feature,
        ),
        cache,
        snapshots: Arc::clone(snapshots) as Arc<dyn atelier_store::SnapshotBackend>,
    };
    BatchOrchestrator::new(config, parts)
}

/// Harness with one backend named `primary`
pub fn harness(config: PipelineConfig, credits: u64) -> Harness {
    harness_with_backends(config, credits, &["primary"])
}

/// Harness with one scripted backend per name, tried in order
pub fn harness_with_backends(config: PipelineConfig, credits: u64, names: &[&str]) -> Harness {
    let journal = CallJournal::new();
    let backends: Vec<Arc<ScriptedBackend>> = names
        .iter()
        .map(|n| Arc::new(ScriptedBackend::new(n, journal.clone())))
        .collect();
    let credits = Arc::new(RecordingCreditService::new(credits, journal.clone()));
    let storage = Arc::new(JournalingStorage::new(journal.clone()));
    let snapshots = Arc::new(MemorySnapshotBackend::new());
    let cache = LocalCache::new(16 << 20);
    let orchestrator = build(
        config.clone(),
        &backends,
        &credits,
        &storage,
        &snapshots,
        cache.clone(),
    );
    Harness {
        orchestrator,
        config,
        backends,
        credits,
        storage,
        snapshots,
        cache,
        journal,
    }
}
