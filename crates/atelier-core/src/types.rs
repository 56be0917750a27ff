//! Core pipeline types: work items, their lifecycle and the batch

use atelier_asset::{AssetRef, Payload};
use atelier_gen::{GarmentAnalysis, GenerationMode};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique work item identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Ulid);

impl ItemId {
    /// Generate new item ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Identity of one incarnation of a batch
///
/// Replaced when the batch is cleared; results computed under an older
/// epoch are discarded on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchEpoch(Ulid);

impl BatchEpoch {
    /// Generate new epoch
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a work item
///
/// ```text
/// queued ─▶ analyzing ─▶ queued ─▶ processing ─▶ success
///    ▲                                  │
///    └──────────── error ◀──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Queued,
    Analyzing,
    Processing,
    Success,
    Error,
}

impl ItemStatus {
    /// Terminal for the current run (`success` or `error`)
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Currently occupying the endpoint
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Analyzing | Self::Processing)
    }

    /// Whether `self -> next` is a legal transition
    ///
    /// `analyzing/processing -> queued` covers both the end of analysis and
    /// the reset of items captured mid-flight by a snapshot.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Analyzing | Self::Processing)
                | (Self::Analyzing | Self::Processing | Self::Error, Self::Queued)
                | (Self::Processing, Self::Success | Self::Error)
        )
    }

    /// Stable lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Analyzing => "analyzing",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ItemStatus,
    pub to: ItemStatus,
}

/// A stored output of a successful item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredOutput {
    /// Durable reference; the only persisted identity of the image
    pub reference: AssetRef,
    /// What the output depicts
    pub category: String,
    /// View label, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
}

/// Per-item enqueue options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemOptions {
    /// Overrides the batch mode for this item
    pub mode: Option<GenerationMode>,
}

impl ItemOptions {
    /// Options overriding the mode
    #[inline]
    #[must_use]
    pub fn with_mode(mode: GenerationMode) -> Self {
        Self { mode: Some(mode) }
    }
}

/// One user-submitted source unit
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Stable identifier
    pub id: ItemId,
    /// Source image; only present while the item is live in memory
    pub source: Option<Payload>,
    /// Lifecycle state
    pub status: ItemStatus,
    /// Classification, once analysed
    pub analysis: Option<GarmentAnalysis>,
    /// Stored outputs, in production order; non-empty iff `success`
    pub results: Vec<StoredOutput>,
    /// User-facing failure message; present iff `error`
    pub error: Option<String>,
    /// Billing did not complete for a stored result
    pub billing_issue: Option<String>,
    /// Mode override
    pub mode: Option<GenerationMode>,
    /// Processing attempts so far
    pub attempt: u32,
    /// Source could not be rehydrated after a restore
    pub source_missing: bool,
    /// When the item was enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    /// Create a queued item
    #[must_use]
    pub fn new(source: Payload, mode: Option<GenerationMode>) -> Self {
        Self {
            id: ItemId::new(),
            source: Some(source),
            status: ItemStatus::Queued,
            analysis: None,
            results: Vec::new(),
            error: None,
            billing_issue: None,
            mode,
            attempt: 0,
            source_missing: false,
            enqueued_at: Utc::now(),
        }
    }

    /// Mode in effect for this item
    #[inline]
    #[must_use]
    pub fn effective_mode<'a>(&'a self, batch_mode: &'a GenerationMode) -> &'a GenerationMode {
        self.mode.as_ref().unwrap_or(batch_mode)
    }

    /// References of the stored outputs, in order
    pub fn result_refs(&self) -> impl Iterator<Item = &AssetRef> {
        self.results.iter().map(|r| &r.reference)
    }

    /// Move to `next`, clearing fields the new state must not carry
    ///
    /// # Errors
    /// Returns `TransitionError` for transitions the lifecycle forbids
    pub fn transition_to(&mut self, next: ItemStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        if next != ItemStatus::Error {
            self.error = None;
        }
        if next != ItemStatus::Success {
            self.results.clear();
            self.billing_issue = None;
        }
        self.status = next;
        Ok(())
    }

    /// `results` non-empty iff `success`, `error` present iff `error`
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        (self.results.is_empty() != (self.status == ItemStatus::Success))
            && (self.error.is_some() == (self.status == ItemStatus::Error))
    }
}

/// The work items of one session for one feature
#[derive(Debug, Clone)]
pub struct Batch {
    /// Items in insertion order
    pub items: IndexMap<ItemId, WorkItem>,
    /// Mode shared by items without an override
    pub mode: GenerationMode,
    /// Current incarnation
    pub epoch: BatchEpoch,
}

impl Batch {
    /// Create an empty batch
    #[must_use]
    pub fn new(mode: GenerationMode) -> Self {
        Self {
            items: IndexMap::new(),
            mode,
            epoch: BatchEpoch::new(),
        }
    }

    /// Number of items
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch has no items
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up an item
    #[inline]
    #[must_use]
    pub fn get(&self, id: ItemId) -> Option<&WorkItem> {
        self.items.get(&id)
    }

    /// Items not yet in a terminal state, in order
    #[must_use]
    pub fn pending_ids(&self) -> Vec<ItemId> {
        self.items
            .values()
            .filter(|item| !item.status.is_terminal())
            .map(|item| item.id)
            .collect()
    }

    /// Items currently occupying the endpoint
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.items.values().filter(|i| i.status.is_active()).count()
    }

    /// Count items per status
    #[must_use]
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.values().filter(|i| i.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [ItemStatus; 5] = [
        ItemStatus::Queued,
        ItemStatus::Analyzing,
        ItemStatus::Processing,
        ItemStatus::Success,
        ItemStatus::Error,
    ];

    fn status() -> impl Strategy<Value = ItemStatus> {
        prop::sample::select(ALL.to_vec())
    }

    fn item() -> WorkItem {
        WorkItem::new(Payload::png(b"src".to_vec()), None)
    }

    #[test]
    fn happy_path_transitions() {
        let mut item = item();
        for next in [
            ItemStatus::Analyzing,
            ItemStatus::Queued,
            ItemStatus::Processing,
            ItemStatus::Error,
            ItemStatus::Queued,
            ItemStatus::Processing,
        ] {
            item.transition_to(next).unwrap();
        }
        assert_eq!(item.status, ItemStatus::Processing);
    }

    #[test]
    fn success_is_final() {
        for next in ALL {
            assert!(!ItemStatus::Success.can_transition_to(next));
        }
        assert!(!ItemStatus::Queued.can_transition_to(ItemStatus::Success));
        assert!(!ItemStatus::Analyzing.can_transition_to(ItemStatus::Processing));
    }

    #[test]
    fn item_id_parses_back() {
        let id = ItemId::new();
        assert_eq!(id.to_string().parse::<ItemId>().unwrap(), id);
    }

    proptest! {
        #[test]
        fn transitions_preserve_consistency(steps in prop::collection::vec(status(), 0..24)) {
            let mut item = item();
            for next in steps {
                let before = item.status;
                match item.transition_to(next) {
                    Ok(()) => {
                        // Emulate what the orchestrator records on each state
                        match next {
                            ItemStatus::Error => item.error = Some("failed".into()),
                            ItemStatus::Success => item.results.push(StoredOutput {
                                reference: AssetRef::parse("users/u/asset-extraction/outputs/x.png").unwrap(),
                                category: "upper".into(),
                                view: None,
                            }),
                            _ => {}
                        }
                    }
                    Err(e) => {
                        prop_assert_eq!(e.from, before);
                        prop_assert_eq!(item.status, before);
                    }
                }
                prop_assert!(item.is_consistent());
            }
        }
    }
}
