//! Binary-free batch projection
//!
//! What a snapshot keeps: item ids, statuses, stored output references,
//! analysis results, error text and mode configuration. What it never
//! keeps: source payloads and access URLs.

use crate::types::{Batch, ItemId, ItemStatus, StoredOutput, WorkItem};
use atelier_gen::{GarmentAnalysis, GenerationMode};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Persisted form of one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: ItemId,
    pub status: ItemStatus,
    #[serde(default)]
    pub analysis: Option<GarmentAnalysis>,
    #[serde(default)]
    pub results: Vec<StoredOutput>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub billing_issue: Option<String>,
    #[serde(default)]
    pub mode: Option<GenerationMode>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub source_missing: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl From<&WorkItem> for ItemSnapshot {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            status: item.status,
            analysis: item.analysis.clone(),
            results: item.results.clone(),
            error: item.error.clone(),
            billing_issue: item.billing_issue.clone(),
            mode: item.mode.clone(),
            attempt: item.attempt,
            source_missing: item.source_missing,
            enqueued_at: item.enqueued_at,
        }
    }
}

impl ItemSnapshot {
    /// Rebuild the item without its source
    #[must_use]
    pub fn into_item(self) -> WorkItem {
        WorkItem {
            id: self.id,
            source: None,
            status: self.status,
            analysis: self.analysis,
            results: self.results,
            error: self.error,
            billing_issue: self.billing_issue,
            mode: self.mode,
            attempt: self.attempt,
            source_missing: self.source_missing,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Persisted form of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub mode: GenerationMode,
    pub items: Vec<ItemSnapshot>,
}

impl BatchSnapshot {
    /// Project the full current state of a batch
    #[must_use]
    pub fn capture(batch: &Batch) -> Self {
        Self {
            mode: batch.mode.clone(),
            items: batch.items.values().map(ItemSnapshot::from).collect(),
        }
    }

    /// Rebuild a batch under a fresh epoch
    ///
    /// Sources are absent; the caller rehydrates them.
    #[must_use]
    pub fn into_batch(self) -> Batch {
        let mut batch = Batch::new(self.mode);
        batch.items = self
            .items
            .into_iter()
            .map(|s| (s.id, s.into_item()))
            .collect::<IndexMap<_, _>>();
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_asset::{AssetRef, Payload};
    use atelier_gen::{GarmentLayer, GarmentType};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn status() -> impl Strategy<Value = ItemStatus> {
        prop_oneof![
            Just(ItemStatus::Queued),
            Just(ItemStatus::Analyzing),
            Just(ItemStatus::Processing),
            Just(ItemStatus::Success),
            Just(ItemStatus::Error),
        ]
    }

    fn build_item(status: ItemStatus, outputs: usize, analysed: bool) -> WorkItem {
        let mut item = WorkItem::new(Payload::png(b"src".to_vec()), None);
        item.status = status;
        if analysed {
            item.analysis = Some(GarmentAnalysis::outfit(vec![
                GarmentLayer::Top,
                GarmentLayer::Bottom,
            ]));
        }
        if status == ItemStatus::Success {
            for n in 0..outputs.max(1) {
                item.results.push(StoredOutput {
                    reference: AssetRef::parse(format!(
                        "users/u1/asset-extraction/outputs/{n:064x}.png"
                    ))
                    .unwrap(),
                    category: "upper".into(),
                    view: None,
                });
            }
        }
        if status == ItemStatus::Error {
            item.error = Some("Generation failed.".into());
        }
        item
    }

    #[test]
    fn snapshot_json_has_no_binary_or_urls() {
        let mut batch = Batch::new(GenerationMode::extraction());
        let item = build_item(ItemStatus::Success, 2, true);
        batch.items.insert(item.id, item);

        let json = serde_json::to_string(&BatchSnapshot::capture(&batch)).unwrap();
        assert!(!json.contains("\"source\""));
        assert!(!json.contains("mem://"));
        assert!(!json.contains("expires"));
        assert!(json.contains("users/u1/asset-extraction/outputs/"));
    }

    #[test]
    fn restored_items_have_no_source() {
        let mut batch = Batch::new(GenerationMode::catalog(2).with_garment_hint(GarmentType::Dress));
        let item = build_item(ItemStatus::Queued, 0, false);
        let id = item.id;
        batch.items.insert(id, item);

        let restored = BatchSnapshot::capture(&batch).into_batch();
        assert_eq!(restored.get(id).unwrap().source, None);
        assert_eq!(restored.mode, batch.mode);
        assert_ne!(restored.epoch, batch.epoch);
    }

    proptest! {
        #[test]
        fn roundtrip_preserves_statuses_and_refs(
            specs in prop::collection::vec((status(), 0usize..4, any::<bool>()), 0..12)
        ) {
            let mut batch = Batch::new(GenerationMode::extraction());
            for (status, outputs, analysed) in specs {
                let item = build_item(status, outputs, analysed);
                batch.items.insert(item.id, item);
            }

            let json = serde_json::to_string(&BatchSnapshot::capture(&batch)).unwrap();
            let restored: BatchSnapshot = serde_json::from_str(&json).unwrap();
            let restored = restored.into_batch();

            let before: Vec<_> = batch
                .items
                .values()
                .map(|i| (i.id, i.status, i.results.clone(), i.analysis.clone()))
                .collect();
            let after: Vec<_> = restored
                .items
                .values()
                .map(|i| (i.id, i.status, i.results.clone(), i.analysis.clone()))
                .collect();
            prop_assert_eq!(before, after);
        }
    }
}
