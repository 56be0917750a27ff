//! Access URL book
//!
//! Keeps the most recent access URL for every reference currently on
//! display. URLs live only here, in memory; the [`AssetRef`] is the durable
//! identity and a fresh URL can always be derived from it.
//!
//! Refresh happens two ways:
//! - proactively, on a fixed interval, for URLs that would lapse before the
//!   next tick ([`AccessUrlBook::spawn_refresher`])
//! - reactively, when a render fails ([`AccessUrlBook::on_render_failure`])

use crate::durable::{AccessUrl, DurableAssetStore};
use crate::error::ObjectError;
use atelier_asset::AssetRef;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// In-memory map from reference to its current access URL
pub struct AccessUrlBook {
    store: DurableAssetStore,
    ttl_secs: u64,
    margin: Duration,
    entries: DashMap<AssetRef, AccessUrl>,
    clock: Clock,
}

impl std::fmt::Debug for AccessUrlBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessUrlBook")
            .field("ttl_secs", &self.ttl_secs)
            .field("margin", &self.margin)
            .field("tracked", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl AccessUrlBook {
    /// Create a book issuing URLs valid for `ttl_secs`, treating URLs within
    /// `margin_secs` of expiry as stale
    #[must_use]
    pub fn new(store: DurableAssetStore, ttl_secs: u64, margin_secs: u64) -> Self {
        Self {
            store,
            ttl_secs,
            margin: Duration::seconds(i64::try_from(margin_secs).unwrap_or(0)),
            entries: DashMap::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Number of references being tracked
    #[inline]
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Current URL for a reference, fetching one if missing or stale
    ///
    /// # Errors
    /// Returns `ObjectError` if a fresh URL cannot be issued
    pub async fn url_for(&self, reference: &AssetRef) -> Result<AccessUrl, ObjectError> {
        let mut urls = self.urls_for(std::slice::from_ref(reference)).await?;
        urls.remove(reference)
            .ok_or_else(|| ObjectError::MissingSignedUrl(reference.to_string()))
    }

    /// Current URLs for many references, fetching all stale ones in a
    /// single storage call
    ///
    /// # Errors
    /// Returns `ObjectError` if the storage call fails
    pub async fn urls_for(
        &self,
        references: &[AssetRef],
    ) -> Result<HashMap<AssetRef, AccessUrl>, ObjectError> {
        let now = self.now();
        let mut out = HashMap::with_capacity(references.len());
        let mut stale = Vec::new();

        for reference in references {
            match self.entries.get(reference) {
                Some(entry) if !entry.is_stale(now, self.margin) => {
                    out.insert(reference.clone(), entry.value().clone());
                }
                _ => stale.push(reference.clone()),
            }
        }

        if !stale.is_empty() {
            let fresh = self.store.get_access_urls(&stale, self.ttl_secs).await?;
            for (reference, url) in fresh {
                self.entries.insert(reference.clone(), url.clone());
                out.insert(reference, url);
            }
        }
        Ok(out)
    }

    /// A rendered URL failed to load: issue a new one for the same reference
    ///
    /// # Errors
    /// Returns `ObjectError` if a fresh URL cannot be issued
    pub async fn on_render_failure(&self, reference: &AssetRef) -> Result<AccessUrl, ObjectError> {
        tracing::debug!(reference = %reference, "render failed, refreshing access url");
        self.entries.remove(reference);
        self.url_for(reference).await
    }

    /// Refresh every tracked URL that lapses within `horizon`
    ///
    /// Returns the number of URLs refreshed.
    ///
    /// # Errors
    /// Returns `ObjectError` if the storage call fails
    pub async fn refresh_expiring(&self, horizon: Duration) -> Result<usize, ObjectError> {
        let cutoff = self.now() + horizon;
        let expiring: Vec<AssetRef> = self
            .entries
            .iter()
            .filter(|e| e.value().is_stale(cutoff, self.margin))
            .map(|e| e.key().clone())
            .collect();
        if expiring.is_empty() {
            return Ok(0);
        }

        let fresh = self.store.get_access_urls(&expiring, self.ttl_secs).await?;
        let refreshed = fresh.len();
        for (reference, url) in fresh {
            self.entries.insert(reference, url);
        }
        tracing::debug!(refreshed, "proactively refreshed access urls");
        Ok(refreshed)
    }

    /// Stop tracking a reference
    pub fn forget(&self, reference: &AssetRef) {
        self.entries.remove(reference);
    }

    /// Stop tracking everything
    pub fn forget_all(&self) {
        self.entries.clear();
    }

    /// Spawn a task refreshing expiring URLs every `interval`
    ///
    /// The task runs until the returned handle is aborted.
    pub fn spawn_refresher(self: Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let horizon = Duration::from_std(interval).unwrap_or_else(|_| Duration::seconds(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh_expiring(horizon).await {
                    tracing::warn!(error = %e, "access url refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MemoryObjectStorage;
    use atelier_asset::{AssetKind, Feature, Payload, UserId};
    use parking_lot::Mutex;

    async fn setup() -> (Arc<MemoryObjectStorage>, DurableAssetStore, AssetRef) {
        let storage = Arc::new(MemoryObjectStorage::new());
        let store = DurableAssetStore::new(
            storage.clone(),
            UserId::new("u1").unwrap(),
            Feature::AssetExtraction,
        );
        let r = store
            .put(&Payload::png(b"img".to_vec()), AssetKind::Output)
            .await
            .unwrap();
        (storage, store, r)
    }

    #[tokio::test]
    async fn fresh_urls_are_reused() {
        let (_, store, r) = setup().await;
        let book = AccessUrlBook::new(store, 600, 30);

        let first = book.url_for(&r).await.unwrap();
        let second = book.url_for(&r).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(book.tracked(), 1);
    }

    #[tokio::test]
    async fn stale_urls_are_reissued() {
        let (_, store, r) = setup().await;
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = now.clone();
        let book = AccessUrlBook::new(store, 600, 30)
            .with_clock(Arc::new(move || *clock_now.lock()));

        let first = book.url_for(&r).await.unwrap();
        *now.lock() += Duration::seconds(590);
        let second = book.url_for(&r).await.unwrap();
        assert_ne!(first.url, second.url);
    }

    #[tokio::test]
    async fn render_failure_swaps_url_for_same_ref() {
        let (storage, store, r) = setup().await;
        let book = AccessUrlBook::new(store, 600, 30);

        let first = book.url_for(&r).await.unwrap();
        let second = book.on_render_failure(&r).await.unwrap();
        assert_ne!(first.url, second.url);
        assert!(storage.resolve(&second.url, Utc::now()).is_some());
    }

    #[tokio::test]
    async fn refresh_expiring_only_touches_lapsing_urls() {
        let (_, store, r) = setup().await;
        let book = AccessUrlBook::new(store, 600, 30);
        book.url_for(&r).await.unwrap();

        assert_eq!(book.refresh_expiring(Duration::seconds(60)).await.unwrap(), 0);
        assert_eq!(book.refresh_expiring(Duration::seconds(3600)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn forget_drops_tracking() {
        let (_, store, r) = setup().await;
        let book = AccessUrlBook::new(store, 600, 30);
        book.url_for(&r).await.unwrap();
        book.forget(&r);
        assert_eq!(book.tracked(), 0);
    }
}
