//! Remote object storage boundary
//!
//! [`ObjectStorage`] is the raw external interface: put an object at a
//! path, request signed URLs for a set of paths, delete an object. Paths
//! are opaque here; namespacing is enforced one level up by
//! [`DurableAssetStore`](crate::DurableAssetStore).

use crate::error::ObjectError;
use atelier_asset::{Payload, UrlSigner};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A time-limited URL for one stored path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    /// Object path the URL points at
    pub path: String,
    /// The URL itself
    pub url: String,
}

/// Raw remote object storage
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `payload` at `path`, overwriting any previous object
    async fn put_object(&self, path: &str, payload: &Payload) -> Result<(), ObjectError>;

    /// Issue URLs valid for `ttl_secs` for every path in `paths`
    async fn signed_urls(
        &self,
        paths: &[String],
        ttl_secs: u64,
    ) -> Result<Vec<SignedUrl>, ObjectError>;

    /// Delete the object at `path`. Deleting a missing object is not an error.
    async fn delete_object(&self, path: &str) -> Result<(), ObjectError>;
}

/// In-process object storage
///
/// Signed URLs embed their expiry and a per-issue sequence number, so two
/// URLs for the same path are never equal and expiry can be checked with
/// [`MemoryObjectStorage::resolve`].
#[derive(Debug)]
pub struct MemoryObjectStorage {
    objects: DashMap<String, Payload>,
    issued: AtomicU64,
    signer: UrlSigner,
}

impl MemoryObjectStorage {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            issued: AtomicU64::new(0),
            signer: UrlSigner::from_secret("atelier-memory-storage"),
        }
    }

    /// Number of stored objects
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no objects are stored
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether `path` is stored
    #[inline]
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    /// Fetch an object directly, bypassing URLs
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Payload> {
        self.objects.get(path).map(|p| p.value().clone())
    }

    /// Resolve a signed URL as a renderer would at time `now`
    ///
    /// Returns `None` for expired, forged, or dangling URLs.
    #[must_use]
    pub fn resolve(&self, url: &str, now: DateTime<Utc>) -> Option<Payload> {
        let parsed = parse_memory_url(url)?;
        if parsed.expires < now.timestamp() {
            return None;
        }
        if !self
            .signer
            .verify(&parsed.path, parsed.expires, parsed.seq, &parsed.sig)
        {
            return None;
        }
        self.get(&parsed.path)
    }
}

impl Default for MemoryObjectStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put_object(&self, path: &str, payload: &Payload) -> Result<(), ObjectError> {
        self.objects.insert(path.to_string(), payload.clone());
        Ok(())
    }

    async fn signed_urls(
        &self,
        paths: &[String],
        ttl_secs: u64,
    ) -> Result<Vec<SignedUrl>, ObjectError> {
        let expires = (Utc::now() + ttl_duration(ttl_secs)).timestamp();
        // Missing paths are simply omitted, as hosted stores do
        Ok(paths
            .iter()
            .filter(|p| self.objects.contains_key(p.as_str()))
            .map(|path| {
                let seq = self.issued.fetch_add(1, Ordering::Relaxed);
                let sig = self.signer.sign(path, expires, seq);
                SignedUrl {
                    path: path.clone(),
                    url: format!("mem://{path}?expires={expires}&seq={seq}&sig={sig}"),
                }
            })
            .collect())
    }

    async fn delete_object(&self, path: &str) -> Result<(), ObjectError> {
        self.objects.remove(path);
        Ok(())
    }
}

struct MemoryUrl {
    path: String,
    expires: i64,
    seq: u64,
    sig: String,
}

fn parse_memory_url(url: &str) -> Option<MemoryUrl> {
    let rest = url.strip_prefix("mem://")?;
    let (path, query) = rest.split_once('?')?;
    let mut expires = None;
    let mut seq = None;
    let mut sig = None;
    for pair in query.split('&') {
        match pair.split_once('=')? {
            ("expires", v) => expires = v.parse().ok(),
            ("seq", v) => seq = v.parse().ok(),
            ("sig", v) => sig = Some(v.to_string()),
            _ => {}
        }
    }
    Some(MemoryUrl {
        path: path.to_string(),
        expires: expires?,
        seq: seq?,
        sig: sig?,
    })
}

/// Convert a TTL in seconds to a `Duration`, capped at one hundred years
pub(crate) fn ttl_duration(ttl_secs: u64) -> Duration {
    const CAP: i64 = 100 * 365 * 24 * 60 * 60;
    Duration::seconds(i64::try_from(ttl_secs).unwrap_or(CAP).min(CAP))
}
