//! Device-local payload cache using moka
//!
//! Mirrors binary payloads (source previews, thumbnails) without a server
//! round-trip. The cache is non-authoritative: anything in it may be
//! rebuilt from a snapshot or from durable storage, so every failure here
//! degrades to a miss.
//!
//! Two tiers:
//! - an in-memory moka cache bounded by total bytes
//! - an optional spill directory that survives process restarts

use crate::error::CacheError;
use atelier_asset::{ContentHash, Payload};
use moka::future::Cache;
use std::path::{Path, PathBuf};

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in the memory tier
    pub entry_count: u64,
    /// Total weighted size of the memory tier in bytes
    pub weighted_bytes: u64,
}

/// Key/value store for binary payloads scoped to this device
#[derive(Debug, Clone)]
pub struct LocalCache {
    inner: Cache<String, Payload>,
    spill_dir: Option<PathBuf>,
}

impl LocalCache {
    /// Create a memory-only cache bounded by `max_bytes`
    #[inline]
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_bytes)
                .weigher(|_key: &String, value: &Payload| {
                    u32::try_from(value.len()).unwrap_or(u32::MAX)
                })
                .build(),
            spill_dir: None,
        }
    }

    /// Create a cache that also spills entries to `dir`
    #[inline]
    #[must_use]
    pub fn with_spill_dir(max_bytes: u64, dir: impl Into<PathBuf>) -> Self {
        Self {
            spill_dir: Some(dir.into()),
            ..Self::new(max_bytes)
        }
    }

    /// Store a payload under `key`
    pub async fn put_local(&self, key: &str, payload: Payload) {
        if let Some(dir) = &self.spill_dir {
            if let Err(e) = write_spill(dir, key, &payload).await {
                tracing::warn!(key, error = %e, "local cache spill write failed");
            }
        }
        self.inner.insert(key.to_string(), payload).await;
    }

    /// Look up a payload, falling back to the spill tier
    pub async fn get_local(&self, key: &str) -> Option<Payload> {
        if let Some(hit) = self.inner.get(key).await {
            return Some(hit);
        }

        let dir = self.spill_dir.as_ref()?;
        match read_spill(dir, key).await {
            Ok(Some(payload)) => {
                // Promote back into memory
                self.inner.insert(key.to_string(), payload.clone()).await;
                Some(payload)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "local cache spill read failed");
                None
            }
        }
    }

    /// Remove a payload from both tiers
    pub async fn remove_local(&self, key: &str) {
        self.inner.invalidate(key).await;
        if let Some(dir) = &self.spill_dir {
            let path = spill_path(dir, key);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(key, error = %e, "local cache spill remove failed");
                }
            }
        }
    }

    /// Check if key is present in either tier
    pub async fn contains(&self, key: &str) -> bool {
        self.get_local(key).await.is_some()
    }

    /// Get cache statistics for the memory tier
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
            weighted_bytes: self.inner.weighted_size(),
        }
    }
}

impl Default for LocalCache {
    /// Memory-only cache with a 256 MiB budget
    fn default() -> Self {
        Self::new(256 * 1024 * 1024)
    }
}

fn spill_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(ContentHash::compute(key.as_bytes()).to_string())
}

// Spill format: mime type, newline, raw bytes.
async fn write_spill(dir: &Path, key: &str, payload: &Payload) -> Result<(), CacheError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

    let path = spill_path(dir, key);
    let mut buf = Vec::with_capacity(payload.mime_type().len() + 1 + payload.len());
    buf.extend_from_slice(payload.mime_type().as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(payload.bytes());

    tokio::fs::write(&path, buf)
        .await
        .map_err(|source| CacheError::Io { path, source })
}

async fn read_spill(dir: &Path, key: &str) -> Result<Option<Payload>, CacheError> {
    let path = spill_path(dir, key);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(CacheError::Io { path, source }),
    };

    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| CacheError::Corrupt(path.clone()))?;
    let mime = std::str::from_utf8(&raw[..split]).map_err(|_| CacheError::Corrupt(path.clone()))?;
    Ok(Some(Payload::new(raw[split + 1..].to_vec(), mime.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_put_and_get() {
        let cache = LocalCache::new(1024);
        cache.put_local("a", Payload::png(b"alpha".to_vec())).await;

        let hit = cache.get_local("a").await.unwrap();
        assert_eq!(hit.bytes().as_ref(), b"alpha");
        assert!(cache.get_local("missing").await.is_none());
    }

    #[tokio::test]
    async fn cache_remove() {
        let cache = LocalCache::new(1024);
        cache.put_local("a", Payload::png(b"alpha".to_vec())).await;
        cache.remove_local("a").await;
        assert!(!cache.contains("a").await);
    }

    #[tokio::test]
    async fn spill_tier_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let first = LocalCache::with_spill_dir(1024, dir.path());
        first
            .put_local("source/1", Payload::new(b"jpeg!".to_vec(), "image/jpeg"))
            .await;

        // A fresh instance has an empty memory tier, like a restarted process
        let second = LocalCache::with_spill_dir(1024, dir.path());
        let hit = second.get_local("source/1").await.unwrap();
        assert_eq!(hit.mime_type(), "image/jpeg");
        assert_eq!(hit.bytes().as_ref(), b"jpeg!");

        second.remove_local("source/1").await;
        let third = LocalCache::with_spill_dir(1024, dir.path());
        assert!(third.get_local("source/1").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_spill_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::with_spill_dir(1024, dir.path());
        tokio::fs::write(spill_path(dir.path(), "k"), b"no-newline-here")
            .await
            .unwrap();
        assert!(cache.get_local("k").await.is_none());
    }
}
