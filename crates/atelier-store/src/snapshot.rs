//! Session snapshot persistence
//!
//! A snapshot is the compact, binary-free projection of pipeline state that
//! lets a session resume after a reload. Writes are always whole-state and
//! last-write-wins, so duplicate writes from overlapping lifecycle triggers
//! are harmless.
//!
//! Snapshots are wrapped in a versioned envelope. A snapshot that cannot be
//! decoded, or that was written by a newer schema, is treated as absent.

use crate::error::SnapshotError;
use async_trait::async_trait;
use atelier_asset::SessionKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Current envelope schema version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Raw key/value persistence for snapshot JSON
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Store `json` under `key`, replacing any previous value
    async fn save(&self, key: &str, json: &str) -> Result<(), SnapshotError>;

    /// Load the value under `key`
    async fn load(&self, key: &str) -> Result<Option<String>, SnapshotError>;

    /// Remove the value under `key`
    async fn remove(&self, key: &str) -> Result<(), SnapshotError>;
}

/// In-process snapshot backend
#[derive(Debug, Default)]
pub struct MemorySnapshotBackend {
    values: DashMap<String, String>,
    saves: AtomicU64,
}

impl MemorySnapshotBackend {
    /// Create an empty backend
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored value
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Total number of successful saves
    #[inline]
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotBackend for MemorySnapshotBackend {
    async fn save(&self, key: &str, json: &str) -> Result<(), SnapshotError> {
        self.values.insert(key.to_string(), json.to_string());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<String>, SnapshotError> {
        Ok(self.raw(key))
    }

    async fn remove(&self, key: &str) -> Result<(), SnapshotError> {
        self.values.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory
#[derive(Debug)]
pub struct FileSnapshotBackend {
    dir: PathBuf,
    writes: AtomicU64,
}

impl FileSnapshotBackend {
    /// Create a backend storing files in `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writes: AtomicU64::new(0),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl SnapshotBackend for FileSnapshotBackend {
    async fn save(&self, key: &str, json: &str) -> Result<(), SnapshotError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SnapshotError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.path_for(key);
        let tmp = path.with_extension(format!(
            "json.tmp-{}",
            self.writes.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| SnapshotError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| SnapshotError::Io { path, source })
    }

    async fn load(&self, key: &str) -> Result<Option<String>, SnapshotError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SnapshotError::Io { path, source }),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), SnapshotError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SnapshotError::Io { path, source }),
        }
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    version: u32,
    saved_at: DateTime<Utc>,
    data: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeIn<T> {
    version: u32,
    #[allow(dead_code)]
    saved_at: DateTime<Utc>,
    data: T,
}

/// Typed snapshot store for one session key
pub struct SnapshotStore<T> {
    backend: Arc<dyn SnapshotBackend>,
    key: SessionKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for SnapshotStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T> Clone for SnapshotStore<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> SnapshotStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a store for `key`
    #[must_use]
    pub fn new(backend: Arc<dyn SnapshotBackend>, key: SessionKey) -> Self {
        Self {
            backend,
            key,
            _marker: PhantomData,
        }
    }

    /// Session key
    #[inline]
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Write the full projection
    ///
    /// # Errors
    /// Returns `SnapshotError` if encoding or the backend fails
    pub async fn save(&self, data: &T) -> Result<(), SnapshotError> {
        let json = serde_json::to_string(&EnvelopeOut {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            data,
        })?;
        self.backend.save(self.key.as_str(), &json).await
    }

    /// Read the snapshot, if a usable one exists
    ///
    /// # Errors
    /// Returns `SnapshotError` only when the backend itself fails; corrupt or
    /// incompatible snapshots are discarded and reported as `None`
    pub async fn load(&self) -> Result<Option<T>, SnapshotError> {
        let Some(raw) = self.backend.load(self.key.as_str()).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<EnvelopeIn<T>>(&raw) {
            Ok(envelope) if envelope.version <= SNAPSHOT_VERSION => Ok(Some(envelope.data)),
            Ok(envelope) => {
                tracing::warn!(
                    key = %self.key,
                    version = envelope.version,
                    "discarding snapshot written by a newer schema"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "discarding unreadable snapshot");
                Ok(None)
            }
        }
    }

    /// Delete the snapshot
    ///
    /// # Errors
    /// Returns `SnapshotError` if the backend fails
    pub async fn clear(&self) -> Result<(), SnapshotError> {
        self.backend.remove(self.key.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_asset::{Feature, UserId};
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Demo {
        items: Vec<String>,
    }

    fn key() -> SessionKey {
        SessionKey::new(&UserId::new("u1").unwrap(), Feature::CatalogForge)
    }

    #[tokio::test]
    async fn save_load_clear() {
        let backend = Arc::new(MemorySnapshotBackend::new());
        let store: SnapshotStore<Demo> = SnapshotStore::new(backend.clone(), key());

        assert_eq!(store.load().await.unwrap(), None);

        let demo = Demo {
            items: vec!["a".into(), "b".into()],
        };
        store.save(&demo).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(demo));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_write_wins() {
        let backend = Arc::new(MemorySnapshotBackend::new());
        let store: SnapshotStore<Demo> = SnapshotStore::new(backend.clone(), key());
        store.save(&Demo { items: vec!["old".into()] }).await.unwrap();
        store.save(&Demo { items: vec!["new".into()] }).await.unwrap();
        store.save(&Demo { items: vec!["new".into()] }).await.unwrap();

        assert_eq!(store.load().await.unwrap().unwrap().items, vec!["new".to_string()]);
        assert_eq!(backend.save_count(), 3);
    }

    #[tokio::test]
    async fn corrupt_or_future_snapshots_load_as_none() {
        let backend = Arc::new(MemorySnapshotBackend::new());
        let store: SnapshotStore<Demo> = SnapshotStore::new(backend.clone(), key());

        backend.save(key().as_str(), "{not json").await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);

        backend
            .save(
                key().as_str(),
                r#"{"version":99,"saved_at":"2026-01-01T00:00:00Z","data":{"items":[]}}"#,
            )
            .await
            .unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileSnapshotBackend::new(dir.path()));
        let store: SnapshotStore<Demo> = SnapshotStore::new(backend, key());

        let demo = Demo {
            items: vec!["x".into()],
        };
        store.save(&demo).await.unwrap();

        // New backend over the same directory sees the snapshot
        let reopened: SnapshotStore<Demo> =
            SnapshotStore::new(Arc::new(FileSnapshotBackend::new(dir.path())), key());
        assert_eq!(reopened.load().await.unwrap(), Some(demo));

        reopened.clear().await.unwrap();
        reopened.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
