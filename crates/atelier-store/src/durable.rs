//! Durable asset store
//!
//! Wraps raw [`ObjectStorage`] with per-user namespacing. Callers hand it
//! payloads and get back [`AssetRef`]s; access URLs are issued on demand
//! and carry their expiry so they can be refreshed before they lapse.

use crate::error::ObjectError;
use crate::object::{ttl_duration, ObjectStorage};
use atelier_asset::{AssetKind, AssetRef, Feature, Payload, UserId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// A short-lived URL for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUrl {
    /// The URL
    pub url: String,
    /// When the URL stops working
    pub expires_at: DateTime<Utc>,
}

impl AccessUrl {
    /// Whether the URL is expired, or will be within `margin`, at `now`
    #[inline]
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - margin <= now
    }
}

/// Per-user view of remote object storage
#[derive(Clone)]
pub struct DurableAssetStore {
    storage: Arc<dyn ObjectStorage>,
    user: UserId,
    feature: Feature,
}

impl std::fmt::Debug for DurableAssetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableAssetStore")
            .field("user", &self.user)
            .field("feature", &self.feature)
            .finish_non_exhaustive()
    }
}

impl DurableAssetStore {
    /// Create a store scoped to `user` and `feature`
    #[must_use]
    pub fn new(storage: Arc<dyn ObjectStorage>, user: UserId, feature: Feature) -> Self {
        Self {
            storage,
            user,
            feature,
        }
    }

    /// User this store is scoped to
    #[inline]
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Upload a payload and return its durable reference
    ///
    /// The object path is derived from the content hash, so uploading the
    /// same bytes twice yields the same reference.
    ///
    /// # Errors
    /// Returns `ObjectError` if the underlying storage rejects the write
    pub async fn put(&self, payload: &Payload, kind: AssetKind) -> Result<AssetRef, ObjectError> {
        let reference = AssetRef::build(
            &self.user,
            self.feature,
            kind,
            &payload.hash(),
            payload.extension(),
        );
        self.storage.put_object(reference.as_path(), payload).await?;
        tracing::debug!(reference = %reference, bytes = payload.len(), "uploaded asset");
        Ok(reference)
    }

    /// Upload a payload under `scope` and return its durable reference
    ///
    /// The reference is owned by the scope: deleting it never affects an
    /// object uploaded under another scope, whatever its bytes.
    ///
    /// # Errors
    /// Returns `ObjectError` for an invalid scope or a rejected write
    pub async fn put_scoped(
        &self,
        payload: &Payload,
        kind: AssetKind,
        scope: &str,
    ) -> Result<AssetRef, ObjectError> {
        let reference = AssetRef::build_scoped(
            &self.user,
            self.feature,
            kind,
            scope,
            &payload.hash(),
            payload.extension(),
        )?;
        self.storage.put_object(reference.as_path(), payload).await?;
        tracing::debug!(reference = %reference, bytes = payload.len(), "uploaded scoped asset");
        Ok(reference)
    }

    /// Issue an access URL for one reference
    ///
    /// # Errors
    /// Returns `ObjectError::ForeignReference` for refs outside this user's
    /// namespace, or `MissingSignedUrl` if the object does not exist
    pub async fn get_access_url(
        &self,
        reference: &AssetRef,
        ttl_secs: u64,
    ) -> Result<AccessUrl, ObjectError> {
        let mut urls = self
            .get_access_urls(std::slice::from_ref(reference), ttl_secs)
            .await?;
        urls.remove(reference)
            .ok_or_else(|| ObjectError::MissingSignedUrl(reference.to_string()))
    }

    /// Issue access URLs for many references in one storage call
    ///
    /// References the storage returned no URL for are absent from the map.
    ///
    /// # Errors
    /// Returns `ObjectError::ForeignReference` if any reference is outside
    /// this user's namespace
    pub async fn get_access_urls(
        &self,
        references: &[AssetRef],
        ttl_secs: u64,
    ) -> Result<HashMap<AssetRef, AccessUrl>, ObjectError> {
        if references.is_empty() {
            return Ok(HashMap::new());
        }
        for reference in references {
            self.check_owned(reference)?;
        }

        let requested_at = Utc::now();
        let paths: Vec<String> = references.iter().map(|r| r.as_path().to_string()).collect();
        let signed = self.storage.signed_urls(&paths, ttl_secs).await?;

        let ttl = ttl_duration(ttl_secs);
        let mut out = HashMap::with_capacity(signed.len());
        for s in signed {
            let reference = AssetRef::parse(s.path)?;
            out.insert(
                reference,
                AccessUrl {
                    url: s.url,
                    expires_at: requested_at + ttl,
                },
            );
        }
        Ok(out)
    }

    /// Delete a stored object
    ///
    /// # Errors
    /// Returns `ObjectError` if the reference is foreign or storage fails
    pub async fn delete(&self, reference: &AssetRef) -> Result<(), ObjectError> {
        self.check_owned(reference)?;
        self.storage.delete_object(reference.as_path()).await?;
        tracing::debug!(reference = %reference, "deleted asset");
        Ok(())
    }

    fn check_owned(&self, reference: &AssetRef) -> Result<(), ObjectError> {
        if reference.belongs_to(&self.user) {
            Ok(())
        } else {
            Err(ObjectError::ForeignReference {
                reference: reference.clone(),
                user: self.user.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MemoryObjectStorage;

    fn store_for(user: &str, storage: Arc<MemoryObjectStorage>) -> DurableAssetStore {
        DurableAssetStore::new(storage, UserId::new(user).unwrap(), Feature::AssetExtraction)
    }

    #[tokio::test]
    async fn put_returns_namespaced_ref() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let store = store_for("u1", storage.clone());

        let r = store
            .put(&Payload::png(b"out".to_vec()), AssetKind::Output)
            .await
            .unwrap();
        assert!(r.as_path().starts_with("users/u1/"));
        assert!(storage.contains(r.as_path()));
    }

    #[tokio::test]
    async fn access_url_resolves_and_expires() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let store = store_for("u1", storage.clone());
        let r = store
            .put(&Payload::png(b"out".to_vec()), AssetKind::Output)
            .await
            .unwrap();

        let url = store.get_access_url(&r, 300).await.unwrap();
        assert!(storage.resolve(&url.url, Utc::now()).is_some());
        assert!(!url.is_stale(Utc::now(), Duration::seconds(30)));
        assert!(url.is_stale(Utc::now() + Duration::seconds(280), Duration::seconds(30)));
    }

    #[tokio::test]
    async fn foreign_refs_are_rejected() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let alice = store_for("alice", storage.clone());
        let bob = store_for("bob", storage);

        let r = alice
            .put(&Payload::png(b"mine".to_vec()), AssetKind::Output)
            .await
            .unwrap();

        assert!(matches!(
            bob.get_access_url(&r, 60).await,
            Err(ObjectError::ForeignReference { .. })
        ));
        assert!(matches!(
            bob.delete(&r).await,
            Err(ObjectError::ForeignReference { .. })
        ));
    }

    #[tokio::test]
    async fn missing_object_has_no_url() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let store = store_for("u1", storage);
        let r = AssetRef::parse("users/u1/asset-extraction/outputs/gone.png").unwrap();
        assert!(matches!(
            store.get_access_url(&r, 60).await,
            Err(ObjectError::MissingSignedUrl(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_object() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let store = store_for("u1", storage.clone());
        let r = store
            .put(&Payload::png(b"x".to_vec()), AssetKind::Source)
            .await
            .unwrap();
        store.delete(&r).await.unwrap();
        assert!(!storage.contains(r.as_path()));
    }

    #[tokio::test]
    async fn scoped_delete_leaves_identical_bytes_elsewhere() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let store = store_for("u1", storage.clone());
        let payload = Payload::png(b"same".to_vec());
        let a = store.put_scoped(&payload, AssetKind::Output, "a/0").await.unwrap();
        let b = store.put_scoped(&payload, AssetKind::Output, "b/0").await.unwrap();
        assert_ne!(a, b);

        store.delete(&a).await.unwrap();
        assert!(!storage.contains(a.as_path()));
        assert!(store.get_access_url(&b, 60).await.is_ok());

        assert!(matches!(
            store.put_scoped(&payload, AssetKind::Output, "../x").await,
            Err(ObjectError::Namespace(_))
        ));
    }
}
