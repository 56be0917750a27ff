//! Filesystem object storage
//!
//! Lays objects out under a root directory using their path verbatim.
//!
//! Write strategy:
//! - Temp file next to the destination, then rename for atomic finalize.
//! - Parent directories are created on demand.
//!
//! Signed URLs are `file://` URLs carrying an expiry and a keyed Blake3
//! signature, checked by [`FsObjectStorage::resolve`].

use crate::error::ObjectError;
use crate::object::{ttl_duration, ObjectStorage, SignedUrl};
use atelier_asset::{Payload, UrlSigner};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Object storage rooted at a local directory
#[derive(Debug)]
pub struct FsObjectStorage {
    root: PathBuf,
    signer: UrlSigner,
    issued: AtomicU64,
}

impl FsObjectStorage {
    /// Create a store rooted at `root`, signing URLs with `secret`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, secret: &str) -> Self {
        Self {
            root: root.into(),
            signer: UrlSigner::from_secret(secret),
            issued: AtomicU64::new(0),
        }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, path: &str) -> Result<PathBuf, ObjectError> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s == "..") {
            return Err(ObjectError::Rejected(format!("illegal object path '{path}'")));
        }
        Ok(self.root.join(path))
    }

    /// Resolve a signed URL to a file path, checking expiry and signature
    #[must_use]
    pub fn resolve(&self, url: &str, now: DateTime<Utc>) -> Option<PathBuf> {
        let rest = url.strip_prefix("file://")?;
        let (file, query) = rest.split_once('?')?;
        let mut expires: Option<i64> = None;
        let mut seq: Option<u64> = None;
        let mut sig: Option<&str> = None;
        for pair in query.split('&') {
            match pair.split_once('=')? {
                ("expires", v) => expires = v.parse().ok(),
                ("seq", v) => seq = v.parse().ok(),
                ("sig", v) => sig = Some(v),
                _ => {}
            }
        }
        let (expires, seq, sig) = (expires?, seq?, sig?);
        let file = PathBuf::from(file);
        let relative = file.strip_prefix(&self.root).ok()?.to_str()?.replace('\\', "/");
        if expires < now.timestamp() || !self.signer.verify(&relative, expires, seq, sig) {
            return None;
        }
        Some(file)
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn put_object(&self, path: &str, payload: &Payload) -> Result<(), ObjectError> {
        let dest = self.object_path(path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ObjectError::io_error(parent, e))?;
        }

        let tmp = dest.with_extension(format!(
            "tmp-{}",
            self.issued.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, payload.bytes())
            .await
            .map_err(|e| ObjectError::io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| ObjectError::io_error(&dest, e))?;

        tracing::debug!(path, bytes = payload.len(), "stored object");
        Ok(())
    }

    async fn signed_urls(
        &self,
        paths: &[String],
        ttl_secs: u64,
    ) -> Result<Vec<SignedUrl>, ObjectError> {
        let expires = (Utc::now() + ttl_duration(ttl_secs)).timestamp();
        let mut urls = Vec::with_capacity(paths.len());

        for path in paths {
            let file = self.object_path(path)?;
            if !tokio::fs::try_exists(&file)
                .await
                .map_err(|e| ObjectError::io_error(&file, e))?
            {
                continue;
            }
            let seq = self.issued.fetch_add(1, Ordering::Relaxed);
            let sig = self.signer.sign(path, expires, seq);
            urls.push(SignedUrl {
                path: path.clone(),
                url: format!(
                    "file://{}?expires={expires}&seq={seq}&sig={sig}",
                    file.display()
                ),
            });
        }
        Ok(urls)
    }

    async fn delete_object(&self, path: &str) -> Result<(), ObjectError> {
        let file = self.object_path(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectError::io_error(file, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn put_then_sign_then_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStorage::new(dir.path(), "secret");
        let path = "users/u1/asset-extraction/outputs/abc.png";

        store
            .put_object(path, &Payload::png(b"png".to_vec()))
            .await
            .unwrap();

        let urls = store.signed_urls(&[path.to_string()], 60).await.unwrap();
        assert_eq!(urls.len(), 1);
        let file = store.resolve(&urls[0].url, Utc::now()).unwrap();
        assert_eq!(tokio::fs::read(file).await.unwrap(), b"png");

        let later = Utc::now() + Duration::seconds(61);
        assert!(store.resolve(&urls[0].url, later).is_none());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStorage::new(dir.path(), "secret");
        let err = store
            .put_object("../outside.png", &Payload::png(b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectError::Rejected(_)));
    }

    #[tokio::test]
    async fn missing_objects_get_no_url_and_delete_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStorage::new(dir.path(), "secret");
        let urls = store
            .signed_urls(&["users/u/none.png".to_string()], 60)
            .await
            .unwrap();
        assert!(urls.is_empty());
        store.delete_object("users/u/none.png").await.unwrap();
    }
}
