//! Error types for the storage layer
//!
//! Provides error handling for:
//! - Remote object storage (put, signed URLs, delete)
//! - Device-local cache spill files
//! - Session snapshot persistence

use atelier_asset::{AssetRef, NamespaceError};
use std::path::PathBuf;

/// Errors from remote object storage
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    /// Object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Reference belongs to another user's namespace
    #[error("reference {reference} is outside the namespace of user {user}")]
    ForeignReference { reference: AssetRef, user: String },

    /// Storage service unreachable or returned a transient failure
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Storage service rejected the request
    #[error("storage rejected request: {0}")]
    Rejected(String),

    /// Signed URL batch did not cover every requested path
    #[error("no signed url returned for {0}")]
    MissingSignedUrl(String),

    /// IO error in a filesystem-backed store
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Namespace error
    #[error("namespace error: {0}")]
    Namespace(#[from] NamespaceError),
}

impl ObjectError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors from the device-local cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// IO error in the spill directory
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Spill file is truncated or malformed
    #[error("corrupt cache entry: {0}")]
    Corrupt(PathBuf),
}

/// Errors from session snapshot persistence
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Backend failed to save, load or remove
    #[error("snapshot backend error: {0}")]
    Backend(String),

    /// IO error in a file-backed snapshot store
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding failed
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Combined storage error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object storage error: {0}")]
    Object(#[from] ObjectError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Result type alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
