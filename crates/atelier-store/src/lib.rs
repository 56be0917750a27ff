//! Atelier Storage Layer
//!
//! Everything the pipeline keeps outside its own memory.
//!
//! # Tiers
//!
//! - **Durable**: [`DurableAssetStore`] over any [`ObjectStorage`]; the
//!   source of truth for generated and source images, addressed by
//!   [`AssetRef`](atelier_asset::AssetRef)
//! - **Ephemeral**: [`LocalCache`], a device-scoped mirror that may be
//!   rebuilt at any time
//! - **Session**: [`SnapshotStore`], the binary-free projection used to
//!   resume a batch
//!
//! # Architecture
//!
//! ```text
//! Payload ──put──▶ DurableAssetStore ──▶ ObjectStorage (memory / fs / remote)
//!                        │
//!                        └──signed urls──▶ AccessUrlBook (memory only, refreshed)
//!
//! Batch projection ──▶ SnapshotStore ──▶ SnapshotBackend (memory / file)
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod access;
pub mod cache;
pub mod durable;
pub mod error;
pub mod fs;
pub mod object;
pub mod snapshot;

pub use access::{AccessUrlBook, Clock};
pub use cache::{CacheStats, LocalCache};
pub use durable::{AccessUrl, DurableAssetStore};
pub use error::{CacheError, ObjectError, SnapshotError, StoreError, StoreResult};
pub use fs::FsObjectStorage;
pub use object::{MemoryObjectStorage, ObjectStorage, SignedUrl};
pub use snapshot::{
    FileSnapshotBackend, MemorySnapshotBackend, SnapshotBackend, SnapshotStore, SNAPSHOT_VERSION,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the storage layer
    pub use crate::{
        AccessUrl, AccessUrlBook, DurableAssetStore, LocalCache, ObjectError, ObjectStorage,
        SnapshotBackend, SnapshotStore,
    };
}
