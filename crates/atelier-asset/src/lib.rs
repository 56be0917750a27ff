//! Atelier Asset Primitives
//!
//! Leaf types shared by every other crate in the workspace.
//!
//! # Core Concepts
//!
//! - [`Payload`]: image bytes with a media type
//! - [`ContentHash`]: 32-byte Blake3 hash naming stored objects
//! - [`UrlSigner`]: signs access URLs issued by storage backends
//! - [`AssetRef`]: durable, per-user reference into remote storage
//! - [`UserId`] / [`Feature`] / [`SessionKey`]: namespacing
//!
//! # Example
//!
//! ```rust,ignore
//! use atelier_asset::{AssetKind, AssetRef, Feature, Payload, UserId};
//!
//! let user = UserId::new("u-1")?;
//! let payload = Payload::png(bytes);
//! let r = AssetRef::build(&user, Feature::AssetExtraction, AssetKind::Output, &payload.hash(), payload.extension());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod hash;
mod namespace;
mod payload;

pub use hash::{ContentHash, HashError, UrlSigner};
pub use namespace::{AssetKind, AssetRef, Feature, NamespaceError, SessionKey, UserId};
pub use payload::{extension_for, mime_for_extension, Payload};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn payload_to_ref() {
        let user = UserId::new("u-1").unwrap();
        let payload = Payload::png(b"fake png".to_vec());
        let r = AssetRef::build(
            &user,
            Feature::CatalogForge,
            AssetKind::Source,
            &payload.hash(),
            payload.extension(),
        );
        assert!(r.belongs_to(&user));
        assert!(r.as_path().contains(&payload.hash().to_string()));
        assert_eq!(AssetRef::parse(r.as_path()).unwrap(), r);
    }
}
