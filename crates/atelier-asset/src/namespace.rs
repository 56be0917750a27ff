//! Per-user namespacing for stored objects and session keys
//!
//! Every remote object path and every snapshot key is derived from a
//! [`UserId`] and a [`Feature`], which is what keeps one user's batches
//! isolated from another's.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Identity supplied by the authentication collaborator
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id
    ///
    /// # Errors
    /// Returns error if the id is empty or contains path separators
    pub fn new(id: impl Into<String>) -> Result<Self, NamespaceError> {
        let id = id.into();
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(NamespaceError::InvalidUserId(id));
        }
        Ok(Self(id))
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = NamespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Pipeline feature a batch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    /// Garment extraction from photos
    #[default]
    AssetExtraction,
    /// Catalog image generation
    CatalogForge,
}

impl Feature {
    /// Stable slug used in paths and keys
    #[inline]
    #[must_use]
    pub const fn slug(self) -> &'static str {
        match self {
            Self::AssetExtraction => "asset-extraction",
            Self::CatalogForge => "catalog-forge",
        }
    }
}

impl Display for Feature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Feature {
    type Err = NamespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asset-extraction" => Ok(Self::AssetExtraction),
            "catalog-forge" => Ok(Self::CatalogForge),
            other => Err(NamespaceError::UnknownFeature(other.to_string())),
        }
    }
}

/// What an object under a user's namespace holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    /// User-submitted source image
    Source,
    /// Generated output
    Output,
}

impl AssetKind {
    const fn dir(self) -> &'static str {
        match self {
            Self::Source => "sources",
            Self::Output => "outputs",
        }
    }
}

/// Opaque, durable reference to an object in remote storage
///
/// This is the identity persisted in snapshots. Access URLs are derived
/// from it on demand and never stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetRef(String);

impl AssetRef {
    /// Build the namespaced path for an object
    #[must_use]
    pub fn build(
        user: &UserId,
        feature: Feature,
        kind: AssetKind,
        hash: &ContentHash,
        extension: &str,
    ) -> Self {
        Self(format!(
            "users/{}/{}/{}/{}.{}",
            user,
            feature.slug(),
            kind.dir(),
            hash,
            extension
        ))
    }

    /// Build a path under an owner-chosen scope inside the kind directory
    ///
    /// Objects in different scopes never share a path, even when their
    /// bytes are identical.
    ///
    /// # Errors
    /// Returns error if `scope` is empty or would escape the namespace
    pub fn build_scoped(
        user: &UserId,
        feature: Feature,
        kind: AssetKind,
        scope: &str,
        hash: &ContentHash,
        extension: &str,
    ) -> Result<Self, NamespaceError> {
        let valid = !scope.is_empty()
            && scope.split('/').all(|s| !s.is_empty() && s != "." && s != "..");
        if !valid {
            return Err(NamespaceError::InvalidRef(scope.to_string()));
        }
        Ok(Self(format!(
            "users/{}/{}/{}/{}/{}.{}",
            user,
            feature.slug(),
            kind.dir(),
            scope,
            hash,
            extension
        )))
    }

    /// Wrap an existing path
    ///
    /// # Errors
    /// Returns error if the path is not under a user namespace
    pub fn parse(path: impl Into<String>) -> Result<Self, NamespaceError> {
        let path = path.into();
        let mut segments = path.split('/');
        let valid = segments.next() == Some("users")
            && segments.next().is_some_and(|u| !u.is_empty())
            && segments.clone().count() >= 1
            && !path.contains("..");
        if !valid {
            return Err(NamespaceError::InvalidRef(path));
        }
        Ok(Self(path))
    }

    /// Path within the object store
    #[inline]
    #[must_use]
    pub fn as_path(&self) -> &str {
        &self.0
    }

    /// Whether this reference lives in `user`'s namespace
    #[must_use]
    pub fn belongs_to(&self, user: &UserId) -> bool {
        self.0
            .strip_prefix("users/")
            .and_then(|rest| rest.split('/').next())
            .is_some_and(|owner| owner == user.as_str())
    }
}

impl Display for AssetRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key for session snapshot persistence, namespaced per user per feature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Build the key for a user's feature session
    #[must_use]
    pub fn new(user: &UserId, feature: Feature) -> Self {
        Self(format!("atelier:{}:{}", feature.slug(), user))
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Namespace construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamespaceError {
    #[error("invalid user id: '{0}'")]
    InvalidUserId(String),

    #[error("unknown feature: '{0}'")]
    UnknownFeature(String),

    #[error("invalid asset reference: '{0}'")]
    InvalidRef(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_rejects_path_tricks() {
        assert!(UserId::new("").is_err());
        assert!(UserId::new("a/b").is_err());
        assert!(UserId::new("..").is_err());
        assert!(UserId::new("user-42").is_ok());
    }

    #[test]
    fn asset_ref_is_namespaced() {
        let user = UserId::new("u1").unwrap();
        let hash = ContentHash::compute(b"png bytes");
        let r = AssetRef::build(&user, Feature::AssetExtraction, AssetKind::Output, &hash, "png");

        assert!(r.as_path().starts_with("users/u1/asset-extraction/outputs/"));
        assert!(r.as_path().ends_with(".png"));
        assert!(r.belongs_to(&user));
        assert!(!r.belongs_to(&UserId::new("u2").unwrap()));
    }

    #[test]
    fn scoped_refs_separate_identical_bytes() {
        let user = UserId::new("u1").unwrap();
        let hash = ContentHash::compute(b"same bytes");
        let build = |scope: &str| {
            AssetRef::build_scoped(&user, Feature::AssetExtraction, AssetKind::Output, scope, &hash, "png")
        };
        let a = build("item-a/0").unwrap();
        let b = build("item-b/0").unwrap();
        assert_ne!(a, b);
        assert_eq!(
            a.as_path(),
            format!("users/u1/asset-extraction/outputs/item-a/0/{hash}.png")
        );
        assert!(a.belongs_to(&user));
        assert_eq!(AssetRef::parse(a.as_path()).unwrap(), a);

        for bad in ["", "..", "a/../b", "a//b", "/a"] {
            assert!(build(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn asset_ref_parse_requires_user_prefix() {
        assert!(AssetRef::parse("users/u1/x.png").is_ok());
        assert!(AssetRef::parse("public/x.png").is_err());
        assert!(AssetRef::parse("users//x.png").is_err());
        assert!(AssetRef::parse("users/u1/../u2/x.png").is_err());
    }

    #[test]
    fn session_key_distinguishes_feature_and_user() {
        let a = UserId::new("a").unwrap();
        let b = UserId::new("b").unwrap();
        assert_ne!(
            SessionKey::new(&a, Feature::AssetExtraction),
            SessionKey::new(&a, Feature::CatalogForge)
        );
        assert_ne!(
            SessionKey::new(&a, Feature::CatalogForge),
            SessionKey::new(&b, Feature::CatalogForge)
        );
    }

    #[test]
    fn feature_roundtrips_through_slug() {
        for f in [Feature::AssetExtraction, Feature::CatalogForge] {
            assert_eq!(f.slug().parse::<Feature>().unwrap(), f);
        }
    }

    proptest::proptest! {
        #[test]
        fn built_refs_parse_and_stay_in_namespace(
            user in "[a-zA-Z0-9_-]{1,16}",
            bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..64),
        ) {
            let owner = UserId::new(user.clone()).unwrap();
            let hash = ContentHash::compute(&bytes);
            let r = AssetRef::build(&owner, Feature::CatalogForge, AssetKind::Source, &hash, "jpg");
            proptest::prop_assert!(r.belongs_to(&owner));
            proptest::prop_assert_eq!(AssetRef::parse(r.as_path()).unwrap(), r.clone());
            let other = UserId::new(format!("{user}x")).unwrap();
            proptest::prop_assert!(!r.belongs_to(&other));
        }
    }
}
