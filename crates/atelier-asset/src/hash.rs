//! Blake3 content hashes and URL signing keys
//!
//! Object paths are named by the [`ContentHash`] of their bytes, so an
//! identical payload uploaded twice lands on the same path. Storage
//! backends that issue their own access URLs sign them with a
//! [`UrlSigner`].

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

const HASH_LEN: usize = 32;
const SIGNATURE_LEN: usize = 8;
const SIGNING_CONTEXT: &str = "atelier access-url signing v1";

/// Blake3 digest of a payload's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Hash `data`
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Raw digest bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// First 16 hex characters, for logs
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; HASH_LEN];
        if s.len() != HASH_LEN * 2 {
            return Err(HashError::WrongLength(s.len()));
        }
        hex::decode_to_slice(s, &mut bytes).map_err(|_| HashError::NotHex(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

/// Key for signing and checking short-lived access URLs
///
/// Derived from an operator secret so the same secret always verifies the
/// URLs it issued, across restarts.
#[derive(Clone)]
pub struct UrlSigner([u8; HASH_LEN]);

impl UrlSigner {
    /// Derive a signing key from `secret`
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        Self(blake3::derive_key(SIGNING_CONTEXT, secret.as_bytes()))
    }

    /// Signature over one issued URL
    #[must_use]
    pub fn sign(&self, path: &str, expires: i64, seq: u64) -> String {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher
            .update(path.as_bytes())
            .update(&expires.to_le_bytes())
            .update(&seq.to_le_bytes());
        hex::encode(&hasher.finalize().as_bytes()[..SIGNATURE_LEN])
    }

    /// Whether `signature` was issued by this key for these fields
    #[must_use]
    pub fn verify(&self, path: &str, expires: i64, seq: u64, signature: &str) -> bool {
        self.sign(path, expires, seq) == signature
    }
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("UrlSigner(..)")
    }
}

/// A string that is not a content hash
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    /// Wrong number of hex characters
    #[error("content hash must be 64 hex characters, got {0}")]
    WrongLength(usize),

    /// Right length, not hex
    #[error("content hash is not hex: {0}")]
    NotHex(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_payloads_share_a_hash() {
        let a = ContentHash::compute(b"front view");
        assert_eq!(a, ContentHash::compute(b"front view"));
        assert_ne!(a, ContentHash::compute(b"back view"));
        assert!(a.to_string().starts_with(&a.short()));
    }

    #[test]
    fn parse_rejects_bad_input() {
        let hash = ContentHash::compute(b"x");
        assert_eq!(hash.to_string().parse::<ContentHash>().unwrap(), hash);
        assert_eq!("abc".parse::<ContentHash>(), Err(HashError::WrongLength(3)));
        assert!(matches!("z".repeat(64).parse::<ContentHash>(), Err(HashError::NotHex(_))));
    }

    #[test]
    fn hash_serializes_as_hex_string() {
        let hash = ContentHash::compute(b"test");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let decoded: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, decoded);
        assert!(serde_json::from_str::<ContentHash>("\"nope\"").is_err());
    }

    #[test]
    fn signatures_bind_every_field_and_the_secret() {
        let signer = UrlSigner::from_secret("s3cret");
        let sig = signer.sign("users/u1/a.png", 100, 7);
        assert!(signer.verify("users/u1/a.png", 100, 7, &sig));
        assert!(!signer.verify("users/u2/a.png", 100, 7, &sig));
        assert!(!signer.verify("users/u1/a.png", 101, 7, &sig));
        assert!(!signer.verify("users/u1/a.png", 100, 8, &sig));
        assert!(!UrlSigner::from_secret("other").verify("users/u1/a.png", 100, 7, &sig));
        assert_eq!(format!("{signer:?}"), "UrlSigner(..)");
    }
}
