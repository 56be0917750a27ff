//! Binary image payloads

use crate::hash::ContentHash;
use bytes::Bytes;
use std::fmt;

/// Image bytes plus their declared media type
///
/// Cloning is cheap: the bytes are reference-counted.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload {
    bytes: Bytes,
    mime_type: String,
}

impl Payload {
    /// Create a payload
    #[inline]
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    /// PNG payload shorthand
    #[inline]
    #[must_use]
    pub fn png(bytes: impl Into<Bytes>) -> Self {
        Self::new(bytes, "image/png")
    }

    /// Raw bytes
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Media type, e.g. `image/png`
    #[inline]
    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Size in bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload carries no bytes
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Content hash of the bytes
    #[inline]
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        ContentHash::compute(&self.bytes)
    }

    /// File extension matching the media type
    #[must_use]
    pub fn extension(&self) -> &'static str {
        extension_for(&self.mime_type)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Map a media type to a file extension, defaulting to `bin`
#[must_use]
pub fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Guess a media type from a file extension
#[must_use]
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_does_not_dump_bytes() {
        let p = Payload::png(vec![0u8; 4096]);
        let dbg = format!("{p:?}");
        assert!(dbg.contains("4096"));
        assert!(dbg.len() < 80);
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(Payload::new(vec![1], "image/jpeg").extension(), "jpg");
        assert_eq!(Payload::new(vec![1], "application/x-unknown").extension(), "bin");
        assert_eq!(mime_for_extension("JPEG"), Some("image/jpeg"));
        assert_eq!(mime_for_extension("txt"), None);
    }

    #[test]
    fn equal_bytes_hash_equal() {
        let a = Payload::png(b"abc".to_vec());
        let b = Payload::new(b"abc".to_vec(), "image/webp");
        assert_eq!(a.hash(), b.hash());
    }
}
