//! Shared data structures exchanged between the cache tiers, the download coordinator, and
//! callers.

use std::fmt;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use url::Url;

/// Length of a hex-encoded SHA-1 digest.
pub const CACHE_KEY_LEN: usize = 40;

/// Immutable image payload shared between the memory tier and every waiting consumer.
pub type ImageData = Arc<[u8]>;

/// Identity of a cached resource in both tiers.
///
/// Derived as the uppercase hex SHA-1 of the canonical URI string so that entries written by
/// earlier runs remain addressable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Digest an already-canonical URI string.
    pub fn from_uri_str(uri: &str) -> Self {
        let digest = Sha1::digest(uri.as_bytes());
        Self(hex::encode_upper(digest))
    }

    /// Digest the canonical serialisation of a parsed URL.
    pub fn from_url(url: &Url) -> Self {
        Self::from_uri_str(url.as_str())
    }

    /// Rebuild a key from a persisted file stem, rejecting anything that is not a digest.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == CACHE_KEY_LEN
            && value.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a caller-supplied URI, accepting only absolute URLs.
///
/// Relative references, empty strings, and unparsable input all yield `None`.
pub fn parse_absolute_uri(uri: &str) -> Option<Url> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return None;
    }
    Url::parse(trimmed).ok().filter(|url| !url.cannot_be_a_base())
}
