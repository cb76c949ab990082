//! Content hashing primitives
//!
//! Provides [`ContentHash`], a strongly-typed SHA-256 digest used to pin
//! patch content, detect stale bases and key idempotency records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// SHA-256 of some bytes. Copy; displays and serializes as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest of `data`
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Compute a hash over several fields under a domain tag.
    ///
    /// Each field is prefixed with its length as a little-endian `u64`, so
    /// no choice of field contents can make two different field lists
    /// produce the same byte stream.
    #[must_use]
    pub fn compute_fields(domain: &str, fields: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in std::iter::once(domain.as_bytes()).chain(fields.iter().copied()) {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    /// First 16 hex digits, for log lines
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Leading eight bytes read as a big-endian `i64`; lock keys use this.
    #[inline]
    #[must_use]
    pub fn prefix_i64(&self) -> i64 {
        let [a, b, c, d, e, f, g, h, ..] = self.0;
        i64::from_be_bytes([a, b, c, d, e, f, g, h])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    /// Exactly 64 hex digits, surrounding whitespace ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|source| HashError {
            input: s.chars().take(80).collect(),
            source,
        })?;
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

/// Text that is not a hex-encoded SHA-256
#[derive(Debug, thiserror::Error)]
#[error("not a sha256 hex digest: {input:?}: {source}")]
pub struct HashError {
    input: String,
    #[source]
    source: hex::FromHexError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_sha256() {
        let hash = ContentHash::compute(b"abc");
        assert_eq!(
            hash.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn parse_rejects_wrong_length_and_non_hex() {
        assert!("abcd".parse::<ContentHash>().is_err());
        assert!("zz".repeat(32).parse::<ContentHash>().is_err());
        let hash = ContentHash::compute(b"test");
        let padded = format!("  {hash}\n");
        assert_eq!(padded.parse::<ContentHash>().unwrap(), hash);
    }

    #[test]
    fn short_is_display_prefix() {
        let hash = ContentHash::compute(b"test");
        let short = hash.short();
        assert_eq!(short.len(), 16);
        assert!(hash.to_string().starts_with(&short));
    }

    #[test]
    fn fields_are_length_delimited() {
        let a = ContentHash::compute_fields("t", &[b"ab", b"c"]);
        let b = ContentHash::compute_fields("t", &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn domain_separates_hashes() {
        let a = ContentHash::compute_fields("one", &[b"x"]);
        let b = ContentHash::compute_fields("two", &[b"x"]);
        assert_ne!(a, b);
        let c = ContentHash::compute_fields("onex", &[]);
        assert_ne!(a, c);
    }

    #[test]
    fn prefix_i64_is_stable() {
        assert_eq!(ContentHash::from_bytes([0xff; 32]).prefix_i64(), -1);
        assert_eq!(ContentHash::from_bytes([0; 32]).prefix_i64(), 0);
        let mut bytes = [0u8; 32];
        bytes[7] = 1;
        assert_eq!(ContentHash::from_bytes(bytes).prefix_i64(), 1);
    }

    #[test]
    fn serde_json_is_hex_string() {
        let hash = ContentHash::compute(b"test");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let decoded: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, decoded);
        assert!(serde_json::from_str::<ContentHash>("\"beef\"").is_err());
    }
}
