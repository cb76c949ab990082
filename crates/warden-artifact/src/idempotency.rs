//! Idempotency keys for deploy requests

use crate::hash::{ContentHash, HashError};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

const DOMAIN: &str = "warden.idempotency.v1";

/// Stable identifier of one logical request.
///
/// Derived from the target path, the full candidate content and the
/// normalized task text. Two requests with the same key are the same
/// request; the second must observe the first one's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(ContentHash);

impl IdempotencyKey {
    /// Derive the key for a request.
    ///
    /// The path is trimmed, the task text is trimmed and lowercased and the
    /// content is taken byte-for-byte.
    #[must_use]
    pub fn derive(target_path: &str, content: &str, task_text: &str) -> Self {
        let task = normalize_task(task_text);
        Self(ContentHash::compute_fields(
            DOMAIN,
            &[
                target_path.trim().as_bytes(),
                content.as_bytes(),
                task.as_bytes(),
            ],
        ))
    }

    /// Underlying hash
    #[inline]
    #[must_use]
    pub const fn hash(&self) -> &ContentHash {
        &self.0
    }
}

fn normalize_task(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for IdempotencyKey {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}
