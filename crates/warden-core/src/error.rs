//! Error types for the patch pipeline
//!
//! [`PatchError`] classifies every way an operation can end without the
//! requested effect:
//! - policy rejection and validation failures (fix the candidate)
//! - lock timeouts (retry later)
//! - smoke test failures (already rolled back)
//! - I/O and store failures
//! - rollback failures, which leave the target inconsistent

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use warden_artifact::PathError;
use warden_curator::CuratorError;
use warden_store::{SinkError, StoreError};

/// Main pipeline error type
#[derive(Debug, Error)]
pub enum PatchError {
    /// The curator found disqualifying reasons
    #[error("rejected by policy: {}", reasons.join("; "))]
    PolicyRejection { reasons: Vec<String> },

    /// Another writer held the target for too long
    #[error("timed out after {waited:?} waiting for the lock on {target}")]
    LockTimeout { target: String, waited: Duration },

    /// Content does not parse or fails a structural check
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// The live target failed its runtime check
    #[error("smoke test failed: {0}")]
    SmokeTestFailure(String),

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Restoring the backup failed after a failed apply
    #[error("rollback of {target} failed after {cause}: {rollback}")]
    RollbackFailed {
        target: String,
        cause: String,
        rollback: String,
    },

    #[error("no stored version {0}")]
    VersionNotFound(i64),

    #[error("no snapshot {0}")]
    SnapshotNotFound(i64),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Curator(#[from] CuratorError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Unexpected failure; always resolves to rejection or rollback
    #[error("internal error: {0}")]
    Internal(String),
}

impl PatchError {
    /// Create I/O error for a path
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Check if the same request may succeed on retry
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Store(StoreError::Task(_)))
    }

    /// Check if an operator must inspect the target by hand
    #[inline]
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = PatchError::PolicyRejection {
            reasons: vec!["empty code".to_string(), "banned import: os".to_string()],
        };
        assert_eq!(err.to_string(), "rejected by policy: empty code; banned import: os");
    }

    #[test]
    fn classification() {
        let timeout = PatchError::LockTimeout {
            target: "app.py".to_string(),
            waited: Duration::from_secs(30),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.requires_operator());

        let rollback = PatchError::RollbackFailed {
            target: "app.py".to_string(),
            cause: "smoke test failed".to_string(),
            rollback: "permission denied".to_string(),
        };
        assert!(rollback.requires_operator());
        assert!(!rollback.is_retryable());
        assert!(!PatchError::ValidationFailure("x".to_string()).is_retryable());
    }
}
