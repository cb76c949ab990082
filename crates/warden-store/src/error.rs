//! Store errors

use crate::model::{PatchId, PatchStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("patch not found: {0}")]
    NotFound(PatchId),

    #[error("illegal transition {from} -> {to}")]
    InvalidTransition { from: PatchStatus, to: PatchStatus },

    /// Compare-and-set lost: the record was not in the expected state
    #[error("patch {id} is {actual}, expected {expected}")]
    Conflict {
        id: PatchId,
        expected: PatchStatus,
        actual: PatchStatus,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Create corrupt-row error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}
