//! Storage trait

use crate::error::StoreError;
use crate::model::{
    CodeVersion, EventType, IdempotencyRecord, PatchEvent, PatchId, PatchRecord, PatchStatus,
    Snapshot,
};
use async_trait::async_trait;
use warden_artifact::IdempotencyKey;

/// Durable relational store behind the pipeline.
///
/// Implementations must be read-committed: once a write returns, every
/// later read from any task observes it.
#[async_trait]
pub trait PatchStore: Send + Sync {
    /// Insert a new record and its `created` event atomically.
    async fn insert_patch(&self, record: &PatchRecord) -> Result<(), StoreError>;

    async fn get_patch(&self, id: PatchId) -> Result<Option<PatchRecord>, StoreError>;

    /// Newest first, optionally filtered by status.
    async fn list_patches(
        &self,
        status: Option<PatchStatus>,
        limit: usize,
    ) -> Result<Vec<PatchRecord>, StoreError>;

    /// Move `id` from `from` to `to` and append one event, atomically.
    ///
    /// # Errors
    /// - [`StoreError::InvalidTransition`] if the edge is not in the state machine
    /// - [`StoreError::Conflict`] if the record is no longer in `from`
    /// - [`StoreError::NotFound`] if there is no such record
    async fn transition(
        &self,
        id: PatchId,
        from: PatchStatus,
        to: PatchStatus,
        event: EventType,
        payload: serde_json::Value,
    ) -> Result<PatchRecord, StoreError>;

    async fn set_previous_version(&self, id: PatchId, version_id: i64) -> Result<(), StoreError>;

    /// Events for one patch in insertion order.
    async fn events(&self, id: PatchId) -> Result<Vec<PatchEvent>, StoreError>;

    /// Save prior file content; returns the new version id.
    async fn insert_code_version(
        &self,
        file_path: &str,
        content: &[u8],
        patch_id: Option<PatchId>,
    ) -> Result<i64, StoreError>;

    async fn code_version(&self, version_id: i64) -> Result<Option<CodeVersion>, StoreError>;

    /// All versions of a file, newest first.
    async fn code_versions_for(&self, file_path: &str) -> Result<Vec<CodeVersion>, StoreError>;

    async fn idempotency(&self, key: &IdempotencyKey)
        -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Insert unless the key exists. Returns `false` for a duplicate, in
    /// which case the stored record is left untouched.
    async fn record_idempotency(&self, record: &IdempotencyRecord) -> Result<bool, StoreError>;

    async fn insert_snapshot(
        &self,
        description: &str,
        artifact_path: &str,
    ) -> Result<i64, StoreError>;

    async fn snapshot(&self, id: i64) -> Result<Option<Snapshot>, StoreError>;

    /// Newest first.
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, StoreError>;
}
