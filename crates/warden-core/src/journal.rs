//! Status transitions mirrored to the event sink
//!
//! The store appends exactly one `PatchEvent` per transition; the journal
//! then forwards the same event to the external sink, fire-and-forget.

use crate::error::PatchError;
use serde_json::{json, Value};
use std::sync::Arc;
use warden_store::{emit, EventSink, EventType, PatchRecord, PatchStatus, PatchStore};

const SOURCE: &str = "patch_pipeline";

#[derive(Clone)]
pub(crate) struct Journal {
    store: Arc<dyn PatchStore>,
    sink: Arc<dyn EventSink>,
}

impl Journal {
    pub(crate) fn new(store: Arc<dyn PatchStore>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, sink }
    }

    pub(crate) fn store(&self) -> &Arc<dyn PatchStore> {
        &self.store
    }

    pub(crate) fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    /// Persist a new `submitted` record and its `created` event
    pub(crate) async fn create(&self, record: &PatchRecord) -> Result<(), PatchError> {
        self.store.insert_patch(record).await?;
        tracing::info!(
            patch_id = %record.id,
            target_path = %record.target_path,
            author = %record.author,
            "patch created"
        );
        self.mirror(record, EventType::Created, json!({ "sha256": record.content_hash }))
            .await;
        Ok(())
    }

    /// Move `record` to `to` using the default event for that status
    pub(crate) async fn advance(
        &self,
        record: &PatchRecord,
        to: PatchStatus,
        payload: Value,
    ) -> Result<PatchRecord, PatchError> {
        self.advance_with(record, to, EventType::for_status(to), payload)
            .await
    }

    /// Move `record` to `to`, recording `event`
    pub(crate) async fn advance_with(
        &self,
        record: &PatchRecord,
        to: PatchStatus,
        event: EventType,
        payload: Value,
    ) -> Result<PatchRecord, PatchError> {
        let updated = self
            .store
            .transition(record.id, record.status, to, event, payload.clone())
            .await?;
        tracing::info!(
            patch_id = %record.id,
            target_path = %record.target_path,
            from = %record.status,
            to = %to,
            event = %event,
            "patch transition"
        );
        self.mirror(&updated, event, payload).await;
        Ok(updated)
    }

    async fn mirror(&self, record: &PatchRecord, event: EventType, payload: Value) {
        let payload = json!({
            "patch_id": record.id,
            "target_path": record.target_path,
            "status": record.status,
            "detail": payload,
        });
        emit(
            self.sink.as_ref(),
            SOURCE,
            event.as_str(),
            record.job_id.as_deref(),
            payload,
        )
        .await;
    }
}
