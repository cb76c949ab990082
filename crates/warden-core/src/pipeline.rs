//! The patch pipeline
//!
//! Entry points for automated deployment and for the manual
//! submit/approve/apply flow. Both share the same guarantees:
//!
//! - a request whose idempotency key already has a terminal result gets
//!   that result back and causes no side effect
//! - at most one writer per target path, enforced by [`PathLocks`]
//! - every status change is one stored event, mirrored to the event sink
//! - an unexpected failure never turns into an approval or a success
//!
//! ```text
//! key ─► cached? ─► structural checks ─► observe base ─► lock ─► cached? ─► review ─► apply
//!     ─► store result ─► unlock
//! ```

use crate::applier::{ApplyStage, PatchApplier};
use crate::atomic;
use crate::config::WardenConfig;
use crate::error::PatchError;
use crate::journal::Journal;
use crate::lock::{PathLockGuard, PathLocks};
use crate::snapshot::{SnapshotCreated, SnapshotManager};
use crate::versions::VersionStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use warden_artifact::{ConfinedRoot, ContentHash, IdempotencyKey, TargetPath};
use warden_curator::parsers::normalize_source;
use warden_curator::{CuratorGate, Decision};
use warden_sandbox::{ArtifactStore, ProcessSandbox, RuntimeSmokeTester, Sandbox};
use warden_store::{
    emit, EventSink, IdempotencyRecord, JsonlEventSink, PatchEvent, PatchId, PatchRecord,
    PatchStatus, PatchStore, Snapshot, SqliteStore, StoreError, TracingEventSink,
};

/// Automated deployment request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub target_path: String,
    /// Full replacement content
    pub code: String,
    /// Free-form task description; part of the idempotency key
    pub task_text: String,
    pub task_id: Option<String>,
    pub job_id: Option<String>,
}

impl DeployRequest {
    #[must_use]
    pub fn new(target_path: impl Into<String>, code: impl Into<String>, task_text: impl Into<String>) -> Self {
        Self {
            target_path: target_path.into(),
            code: code.into(),
            task_text: task_text.into(),
            task_id: None,
            job_id: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Terminal result of a logical request; this is what idempotency records hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub patch_id: PatchId,
    pub idempotency_key: IdempotencyKey,
    /// `rejected`, `success` or `rolled_back`
    pub status: PatchStatus,
    pub sha256: ContentHash,
    pub target_path: String,
    pub reasons: Vec<String>,
    pub message: String,
    /// Curator score; 0 for structural rejections
    pub score: Option<u8>,
    pub failed_stage: Option<ApplyStage>,
    pub previous_version_id: Option<i64>,
    /// Served from an earlier identical request
    #[serde(default)]
    pub replayed: bool,
}

impl PatchOutcome {
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == PatchStatus::Success
    }

    /// Map a non-success outcome onto the error taxonomy.
    ///
    /// # Errors
    /// - [`PatchError::PolicyRejection`] for rejections
    /// - [`PatchError::ValidationFailure`] for syntax, integrity and base-check failures
    /// - [`PatchError::SmokeTestFailure`] for smoke failures
    /// - [`PatchError::Internal`] for backup and write failures
    pub fn into_result(self) -> Result<Self, PatchError> {
        match (self.status, self.failed_stage) {
            (PatchStatus::Success, _) => Ok(self),
            (PatchStatus::Rejected, _) => Err(PatchError::PolicyRejection {
                reasons: self.reasons,
            }),
            (_, Some(ApplyStage::Smoke)) => Err(PatchError::SmokeTestFailure(self.message)),
            (
                _,
                Some(ApplyStage::Syntax | ApplyStage::Integrity | ApplyStage::Precondition),
            ) => Err(PatchError::ValidationFailure(self.message)),
            _ => Err(PatchError::Internal(self.message)),
        }
    }
}

/// Manual submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub author: String,
    pub target_path: String,
    pub content: String,
    pub task_id: Option<String>,
    pub job_id: Option<String>,
}

/// Result of [`PatchPipeline::submit_patch`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub id: PatchId,
    /// `approved` or `rejected`
    pub status: PatchStatus,
    pub sha256: ContentHash,
    /// Present only when approved
    pub approve_token: Option<String>,
    pub reasons: Vec<String>,
    pub score: Option<u8>,
}

/// Distinguishable results of [`PatchPipeline::apply_patch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPatchOutcome {
    NotFound,
    TokenMismatch,
    InvalidState,
    DbError,
    Success,
    RolledBack,
}

/// Result of [`PatchPipeline::apply_patch`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyPatchResponse {
    pub outcome: ApplyPatchOutcome,
    pub id: PatchId,
    pub status: Option<PatchStatus>,
    pub sha256: Option<ContentHash>,
    pub message: String,
    pub failed_stage: Option<ApplyStage>,
    pub previous_version_id: Option<i64>,
    pub replayed: bool,
}

impl ApplyPatchResponse {
    fn refused(outcome: ApplyPatchOutcome, id: PatchId, status: Option<PatchStatus>, message: impl Into<String>) -> Self {
        Self {
            outcome,
            id,
            status,
            sha256: None,
            message: message.into(),
            failed_stage: None,
            previous_version_id: None,
            replayed: false,
        }
    }

    fn from_outcome(id: PatchId, outcome: &PatchOutcome) -> Self {
        let kind = match outcome.status {
            PatchStatus::Success => ApplyPatchOutcome::Success,
            PatchStatus::RolledBack => ApplyPatchOutcome::RolledBack,
            _ => ApplyPatchOutcome::InvalidState,
        };
        Self {
            outcome: kind,
            id,
            status: Some(outcome.status),
            sha256: Some(outcome.sha256),
            message: outcome.message.clone(),
            failed_stage: outcome.failed_stage,
            previous_version_id: outcome.previous_version_id,
            replayed: outcome.replayed,
        }
    }
}

/// A record with its full audit trail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchDetails {
    /// Approve token redacted
    pub record: PatchRecord,
    pub events: Vec<PatchEvent>,
}

/// Result of [`PatchPipeline::revert_file`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevertOutcome {
    pub target_path: String,
    pub restored_version_id: i64,
    /// Version holding the content that was replaced; `None` if the file was missing
    pub backup_version_id: Option<i64>,
    pub sha256: ContentHash,
}

/// The self-deploying patch pipeline
#[derive(Clone)]
pub struct PatchPipeline {
    root: ConfinedRoot,
    state_dir: PathBuf,
    default_author: String,
    gate: CuratorGate,
    applier: PatchApplier,
    journal: Journal,
    versions: VersionStore,
    locks: PathLocks,
    snapshots: SnapshotManager,
}

impl std::fmt::Debug for PatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchPipeline")
            .field("root", &self.root)
            .field("state_dir", &self.state_dir)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl PatchPipeline {
    /// Production wiring: SQLite under the state dir, `python3` sandbox,
    /// tracing or JSON-lines event sink.
    ///
    /// # Errors
    /// Fails if the root is unusable or the store or event log cannot be opened.
    pub async fn open(config: &WardenConfig) -> Result<Self, PatchError> {
        let store: Arc<dyn PatchStore> = Arc::new(SqliteStore::open(config.database_path())?);
        let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessSandbox::new(&config.interpreter));
        let sink: Arc<dyn EventSink> = match &config.event_log {
            Some(path) => Arc::new(JsonlEventSink::open(path).await?),
            None => Arc::new(TracingEventSink),
        };
        Self::with_components(config, store, sandbox, sink)
    }

    /// Wire the pipeline from explicit collaborators.
    ///
    /// # Errors
    /// Fails if the root or state dir is unusable or the policy does not compile.
    pub fn with_components(
        config: &WardenConfig,
        store: Arc<dyn PatchStore>,
        sandbox: Arc<dyn Sandbox>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, PatchError> {
        let root = ConfinedRoot::new(&config.root)?;
        let state_dir = config.state_dir();
        std::fs::create_dir_all(&state_dir).map_err(|e| PatchError::io(&state_dir, e))?;
        let state_dir = state_dir
            .canonicalize()
            .map_err(|e| PatchError::io(&state_dir, e))?;

        let mut gate = CuratorGate::new(config.policy.clone(), root.clone(), sandbox.clone())?;
        if let Some(cache) = config.decision_cache() {
            gate = gate.with_cache(cache);
        }
        let smoke = RuntimeSmokeTester::new(sandbox)
            .with_timeout(config.smoke_timeout())
            .with_artifacts(ArtifactStore::new(config.artifacts_dir()));
        let applier = PatchApplier::new(store.clone(), sink.clone(), smoke)
            .with_entry_points(config.entry_points.clone());
        let locks = PathLocks::new(config.locks_dir())
            .with_timeout(config.lock_timeout())
            .with_poll_interval(config.lock_poll_interval());
        let snapshots = SnapshotManager::new(
            root.path(),
            config.snapshot_dir(),
            config.snapshot_paths.clone(),
        )
        .with_store(store.clone());

        Ok(Self {
            root,
            state_dir,
            default_author: config.default_author.clone(),
            gate,
            applier,
            versions: VersionStore::new(store.clone()),
            journal: Journal::new(store, sink),
            locks,
            snapshots,
        })
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &ConfinedRoot {
        &self.root
    }

    #[inline]
    #[must_use]
    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    fn store(&self) -> &Arc<dyn PatchStore> {
        self.journal.store()
    }

    /// Dry-run curator review; nothing is recorded
    pub async fn review(
        &self,
        task_text: &str,
        code: &str,
        target_path: &str,
        job_id: Option<&str>,
    ) -> Decision {
        self.gate.review(task_text, code, target_path, job_id).await
    }

    /// Review and apply in one call.
    ///
    /// Rejections and rollbacks are outcomes, not errors.
    ///
    /// # Errors
    /// - [`PatchError::LockTimeout`] if the target stays busy
    /// - [`PatchError::RollbackFailed`] if a failed apply could not be undone
    /// - [`PatchError::Store`] on database failure
    pub async fn deploy(&self, request: DeployRequest) -> Result<PatchOutcome, PatchError> {
        let key = IdempotencyKey::derive(&request.target_path, &request.code, &request.task_text);
        if let Some(outcome) = self.replay(&key).await? {
            return Ok(outcome);
        }

        let target = match self.structural_check(&request.target_path, &request.code) {
            Ok(target) => target,
            Err(reasons) => {
                let record = PatchRecord::new(
                    &self.default_author,
                    request.target_path.trim(),
                    request.code,
                    key,
                )
                .with_task_id(request.task_id)
                .with_job_id(request.job_id);
                return self.reject_unvalidated(record, reasons).await;
            }
        };

        // Observed before waiting for the lock: a concurrent writer that wins
        // the lock makes this request stale.
        let base_hash = current_hash(&target).await?;
        let lock = self.locks.acquire(&target).await?;
        if let Some(outcome) = self.replay(&key).await? {
            return Ok(outcome);
        }

        let record = PatchRecord::new(
            &self.default_author,
            target.relative(),
            normalize_source(&request.code).into_owned(),
            key,
        )
        .with_task_id(request.task_id)
        .with_job_id(request.job_id)
        .with_base_hash(base_hash);
        self.journal.create(&record).await?;
        let record = self
            .journal
            .advance(&record, PatchStatus::Validated, json!({ "target_path": target.relative() }))
            .await?;

        let decision = self
            .gate
            .review(&request.task_text, &record.content, target.relative(), record.job_id.as_deref())
            .await;
        if !decision.is_approved() {
            let outcome = self.reject_reviewed(&record, &decision).await?;
            if decision.is_transient() {
                tracing::warn!(patch_id = %record.id, "review failed internally; result not kept for replay");
                return Ok(outcome);
            }
            return self.finish(outcome).await;
        }
        let record = self
            .journal
            .advance(&record, PatchStatus::Approved, json!({ "score": decision.score() }))
            .await?;

        let outcome = self.run_apply(&record, &target, &lock, Some(decision.score())).await?;
        // Stored before the lock is released so a waiting duplicate replays it.
        let outcome = self.finish(outcome).await?;
        drop(lock);
        Ok(outcome)
    }

    /// Record a patch for later approval-gated apply.
    ///
    /// # Errors
    /// [`PatchError::Store`] on database failure.
    pub async fn submit_patch(&self, request: SubmitRequest) -> Result<SubmitOutcome, PatchError> {
        let key = IdempotencyKey::derive(
            &request.target_path,
            &request.content,
            request.task_id.as_deref().unwrap_or(""),
        );
        let author = if request.author.trim().is_empty() {
            self.default_author.clone()
        } else {
            request.author.trim().to_string()
        };

        let target = match self.structural_check(&request.target_path, &request.content) {
            Ok(target) => target,
            Err(reasons) => {
                let record = PatchRecord::new(author, request.target_path.trim(), request.content, key)
                    .with_task_id(request.task_id)
                    .with_job_id(request.job_id);
                let sha256 = record.content_hash;
                let record = self.reject_record(&record, &reasons, Some(0)).await?;
                return Ok(SubmitOutcome {
                    id: record.id,
                    status: record.status,
                    sha256,
                    approve_token: None,
                    reasons,
                    score: Some(0),
                });
            }
        };

        let content = normalize_source(&request.content).into_owned();
        let mut record = PatchRecord::new(author, target.relative(), content, key)
            .with_task_id(request.task_id)
            .with_job_id(request.job_id)
            .with_base_hash(current_hash(&target).await?);
        record.approve_token = Some(uuid::Uuid::new_v4().simple().to_string());
        self.journal.create(&record).await?;
        let record = self
            .journal
            .advance(&record, PatchStatus::Validated, json!({ "target_path": target.relative() }))
            .await?;

        let decision = self
            .gate
            .review(
                record.task_id.as_deref().unwrap_or(""),
                &record.content,
                target.relative(),
                record.job_id.as_deref(),
            )
            .await;
        let approve_token = if decision.is_approved() {
            self.journal
                .advance(&record, PatchStatus::Approved, json!({ "score": decision.score() }))
                .await?
                .approve_token
        } else {
            self.reject_reviewed(&record, &decision).await?;
            None
        };

        Ok(SubmitOutcome {
            id: record.id,
            status: if decision.is_approved() {
                PatchStatus::Approved
            } else {
                PatchStatus::Rejected
            },
            sha256: record.content_hash,
            approve_token,
            reasons: decision.reason_messages(),
            score: Some(decision.score()),
        })
    }

    /// Apply an approved patch if `approve_token` matches.
    ///
    /// # Errors
    /// - [`PatchError::LockTimeout`] if the target stays busy
    /// - [`PatchError::RollbackFailed`] if a failed apply could not be undone
    pub async fn apply_patch(
        &self,
        id: PatchId,
        approve_token: &str,
    ) -> Result<ApplyPatchResponse, PatchError> {
        use ApplyPatchOutcome as O;

        let record = match self.store().get_patch(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(ApplyPatchResponse::refused(O::NotFound, id, None, "no such patch")),
            Err(e) => return Ok(db_error(id, &e)),
        };
        if !token_matches(record.approve_token.as_deref(), approve_token) {
            tracing::warn!(patch_id = %id, "approve token mismatch");
            return Ok(ApplyPatchResponse::refused(
                O::TokenMismatch,
                id,
                Some(record.status),
                "approve token does not match",
            ));
        }
        match self.replay(&record.idempotency_key).await {
            Ok(Some(outcome)) => return Ok(ApplyPatchResponse::from_outcome(id, &outcome)),
            Ok(None) => {}
            Err(PatchError::Store(e)) => return Ok(db_error(id, &e)),
            Err(e) => return Err(e),
        }
        if record.status != PatchStatus::Approved {
            return Ok(ApplyPatchResponse::refused(
                O::InvalidState,
                id,
                Some(record.status),
                format!("patch is {}, expected approved", record.status),
            ));
        }
        let target = match self.root.resolve(&record.target_path) {
            Ok(target) => target,
            Err(e) => {
                return Ok(ApplyPatchResponse::refused(
                    O::InvalidState,
                    id,
                    Some(record.status),
                    e.to_string(),
                ))
            }
        };

        let lock = self.locks.acquire(&target).await?;
        match self.replay(&record.idempotency_key).await {
            Ok(Some(outcome)) => return Ok(ApplyPatchResponse::from_outcome(id, &outcome)),
            Ok(None) => {}
            Err(PatchError::Store(e)) => return Ok(db_error(id, &e)),
            Err(e) => return Err(e),
        }
        let record = match self.store().get_patch(id).await {
            Ok(Some(record)) if record.status == PatchStatus::Approved => record,
            Ok(Some(record)) => {
                return Ok(ApplyPatchResponse::refused(
                    O::InvalidState,
                    id,
                    Some(record.status),
                    format!("patch is {}, expected approved", record.status),
                ))
            }
            Ok(None) => return Ok(ApplyPatchResponse::refused(O::NotFound, id, None, "no such patch")),
            Err(e) => return Ok(db_error(id, &e)),
        };

        let outcome = match self.run_apply(&record, &target, &lock, None).await {
            Ok(outcome) => outcome,
            Err(PatchError::Store(StoreError::Conflict { actual, .. })) => {
                return Ok(ApplyPatchResponse::refused(
                    O::InvalidState,
                    id,
                    Some(actual),
                    format!("patch moved to {actual} concurrently"),
                ))
            }
            Err(PatchError::Store(e)) => return Ok(db_error(id, &e)),
            Err(e) => return Err(e),
        };
        let outcome = self.finish(outcome).await?;
        drop(lock);
        Ok(ApplyPatchResponse::from_outcome(id, &outcome))
    }

    /// A record and its events; the approve token is never returned.
    ///
    /// # Errors
    /// [`PatchError::Store`] on database failure.
    pub async fn get_patch(&self, id: PatchId) -> Result<Option<PatchDetails>, PatchError> {
        let Some(mut record) = self.store().get_patch(id).await? else {
            return Ok(None);
        };
        record.approve_token = None;
        let events = self.store().events(id).await?;
        Ok(Some(PatchDetails { record, events }))
    }

    /// Newest first, approve tokens redacted
    ///
    /// # Errors
    /// [`PatchError::Store`] on database failure.
    pub async fn list_patches(
        &self,
        status: Option<PatchStatus>,
        limit: usize,
    ) -> Result<Vec<PatchRecord>, PatchError> {
        let mut records = self.store().list_patches(status, limit).await?;
        for record in &mut records {
            record.approve_token = None;
        }
        Ok(records)
    }

    /// Put a stored version back in place, backing up what it replaces.
    ///
    /// # Errors
    /// - [`PatchError::VersionNotFound`] for an unknown version
    /// - [`PatchError::ValidationFailure`] if the version belongs to another file
    /// - [`PatchError::LockTimeout`] if the target stays busy
    /// - [`PatchError::Io`] if the write fails
    pub async fn revert_file(
        &self,
        target_path: &str,
        version_id: i64,
    ) -> Result<RevertOutcome, PatchError> {
        let target = self.root.resolve(target_path)?;
        let version = self.versions.get(version_id).await?;
        if version.file_path != target.relative() {
            return Err(PatchError::ValidationFailure(format!(
                "version {version_id} belongs to {}, not {target}",
                version.file_path
            )));
        }

        let _lock = self.locks.acquire(&target).await?;
        let current = match tokio::fs::read(target.as_path()).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(PatchError::io(target.as_path(), e)),
        };
        let backup_version_id = match &current {
            Some(bytes) => Some(self.versions.backup(&target, bytes, None).await?),
            None => None,
        };
        atomic::write_atomic_async(target.as_path().to_path_buf(), version.content.clone())
            .await
            .map_err(|e| PatchError::io(target.as_path(), e))?;

        tracing::info!(target_path = %target, version_id, ?backup_version_id, "file reverted");
        emit(
            self.journal.sink(),
            "patch_pipeline",
            "file_reverted",
            None,
            json!({
                "target_path": target.relative(),
                "restored_version_id": version_id,
                "backup_version_id": backup_version_id,
            }),
        )
        .await;
        Ok(RevertOutcome {
            target_path: target.relative().to_string(),
            restored_version_id: version_id,
            backup_version_id,
            sha256: version.content_hash,
        })
    }

    /// # Errors
    /// See [`SnapshotManager::create_snapshot`].
    pub async fn create_snapshot(&self, description: &str) -> Result<SnapshotCreated, PatchError> {
        self.snapshots.create_snapshot(description).await
    }

    /// # Errors
    /// See [`SnapshotManager::restore_snapshot`].
    pub async fn restore_snapshot(&self, id: i64) -> Result<Snapshot, PatchError> {
        self.snapshots.restore_snapshot(id).await
    }

    /// # Errors
    /// [`PatchError::Store`] on database failure.
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>, PatchError> {
        self.snapshots.list_snapshots().await
    }

    /// Non-empty content and a file path inside the root, outside the state dir
    fn structural_check(&self, raw_target: &str, code: &str) -> Result<TargetPath, Vec<String>> {
        let mut reasons = Vec::new();
        if code.trim().is_empty() {
            reasons.push("empty code".to_string());
        }
        let target = match self.root.resolve(raw_target) {
            Ok(target) if target.as_path().starts_with(&self.state_dir) => {
                reasons.push(format!("target path is inside the state directory: {target}"));
                None
            }
            Ok(target) => Some(target),
            Err(e) => {
                reasons.push(e.to_string());
                None
            }
        };
        match target {
            Some(target) if reasons.is_empty() => Ok(target),
            _ => Err(reasons),
        }
    }

    async fn replay(&self, key: &IdempotencyKey) -> Result<Option<PatchOutcome>, PatchError> {
        let Some(cached) = self.store().idempotency(key).await? else {
            return Ok(None);
        };
        let mut outcome: PatchOutcome =
            serde_json::from_value(cached.result).map_err(StoreError::from)?;
        outcome.replayed = true;
        tracing::info!(
            patch_id = %outcome.patch_id,
            key = %key,
            status = %outcome.status,
            "replayed terminal result"
        );
        Ok(Some(outcome))
    }

    /// Store the terminal outcome; the first writer for a key wins
    async fn finish(&self, outcome: PatchOutcome) -> Result<PatchOutcome, PatchError> {
        let record = IdempotencyRecord {
            key: outcome.idempotency_key,
            status: outcome.status,
            result: serde_json::to_value(&outcome).map_err(StoreError::from)?,
            created_at: Utc::now(),
        };
        if !self.store().record_idempotency(&record).await? {
            tracing::debug!(key = %outcome.idempotency_key, "idempotency record already present");
        }
        Ok(outcome)
    }

    async fn reject_record(
        &self,
        record: &PatchRecord,
        reasons: &[String],
        score: Option<u8>,
    ) -> Result<PatchRecord, PatchError> {
        self.journal.create(record).await?;
        self.journal
            .advance(record, PatchStatus::Rejected, json!({ "reasons": reasons, "score": score }))
            .await
    }

    /// `submitted -> rejected` for requests that fail structural checks;
    /// scored 0 like any other fail-fast rejection
    async fn reject_unvalidated(
        &self,
        record: PatchRecord,
        reasons: Vec<String>,
    ) -> Result<PatchOutcome, PatchError> {
        let record = self.reject_record(&record, &reasons, Some(0)).await?;
        let outcome = PatchOutcome {
            patch_id: record.id,
            idempotency_key: record.idempotency_key,
            status: PatchStatus::Rejected,
            sha256: record.content_hash,
            target_path: record.target_path,
            message: format!("rejected: {}", reasons.join("; ")),
            reasons,
            score: Some(0),
            failed_stage: None,
            previous_version_id: None,
            replayed: false,
        };
        self.finish(outcome).await
    }

    /// `validated -> rejected` on a curator rejection
    async fn reject_reviewed(
        &self,
        record: &PatchRecord,
        decision: &Decision,
    ) -> Result<PatchOutcome, PatchError> {
        let reasons = decision.reason_messages();
        self.journal
            .advance(
                record,
                PatchStatus::Rejected,
                json!({ "reasons": reasons, "score": decision.score() }),
            )
            .await?;
        Ok(PatchOutcome {
            patch_id: record.id,
            idempotency_key: record.idempotency_key,
            status: PatchStatus::Rejected,
            sha256: record.content_hash,
            target_path: record.target_path.clone(),
            message: format!("rejected by curator: {}", reasons.join("; ")),
            reasons,
            score: Some(decision.score()),
            failed_stage: None,
            previous_version_id: None,
            replayed: false,
        })
    }

    /// Apply under a held lock, caching the outcome even when the restore failed
    async fn run_apply(
        &self,
        record: &PatchRecord,
        target: &TargetPath,
        lock: &PathLockGuard,
        score: Option<u8>,
    ) -> Result<PatchOutcome, PatchError> {
        let report = match self.applier.apply(record, target, lock).await {
            Ok(report) => report,
            Err(err @ PatchError::RollbackFailed { .. }) => {
                let outcome = PatchOutcome {
                    patch_id: record.id,
                    idempotency_key: record.idempotency_key,
                    status: PatchStatus::RolledBack,
                    sha256: record.content_hash,
                    target_path: record.target_path.clone(),
                    reasons: vec![err.to_string()],
                    message: err.to_string(),
                    score,
                    failed_stage: None,
                    previous_version_id: None,
                    replayed: false,
                };
                self.finish(outcome).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let reasons = if report.succeeded() {
            Vec::new()
        } else {
            vec![report.message.clone()]
        };
        Ok(PatchOutcome {
            patch_id: record.id,
            idempotency_key: record.idempotency_key,
            status: report.status,
            sha256: record.content_hash,
            target_path: record.target_path.clone(),
            reasons,
            message: report.message,
            score,
            failed_stage: report.failed_stage,
            previous_version_id: report.previous_version_id,
            replayed: false,
        })
    }
}

async fn current_hash(target: &TargetPath) -> Result<Option<ContentHash>, PatchError> {
    match tokio::fs::read(target.as_path()).await {
        Ok(bytes) => Ok(Some(ContentHash::compute(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PatchError::io(target.as_path(), e)),
    }
}

fn db_error(id: PatchId, error: &StoreError) -> ApplyPatchResponse {
    tracing::error!(patch_id = %id, error = %error, "store failure during apply");
    ApplyPatchResponse::refused(ApplyPatchOutcome::DbError, id, None, error.to_string())
}

/// Length-independent comparison of the stored and presented tokens
fn token_matches(expected: Option<&str>, presented: &str) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    let (a, b) = (
        ContentHash::compute(expected.as_bytes()),
        ContentHash::compute(presented.as_bytes()),
    );
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(token_matches(Some("abc"), "abc"));
        assert!(!token_matches(Some("abc"), "abd"));
        assert!(!token_matches(Some("abc"), ""));
        assert!(!token_matches(None, "abc"));
    }

    #[test]
    fn outcome_maps_onto_taxonomy() {
        let base = PatchOutcome {
            patch_id: PatchId::new(),
            idempotency_key: IdempotencyKey::derive("a.py", "x", ""),
            status: PatchStatus::Rejected,
            sha256: ContentHash::compute(b"x"),
            target_path: "a.py".to_string(),
            reasons: vec!["banned import: os".to_string()],
            message: "rejected".to_string(),
            score: Some(90),
            failed_stage: None,
            previous_version_id: None,
            replayed: false,
        };
        assert!(matches!(
            base.clone().into_result(),
            Err(PatchError::PolicyRejection { .. })
        ));

        let smoke = PatchOutcome {
            status: PatchStatus::RolledBack,
            failed_stage: Some(ApplyStage::Smoke),
            ..base.clone()
        };
        assert!(matches!(smoke.into_result(), Err(PatchError::SmokeTestFailure(_))));

        let stale = PatchOutcome {
            status: PatchStatus::RolledBack,
            failed_stage: Some(ApplyStage::Precondition),
            ..base.clone()
        };
        assert!(matches!(stale.into_result(), Err(PatchError::ValidationFailure(_))));

        let ok = PatchOutcome {
            status: PatchStatus::Success,
            ..base
        };
        assert!(ok.into_result().is_ok());
    }
}
