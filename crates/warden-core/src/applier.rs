//! Atomic apply with rollback
//!
//! ```text
//! approved ─► applying ─► integrity ─► base check ─► backup ─► stage temp file
//!                                                               │
//!                               syntax check ◄──────────────────┘
//!                                    │
//!                           rename over target ─► smoke test ─► success
//!                                    └──── any failure ──► restore ─► rolled_back
//! ```
//!
//! The rename is the commit point. Before it the target is untouched; after
//! it a failure restores the backed-up bytes (or removes a file that did not
//! exist before).

use crate::atomic;
use crate::error::PatchError;
use crate::journal::Journal;
use crate::lock::PathLockGuard;
use crate::versions::VersionStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use warden_artifact::{ContentHash, TargetPath};
use warden_curator::parsers::check_syntax;
use warden_sandbox::{RuntimeSmokeTester, SmokeReport};
use warden_store::{EventSink, EventType, PatchRecord, PatchStatus, PatchStore};

/// Step of an apply that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStage {
    /// Stored content no longer matches its hash
    Integrity,
    /// Target changed since the patch was created
    Precondition,
    Backup,
    Write,
    Syntax,
    Smoke,
}

impl ApplyStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Integrity => "integrity",
            Self::Precondition => "precondition",
            Self::Backup => "backup",
            Self::Write => "write",
            Self::Syntax => "syntax",
            Self::Smoke => "smoke",
        }
    }
}

/// Terminal result of one apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// `success` or `rolled_back`
    pub status: PatchStatus,
    pub failed_stage: Option<ApplyStage>,
    pub message: String,
    pub previous_version_id: Option<i64>,
    pub smoke: Option<SmokeReport>,
}

impl ApplyReport {
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == PatchStatus::Success
    }
}

/// How to undo a write
enum Undo {
    Nothing,
    Restore(Vec<u8>),
    /// Delete the new file and the directories created for it
    Remove { created_dirs: Vec<PathBuf> },
}

struct Failure {
    stage: ApplyStage,
    message: String,
    smoke: Option<SmokeReport>,
}

impl Failure {
    fn new(stage: ApplyStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            smoke: None,
        }
    }
}

/// Drives `approved` patches through `applying` to a terminal status.
#[derive(Clone)]
pub struct PatchApplier {
    journal: Journal,
    versions: VersionStore,
    smoke: RuntimeSmokeTester,
    entry_points: BTreeMap<String, String>,
}

impl std::fmt::Debug for PatchApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchApplier")
            .field("smoke", &self.smoke)
            .field("entry_points", &self.entry_points)
            .finish_non_exhaustive()
    }
}

impl PatchApplier {
    #[must_use]
    pub fn new(
        store: Arc<dyn PatchStore>,
        sink: Arc<dyn EventSink>,
        smoke: RuntimeSmokeTester,
    ) -> Self {
        Self {
            versions: VersionStore::new(store.clone()),
            journal: Journal::new(store, sink),
            smoke,
            entry_points: BTreeMap::new(),
        }
    }

    /// Require `symbol` in files named `file_name`
    #[inline]
    #[must_use]
    pub fn with_entry_points(mut self, entry_points: BTreeMap<String, String>) -> Self {
        self.entry_points = entry_points;
        self
    }

    #[inline]
    #[must_use]
    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    /// Apply an `approved` record to `target` while `lock` is held.
    ///
    /// A failed write, syntax check or smoke test is not an error: the
    /// target is restored and the report says `rolled_back`.
    ///
    /// # Errors
    /// - [`PatchError::RollbackFailed`] if the restore itself failed
    /// - [`PatchError::Store`] if a status transition cannot be recorded
    /// - [`PatchError::Internal`] if `lock` does not cover `target`
    pub async fn apply(
        &self,
        record: &PatchRecord,
        target: &TargetPath,
        lock: &PathLockGuard,
    ) -> Result<ApplyReport, PatchError> {
        if lock.target() != target.relative() {
            return Err(PatchError::Internal(format!(
                "lock for {} does not cover {target}",
                lock.target()
            )));
        }
        let record = self
            .journal
            .advance(record, PatchStatus::Applying, json!({ "lock_key": lock.key() }))
            .await?;

        let mut undo = Undo::Nothing;
        let mut previous_version_id = None;
        let attempt = self
            .attempt(&record, target, &mut undo, &mut previous_version_id)
            .await;

        match attempt {
            Ok(smoke) => {
                self.journal
                    .advance(
                        &record,
                        PatchStatus::Success,
                        json!({
                            "sha256": record.content_hash,
                            "previous_version_id": previous_version_id,
                            "smoke": smoke.message,
                        }),
                    )
                    .await?;
                Ok(ApplyReport {
                    status: PatchStatus::Success,
                    failed_stage: None,
                    message: format!("applied {target}: {}", smoke.message),
                    previous_version_id,
                    smoke: Some(smoke),
                })
            }
            Err(failure) => {
                self.roll_back(&record, target, undo, failure, previous_version_id)
                    .await
            }
        }
    }

    async fn attempt(
        &self,
        record: &PatchRecord,
        target: &TargetPath,
        undo: &mut Undo,
        previous_version_id: &mut Option<i64>,
    ) -> Result<SmokeReport, Failure> {
        if !record.content_intact() {
            return Err(Failure::new(
                ApplyStage::Integrity,
                "stored content does not match its sha256",
            ));
        }

        let prior = match tokio::fs::read(target.as_path()).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Failure::new(
                    ApplyStage::Backup,
                    format!("cannot read {target}: {e}"),
                ))
            }
        };
        if prior.as_deref().map(ContentHash::compute) != record.base_hash {
            return Err(Failure::new(
                ApplyStage::Precondition,
                format!("{target} changed since the patch was created"),
            ));
        }

        if let Some(bytes) = &prior {
            let version_id = self
                .versions
                .backup(target, bytes, Some(record.id))
                .await
                .map_err(|e| Failure::new(ApplyStage::Backup, e.to_string()))?;
            self.journal
                .store()
                .set_previous_version(record.id, version_id)
                .await
                .map_err(|e| Failure::new(ApplyStage::Backup, e.to_string()))?;
            *previous_version_id = Some(version_id);
        }

        let path = target.as_path().to_path_buf();
        let bytes = record.content.clone().into_bytes();
        let (staged, on_disk) = tokio::task::spawn_blocking(move || {
            let staged = atomic::stage(&path, &bytes)?;
            let on_disk = staged.read_back()?;
            Ok::<_, std::io::Error>((staged, on_disk))
        })
        .await
        .map_err(|e| Failure::new(ApplyStage::Write, e.to_string()))?
        .map_err(|e| Failure::new(ApplyStage::Write, format!("cannot stage {target}: {e}")))?;
        if prior.is_none() {
            *undo = Undo::Remove {
                created_dirs: staged.created_dirs().to_vec(),
            };
        }

        let staged_source = String::from_utf8(on_disk)
            .map_err(|e| Failure::new(ApplyStage::Syntax, format!("staged file is not UTF-8: {e}")))?;
        if let Err(e) = check_syntax(&staged_source) {
            return Err(Failure::new(ApplyStage::Syntax, e.to_string()));
        }

        if let Some(bytes) = prior {
            *undo = Undo::Restore(bytes);
        }
        tokio::task::spawn_blocking(move || staged.commit())
            .await
            .map_err(|e| Failure::new(ApplyStage::Write, e.to_string()))?
            .map_err(|e| Failure::new(ApplyStage::Write, format!("cannot replace {target}: {e}")))?;

        let symbol = target
            .file_name()
            .and_then(|name| self.entry_points.get(name))
            .map(String::as_str);
        let report = self
            .smoke
            .run(target.as_path(), symbol, record.job_id.as_deref())
            .await;
        if report.passed {
            Ok(report)
        } else {
            Err(Failure {
                stage: ApplyStage::Smoke,
                message: report.message.clone(),
                smoke: Some(report),
            })
        }
    }

    async fn roll_back(
        &self,
        record: &PatchRecord,
        target: &TargetPath,
        undo: Undo,
        failure: Failure,
        previous_version_id: Option<i64>,
    ) -> Result<ApplyReport, PatchError> {
        let path = target.as_path().to_path_buf();
        let restored = match undo {
            Undo::Nothing => Ok(false),
            Undo::Restore(bytes) => atomic::write_atomic_async(path, bytes).await.map(|()| true),
            Undo::Remove { created_dirs } => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                Err(e) => Err(e),
            }
            .map(|restored| {
                if !created_dirs.is_empty() {
                    let removed = atomic::remove_created_dirs(&created_dirs);
                    tracing::debug!(target_path = %target, removed, "removed directories created for the patch");
                }
                restored
            }),
        };

        match restored {
            Ok(restored) => {
                tracing::warn!(
                    patch_id = %record.id,
                    target_path = %target,
                    stage = failure.stage.as_str(),
                    reason = %failure.message,
                    restored,
                    "apply failed, rolled back"
                );
                self.journal
                    .advance(
                        record,
                        PatchStatus::RolledBack,
                        json!({
                            "stage": failure.stage,
                            "reason": failure.message,
                            "restored": restored,
                            "previous_version_id": previous_version_id,
                        }),
                    )
                    .await?;
                Ok(ApplyReport {
                    status: PatchStatus::RolledBack,
                    failed_stage: Some(failure.stage),
                    message: format!("{} failed: {}", failure.stage.as_str(), failure.message),
                    previous_version_id,
                    smoke: failure.smoke,
                })
            }
            Err(rollback) => {
                tracing::error!(
                    patch_id = %record.id,
                    target_path = %target,
                    stage = failure.stage.as_str(),
                    reason = %failure.message,
                    error = %rollback,
                    "rollback failed, target may be inconsistent"
                );
                if let Err(e) = self
                    .journal
                    .advance_with(
                        record,
                        PatchStatus::RolledBack,
                        EventType::ApplyFailed,
                        json!({
                            "stage": failure.stage,
                            "reason": failure.message,
                            "rollback_failed": true,
                            "rollback_error": rollback.to_string(),
                            "previous_version_id": previous_version_id,
                        }),
                    )
                    .await
                {
                    tracing::error!(patch_id = %record.id, error = %e, "failed to record rollback failure");
                }
                Err(PatchError::RollbackFailed {
                    target: target.relative().to_string(),
                    cause: format!("{} failure ({})", failure.stage.as_str(), failure.message),
                    rollback: rollback.to_string(),
                })
            }
        }
    }
}
