//! Data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use ulid::Ulid;
use warden_artifact::{ContentHash, IdempotencyKey};

/// Unique patch identifier (ULID, sortable by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchId(Ulid);

impl PatchId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for PatchId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s.trim()).map(Self)
    }
}

/// Lifecycle status of a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    Submitted,
    Validated,
    Approved,
    Rejected,
    Applying,
    Success,
    RolledBack,
}

impl PatchStatus {
    pub const ALL: [Self; 7] = [
        Self::Submitted,
        Self::Validated,
        Self::Approved,
        Self::Rejected,
        Self::Applying,
        Self::Success,
        Self::RolledBack,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Validated => "validated",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Applying => "applying",
            Self::Success => "success",
            Self::RolledBack => "rolled_back",
        }
    }

    /// No further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Success | Self::RolledBack)
    }

    /// Forward-only state machine. `submitted -> rejected` covers requests
    /// that fail structural checks before validation.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Submitted, Self::Validated | Self::Rejected)
                | (Self::Validated, Self::Approved | Self::Rejected)
                | (Self::Approved, Self::Applying)
                | (Self::Applying, Self::Success | Self::RolledBack)
        )
    }
}

impl Display for PatchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown patch status: {s}"))
    }
}

/// Kind of audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Validated,
    ReviewApproved,
    ReviewRejected,
    ApplyStarted,
    ApplyFinished,
    ApplyFailed,
    RolledBack,
}

impl EventType {
    pub const ALL: [Self; 8] = [
        Self::Created,
        Self::Validated,
        Self::ReviewApproved,
        Self::ReviewRejected,
        Self::ApplyStarted,
        Self::ApplyFinished,
        Self::ApplyFailed,
        Self::RolledBack,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::ReviewApproved => "review_approved",
            Self::ReviewRejected => "review_rejected",
            Self::ApplyStarted => "apply_started",
            Self::ApplyFinished => "apply_finished",
            Self::ApplyFailed => "apply_failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Event recorded when a patch enters `status`
    #[must_use]
    pub const fn for_status(status: PatchStatus) -> Self {
        match status {
            PatchStatus::Submitted => Self::Created,
            PatchStatus::Validated => Self::Validated,
            PatchStatus::Approved => Self::ReviewApproved,
            PatchStatus::Rejected => Self::ReviewRejected,
            PatchStatus::Applying => Self::ApplyStarted,
            PatchStatus::Success => Self::ApplyFinished,
            PatchStatus::RolledBack => Self::RolledBack,
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// A proposed full-file replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub id: PatchId,
    pub author: String,
    /// Root-relative target
    pub target_path: String,
    pub content: String,
    pub content_hash: ContentHash,
    pub status: PatchStatus,
    pub approve_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub task_id: Option<String>,
    pub job_id: Option<String>,
    /// CodeVersion saved before this patch overwrote the target
    pub previous_version_id: Option<i64>,
    pub idempotency_key: IdempotencyKey,
    /// Hash of the target when the request arrived; `None` if it did not exist
    pub base_hash: Option<ContentHash>,
}

impl PatchRecord {
    /// New record in `submitted` state
    #[must_use]
    pub fn new(
        author: impl Into<String>,
        target_path: impl Into<String>,
        content: impl Into<String>,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        let content = content.into();
        Self {
            id: PatchId::new(),
            author: author.into(),
            target_path: target_path.into(),
            content_hash: ContentHash::compute(content.as_bytes()),
            content,
            status: PatchStatus::Submitted,
            approve_token: None,
            created_at: Utc::now(),
            applied_at: None,
            task_id: None,
            job_id: None,
            previous_version_id: None,
            idempotency_key,
            base_hash: None,
        }
    }

    #[must_use]
    pub fn with_task_id(mut self, task_id: Option<String>) -> Self {
        self.task_id = task_id;
        self
    }

    #[must_use]
    pub fn with_job_id(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id;
        self
    }

    #[must_use]
    pub fn with_base_hash(mut self, base_hash: Option<ContentHash>) -> Self {
        self.base_hash = base_hash;
        self
    }

    /// Whether `content` still hashes to `content_hash`
    #[must_use]
    pub fn content_intact(&self) -> bool {
        ContentHash::compute(self.content.as_bytes()) == self.content_hash
    }
}

/// One audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEvent {
    pub id: i64,
    pub patch_id: PatchId,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Prior content of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeVersion {
    pub version_id: i64,
    pub file_path: String,
    pub content: Vec<u8>,
    pub content_hash: ContentHash,
    /// Patch whose apply caused the backup
    pub patch_id: Option<PatchId>,
    pub created_at: DateTime<Utc>,
}

/// Terminal outcome of a logical request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub status: PatchStatus,
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Whole-tree archive metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub description: String,
    pub artifact_path: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        use PatchStatus::*;
        assert!(Submitted.can_transition_to(Validated));
        assert!(Submitted.can_transition_to(Rejected));
        assert!(Validated.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Applying));
        assert!(Applying.can_transition_to(RolledBack));
        assert!(!Success.can_transition_to(Applying));
        assert!(!RolledBack.can_transition_to(Success));
        assert!(!Approved.can_transition_to(Success));
        assert!(!Submitted.can_transition_to(Applying));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in PatchStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in PatchStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn status_and_event_names_round_trip() {
        for status in PatchStatus::ALL {
            assert_eq!(status.as_str().parse::<PatchStatus>().unwrap(), status);
        }
        for event in EventType::ALL {
            assert_eq!(event.as_str().parse::<EventType>().unwrap(), event);
        }
        assert!("bogus".parse::<PatchStatus>().is_err());
    }

    #[test]
    fn every_status_has_an_event() {
        assert_eq!(EventType::for_status(PatchStatus::Approved), EventType::ReviewApproved);
        assert_eq!(EventType::for_status(PatchStatus::RolledBack), EventType::RolledBack);
    }

    #[test]
    fn new_record_hashes_content() {
        let key = IdempotencyKey::derive("a.py", "x = 1\n", "t");
        let record = PatchRecord::new("alice", "a.py", "x = 1\n", key);
        assert_eq!(record.status, PatchStatus::Submitted);
        assert!(record.content_intact());
        let mut tampered = record.clone();
        tampered.content.push('#');
        assert!(!tampered.content_intact());
    }

    #[test]
    fn patch_id_parses() {
        let id = PatchId::new();
        assert_eq!(id.to_string().parse::<PatchId>().unwrap(), id);
    }
}
