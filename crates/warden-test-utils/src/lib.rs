//! Testing utilities for the Warden workspace
//!
//! Shared fakes and fixtures: a scripted sandbox, a recording event sink, a
//! store with a slow idempotency write and a throwaway project tree.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden_sandbox::{Program, Sandbox, SandboxError, SandboxOutput, SandboxRequest, SandboxStage};
use warden_artifact::IdempotencyKey;
use warden_store::{
    CodeVersion, EventSink, EventType, IdempotencyRecord, PatchEvent, PatchId, PatchRecord,
    PatchStatus, PatchStore, SinkError, Snapshot, SqliteStore, StoreError,
};

type Script = dyn Fn(&SandboxRequest, &str) -> Result<SandboxOutput, SandboxError> + Send + Sync;

/// Sandbox that answers every request from a closure instead of spawning
/// a process. The closure sees the request and the program text.
pub struct ScriptedSandbox {
    script: Box<Script>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    stages: Mutex<Vec<SandboxStage>>,
}

impl std::fmt::Debug for ScriptedSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedSandbox")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

pub fn output(exit_code: Option<i32>, stderr: &str, timed_out: bool) -> SandboxOutput {
    SandboxOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        timed_out,
        duration: Duration::from_millis(1),
    }
}

impl ScriptedSandbox {
    pub fn new(
        script: impl Fn(&SandboxRequest, &str) -> Result<SandboxOutput, SandboxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            delay: None,
            calls: AtomicUsize::new(0),
            stages: Mutex::new(Vec::new()),
        }
    }

    /// Every run exits 0
    pub fn passing() -> Self {
        Self::new(|_, _| Ok(output(Some(0), "", false)))
    }

    /// Every run exits with `code` and writes `stderr`
    pub fn failing(code: i32, stderr: &str) -> Self {
        let stderr = stderr.to_string();
        Self::new(move |_, _| Ok(output(Some(code), &stderr, false)))
    }

    /// Every run hits its timeout
    pub fn timing_out() -> Self {
        Self::new(|_, _| Ok(output(None, "", true)))
    }

    /// The sandbox itself fails
    pub fn broken() -> Self {
        Self::new(|_, _| {
            Err(SandboxError::Spawn {
                program: PathBuf::from("python3"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no interpreter"),
            })
        })
    }

    /// Micro checks pass. Smoke runs fail when the program has a top-level
    /// `raise` line and exit 3 when the requested entry symbol is not
    /// assigned, defined or declared as a class.
    pub fn python_like() -> Self {
        Self::new(|request, text| {
            if request.stage == SandboxStage::MicroCheck {
                return Ok(output(Some(0), "", false));
            }
            if text.lines().any(|l| l.starts_with("raise ")) {
                return Ok(output(
                    Some(1),
                    "Traceback (most recent call last):\nRuntimeError: boom",
                    false,
                ));
            }
            if let Some(symbol) = request.args.first() {
                let defined = text.lines().any(|l| {
                    l.starts_with(&format!("{symbol} ="))
                        || l.starts_with(&format!("{symbol}="))
                        || l.starts_with(&format!("def {symbol}("))
                        || l.starts_with(&format!("class {symbol}"))
                });
                if !defined {
                    return Ok(output(
                        Some(3),
                        &format!("missing entry symbol: {symbol}"),
                        false,
                    ));
                }
            }
            Ok(output(Some(0), "", false))
        })
    }

    /// Sleep this long before answering
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of runs so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Stages of every run, in order
    pub fn stages(&self) -> Vec<SandboxStage> {
        self.stages.lock().clone()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxOutput, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.stages.lock().push(request.stage);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = match &request.program {
            Program::Source(source) => source.clone(),
            Program::File(path) => std::fs::read_to_string(path).unwrap_or_default(),
        };
        (self.script)(&request, &text)
    }
}

/// One event captured by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub source: String,
    pub event_type: String,
    pub job_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Event sink that keeps everything in memory, or rejects everything
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every delivery fails
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn log(
        &self,
        source: &str,
        event_type: &str,
        job_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::IntegrityViolation(0));
        }
        self.events.lock().push(RecordedEvent {
            source: source.to_string(),
            event_type: event_type.to_string(),
            job_id: job_id.map(str::to_string),
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// In-memory SQLite store whose idempotency insert sleeps first, widening
/// the window between a write landing on disk and its result being stored
#[derive(Debug)]
pub struct SlowIdempotencyStore {
    inner: Arc<SqliteStore>,
    delay: Duration,
}

impl SlowIdempotencyStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(SqliteStore::in_memory().unwrap()),
            delay,
        }
    }
}

#[async_trait]
impl PatchStore for SlowIdempotencyStore {
    async fn insert_patch(&self, record: &PatchRecord) -> Result<(), StoreError> {
        self.inner.insert_patch(record).await
    }

    async fn get_patch(&self, id: PatchId) -> Result<Option<PatchRecord>, StoreError> {
        self.inner.get_patch(id).await
    }

    async fn list_patches(
        &self,
        status: Option<PatchStatus>,
        limit: usize,
    ) -> Result<Vec<PatchRecord>, StoreError> {
        self.inner.list_patches(status, limit).await
    }

    async fn transition(
        &self,
        id: PatchId,
        from: PatchStatus,
        to: PatchStatus,
        event: EventType,
        payload: serde_json::Value,
    ) -> Result<PatchRecord, StoreError> {
        self.inner.transition(id, from, to, event, payload).await
    }

    async fn set_previous_version(&self, id: PatchId, version_id: i64) -> Result<(), StoreError> {
        self.inner.set_previous_version(id, version_id).await
    }

    async fn events(&self, id: PatchId) -> Result<Vec<PatchEvent>, StoreError> {
        self.inner.events(id).await
    }

    async fn insert_code_version(
        &self,
        file_path: &str,
        content: &[u8],
        patch_id: Option<PatchId>,
    ) -> Result<i64, StoreError> {
        self.inner.insert_code_version(file_path, content, patch_id).await
    }

    async fn code_version(&self, version_id: i64) -> Result<Option<CodeVersion>, StoreError> {
        self.inner.code_version(version_id).await
    }

    async fn code_versions_for(&self, file_path: &str) -> Result<Vec<CodeVersion>, StoreError> {
        self.inner.code_versions_for(file_path).await
    }

    async fn idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.inner.idempotency(key).await
    }

    async fn record_idempotency(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.record_idempotency(record).await
    }

    async fn insert_snapshot(
        &self,
        description: &str,
        artifact_path: &str,
    ) -> Result<i64, StoreError> {
        self.inner.insert_snapshot(description, artifact_path).await
    }

    async fn snapshot(&self, id: i64) -> Result<Option<Snapshot>, StoreError> {
        self.inner.snapshot(id).await
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, StoreError> {
        self.inner.list_snapshots().await
    }
}

/// Temporary project tree, removed on drop
#[derive(Debug)]
pub struct TestWorkspace {
    dir: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `content` to a root-relative path, creating parents
    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(relative)).unwrap()
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.dir.path().join(relative).exists()
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
