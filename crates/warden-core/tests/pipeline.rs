//! End-to-end behavior of the patch pipeline against a real SQLite store,
//! real files and a scripted sandbox.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use warden_core::prelude::*;
use warden_artifact::ContentHash;
use warden_core::{ApplyPatchOutcome, ApplyStage};
use std::sync::atomic::{AtomicUsize, Ordering};
use warden_sandbox::{Sandbox, SandboxError, SandboxStage};
use warden_store::{EventSink, EventType, JsonlEventSink, PatchStore, SqliteStore};
use warden_test_utils::{output, RecordingSink, ScriptedSandbox, SlowIdempotencyStore, TestWorkspace};

struct Harness {
    ws: TestWorkspace,
    store: Arc<SqliteStore>,
    sandbox: Arc<ScriptedSandbox>,
    sink: Arc<RecordingSink>,
    pipeline: PatchPipeline,
}

fn config(ws: &TestWorkspace) -> WardenConfig {
    let mut config = WardenConfig::new(ws.path()).with_lock_timeout(Duration::from_secs(5));
    config.lock_poll_ms = 10;
    config
}

fn harness_with(sandbox: ScriptedSandbox, sink: RecordingSink) -> Harness {
    let ws = TestWorkspace::new();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let sandbox = Arc::new(sandbox);
    let sink = Arc::new(sink);
    let pipeline = PatchPipeline::with_components(
        &config(&ws),
        store.clone() as Arc<dyn PatchStore>,
        sandbox.clone() as Arc<dyn Sandbox>,
        sink.clone() as Arc<dyn EventSink>,
    )
    .unwrap();
    Harness {
        ws,
        store,
        sandbox,
        sink,
        pipeline,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedSandbox::python_like(), RecordingSink::new())
}

async fn event_types(h: &Harness, id: PatchId) -> Vec<EventType> {
    h.store
        .events(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn deploy_success_walks_the_full_lifecycle() {
    let h = harness();
    h.ws.write("app.py", "app = 'v1'\n");

    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "app = 'v2'\n", "bump version").with_job_id("job-1"))
        .await
        .unwrap();

    assert_eq!(outcome.status, PatchStatus::Success, "{}", outcome.message);
    assert_eq!(outcome.score, Some(100));
    assert!(!outcome.replayed);
    assert_eq!(h.ws.read("app.py"), "app = 'v2'\n");

    let backup = h
        .pipeline
        .versions()
        .get(outcome.previous_version_id.unwrap())
        .await
        .unwrap();
    assert_eq!(backup.content, b"app = 'v1'\n");

    assert_eq!(
        event_types(&h, outcome.patch_id).await,
        vec![
            EventType::Created,
            EventType::Validated,
            EventType::ReviewApproved,
            EventType::ApplyStarted,
            EventType::ApplyFinished,
        ]
    );
    let mirrored = h.sink.events();
    assert_eq!(mirrored.len(), 5);
    assert!(mirrored.iter().all(|e| e.job_id.as_deref() == Some("job-1")));
    assert!(mirrored.iter().all(|e| e.source == "patch_pipeline"));
}

#[tokio::test]
async fn identical_deploy_replays_without_writing_again() {
    let h = harness();
    let request = DeployRequest::new("app.py", "app = 1\n", "Create  App");

    let first = h.pipeline.deploy(request.clone()).await.unwrap();
    assert!(first.succeeded());
    let calls_after_first = h.sandbox.calls();

    // Someone edits the file by hand; a replay must not clobber it.
    h.ws.write("app.py", "app = 'manual'\n");
    let again = DeployRequest::new("app.py", "app = 1\n", "create app");
    let second = h.pipeline.deploy(again).await.unwrap();

    assert!(second.replayed);
    assert_eq!(second.patch_id, first.patch_id);
    assert_eq!(second.status, PatchStatus::Success);
    assert_eq!(h.sandbox.calls(), calls_after_first);
    assert_eq!(h.ws.read("app.py"), "app = 'manual'\n");
    assert_eq!(h.pipeline.list_patches(None, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn empty_code_is_rejected_with_score_zero() {
    let h = harness();
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "  \n\t", "nothing"))
        .await
        .unwrap();

    assert_eq!(outcome.status, PatchStatus::Rejected);
    assert_eq!(outcome.score, Some(0));
    assert!(outcome.reasons.iter().any(|r| r == "empty code"));
    assert!(!h.ws.exists("app.py"));
    assert_eq!(h.sandbox.calls(), 0);
    assert_eq!(
        event_types(&h, outcome.patch_id).await,
        vec![EventType::Created, EventType::ReviewRejected]
    );
    assert!(matches!(
        outcome.into_result(),
        Err(PatchError::PolicyRejection { .. })
    ));
}

#[tokio::test]
async fn indented_snippet_is_reviewed_and_written_dedented() {
    let h = harness();
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new(
            "app.py",
            "    def make():\n        return 2\n\n    app = make()\n",
            "pasted snippet",
        ))
        .await
        .unwrap();

    assert!(outcome.succeeded(), "{}", outcome.message);
    let written = "def make():\n    return 2\n\napp = make()\n";
    assert_eq!(h.ws.read("app.py"), written);
    assert_eq!(outcome.sha256, ContentHash::compute(written.as_bytes()));
}

#[tokio::test]
async fn banned_import_costs_ten_points() {
    let h = harness();
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("tool.py", "import subprocess\n", "shell out"))
        .await
        .unwrap();

    assert_eq!(outcome.status, PatchStatus::Rejected);
    assert_eq!(outcome.score, Some(90));
    assert_eq!(outcome.reasons, vec!["banned import: subprocess".to_string()]);
    assert!(!h.ws.exists("tool.py"));
    assert_eq!(
        event_types(&h, outcome.patch_id).await,
        vec![EventType::Created, EventType::Validated, EventType::ReviewRejected]
    );
}

#[tokio::test]
async fn unparseable_code_is_rejected_regardless_of_content() {
    let h = harness();
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "app = (1,\n", "broken"))
        .await
        .unwrap();

    assert_eq!(outcome.status, PatchStatus::Rejected);
    assert_eq!(outcome.score, Some(0));
    assert!(!h.ws.exists("app.py"));
    assert!(h.sandbox.stages().is_empty());
}

#[tokio::test]
async fn path_escape_is_rejected_before_any_filesystem_access() {
    let h = harness();
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("../outside.py", "x = 1\n", "escape"))
        .await
        .unwrap();

    assert_eq!(outcome.status, PatchStatus::Rejected);
    assert!(outcome.reasons.iter().any(|r| r.contains("escapes")));
    assert!(!h.ws.path().parent().unwrap().join("outside.py").exists());
    assert_eq!(h.sandbox.calls(), 0);
    let locks = h.ws.path().join(".warden/locks");
    assert!(!locks.exists() || std::fs::read_dir(&locks).unwrap().next().is_none());
}

#[tokio::test]
async fn state_directory_is_not_a_valid_target() {
    let h = harness();
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new(".warden/evil.py", "x = 1\n", "tamper"))
        .await
        .unwrap();
    assert_eq!(outcome.status, PatchStatus::Rejected);
    assert!(outcome.reasons[0].contains("state directory"));
}

#[tokio::test]
async fn load_time_exception_restores_original_bytes() {
    let h = harness();
    let original = "app = 'stable'\r\n# trailing bytes kept exactly\r\n";
    h.ws.write("app.py", original);

    let outcome = h
        .pipeline
        .deploy(DeployRequest::new(
            "app.py",
            "app = 'new'\nraise RuntimeError('boom')\n",
            "break it",
        ))
        .await
        .unwrap();

    assert_eq!(outcome.status, PatchStatus::RolledBack);
    assert_eq!(outcome.failed_stage, Some(ApplyStage::Smoke));
    assert_eq!(h.ws.read("app.py"), original);
    assert_eq!(
        event_types(&h, outcome.patch_id).await,
        vec![
            EventType::Created,
            EventType::Validated,
            EventType::ReviewApproved,
            EventType::ApplyStarted,
            EventType::RolledBack,
        ]
    );
    assert!(matches!(
        outcome.into_result(),
        Err(PatchError::SmokeTestFailure(_))
    ));
}

#[tokio::test]
async fn missing_entry_symbol_rolls_back() {
    let h = harness();
    h.ws.write("app.py", "app = 1\n");
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "application = 2\n", "rename"))
        .await
        .unwrap();
    assert_eq!(outcome.status, PatchStatus::RolledBack);
    assert_eq!(h.ws.read("app.py"), "app = 1\n");
    assert!(h.sandbox.stages().contains(&SandboxStage::Smoke));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_deploys_to_one_path_have_one_winner() {
    let h = harness_with(
        ScriptedSandbox::python_like().with_delay(Duration::from_millis(100)),
        RecordingSink::new(),
    );
    h.ws.write("app.py", "app = 0\n");

    let a = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "app = 'a'\n", "writer a"));
    let b = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "app = 'b'\n", "writer b"));
    let (a, b) = futures::join!(a, b);
    let (a, b) = (a.unwrap(), b.unwrap());

    let winners: Vec<_> = [&a, &b].into_iter().filter(|o| o.succeeded()).collect();
    assert_eq!(winners.len(), 1, "a: {}, b: {}", a.message, b.message);
    let loser = if a.succeeded() { &b } else { &a };
    assert_eq!(loser.status, PatchStatus::RolledBack);
    assert_eq!(loser.failed_stage, Some(ApplyStage::Precondition));

    let expected = if a.succeeded() { "app = 'a'\n" } else { "app = 'b'\n" };
    assert_eq!(h.ws.read("app.py"), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_waiting_on_the_lock_replays_the_first_result() {
    let ws = TestWorkspace::new();
    ws.write("app.py", "app = 0\n");
    let store = Arc::new(SlowIdempotencyStore::new(Duration::from_millis(300)));
    let pipeline = PatchPipeline::with_components(
        &config(&ws),
        store.clone() as Arc<dyn PatchStore>,
        Arc::new(ScriptedSandbox::python_like()),
        Arc::new(RecordingSink::new()),
    )
    .unwrap();
    let request = DeployRequest::new("app.py", "app = 1\n", "bump");

    let first = pipeline.deploy(request.clone());
    let second = async {
        // Start once the first write is live but before its result is stored.
        while ws.read("app.py") != "app = 1\n" {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pipeline.deploy(request.clone()).await
    };
    let (first, second) = futures::join!(first, second);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(first.succeeded());
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(second.patch_id, first.patch_id);
    assert_eq!(store.code_versions_for("app.py").await.unwrap().len(), 1);
    assert_eq!(
        store
            .list_patches(Some(PatchStatus::Success), 10)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn internal_review_failure_is_not_replayed() {
    let micro_calls = Arc::new(AtomicUsize::new(0));
    let counter = micro_calls.clone();
    let sandbox = ScriptedSandbox::new(move |request, _| {
        if request.stage == SandboxStage::MicroCheck && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(SandboxError::Spawn {
                program: "python3".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no interpreter"),
            });
        }
        Ok(output(Some(0), "", false))
    });
    let h = harness_with(sandbox, RecordingSink::new());
    let request = DeployRequest::new("app.py", "app = 1\n", "create app");

    let first = h.pipeline.deploy(request.clone()).await.unwrap();
    assert_eq!(first.status, PatchStatus::Rejected);
    assert!(first.reasons[0].contains("micro check could not run"));
    assert!(!h.ws.exists("app.py"));

    let second = h.pipeline.deploy(request).await.unwrap();
    assert!(!second.replayed);
    assert!(second.succeeded(), "{}", second.message);
    assert_ne!(second.patch_id, first.patch_id);
    assert_eq!(micro_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.ws.read("app.py"), "app = 1\n");
}

#[tokio::test]
async fn busy_target_times_out() {
    let ws = TestWorkspace::new();
    let mut config = config(&ws).with_lock_timeout(Duration::from_millis(50));
    config.lock_poll_ms = 5;
    let pipeline = PatchPipeline::with_components(
        &config,
        Arc::new(SqliteStore::in_memory().unwrap()),
        Arc::new(ScriptedSandbox::python_like()),
        Arc::new(RecordingSink::new()),
    )
    .unwrap();

    let locks = warden_core::PathLocks::new(config.locks_dir());
    let target = pipeline.root().resolve("app.py").unwrap();
    let _held = locks.acquire(&target).await.unwrap();

    let err = pipeline
        .deploy(DeployRequest::new("app.py", "app = 1\n", "blocked"))
        .await
        .unwrap_err();
    assert!(matches!(err, PatchError::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert!(!ws.exists("app.py"));
}

#[tokio::test]
async fn submit_then_apply_with_token() {
    let h = harness();
    h.ws.write("app.py", "app = 1\n");

    let submitted = h
        .pipeline
        .submit_patch(SubmitRequest {
            author: "alice".to_string(),
            target_path: "app.py".to_string(),
            content: "app = 2\n".to_string(),
            task_id: Some("T-9".to_string()),
            job_id: None,
        })
        .await
        .unwrap();
    assert_eq!(submitted.status, PatchStatus::Approved);
    let token = submitted.approve_token.clone().unwrap();
    assert_eq!(h.ws.read("app.py"), "app = 1\n");

    let details = h.pipeline.get_patch(submitted.id).await.unwrap().unwrap();
    assert_eq!(details.record.author, "alice");
    assert_eq!(details.record.approve_token, None);

    let wrong = h.pipeline.apply_patch(submitted.id, "nope").await.unwrap();
    assert_eq!(wrong.outcome, ApplyPatchOutcome::TokenMismatch);
    assert_eq!(h.ws.read("app.py"), "app = 1\n");

    let applied = h.pipeline.apply_patch(submitted.id, &token).await.unwrap();
    assert_eq!(applied.outcome, ApplyPatchOutcome::Success, "{}", applied.message);
    assert_eq!(applied.sha256, Some(submitted.sha256));
    assert_eq!(h.ws.read("app.py"), "app = 2\n");

    let again = h.pipeline.apply_patch(submitted.id, &token).await.unwrap();
    assert_eq!(again.outcome, ApplyPatchOutcome::Success);
    assert!(again.replayed);
}

#[tokio::test]
async fn apply_refuses_unknown_and_rejected_patches() {
    let h = harness();
    let missing = h.pipeline.apply_patch(PatchId::new(), "t").await.unwrap();
    assert_eq!(missing.outcome, ApplyPatchOutcome::NotFound);

    let rejected = h
        .pipeline
        .submit_patch(SubmitRequest {
            author: String::new(),
            target_path: "x.py".to_string(),
            content: "import socket\n".to_string(),
            ..SubmitRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(rejected.status, PatchStatus::Rejected);
    assert_eq!(rejected.approve_token, None);
    assert_eq!(rejected.score, Some(90));

    // The token exists but was never revealed; guessing it still fails.
    let refused = h.pipeline.apply_patch(rejected.id, "").await.unwrap();
    assert_eq!(refused.outcome, ApplyPatchOutcome::TokenMismatch);

    let stored = h.store.get_patch(rejected.id).await.unwrap().unwrap();
    assert_eq!(stored.author, "warden");
    let token = stored.approve_token.unwrap();
    let invalid = h.pipeline.apply_patch(rejected.id, &token).await.unwrap();
    assert_eq!(invalid.outcome, ApplyPatchOutcome::InvalidState);
    assert_eq!(invalid.status, Some(PatchStatus::Rejected));
}

#[tokio::test]
async fn submit_with_bad_path_is_rejected_without_token() {
    let h = harness();
    let outcome = h
        .pipeline
        .submit_patch(SubmitRequest {
            author: "bob".to_string(),
            target_path: "/etc/passwd".to_string(),
            content: "x = 1\n".to_string(),
            ..SubmitRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, PatchStatus::Rejected);
    assert_eq!(outcome.approve_token, None);
    assert_eq!(outcome.score, Some(0));
}

#[tokio::test]
async fn revert_restores_a_saved_version() {
    let h = harness();
    h.ws.write("app.py", "app = 1\n");
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "app = 2\n", "upgrade"))
        .await
        .unwrap();
    let v1 = outcome.previous_version_id.unwrap();

    let reverted = h.pipeline.revert_file("app.py", v1).await.unwrap();
    assert_eq!(h.ws.read("app.py"), "app = 1\n");
    assert_eq!(reverted.restored_version_id, v1);

    let backup = h
        .pipeline
        .versions()
        .get(reverted.backup_version_id.unwrap())
        .await
        .unwrap();
    assert_eq!(backup.content, b"app = 2\n");
    assert!(h.sink.event_types().contains(&"file_reverted".to_string()));

    assert!(matches!(
        h.pipeline.revert_file("other.py", v1).await,
        Err(PatchError::ValidationFailure(_))
    ));
    assert!(matches!(
        h.pipeline.revert_file("app.py", 999).await,
        Err(PatchError::VersionNotFound(999))
    ));
}

#[tokio::test]
async fn snapshots_round_trip_through_the_pipeline() {
    let h = harness();
    h.ws.write("src/app.py", "app = 1\n");
    let created = h.pipeline.create_snapshot("nightly").await.unwrap();
    assert_eq!(created.archived, vec!["src".to_string()]);

    h.pipeline
        .deploy(DeployRequest::new("src/app.py", "app = 2\n", "change"))
        .await
        .unwrap();
    assert_eq!(h.ws.read("src/app.py"), "app = 2\n");

    let restored = h.pipeline.restore_snapshot(created.snapshot_id).await.unwrap();
    assert_eq!(restored.description, "nightly");
    assert_eq!(h.ws.read("src/app.py"), "app = 1\n");
    assert_eq!(h.pipeline.list_snapshots().await.unwrap().len(), 1);
}

#[tokio::test]
async fn failing_sink_never_fails_the_pipeline() {
    let h = harness_with(ScriptedSandbox::python_like(), RecordingSink::failing());
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "app = 1\n", "quiet"))
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert_eq!(event_types(&h, outcome.patch_id).await.len(), 5);
}

#[tokio::test]
async fn broken_sandbox_fails_closed() {
    let h = harness_with(ScriptedSandbox::broken(), RecordingSink::new());
    let outcome = h
        .pipeline
        .deploy(DeployRequest::new("app.py", "app = 1\n", "no interpreter"))
        .await
        .unwrap();
    assert_eq!(outcome.status, PatchStatus::Rejected);
    assert!(outcome.reasons[0].contains("micro check could not run"));
    assert!(!h.ws.exists("app.py"));
}

#[tokio::test]
async fn open_wires_sqlite_and_jsonl_sink() {
    let ws = TestWorkspace::new();
    let log = ws.path().join("audit/events.jsonl");
    let config = config(&ws).with_event_log(&log);
    let pipeline = PatchPipeline::open(&config).await.unwrap();

    let outcome = pipeline
        .deploy(DeployRequest::new("../nope.py", "x = 1\n", "escape"))
        .await
        .unwrap();
    assert_eq!(outcome.status, PatchStatus::Rejected);
    assert!(config.database_path().exists());
    assert_eq!(JsonlEventSink::verify(&log).await.unwrap(), 2);

    let reopened = PatchPipeline::open(&config).await.unwrap();
    let replay = reopened
        .deploy(DeployRequest::new("../nope.py", "x = 1\n", "escape"))
        .await
        .unwrap();
    assert!(replay.replayed);
}
