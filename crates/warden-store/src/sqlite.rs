//! SQLite implementation of [`PatchStore`].
//!
//! One connection behind a mutex; every operation runs on the blocking
//! pool via `spawn_blocking`. Status transitions are compare-and-set inside
//! a transaction together with their event row, so a record and its audit
//! trail can never disagree.
//!
//! # Schema Versioning
//!
//! `schema_version` holds a single row. Bump `CURRENT_SCHEMA_VERSION` and
//! add a step to `run_migrations()` for every schema change.

use crate::error::StoreError;
use crate::model::{
    CodeVersion, EventType, IdempotencyRecord, PatchEvent, PatchId, PatchRecord, PatchStatus,
    Snapshot,
};
use crate::store::PatchStore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use warden_artifact::{ContentHash, IdempotencyKey};

const CURRENT_SCHEMA_VERSION: i64 = 1;

const PATCH_COLUMNS: &str = "id, author, target_path, content, content_hash, status, \
     approve_token, created_at, applied_at, task_id, job_id, previous_version_id, \
     idempotency_key, base_hash";

/// SQLite-backed [`PatchStore`]
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// Uses WAL journaling with `synchronous = FULL` and a busy timeout so a
    /// second process reading the same file waits instead of failing.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the file cannot be opened, configured or
    /// migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Open {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(journal_mode = %journal_mode, path = %path.display(), "sqlite did not enable WAL");
        }
        Self::configure(conn)
    }

    /// Fresh private in-memory database
    ///
    /// # Errors
    /// Returns [`StoreError`] if the schema cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            ",
        )?;
        let current: i64 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);
        Self::run_migrations(&conn, current)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::corrupt(format!(
                "schema version {from_version} is newer than supported {CURRENT_SCHEMA_VERSION}"
            )));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS patches (
                    id TEXT PRIMARY KEY,
                    author TEXT NOT NULL,
                    target_path TEXT NOT NULL,
                    content TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    status TEXT NOT NULL,
                    approve_token TEXT,
                    created_at TEXT NOT NULL,
                    applied_at TEXT,
                    task_id TEXT,
                    job_id TEXT,
                    previous_version_id INTEGER,
                    idempotency_key TEXT NOT NULL,
                    base_hash TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_patches_status ON patches(status, created_at);
                CREATE INDEX IF NOT EXISTS idx_patches_key ON patches(idempotency_key);

                CREATE TABLE IF NOT EXISTS patch_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    patch_id TEXT NOT NULL REFERENCES patches(id),
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_patch ON patch_events(patch_id, id);

                CREATE TABLE IF NOT EXISTS code_versions (
                    version_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_path TEXT NOT NULL,
                    content BLOB NOT NULL,
                    content_hash TEXT NOT NULL,
                    patch_id TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_versions_path ON code_versions(file_path, version_id);

                CREATE TABLE IF NOT EXISTS idempotency (
                    key TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    result TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    description TEXT NOT NULL,
                    artifact_path TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                ",
            )?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Task(format!("{op}: {e}")))?
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(format!("timestamp {raw:?}: {e}")))
}

fn parse_hash(raw: &str) -> Result<ContentHash, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::corrupt(format!("hash {raw:?}: {e}")))
}

fn parse_status(raw: &str) -> Result<PatchStatus, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

fn parse_patch_id(raw: &str) -> Result<PatchId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::corrupt(format!("patch id {raw:?}: {e}")))
}

/// Column values of one `patches` row, before validation
struct RawPatch {
    id: String,
    author: String,
    target_path: String,
    content: String,
    content_hash: String,
    status: String,
    approve_token: Option<String>,
    created_at: String,
    applied_at: Option<String>,
    task_id: Option<String>,
    job_id: Option<String>,
    previous_version_id: Option<i64>,
    idempotency_key: String,
    base_hash: Option<String>,
}

impl RawPatch {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            author: row.get(1)?,
            target_path: row.get(2)?,
            content: row.get(3)?,
            content_hash: row.get(4)?,
            status: row.get(5)?,
            approve_token: row.get(6)?,
            created_at: row.get(7)?,
            applied_at: row.get(8)?,
            task_id: row.get(9)?,
            job_id: row.get(10)?,
            previous_version_id: row.get(11)?,
            idempotency_key: row.get(12)?,
            base_hash: row.get(13)?,
        })
    }
}

impl TryFrom<RawPatch> for PatchRecord {
    type Error = StoreError;

    fn try_from(raw: RawPatch) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_patch_id(&raw.id)?,
            author: raw.author,
            target_path: raw.target_path,
            content: raw.content,
            content_hash: parse_hash(&raw.content_hash)?,
            status: parse_status(&raw.status)?,
            approve_token: raw.approve_token,
            created_at: parse_time(&raw.created_at)?,
            applied_at: raw.applied_at.as_deref().map(parse_time).transpose()?,
            task_id: raw.task_id,
            job_id: raw.job_id,
            previous_version_id: raw.previous_version_id,
            idempotency_key: raw
                .idempotency_key
                .parse()
                .map_err(|e| StoreError::corrupt(format!("idempotency key: {e}")))?,
            base_hash: raw.base_hash.as_deref().map(parse_hash).transpose()?,
        })
    }
}

fn load_patch(conn: &Connection, id: &str) -> Result<Option<PatchRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {PATCH_COLUMNS} FROM patches WHERE id = ?1"),
        params![id],
        RawPatch::from_row,
    )
    .optional()?
    .map(PatchRecord::try_from)
    .transpose()
}

fn insert_event(
    conn: &Connection,
    patch_id: &str,
    event: EventType,
    payload: &serde_json::Value,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO patch_events (patch_id, event_type, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![patch_id, event.as_str(), serde_json::to_string(payload)?, timestamp(at)],
    )?;
    Ok(())
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, Vec<u8>, String, Option<String>, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn build_version(
    (version_id, file_path, content, hash, patch_id, created_at): (i64, String, Vec<u8>, String, Option<String>, String),
) -> Result<CodeVersion, StoreError> {
    Ok(CodeVersion {
        version_id,
        file_path,
        content,
        content_hash: parse_hash(&hash)?,
        patch_id: patch_id.as_deref().map(parse_patch_id).transpose()?,
        created_at: parse_time(&created_at)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn build_snapshot((id, description, artifact_path, created_at): (i64, String, String, String)) -> Result<Snapshot, StoreError> {
    Ok(Snapshot {
        id,
        description,
        artifact_path,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl PatchStore for SqliteStore {
    async fn insert_patch(&self, record: &PatchRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn("insert_patch", move |conn| {
            let tx = conn.transaction()?;
            let id = record.id.to_string();
            tx.execute(
                &format!(
                    "INSERT INTO patches ({PATCH_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    id,
                    record.author,
                    record.target_path,
                    record.content,
                    record.content_hash.to_string(),
                    record.status.as_str(),
                    record.approve_token,
                    timestamp(record.created_at),
                    record.applied_at.map(timestamp),
                    record.task_id,
                    record.job_id,
                    record.previous_version_id,
                    record.idempotency_key.to_string(),
                    record.base_hash.map(|h| h.to_string()),
                ],
            )?;
            let payload = serde_json::json!({
                "author": record.author,
                "target_path": record.target_path,
                "sha256": record.content_hash,
                "task_id": record.task_id,
                "job_id": record.job_id,
            });
            insert_event(&tx, &id, EventType::Created, &payload, record.created_at)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_patch(&self, id: PatchId) -> Result<Option<PatchRecord>, StoreError> {
        self.with_conn("get_patch", move |conn| load_patch(conn, &id.to_string()))
            .await
    }

    async fn list_patches(
        &self,
        status: Option<PatchStatus>,
        limit: usize,
    ) -> Result<Vec<PatchRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn("list_patches", move |conn| {
            let sql = format!(
                "SELECT {PATCH_COLUMNS} FROM patches \
                 WHERE (?1 IS NULL OR status = ?1) \
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![status.map(PatchStatus::as_str), limit], RawPatch::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(PatchRecord::try_from).collect()
        })
        .await
    }

    async fn transition(
        &self,
        id: PatchId,
        from: PatchStatus,
        to: PatchStatus,
        event: EventType,
        payload: serde_json::Value,
    ) -> Result<PatchRecord, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        self.with_conn("transition", move |conn| {
            let key = id.to_string();
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row("SELECT status FROM patches WHERE id = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            let current = match current {
                Some(raw) => parse_status(&raw)?,
                None => return Err(StoreError::NotFound(id)),
            };
            if current != from {
                return Err(StoreError::Conflict {
                    id,
                    expected: from,
                    actual: current,
                });
            }
            let now = Utc::now();
            let applied_at = (to == PatchStatus::Success).then(|| timestamp(now));
            tx.execute(
                "UPDATE patches SET status = ?1, applied_at = COALESCE(?2, applied_at) \
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), applied_at, key, from.as_str()],
            )?;
            insert_event(&tx, &key, event, &payload, now)?;
            let record = load_patch(&tx, &key)?.ok_or(StoreError::NotFound(id))?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn set_previous_version(&self, id: PatchId, version_id: i64) -> Result<(), StoreError> {
        self.with_conn("set_previous_version", move |conn| {
            let changed = conn.execute(
                "UPDATE patches SET previous_version_id = ?1 WHERE id = ?2",
                params![version_id, id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn events(&self, id: PatchId) -> Result<Vec<PatchEvent>, StoreError> {
        self.with_conn("events", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, payload, created_at FROM patch_events \
                 WHERE patch_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![id.to_string()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(event_id, event_type, payload, created_at)| {
                    Ok(PatchEvent {
                        id: event_id,
                        patch_id: id,
                        event_type: event_type.parse().map_err(StoreError::Corrupt)?,
                        payload: serde_json::from_str(&payload)?,
                        created_at: parse_time(&created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn insert_code_version(
        &self,
        file_path: &str,
        content: &[u8],
        patch_id: Option<PatchId>,
    ) -> Result<i64, StoreError> {
        let file_path = file_path.to_string();
        let content = content.to_vec();
        self.with_conn("insert_code_version", move |conn| {
            let hash = ContentHash::compute(&content);
            conn.execute(
                "INSERT INTO code_versions (file_path, content, content_hash, patch_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    file_path,
                    content,
                    hash.to_string(),
                    patch_id.map(|p| p.to_string()),
                    timestamp(Utc::now()),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn code_version(&self, version_id: i64) -> Result<Option<CodeVersion>, StoreError> {
        self.with_conn("code_version", move |conn| {
            conn.query_row(
                "SELECT version_id, file_path, content, content_hash, patch_id, created_at \
                 FROM code_versions WHERE version_id = ?1",
                params![version_id],
                version_from_row,
            )
            .optional()?
            .map(build_version)
            .transpose()
        })
        .await
    }

    async fn code_versions_for(&self, file_path: &str) -> Result<Vec<CodeVersion>, StoreError> {
        let file_path = file_path.to_string();
        self.with_conn("code_versions_for", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT version_id, file_path, content, content_hash, patch_id, created_at \
                 FROM code_versions WHERE file_path = ?1 ORDER BY version_id DESC",
            )?;
            let rows = stmt
                .query_map(params![file_path], version_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(build_version).collect()
        })
        .await
    }

    async fn idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let key = *key;
        self.with_conn("idempotency", move |conn| {
            let row: Option<(String, String, String)> = conn
                .query_row(
                    "SELECT status, result, created_at FROM idempotency WHERE key = ?1",
                    params![key.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            row.map(|(status, result, created_at)| {
                Ok(IdempotencyRecord {
                    key,
                    status: parse_status(&status)?,
                    result: serde_json::from_str(&result)?,
                    created_at: parse_time(&created_at)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn record_idempotency(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        let record = record.clone();
        self.with_conn("record_idempotency", move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO idempotency (key, status, result, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.key.to_string(),
                    record.status.as_str(),
                    serde_json::to_string(&record.result)?,
                    timestamp(record.created_at),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn insert_snapshot(
        &self,
        description: &str,
        artifact_path: &str,
    ) -> Result<i64, StoreError> {
        let description = description.to_string();
        let artifact_path = artifact_path.to_string();
        self.with_conn("insert_snapshot", move |conn| {
            conn.execute(
                "INSERT INTO snapshots (description, artifact_path, created_at) VALUES (?1, ?2, ?3)",
                params![description, artifact_path, timestamp(Utc::now())],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn snapshot(&self, id: i64) -> Result<Option<Snapshot>, StoreError> {
        self.with_conn("snapshot", move |conn| {
            conn.query_row(
                "SELECT id, description, artifact_path, created_at FROM snapshots WHERE id = ?1",
                params![id],
                snapshot_from_row,
            )
            .optional()?
            .map(build_snapshot)
            .transpose()
        })
        .await
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, StoreError> {
        self.with_conn("list_snapshots", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, description, artifact_path, created_at FROM snapshots ORDER BY id DESC",
            )?;
            let rows = stmt
                .query_map([], snapshot_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(build_snapshot).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(path: &str, content: &str) -> PatchRecord {
        PatchRecord::new(
            "tester",
            path,
            content,
            IdempotencyKey::derive(path, content, "task"),
        )
    }

    #[tokio::test]
    async fn insert_get_and_created_event() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = record("a.py", "x = 1\n").with_task_id(Some("T-1".into()));
        store.insert_patch(&rec).await.unwrap();

        let loaded = store.get_patch(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, rec.id);
        assert_eq!(loaded.content_hash, rec.content_hash);
        assert_eq!(loaded.task_id.as_deref(), Some("T-1"));
        assert_eq!(loaded.status, PatchStatus::Submitted);

        let events = store.events(rec.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Created);
        assert_eq!(events[0].payload["task_id"], "T-1");
    }

    #[tokio::test]
    async fn missing_patch_is_none() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.get_patch(PatchId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = record("a.py", "x = 1\n");
        store.insert_patch(&rec).await.unwrap();

        let moved = store
            .transition(rec.id, PatchStatus::Submitted, PatchStatus::Validated, EventType::Validated, json!({}))
            .await
            .unwrap();
        assert_eq!(moved.status, PatchStatus::Validated);

        let stale = store
            .transition(rec.id, PatchStatus::Submitted, PatchStatus::Validated, EventType::Validated, json!({}))
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::Conflict {
                actual: PatchStatus::Validated,
                ..
            })
        ));
        // Lost CAS appends nothing.
        assert_eq!(store.events(rec.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn illegal_edge_is_refused() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = record("a.py", "x = 1\n");
        store.insert_patch(&rec).await.unwrap();
        let result = store
            .transition(rec.id, PatchStatus::Submitted, PatchStatus::Success, EventType::ApplyFinished, json!({}))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn success_sets_applied_at() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = record("a.py", "x = 1\n");
        store.insert_patch(&rec).await.unwrap();
        let path = [
            (PatchStatus::Submitted, PatchStatus::Validated),
            (PatchStatus::Validated, PatchStatus::Approved),
            (PatchStatus::Approved, PatchStatus::Applying),
            (PatchStatus::Applying, PatchStatus::Success),
        ];
        let mut last = None;
        for (from, to) in path {
            last = Some(
                store
                    .transition(rec.id, from, to, EventType::for_status(to), json!({}))
                    .await
                    .unwrap(),
            );
        }
        assert!(last.unwrap().applied_at.is_some());
        let kinds: Vec<_> = store
            .events(rec.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventType::Created,
                EventType::Validated,
                EventType::ReviewApproved,
                EventType::ApplyStarted,
                EventType::ApplyFinished,
            ]
        );
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = SqliteStore::in_memory().unwrap();
        let a = record("a.py", "a = 1\n");
        let b = record("b.py", "b = 1\n");
        store.insert_patch(&a).await.unwrap();
        store.insert_patch(&b).await.unwrap();
        store
            .transition(b.id, PatchStatus::Submitted, PatchStatus::Rejected, EventType::ReviewRejected, json!({}))
            .await
            .unwrap();

        assert_eq!(store.list_patches(None, 10).await.unwrap().len(), 2);
        let rejected = store.list_patches(Some(PatchStatus::Rejected), 10).await.unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].id, b.id);
        assert_eq!(store.list_patches(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idempotency_first_writer_wins() {
        let store = SqliteStore::in_memory().unwrap();
        let key = IdempotencyKey::derive("a.py", "x", "t");
        let first = IdempotencyRecord {
            key,
            status: PatchStatus::Success,
            result: json!({"n": 1}),
            created_at: Utc::now(),
        };
        let second = IdempotencyRecord {
            status: PatchStatus::RolledBack,
            result: json!({"n": 2}),
            ..first.clone()
        };
        assert!(store.record_idempotency(&first).await.unwrap());
        assert!(!store.record_idempotency(&second).await.unwrap());
        let stored = store.idempotency(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, PatchStatus::Success);
        assert_eq!(stored.result, json!({"n": 1}));
    }

    #[tokio::test]
    async fn code_versions_keep_bytes() {
        let store = SqliteStore::in_memory().unwrap();
        let v1 = store.insert_code_version("a.py", b"one\xff", None).await.unwrap();
        let v2 = store.insert_code_version("a.py", b"two", None).await.unwrap();
        assert!(v2 > v1);
        let loaded = store.code_version(v1).await.unwrap().unwrap();
        assert_eq!(loaded.content, b"one\xff".to_vec());
        assert_eq!(loaded.content_hash, ContentHash::compute(b"one\xff"));
        let history: Vec<_> = store
            .code_versions_for("a.py")
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.version_id)
            .collect();
        assert_eq!(history, vec![v2, v1]);
        assert!(store.code_version(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshots_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.insert_snapshot("nightly", "/tmp/s.tar.gz").await.unwrap();
        let snap = store.snapshot(id).await.unwrap().unwrap();
        assert_eq!(snap.description, "nightly");
        assert_eq!(snap.artifact_path, "/tmp/s.tar.gz");
        assert_eq!(store.list_snapshots().await.unwrap().len(), 1);
        assert!(store.snapshot(id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("warden.db");
        let rec = record("a.py", "x = 1\n");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_patch(&rec).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_patch(rec.id).await.unwrap().is_some());
    }
}
