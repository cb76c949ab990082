//! External audit event sinks
//!
//! The pipeline mirrors every lifecycle transition to an [`EventSink`].
//! Delivery is fire-and-forget: [`emit`] logs failures locally and never
//! propagates them.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use warden_artifact::ContentHash;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hash chain broken at the given 1-based line
    #[error("event log integrity violation at line {0}")]
    IntegrityViolation(usize),
}

/// Structured audit logger
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log(
        &self,
        source: &str,
        event_type: &str,
        job_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError>;
}

/// Deliver one event, swallowing and logging any failure.
pub async fn emit(
    sink: &dyn EventSink,
    source: &str,
    event_type: &str,
    job_id: Option<&str>,
    payload: serde_json::Value,
) {
    if let Err(e) = sink.log(source, event_type, job_id, &payload).await {
        tracing::warn!(source, event_type, error = %e, "event sink delivery failed");
    }
}

/// Writes events as structured `tracing` records
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn log(
        &self,
        source: &str,
        event_type: &str,
        job_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError> {
        tracing::info!(
            source,
            event_type,
            job_id = job_id.unwrap_or(""),
            payload = %payload,
            "audit event"
        );
        Ok(())
    }
}

/// One line of a [`JsonlEventSink`] file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub timestamp: String,
    pub source: String,
    pub event_type: String,
    pub job_id: Option<String>,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

impl SinkRecord {
    fn compute_hash(&self) -> Result<String, SinkError> {
        let payload = serde_json::to_vec(&self.payload)?;
        Ok(ContentHash::compute_fields(
            "warden.sink.v1",
            &[
                self.prev_hash.as_bytes(),
                self.timestamp.as_bytes(),
                self.source.as_bytes(),
                self.event_type.as_bytes(),
                self.job_id.as_deref().unwrap_or("").as_bytes(),
                &payload,
            ],
        )
        .to_string())
    }
}

fn genesis() -> String {
    "0".repeat(64)
}

/// Append-only JSON-lines file with a SHA-256 hash chain
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    last_hash: Mutex<String>,
}

impl JsonlEventSink {
    /// Open `path`, resuming the hash chain from its last line.
    ///
    /// # Errors
    /// Returns [`SinkError::Io`] if an existing file cannot be read, or a
    /// serialization error if its last line is not a valid record.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let last_hash = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match text.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(line) => serde_json::from_str::<SinkRecord>(line)?.hash,
                None => genesis(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => genesis(),
            Err(source) => return Err(SinkError::Io { path, source }),
        };
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the hash chain of a sink file; returns the number of records.
    ///
    /// # Errors
    /// [`SinkError::IntegrityViolation`] at the first broken link.
    pub async fn verify(path: impl AsRef<Path>) -> Result<usize, SinkError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SinkError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut prev = genesis();
        let mut count = 0;
        for (index, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            let record: SinkRecord = serde_json::from_str(line)?;
            if record.prev_hash != prev || record.compute_hash()? != record.hash {
                return Err(SinkError::IntegrityViolation(index + 1));
            }
            prev = record.hash;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn log(
        &self,
        source: &str,
        event_type: &str,
        job_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError> {
        let mut last = self.last_hash.lock().await;
        let mut record = SinkRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            source: source.to_string(),
            event_type: event_type.to_string(),
            job_id: job_id.map(str::to_string),
            payload: payload.clone(),
            prev_hash: last.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash()?;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let io_err = |source| SinkError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        *last = record.hash;
        Ok(())
    }
}
