//! Persistent storage for captured sandbox output

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Locations of persisted smoke output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmokeArtifacts {
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Writes captured output under `<dir>/<job>/<timestamp>/<stage>/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Base directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist stdout and stderr of one run.
    ///
    /// Runs without a job id are filed under `adhoc`.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the directory or files cannot be
    /// written.
    pub async fn persist(
        &self,
        job_id: Option<&str>,
        stage: &str,
        stdout: &str,
        stderr: &str,
    ) -> std::io::Result<SmokeArtifacts> {
        let job = job_id.map_or_else(|| "adhoc".to_string(), sanitize);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let dir = self.dir.join(job).join(stamp).join(stage);
        tokio::fs::create_dir_all(&dir).await?;

        let stdout_path = dir.join("stdout.log");
        let stderr_path = dir.join("stderr.log");
        tokio::fs::write(&stdout_path, stdout).await?;
        tokio::fs::write(&stderr_path, stderr).await?;
        Ok(SmokeArtifacts {
            stdout_path,
            stderr_path,
        })
    }
}

/// Job ids come from callers; keep them to one safe path segment.
fn sanitize(job_id: &str) -> String {
    let cleaned: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "adhoc".to_string(),
        s => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_one_segment() {
        assert_eq!(sanitize("job-42"), "job-42");
        assert_eq!(sanitize("../../etc"), "_.._etc");
        assert_eq!(sanitize(".."), "adhoc");
        assert_eq!(sanitize("a/b c"), "a_b_c");
    }

    #[tokio::test]
    async fn persist_writes_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifacts = store
            .persist(Some("job-1"), "smoke", "out", "err")
            .await
            .unwrap();
        assert!(artifacts.stdout_path.starts_with(dir.path().join("job-1")));
        assert!(artifacts.stdout_path.ends_with("smoke/stdout.log"));
        assert_eq!(std::fs::read_to_string(&artifacts.stdout_path).unwrap(), "out");
        assert_eq!(std::fs::read_to_string(&artifacts.stderr_path).unwrap(), "err");
    }

    #[tokio::test]
    async fn persist_without_job_uses_adhoc() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifacts = store.persist(None, "smoke", "", "").await.unwrap();
        assert!(artifacts.stderr_path.starts_with(dir.path().join("adhoc")));
    }
}
