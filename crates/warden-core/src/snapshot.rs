//! Whole-tree snapshots
//!
//! A coarse safety net, independent of per-patch versioning: selected
//! top-level paths are archived as `.tar.gz` and can be unpacked back over
//! the tree later.

use crate::error::PatchError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use warden_store::{PatchStore, Snapshot};

/// Result of [`SnapshotManager::create_snapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotCreated {
    /// 0 when no store is configured
    pub snapshot_id: i64,
    pub artifact_path: PathBuf,
    /// Included paths that existed
    pub archived: Vec<String>,
}

/// Creates and restores tree archives
#[derive(Clone)]
pub struct SnapshotManager {
    root: PathBuf,
    dir: PathBuf,
    include: Vec<String>,
    store: Option<Arc<dyn PatchStore>>,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("root", &self.root)
            .field("dir", &self.dir)
            .field("include", &self.include)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl SnapshotManager {
    /// Archive `include` (root-relative) from `root` into `dir`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, dir: impl Into<PathBuf>, include: Vec<String>) -> Self {
        Self {
            root: root.into(),
            dir: dir.into(),
            include,
            store: None,
        }
    }

    /// Record snapshots durably
    #[inline]
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn PatchStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Archive whichever included paths currently exist.
    ///
    /// # Errors
    /// [`PatchError::Io`] if the archive cannot be written,
    /// [`PatchError::Store`] if it cannot be recorded.
    pub async fn create_snapshot(&self, description: &str) -> Result<SnapshotCreated, PatchError> {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let artifact_path = self.dir.join(format!("snapshot_{stamp}.tar.gz"));

        let root = self.root.clone();
        let dir = self.dir.clone();
        let include = self.include.clone();
        let path = artifact_path.clone();
        let archived = tokio::task::spawn_blocking(move || write_archive(&root, &dir, &include, &path))
            .await
            .map_err(|e| PatchError::Internal(e.to_string()))?
            .map_err(|e| PatchError::io(&artifact_path, e))?;

        let snapshot_id = match &self.store {
            Some(store) => {
                store
                    .insert_snapshot(description, &artifact_path.to_string_lossy())
                    .await?
            }
            None => 0,
        };
        tracing::info!(
            snapshot_id,
            path = %artifact_path.display(),
            archived = ?archived,
            "snapshot created"
        );
        Ok(SnapshotCreated {
            snapshot_id,
            artifact_path,
            archived,
        })
    }

    /// Unpack snapshot `id` over the tree. Files created after the snapshot
    /// are left in place.
    ///
    /// # Errors
    /// - [`PatchError::SnapshotNotFound`] for an unknown id or without a store
    /// - [`PatchError::Io`] if the archive cannot be read or unpacked
    pub async fn restore_snapshot(&self, id: i64) -> Result<Snapshot, PatchError> {
        let store = self.store.as_ref().ok_or(PatchError::SnapshotNotFound(id))?;
        let snapshot = store
            .snapshot(id)
            .await?
            .ok_or(PatchError::SnapshotNotFound(id))?;

        let archive = PathBuf::from(&snapshot.artifact_path);
        let root = self.root.clone();
        let path = archive.clone();
        tokio::task::spawn_blocking(move || unpack_archive(&path, &root))
            .await
            .map_err(|e| PatchError::Internal(e.to_string()))?
            .map_err(|e| PatchError::io(&archive, e))?;

        tracing::info!(snapshot_id = id, path = %archive.display(), "snapshot restored");
        Ok(snapshot)
    }

    /// Recorded snapshots, newest first; empty without a store
    ///
    /// # Errors
    /// [`PatchError::Store`] on database failure.
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>, PatchError> {
        match &self.store {
            Some(store) => Ok(store.list_snapshots().await?),
            None => Ok(Vec::new()),
        }
    }
}

fn write_archive(
    root: &Path,
    dir: &Path,
    include: &[String],
    output: &Path,
) -> std::io::Result<Vec<String>> {
    std::fs::create_dir_all(dir)?;
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    let encoder = GzEncoder::new(temp.reopen()?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut archived = Vec::new();
    for name in include {
        let source = root.join(name);
        if source.is_dir() {
            builder.append_dir_all(name, &source)?;
        } else if source.is_file() {
            builder.append_path_with_name(&source, name)?;
        } else {
            continue;
        }
        archived.push(name.clone());
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()?;
    temp.persist(output).map_err(|e| e.error)?;
    Ok(archived)
}

fn unpack_archive(archive: &Path, root: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.unpack(root)
}
