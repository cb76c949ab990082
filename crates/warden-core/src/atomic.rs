//! Atomic file replacement
//!
//! Content goes to a temp file in the target's own directory, is fsynced,
//! and is renamed over the target; the directory is fsynced afterwards so
//! the rename survives a crash. Readers see the old file or the new one,
//! never a mix.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Fully written, durable temp file waiting to replace its target
#[derive(Debug)]
pub(crate) struct StagedFile {
    temp: NamedTempFile,
    target: PathBuf,
    created_dirs: Vec<PathBuf>,
}

impl StagedFile {
    /// The bytes as they landed on disk
    pub(crate) fn read_back(&self) -> io::Result<Vec<u8>> {
        fs::read(self.temp.path())
    }

    /// Directories staging had to create, deepest first
    pub(crate) fn created_dirs(&self) -> &[PathBuf] {
        &self.created_dirs
    }

    /// Rename over the target. Dropping instead discards the temp file.
    pub(crate) fn commit(self) -> io::Result<()> {
        self.temp.persist(&self.target).map_err(|e| e.error)?;
        match self.target.parent() {
            Some(dir) => sync_dir(dir),
            None => Ok(()),
        }
    }
}

/// Write `bytes` beside `target` without touching the target yet.
///
/// An existing target's permissions carry over to the replacement.
pub(crate) fn stage(target: &Path, bytes: &[u8]) -> io::Result<StagedFile> {
    let dir = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
    let created_dirs = create_parents(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    match fs::metadata(target) {
        Ok(meta) => fs::set_permissions(temp.path(), meta.permissions())?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => set_default_mode(temp.path())?,
        Err(e) => return Err(e),
    }
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    Ok(StagedFile {
        temp,
        target: target.to_path_buf(),
        created_dirs,
    })
}

/// `create_dir_all`, reporting which directories did not exist before
fn create_parents(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|d| !d.as_os_str().is_empty() && !d.exists())
        .map(Path::to_path_buf)
        .collect();
    fs::create_dir_all(dir)?;
    Ok(missing)
}

/// Remove directories listed deepest first, stopping at the first one that
/// is not empty or cannot be removed
pub(crate) fn remove_created_dirs(dirs: &[PathBuf]) -> usize {
    dirs.iter().take_while(|d| fs::remove_dir(d).is_ok()).count()
}

/// Stage and commit in one step
pub(crate) fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    stage(target, bytes)?.commit()
}

/// [`write_atomic`] on the blocking pool
pub(crate) async fn write_atomic_async(target: PathBuf, bytes: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .map_err(io::Error::other)?
}

#[cfg(unix)]
fn set_default_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
