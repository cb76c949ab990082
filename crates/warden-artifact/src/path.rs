//! Root-confined filesystem paths
//!
//! Every path the pipeline touches is resolved through a [`ConfinedRoot`]
//! before use. Resolution is lexical first (so `..` cannot climb out through
//! a directory that does not exist yet) and then canonical on the longest
//! existing ancestor (so symlinks cannot point out of the root).

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};

/// A canonicalized directory that bounds all filesystem access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfinedRoot {
    root: PathBuf,
}

impl ConfinedRoot {
    /// Canonicalize `root` and use it as the confinement boundary.
    ///
    /// # Errors
    /// Returns [`PathError::RootUnavailable`] if the root does not exist or
    /// is not a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PathError> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|source| PathError::RootUnavailable {
                root: root.to_path_buf(),
                source,
            })?;
        if !canonical.is_dir() {
            return Err(PathError::RootUnavailable {
                root: canonical,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            });
        }
        Ok(Self { root: canonical })
    }

    /// The canonical root directory
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path to a file location inside the root.
    ///
    /// Relative paths are taken relative to the root. Absolute paths are
    /// accepted only if they land inside it.
    ///
    /// # Errors
    /// - [`PathError::Empty`] for blank input
    /// - [`PathError::Escape`] if the path resolves outside the root
    /// - [`PathError::NotAFile`] if it names the root or an existing directory
    /// - [`PathError::Io`] if an existing ancestor cannot be canonicalized
    pub fn resolve(&self, raw: &str) -> Result<TargetPath, PathError> {
        let absolute = self.confine(raw)?;
        if absolute == self.root || absolute.is_dir() {
            return Err(PathError::NotAFile(raw.trim().to_string()));
        }
        let relative = absolute
            .strip_prefix(&self.root)
            .map_err(|_| PathError::Escape(raw.trim().to_string()))?
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        Ok(TargetPath { absolute, relative })
    }

    /// Whether `raw` names any location (file or directory) inside the root.
    #[must_use]
    pub fn contains(&self, raw: &str) -> bool {
        self.confine(raw).is_ok()
    }

    fn confine(&self, raw: &str) -> Result<PathBuf, PathError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        let joined = self.root.join(trimmed);
        let lexical = normalize_lexically(&joined);
        if !lexical.starts_with(&self.root) {
            return Err(PathError::Escape(trimmed.to_string()));
        }
        let resolved = canonicalize_existing_prefix(&lexical).map_err(|source| PathError::Io {
            path: lexical.clone(),
            source,
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(PathError::Escape(trimmed.to_string()));
        }
        Ok(resolved)
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest prefix of `path` that exists, then re-attach the
/// remaining (not yet created) components.
fn canonicalize_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if existing.symlink_metadata().is_ok() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

/// A file location proven to be inside a [`ConfinedRoot`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetPath {
    absolute: PathBuf,
    relative: String,
}

impl TargetPath {
    /// Absolute, canonical location
    #[inline]
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.absolute
    }

    /// Root-relative form using `/` separators
    #[inline]
    #[must_use]
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Final path component
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.absolute.file_name().and_then(|n| n.to_str())
    }

    /// Containing directory
    #[must_use]
    pub fn parent(&self) -> Option<&Path> {
        self.absolute.parent()
    }
}

impl Display for TargetPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative)
    }
}

impl AsRef<Path> for TargetPath {
    fn as_ref(&self) -> &Path {
        &self.absolute
    }
}

/// Path resolution errors
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Blank input
    #[error("target path is empty")]
    Empty,

    /// Resolves outside the confinement root
    #[error("path escapes the configured root: {0}")]
    Escape(String),

    /// Names a directory rather than a file
    #[error("path does not name a file: {0}")]
    NotAFile(String),

    /// Filesystem error while canonicalizing
    #[error("cannot resolve {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Root directory missing or unusable
    #[error("root {root} is unavailable: {source}")]
    RootUnavailable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn root() -> (tempfile::TempDir, ConfinedRoot) {
        let dir = tempfile::tempdir().unwrap();
        let root = ConfinedRoot::new(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn resolves_relative_new_file() {
        let (_dir, root) = root();
        let target = root.resolve("src/app.py").unwrap();
        assert_eq!(target.relative(), "src/app.py");
        assert!(target.as_path().starts_with(root.path()));
        assert_eq!(target.file_name(), Some("app.py"));
    }

    #[test]
    fn dot_segments_are_normalized() {
        let (_dir, root) = root();
        let target = root.resolve("./src/../lib/./x.py").unwrap();
        assert_eq!(target.relative(), "lib/x.py");
    }

    #[test]
    fn parent_escape_is_rejected() {
        let (_dir, root) = root();
        assert!(matches!(
            root.resolve("../outside.py"),
            Err(PathError::Escape(_))
        ));
        assert!(matches!(
            root.resolve("a/../../outside.py"),
            Err(PathError::Escape(_))
        ));
    }

    #[test]
    fn absolute_outside_is_rejected() {
        let (_dir, root) = root();
        assert!(matches!(
            root.resolve("/etc/passwd"),
            Err(PathError::Escape(_))
        ));
    }

    #[test]
    fn absolute_inside_is_accepted() {
        let (_dir, root) = root();
        let raw = root.path().join("m.py");
        let target = root.resolve(raw.to_str().unwrap()).unwrap();
        assert_eq!(target.relative(), "m.py");
    }

    #[test]
    fn empty_and_directory_are_rejected() {
        let (dir, root) = root();
        std::fs::create_dir(dir.path().join("pkg")).unwrap();
        assert!(matches!(root.resolve("   "), Err(PathError::Empty)));
        assert!(matches!(root.resolve("pkg"), Err(PathError::NotAFile(_))));
        assert!(matches!(root.resolve("."), Err(PathError::NotAFile(_))));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let (dir, root) = root();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        assert!(matches!(
            root.resolve("link/evil.py"),
            Err(PathError::Escape(_))
        ));
    }

    #[test]
    fn contains_accepts_directories() {
        let (dir, root) = root();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        assert!(root.contains("data"));
        assert!(root.contains("data/file.txt"));
        assert!(!root.contains("/tmp/../etc/hosts"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            ConfinedRoot::new(missing),
            Err(PathError::RootUnavailable { .. })
        ));
    }

    proptest! {
        #[test]
        fn resolved_paths_never_leave_root(segments in proptest::collection::vec("(\\.\\.|\\.|[a-z]{1,4})", 1..8)) {
            let (_dir, root) = root();
            let raw = segments.join("/");
            if let Ok(target) = root.resolve(&raw) {
                prop_assert!(target.as_path().starts_with(root.path()));
            }
        }
    }
}
