//! Warden Artifact Primitives
//!
//! Leaf types shared by every other crate in the pipeline.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: 32-byte SHA-256 hash of file content
//! - [`IdempotencyKey`]: stable identifier of a logical deploy request
//! - [`ConfinedRoot`]: the filesystem root all I/O is confined to
//! - [`TargetPath`]: a path proven to live inside a [`ConfinedRoot`]
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_artifact::{ConfinedRoot, IdempotencyKey};
//!
//! let root = ConfinedRoot::new("/srv/app")?;
//! let target = root.resolve("src/app.py")?;
//! let key = IdempotencyKey::derive("src/app.py", code, "add health check");
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod hash;
mod idempotency;
mod path;

pub use hash::{ContentHash, HashError};
pub use idempotency::IdempotencyKey;
pub use path::{ConfinedRoot, PathError, TargetPath};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn key_and_path_agree_on_target() {
        let dir = tempfile::tempdir().unwrap();
        let root = ConfinedRoot::new(dir.path()).unwrap();
        let target = root.resolve("pkg/mod.py").unwrap();
        assert_eq!(target.relative(), "pkg/mod.py");

        let a = IdempotencyKey::derive(target.relative(), "x = 1\n", "task");
        let b = IdempotencyKey::derive("pkg/mod.py", "x = 1\n", "task");
        assert_eq!(a, b);
    }
}
