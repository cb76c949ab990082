//! Warden Core
//!
//! A self-deploying patch pipeline: candidate Python files are reviewed by
//! the curator, written under a per-path lock with an atomic rename,
//! smoke-tested in place and rolled back byte-for-byte on any failure.
//!
//! # Core Concepts
//!
//! - [`PatchPipeline`]: the operator surface (deploy, submit, apply, revert, snapshots)
//! - [`PathLocks`]: cross-process advisory lock per target path
//! - [`PatchApplier`]: backup, stage, commit, smoke, restore
//! - [`VersionStore`]: every prior file content, addressable by id
//! - [`SnapshotManager`]: whole-tree `.tar.gz` archives
//! - [`WardenConfig`]: TOML configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_core::prelude::*;
//!
//! let pipeline = PatchPipeline::open(&WardenConfig::load("warden.toml")?).await?;
//! let outcome = pipeline
//!     .deploy(DeployRequest::new("src/app.py", code, "add health route"))
//!     .await?;
//! assert!(outcome.succeeded() || !outcome.reasons.is_empty());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod applier;
mod atomic;
pub mod config;
pub mod error;
mod journal;
pub mod lock;
pub mod pipeline;
pub mod snapshot;
pub mod versions;

pub use applier::{ApplyReport, ApplyStage, PatchApplier};
pub use config::WardenConfig;
pub use error::{ConfigError, PatchError};
pub use lock::{PathLockGuard, PathLocks};
pub use pipeline::{
    ApplyPatchOutcome, ApplyPatchResponse, DeployRequest, PatchDetails, PatchOutcome,
    PatchPipeline, RevertOutcome, SubmitOutcome, SubmitRequest,
};
pub use snapshot::{SnapshotCreated, SnapshotManager};
pub use versions::VersionStore;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the pipeline
    pub use crate::config::WardenConfig;
    pub use crate::error::PatchError;
    pub use crate::pipeline::{DeployRequest, PatchOutcome, PatchPipeline, SubmitRequest};
    pub use warden_store::{PatchId, PatchStatus};
}
