//! Warden Sandbox
//!
//! One execution abstraction shared by the curator's micro check and the
//! post-apply smoke test: run an interpreter over a program with a hard
//! wall-clock limit, a scrubbed environment and captured output.
//!
//! # Core Concepts
//!
//! - [`Sandbox`]: async trait, `(program, timeout, restrictions) -> output`
//! - [`ProcessSandbox`]: child-process implementation on `tokio::process`
//! - [`RuntimeSmokeTester`]: runs a live target and reports [`SmokeReport`]
//! - [`ArtifactStore`]: persists captured output keyed by job id

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod artifacts;
mod error;
mod process;
mod request;
mod smoke;

pub use artifacts::{ArtifactStore, SmokeArtifacts};
pub use error::SandboxError;
pub use process::{ProcessSandbox, Sandbox};
pub use request::{Program, Restrictions, SandboxOutput, SandboxRequest, SandboxStage};
pub use smoke::{RuntimeSmokeTester, SmokeReport, PYTHON_SMOKE_HARNESS};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
