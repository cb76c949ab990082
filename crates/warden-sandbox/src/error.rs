//! Sandbox errors

use std::path::PathBuf;
use thiserror::Error;

/// Failures of the sandbox itself, as opposed to failures of the program
/// running inside it (those are reported through exit codes).
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Scratch directory or program file could not be prepared
    #[error("failed to prepare sandbox program: {0}")]
    Prepare(#[source] std::io::Error),

    /// Interpreter could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child failed
    #[error("failed to wait on sandboxed process: {0}")]
    Wait(#[source] std::io::Error),
}
