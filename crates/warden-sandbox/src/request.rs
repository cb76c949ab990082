//! Sandbox request and output types

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which pipeline stage a sandbox run belongs to (for logs and artifacts)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStage {
    /// Curator bytecode-compile/load check on an isolated copy
    MicroCheck,
    /// Post-apply execution of the live target
    Smoke,
}

impl SandboxStage {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MicroCheck => "micro_check",
            Self::Smoke => "smoke",
        }
    }
}

/// What to execute
#[derive(Debug, Clone)]
pub enum Program {
    /// An existing file, executed in place
    File(PathBuf),
    /// Inline source, written to a fresh scratch directory first
    Source(String),
}

/// Process-level restrictions applied to every run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restrictions {
    /// Start from an empty environment (`PATH` is kept for interpreter lookup)
    pub clear_env: bool,
    /// Signal and enforce no network: `NO_NET=1` and unroutable proxies
    pub deny_network: bool,
    /// Working directory; defaults to the scratch dir or the program's dir
    pub working_dir: Option<PathBuf>,
    /// Additional environment variables
    pub extra_env: Vec<(String, String)>,
}

impl Default for Restrictions {
    fn default() -> Self {
        Self {
            clear_env: true,
            deny_network: true,
            working_dir: None,
            extra_env: Vec::new(),
        }
    }
}

/// One bounded execution
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub stage: SandboxStage,
    pub program: Program,
    /// Inline driver script; the program path is passed as its first argument
    pub harness: Option<String>,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub restrictions: Restrictions,
}

impl SandboxRequest {
    /// Create a request with default restrictions and no harness
    #[must_use]
    pub fn new(stage: SandboxStage, program: Program, timeout: Duration) -> Self {
        Self {
            stage,
            program,
            harness: None,
            args: Vec::new(),
            timeout,
            restrictions: Restrictions::default(),
        }
    }

    /// Drive the program through an inline harness script
    #[inline]
    #[must_use]
    pub fn with_harness(mut self, harness: impl Into<String>) -> Self {
        self.harness = Some(harness.into());
        self
    }

    /// Extra arguments after the program path
    #[inline]
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_restrictions(mut self, restrictions: Restrictions) -> Self {
        self.restrictions = restrictions;
        self
    }
}

/// Result of a sandboxed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxOutput {
    /// `None` when killed by a signal or by the timeout
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl SandboxOutput {
    /// Exited with status zero inside the time limit
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_restrictions_are_strict() {
        let r = Restrictions::default();
        assert!(r.clear_env);
        assert!(r.deny_network);
        assert!(r.working_dir.is_none());
    }

    #[test]
    fn succeeded_requires_zero_exit_and_no_timeout() {
        let mut out = SandboxOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            duration: Duration::from_millis(5),
        };
        assert!(out.succeeded());
        out.timed_out = true;
        assert!(!out.succeeded());
        out.timed_out = false;
        out.exit_code = Some(1);
        assert!(!out.succeeded());
    }

    #[test]
    fn stage_names() {
        assert_eq!(SandboxStage::MicroCheck.as_str(), "micro_check");
        assert_eq!(SandboxStage::Smoke.as_str(), "smoke");
    }
}
