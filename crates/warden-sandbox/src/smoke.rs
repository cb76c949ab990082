//! Post-apply runtime smoke test

use crate::artifacts::{ArtifactStore, SmokeArtifacts};
use crate::process::Sandbox;
use crate::request::{Program, Restrictions, SandboxRequest, SandboxStage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Exit code the harness uses for a missing entry symbol
const MISSING_SYMBOL_EXIT: i32 = 3;

/// Loads the target in a throwaway namespace and optionally checks that a
/// named top-level object exists. `argv[1]` is the target, `argv[2]` the
/// symbol.
pub const PYTHON_SMOKE_HARNESS: &str = r#"import os, runpy, sys
target = sys.argv[1]
sys.path.insert(0, os.path.dirname(os.path.abspath(target)))
ns = runpy.run_path(target, run_name="__smoke__")
symbol = sys.argv[2] if len(sys.argv) > 2 else ""
if symbol and symbol not in ns:
    sys.stderr.write("missing entry symbol: %s\n" % symbol)
    sys.exit(3)
"#;

/// Outcome of one smoke run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmokeReport {
    pub passed: bool,
    pub message: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// `None` when no store is configured or persisting failed
    pub artifacts: Option<SmokeArtifacts>,
}

/// Executes a live target under the sandbox and judges the result.
#[derive(Clone)]
pub struct RuntimeSmokeTester {
    sandbox: Arc<dyn Sandbox>,
    timeout: Duration,
    harness: Option<String>,
    artifacts: Option<ArtifactStore>,
    working_dir: Option<PathBuf>,
    stderr_excerpt: usize,
}

impl std::fmt::Debug for RuntimeSmokeTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSmokeTester")
            .field("timeout", &self.timeout)
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

impl RuntimeSmokeTester {
    /// Tester using the Python harness and a 20 second limit
    #[must_use]
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            timeout: Duration::from_secs(20),
            harness: Some(PYTHON_SMOKE_HARNESS.to_string()),
            artifacts: None,
            working_dir: None,
            stderr_excerpt: 300,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the harness; `None` executes the target directly
    #[inline]
    #[must_use]
    pub fn with_harness(mut self, harness: Option<String>) -> Self {
        self.harness = harness;
        self
    }

    /// Persist captured output into this store
    #[inline]
    #[must_use]
    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Run from this directory instead of the target's own
    #[inline]
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run `target`, optionally asserting `expected_symbol` is defined.
    ///
    /// Never fails: sandbox errors become a failed report.
    pub async fn run(
        &self,
        target: &Path,
        expected_symbol: Option<&str>,
        job_id: Option<&str>,
    ) -> SmokeReport {
        let mut request = SandboxRequest::new(
            SandboxStage::Smoke,
            Program::File(target.to_path_buf()),
            self.timeout,
        )
        .with_restrictions(Restrictions {
            working_dir: self.working_dir.clone(),
            ..Restrictions::default()
        });
        if let Some(harness) = &self.harness {
            request = request.with_harness(harness.clone());
        }
        if let Some(symbol) = expected_symbol {
            request = request.with_args(vec![symbol.to_string()]);
        }

        let output = match self.sandbox.run(request).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(path = %target.display(), error = %e, "smoke sandbox failed");
                return SmokeReport {
                    passed: false,
                    message: format!("smoke test could not run: {e}"),
                    exit_code: None,
                    timed_out: false,
                    artifacts: None,
                };
            }
        };

        let artifacts = match &self.artifacts {
            Some(store) => match store
                .persist(job_id, SandboxStage::Smoke.as_str(), &output.stdout, &output.stderr)
                .await
            {
                Ok(paths) => Some(paths),
                Err(e) => {
                    tracing::warn!(
                        path = %target.display(),
                        dir = %store.dir().display(),
                        error = %e,
                        "failed to persist smoke artifacts"
                    );
                    None
                }
            },
            None => None,
        };

        let message = if output.timed_out {
            format!(
                "smoke test timed out after {}s and was killed",
                self.timeout.as_secs_f32()
            )
        } else if output.succeeded() {
            "smoke test passed".to_string()
        } else {
            let excerpt = truncate(output.stderr.trim(), self.stderr_excerpt);
            match (output.exit_code, expected_symbol) {
                (Some(MISSING_SYMBOL_EXIT), Some(symbol)) if self.harness.is_some() => {
                    format!("entry symbol `{symbol}` not defined: {excerpt}")
                }
                (Some(code), _) => format!("smoke test exited with code {code}: {excerpt}"),
                (None, _) => format!("smoke test terminated by signal: {excerpt}"),
            }
        };

        SmokeReport {
            passed: output.succeeded(),
            message,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            artifacts,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
