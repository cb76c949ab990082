//! Child-process sandbox
//!
//! Every run is bounded: the child is spawned with `kill_on_drop`, awaited
//! under a wall-clock timeout and killed when the timeout expires. Output
//! pipes are drained concurrently so a chatty child cannot deadlock on a
//! full pipe.

use crate::error::SandboxError;
use crate::request::{Program, Restrictions, SandboxOutput, SandboxRequest};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

const BLACKHOLE_PROXY: &str = "http://127.0.0.1:9";
const PROXY_VARS: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "all_proxy",
];
/// How long to wait for pipes to close after the child is gone
const DRAIN_GRACE: Duration = Duration::from_secs(1);
const SCRATCH_FILE: &str = "candidate.py";

/// Executes programs under a timeout with restricted environment.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one request to completion or timeout.
    ///
    /// # Errors
    /// Returns [`SandboxError`] only when the sandbox itself fails; a
    /// program that exits non-zero or times out is a successful run with
    /// that outcome recorded in [`SandboxOutput`].
    async fn run(&self, request: SandboxRequest) -> Result<SandboxOutput, SandboxError>;
}

/// Runs programs with an external interpreter (`python3 -I` by default)
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    interpreter: PathBuf,
    interpreter_args: Vec<String>,
    inline_flag: String,
    max_output_bytes: usize,
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new("python3")
    }
}

impl ProcessSandbox {
    /// Sandbox for the given interpreter, with Python isolated-mode flags
    #[must_use]
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args: vec!["-I".to_string()],
            inline_flag: "-c".to_string(),
            max_output_bytes: 1024 * 1024,
        }
    }

    /// Arguments placed before the program (replaces the defaults)
    #[inline]
    #[must_use]
    pub fn with_interpreter_args(mut self, args: Vec<String>) -> Self {
        self.interpreter_args = args;
        self
    }

    /// Flag that makes the interpreter run an inline script
    #[inline]
    #[must_use]
    pub fn with_inline_flag(mut self, flag: impl Into<String>) -> Self {
        self.inline_flag = flag.into();
        self
    }

    /// Per-stream cap on captured output
    #[inline]
    #[must_use]
    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Interpreter in use
    #[inline]
    #[must_use]
    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    fn command(&self, request: &SandboxRequest, program: &Path, default_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.interpreter_args);
        if let Some(harness) = &request.harness {
            cmd.arg(&self.inline_flag).arg(harness);
        }
        cmd.arg(program).args(&request.args);
        apply_restrictions(&mut cmd, &request.restrictions);
        cmd.current_dir(request.restrictions.working_dir.as_deref().unwrap_or(default_dir));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn apply_restrictions(cmd: &mut Command, restrictions: &Restrictions) {
    if restrictions.clear_env {
        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
    }
    if restrictions.deny_network {
        cmd.env("NO_NET", "1");
        for var in PROXY_VARS {
            cmd.env(var, BLACKHOLE_PROXY);
        }
        cmd.env("NO_PROXY", "").env("no_proxy", "");
    }
    for (key, value) in &restrictions.extra_env {
        cmd.env(key, value);
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxOutput, SandboxError> {
        // The scratch dir must outlive the child.
        let (program, default_dir, _scratch) = match &request.program {
            Program::File(path) => {
                let dir = path
                    .parent()
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
                (path.clone(), dir, None)
            }
            Program::Source(code) => {
                let dir = tempfile::tempdir().map_err(SandboxError::Prepare)?;
                let path = dir.path().join(SCRATCH_FILE);
                tokio::fs::write(&path, code)
                    .await
                    .map_err(SandboxError::Prepare)?;
                (path, dir.path().to_path_buf(), Some(dir))
            }
        };

        let mut cmd = self.command(&request, &program, &default_dir);
        tracing::debug!(
            stage = request.stage.as_str(),
            interpreter = %self.interpreter.display(),
            program = %program.display(),
            timeout_ms = request.timeout.as_millis() as u64,
            "spawning sandboxed process"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: self.interpreter.clone(),
            source,
        })?;
        let stdout_task = drain(&mut child, Stream::Stdout, self.max_output_bytes);
        let stderr_task = drain(&mut child, Stream::Stderr, self.max_output_bytes);

        let (exit_code, timed_out) = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => return Err(SandboxError::Wait(e)),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(stage = request.stage.as_str(), error = %e, "failed to kill timed-out process");
                }
                (None, true)
            }
        };
        let duration = started.elapsed();

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        tracing::debug!(
            stage = request.stage.as_str(),
            ?exit_code,
            timed_out,
            duration_ms = duration.as_millis() as u64,
            "sandboxed process finished"
        );

        Ok(SandboxOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration,
        })
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type DrainTask = Option<tokio::task::JoinHandle<Vec<u8>>>;

fn drain(child: &mut Child, stream: Stream, limit: usize) -> DrainTask {
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);
    match stream {
        Stream::Stdout => child.stdout.take().map(|pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.take(limit).read_to_end(&mut buf).await;
                buf
            })
        }),
        Stream::Stderr => child.stderr.take().map(|pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.take(limit).read_to_end(&mut buf).await;
                buf
            })
        }),
    }
}

async fn collect(task: DrainTask) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}
