//! Curator policy configuration
//!
//! An explicit, immutable value handed to [`CuratorGate`](crate::CuratorGate)
//! at construction. Two gates built from equal policies judge identical code
//! identically.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds and deny-lists applied by the curator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorPolicy {
    /// Maximum number of source lines
    pub max_lines: usize,
    /// Maximum size in bytes
    pub max_bytes: usize,
    /// Maximum cyclomatic complexity estimate for the whole file
    pub max_complexity: u32,
    /// Modules that may not be imported (a prefix match on dotted names)
    pub banned_imports: Vec<String>,
    /// Fully-qualified call names that are always rejected
    pub banned_calls: Vec<String>,
    /// File-opening calls allowed only with a literal in-root path
    pub guarded_open_calls: Vec<String>,
    /// Regular expressions matched against the raw source
    pub secret_patterns: Vec<String>,
    /// Wall-clock limit for the micro check, in milliseconds
    pub sandbox_timeout_ms: u64,
    /// Whether the `httpx` client library may be imported
    pub allow_httpx: bool,
}

impl Default for CuratorPolicy {
    fn default() -> Self {
        Self {
            max_lines: 2000,
            max_bytes: 300_000,
            max_complexity: 25,
            banned_imports: to_strings(&[
                "subprocess",
                "shutil",
                "socket",
                "ftplib",
                "telnetlib",
                "paramiko",
                "asyncssh",
                "fabric",
                "multiprocessing",
                "pickle",
            ]),
            banned_calls: to_strings(&[
                "eval",
                "exec",
                "compile",
                "__import__",
                "os.system",
                "subprocess.Popen",
                "subprocess.run",
                "subprocess.call",
                "subprocess.check_call",
                "subprocess.check_output",
                "shutil.rmtree",
            ]),
            guarded_open_calls: to_strings(&["open", "io.open", "os.open"]),
            secret_patterns: to_strings(&[
                r#"(?i)(api[_-]?key|secret|token|password)\s*[:=]\s*['"][A-Za-z0-9_\-]{16,}['"]"#,
                r"(?i)sk-[A-Za-z0-9]{20,}",
            ]),
            sandbox_timeout_ms: 5_000,
            allow_httpx: true,
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl CuratorPolicy {
    /// Micro check time limit
    #[inline]
    #[must_use]
    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_timeout_ms)
    }

    /// Set maximum line count
    #[inline]
    #[must_use]
    pub fn with_max_lines(mut self, max: usize) -> Self {
        self.max_lines = max;
        self
    }

    /// Set maximum byte size
    #[inline]
    #[must_use]
    pub fn with_max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = max;
        self
    }

    /// Set maximum complexity
    #[inline]
    #[must_use]
    pub fn with_max_complexity(mut self, max: u32) -> Self {
        self.max_complexity = max;
        self
    }

    /// Set micro check timeout
    #[inline]
    #[must_use]
    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Add a banned import
    #[must_use]
    pub fn with_banned_import(mut self, module: impl Into<String>) -> Self {
        self.banned_imports.push(module.into());
        self
    }

    /// Allow or forbid `httpx`
    #[inline]
    #[must_use]
    pub fn with_allow_httpx(mut self, allow: bool) -> Self {
        self.allow_httpx = allow;
        self
    }

    /// Whether importing `module` is forbidden.
    ///
    /// `os.path` is banned by `os`, but `osmosis` is not.
    #[must_use]
    pub fn is_banned_import(&self, module: &str) -> bool {
        let matches = |banned: &str| {
            module == banned
                || module
                    .strip_prefix(banned)
                    .is_some_and(|rest| rest.starts_with('.'))
        };
        self.banned_imports.iter().any(|b| matches(b)) || (!self.allow_httpx && matches("httpx"))
    }

    /// Whether `call` is on the deny-list
    #[must_use]
    pub fn is_banned_call(&self, call: &str) -> bool {
        self.banned_calls.iter().any(|b| b == call)
    }

    /// Whether `call` opens files and needs its path argument checked
    #[must_use]
    pub fn is_guarded_open(&self, call: &str) -> bool {
        self.guarded_open_calls.iter().any(|b| b == call)
    }
}
