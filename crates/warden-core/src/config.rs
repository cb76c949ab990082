//! Pipeline configuration
//!
//! One immutable [`WardenConfig`] value is built at startup (from TOML or in
//! code) and handed to every component. Nothing reads process-wide state.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_curator::{CuratorPolicy, DecisionCache};

const STATE_DIR: &str = ".warden";

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Filesystem root every target must resolve inside
    pub root: PathBuf,
    /// Database, locks, artifacts and snapshots; defaults to `<root>/.warden`
    pub state_dir: Option<PathBuf>,
    /// How long to wait for a per-path lock
    pub lock_timeout_ms: u64,
    /// Sleep between lock attempts
    pub lock_poll_ms: u64,
    /// Wall-clock limit of the post-apply smoke test
    pub smoke_timeout_ms: u64,
    /// Interpreter used by the sandbox
    pub interpreter: String,
    /// File name to required top-level symbol, checked by the smoke test
    pub entry_points: BTreeMap<String, String>,
    /// Top-level paths archived by snapshots
    pub snapshot_paths: Vec<String>,
    /// Append audit events to this JSON-lines file instead of the log
    pub event_log: Option<PathBuf>,
    /// Author recorded for patches created by `deploy`
    pub default_author: String,
    /// Curator decisions kept for identical (target, code) reviews; 0 disables
    pub review_cache_entries: u64,
    pub review_cache_ttl_ms: u64,
    pub policy: CuratorPolicy,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            state_dir: None,
            lock_timeout_ms: 30_000,
            lock_poll_ms: 100,
            smoke_timeout_ms: 20_000,
            interpreter: "python3".to_string(),
            entry_points: BTreeMap::from([("app.py".to_string(), "app".to_string())]),
            snapshot_paths: vec![
                "src".to_string(),
                "config".to_string(),
                "docker-compose.yml".to_string(),
            ],
            event_log: None,
            default_author: "warden".to_string(),
            review_cache_entries: 512,
            review_cache_ttl_ms: 600_000,
            policy: CuratorPolicy::default(),
        }
    }
}

impl WardenConfig {
    /// Defaults for the given root
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    ///
    /// # Errors
    /// [`ConfigError::Parse`] on malformed TOML or mistyped values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: CuratorPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = duration_ms(timeout);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_smoke_timeout(mut self, timeout: Duration) -> Self {
        self.smoke_timeout_ms = duration_ms(timeout);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_entry_point(mut self, file_name: impl Into<String>, symbol: impl Into<String>) -> Self {
        self.entry_points.insert(file_name.into(), symbol.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log = Some(path.into());
        self
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.root.join(STATE_DIR))
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.state_dir().join("warden.db")
    }

    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir().join("artifacts")
    }

    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir().join("snapshots")
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }

    #[must_use]
    pub fn smoke_timeout(&self) -> Duration {
        Duration::from_millis(self.smoke_timeout_ms)
    }

    /// Bounded TTL cache for curator decisions, unless disabled
    #[must_use]
    pub fn decision_cache(&self) -> Option<DecisionCache> {
        (self.review_cache_entries > 0).then(|| {
            DecisionCache::with_ttl(
                self.review_cache_entries,
                Duration::from_millis(self.review_cache_ttl_ms),
            )
        })
    }

    /// Entry symbol the smoke test must find in a file of this name
    #[must_use]
    pub fn entry_symbol(&self, file_name: &str) -> Option<&str> {
        self.entry_points.get(file_name).map(String::as_str)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = WardenConfig::new("/srv/app");
        assert_eq!(config.state_dir(), PathBuf::from("/srv/app/.warden"));
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.smoke_timeout(), Duration::from_secs(20));
        assert_eq!(config.entry_symbol("app.py"), Some("app"));
        assert_eq!(config.entry_symbol("util.py"), None);
        assert!(config.decision_cache().is_some());
    }

    #[test]
    fn review_cache_can_be_disabled() {
        let config = WardenConfig::from_toml_str("review_cache_entries = 0").unwrap();
        assert!(config.decision_cache().is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = WardenConfig::from_toml_str(
            r#"
            root = "/srv/app"
            lock_timeout_ms = 500

            [entry_points]
            "main.py" = "application"

            [policy]
            max_lines = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_millis(500));
        assert_eq!(config.entry_symbol("main.py"), Some("application"));
        assert_eq!(config.entry_symbol("app.py"), None);
        assert_eq!(config.policy.max_lines, 50);
        assert_eq!(config.policy.max_complexity, 25);
        assert_eq!(config.interpreter, "python3");
    }

    #[test]
    fn explicit_state_dir_wins() {
        let config = WardenConfig::new("/srv/app").with_state_dir("/var/lib/warden");
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/warden/warden.db"));
        assert_eq!(config.locks_dir(), PathBuf::from("/var/lib/warden/locks"));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(matches!(
            WardenConfig::from_toml_str("lock_timeout_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
