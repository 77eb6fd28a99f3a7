//! Session configuration.
//!
//! Loaded from `~/.config/kaisha/session.ron` (RON). Missing fields take
//! their defaults; a missing or broken file falls back to
//! `SessionConfig::default()` with a log line.
//!
//! Example session.ron:
//! ```ron
//! (
//!     conflict_policy: reject,
//!     event_capacity: 512,
//!     round_trip_timeout_ms: Some(5000),
//! )
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use kaisha_cache::ConflictPolicy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_COMMAND_CAPACITY, DEFAULT_EVENT_CAPACITY,
    MAX_ROUND_TRIP_TIMEOUT,
};

/// Errors reading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// What to do with a second mutation on a company that has one in flight.
    pub conflict_policy: ConflictPolicy,
    /// Session events buffered per subscriber.
    pub event_capacity: usize,
    /// Commands buffered from handles.
    pub command_capacity: usize,
    /// Fetch the collection as soon as the session starts.
    pub fetch_on_start: bool,
    /// Fail a round trip that takes longer than this. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            fetch_on_start: true,
            round_trip_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_fetch_on_start(mut self, fetch: bool) -> Self {
        self.fetch_on_start = fetch;
        self
    }

    pub fn with_round_trip_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Configured timeout, clamped to [`MAX_ROUND_TRIP_TIMEOUT`].
    pub fn round_trip_timeout(&self) -> Option<Duration> {
        self.round_trip_timeout_ms
            .map(|ms| Duration::from_millis(ms).min(MAX_ROUND_TRIP_TIMEOUT))
    }

    /// Channel sizes must be non-zero for tokio.
    pub(crate) fn event_capacity(&self) -> usize {
        self.event_capacity.max(1)
    }

    pub(crate) fn command_capacity(&self) -> usize {
        self.command_capacity.max(1)
    }

    /// `~/.config/kaisha/session.ron`.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Parse a config file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(content)?)
    }

    /// Load the user's config, falling back to defaults on any error.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            info!("No config directory available, using default session config");
            return Self::default();
        };
        Self::load_or_default(&path)
    }

    /// Load `path`, falling back to defaults if it's missing or broken.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("Session config not found at {:?}, using defaults", path);
            return Self::default();
        }
        match Self::load_from(path) {
            Ok(config) => {
                info!("Loaded session config from {:?}", path);
                config
            }
            Err(e) => {
                warn!("Failed to load session config from {:?}: {}", path, e);
                warn!("Falling back to default session config");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config = SessionConfig::parse("(conflict_policy: reject, round_trip_timeout_ms: Some(250))").unwrap();
        assert_eq!(config.conflict_policy, ConflictPolicy::Reject);
        assert_eq!(config.round_trip_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert!(config.fetch_on_start);
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(SessionConfig::parse("()").unwrap(), SessionConfig::default());
    }

    #[test]
    fn test_broken_config_is_error() {
        assert!(matches!(SessionConfig::parse("(conflict_policy: "), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = SessionConfig::load_or_default(Path::new("/nonexistent/kaisha/session.ron"));
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_timeout_is_clamped() {
        let config = SessionConfig::default().with_round_trip_timeout(Duration::from_secs(3600));
        assert_eq!(config.round_trip_timeout(), Some(MAX_ROUND_TRIP_TIMEOUT));
    }

    #[test]
    fn test_zero_capacities_are_bumped() {
        let config = SessionConfig { event_capacity: 0, command_capacity: 0, ..Default::default() };
        assert_eq!(config.event_capacity(), 1);
        assert_eq!(config.command_capacity(), 1);
    }
}
