//! Model configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// Intervals driving the adaptive pollers, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Normal refresh interval.
    pub base_ms: u64,
    /// Fastest interval reachable through activity.
    pub fast_ms: u64,
    /// Interval used while the host is unfocused.
    pub max_ms: u64,
    /// Amount added per decay step on idle ticks.
    pub step_ms: u64,
    /// Consecutive activity signals needed before the interval halves.
    pub accelerate_after: u32,
    /// Idle ticks between decay steps.
    pub decay_after: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_ms: 4000,
            fast_ms: 1000,
            max_ms: 20000,
            step_ms: 500,
            accelerate_after: 1,
            decay_after: 4,
        }
    }
}

impl PollConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn fast(&self) -> Duration {
        Duration::from_millis(self.fast_ms.min(self.base_ms))
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.base_ms))
    }

    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }
}

/// Everything the application context needs to talk to the compute API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the compute API, e.g. `http://localhost:8080/compute/v2`.
    pub api_url: String,
    /// Value of the `X-Auth-Token` header.
    pub token: Option<String>,
    /// Response envelope variant spoken by the API.
    pub envelope: Envelope,
    /// Endpoint for bulk admin operations.
    pub admin_url: Option<String>,
    /// Use `changes-since` for VM polls after the first full fetch.
    pub incremental: bool,
    pub poll: PollConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080/compute/v2".to_string(),
            token: None,
            envelope: Envelope::default(),
            admin_url: None,
            incremental: true,
            poll: PollConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config =
            ModelConfig::from_json(r#"{"api_url": "http://api", "envelope": "legacy"}"#).unwrap();
        assert_eq!(config.api_url, "http://api");
        assert_eq!(config.envelope, Envelope::Legacy);
        assert_eq!(config.poll, PollConfig::default());
        assert!(config.token.is_none());
    }

    #[test]
    fn test_poll_bounds_are_ordered() {
        let poll = PollConfig {
            base_ms: 500,
            fast_ms: 1000,
            max_ms: 100,
            ..Default::default()
        };
        assert!(poll.fast() <= poll.base());
        assert!(poll.base() <= poll.max());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cirrus.json");
        std::fs::write(&path, r#"{"token": "secret", "poll": {"base_ms": 2000}}"#).unwrap();

        let config = ModelConfig::from_file(&path).unwrap();
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.poll.base_ms, 2000);
        assert_eq!(config.poll.fast_ms, 1000);
    }
}
