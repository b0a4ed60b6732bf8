//! Engine Configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ssh::SessionSettings;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Fixed delay between reconnect attempts (milliseconds)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Bound on each handshake attempt (milliseconds)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Host that tunnel listeners bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// SSH keepalive interval (seconds)
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives tolerated before the session is dropped
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// How often a session owner checks whether its transport is still up
    /// (milliseconds)
    #[serde(default = "default_liveness_check_ms")]
    pub liveness_check_ms: u64,
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    1000
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_liveness_check_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            bind_host: default_bind_host(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_max: default_keepalive_max(),
            liveness_check_ms: default_liveness_check_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn liveness_check(&self) -> Duration {
        Duration::from_millis(self.liveness_check_ms.max(1))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_max: self.keepalive_max,
        }
    }
}
