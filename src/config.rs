//! Link configuration
//!
//! Every field has a default, so a config file only needs the values it
//! wants to change:
//!
//! ```json
//! { "max_connections": 4, "heartbeat_interval_ms": 10000 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::registry::DEFAULT_MAX_CONNECTIONS;

/// Default period between health sweeps
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default silence after which a connection is considered dead
pub const DEFAULT_IDLE_THRESHOLD_MS: u64 = 60_000;

/// Default delay between DISCONNECTED and RECONNECTING
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;

/// Default bound on endpoint resolution
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 15_000;

/// Default bound on the outbound socket connect
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default bound on the responder's single inbound accept
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 30_000;

/// Default lifetime of an unanswered handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Service name published on the discovery layer
    pub service_name: String,
    pub max_connections: usize,
    pub heartbeat_interval_ms: u64,
    pub idle_threshold_ms: u64,
    pub reconnect_delay_ms: u64,
    pub resolve_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_name: "peerlink".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            resolve_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl LinkConfig {
    pub fn from_json(json: &str) -> Result<Self, LinkError> {
        let config: LinkConfig =
            serde_json::from_str(json).map_err(|e| LinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.service_name.trim().is_empty() {
            return Err(LinkError::Config("service_name must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(LinkError::Config("max_connections must be at least 1".into()));
        }

        let durations = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("idle_threshold_ms", self.idle_threshold_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("resolve_timeout_ms", self.resolve_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("accept_timeout_ms", self.accept_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(LinkError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
