//! Session and relay configuration.
//!
//! Layered: built-in defaults, then an optional TOML file, then `TOPICSYNC_*`
//! environment variables. Durations are milliseconds.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

pub const DEFAULT_ROOM: &str = "zeromq-topic-manager";
pub const DEFAULT_PATH: &str = "/yjs-websocket";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:1234";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Relay endpoint without the room segment.
    pub server_url: String,
    pub room: String,
    /// Presence name; `user_<n>` when unset.
    pub display_name: Option<String>,
    pub resync_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub awareness: AwarenessConfig,
    pub relay: RelayConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://{DEFAULT_BIND_ADDR}{DEFAULT_PATH}"),
            room: DEFAULT_ROOM.to_string(),
            display_name: None,
            resync_timeout_ms: 5_000,
            reconnect: ReconnectPolicy::default(),
            awareness: AwarenessConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Fraction of each delay randomized in both directions.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 10_000,
            jitter: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwarenessConfig {
    pub heartbeat_ms: u64,
    pub missed_heartbeats: u32,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 15_000,
            missed_heartbeats: 2,
        }
    }
}

impl AwarenessConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    /// Silence longer than this evicts a peer.
    pub fn liveness(&self) -> Duration {
        self.heartbeat() * self.missed_heartbeats.max(1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// URL path prefix; the room is the segment after it.
    pub path: String,
    /// Messages buffered per connection before a slow peer starts lagging.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            path: DEFAULT_PATH.to_string(),
            broadcast_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    /// Full endpoint for the configured room.
    pub fn room_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| NetError::Config(e.to_string()))
    }

    /// Defaults, then `path` if it exists, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|e| {
                    NetError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                let config = Self::from_toml_str(&contents)?;
                tracing::debug!(path = %path.display(), "loaded config file");
                config
            }
            Some(path) => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut non_empty = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = non_empty("TOPICSYNC_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(room) = non_empty("TOPICSYNC_ROOM") {
            self.room = room;
        }
        if let Some(name) = non_empty("TOPICSYNC_DISPLAY_NAME") {
            self.display_name = Some(name);
        }
        if let Some(addr) = non_empty("TOPICSYNC_RELAY_ADDR") {
            self.relay.bind_addr = addr;
        }
        if let Some(raw) = non_empty("TOPICSYNC_HEARTBEAT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => self.awareness.heartbeat_ms = ms,
                Ok(_) => tracing::warn!("TOPICSYNC_HEARTBEAT_MS must be positive, ignoring"),
                Err(err) => tracing::warn!("invalid TOPICSYNC_HEARTBEAT_MS, ignoring: {err}"),
            }
        }
    }
}
