//! Configuration for maxwell-client connections

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConnectionError, Result};

/// Path component appended to every endpoint when building the socket URL.
pub const WS_PATH: &str = "$ws";

/// Connection options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Fixed delay before reconnecting after a transport close (no backoff)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Heartbeat tick period
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Deadline applied to `request()` calls without an explicit timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How many times a "frontend not found" error reply is retried (0 = never)
    #[serde(default)]
    pub retry_route_count: u32,

    /// Use `wss` instead of `ws`
    #[serde(default)]
    pub tls_enabled: bool,

    /// Log every sent and received round message at debug level
    #[serde(default)]
    pub debug_logging_enabled: bool,
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_ms() -> u64 {
    10000
}

fn default_request_timeout_ms() -> u64 {
    15000
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_route_count: 0,
            tls_enabled: false,
            debug_logging_enabled: false,
        }
    }
}

impl Options {
    /// Load options from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConnectionError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let options: Options = toml::from_str(&content)
            .map_err(|e| ConnectionError::Config(format!("Invalid options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Reject values the connection state machine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConnectionError::Config(
                "heartbeat_interval_ms must be greater than 0".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConnectionError::Config(
                "request_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Build the socket URL for an endpoint (`host:port`)
    pub fn build_url(&self, endpoint: &str) -> String {
        let scheme = if self.tls_enabled { "wss" } else { "ws" };
        format!("{}://{}/{}", scheme, endpoint, WS_PATH)
    }
}
