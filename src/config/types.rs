//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub monitoring: MonitoringConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Path the WebSocket upgrade is served on.
    pub ws_path: String,
    pub max_payload_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Relay behaviour configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub broadcast: BroadcastPolicy,
    /// Empty list accepts every origin.
    pub allowed_origins: Vec<String>,
    /// File the latest payload is mirrored to.
    pub mirror_path: Option<PathBuf>,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub metrics_enabled: bool,
}

/// Which registered connections receive an accepted payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastPolicy {
    /// Every connection except the sender.
    #[default]
    Others,
    /// Every connection, the sender receives its own update back.
    All,
}

impl BroadcastPolicy {
    pub fn includes_sender(self) -> bool {
        matches!(self, BroadcastPolicy::All)
    }
}

impl fmt::Display for BroadcastPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastPolicy::Others => write!(f, "others"),
            BroadcastPolicy::All => write!(f, "all"),
        }
    }
}

impl FromStr for BroadcastPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "others" => Ok(BroadcastPolicy::Others),
            "all" => Ok(BroadcastPolicy::All),
            other => anyhow::bail!("unknown broadcast policy '{}', expected 'others' or 'all'", other),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ws_path: "/".to_string(),
            max_payload_bytes: 100 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            outbound_queue: 64,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}
