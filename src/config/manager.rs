//! Configuration Manager

use super::{BroadcastPolicy, Config};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse a TOML document. Missing sections and fields fall back to defaults.
    pub fn parse(content: &str) -> Result<Config> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_env(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_addr) = lookup("RELAY_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid RELAY_BIND_ADDR: {}", bind_addr))?;
        }

        // PORT wins over the port part of RELAY_BIND_ADDR, matching hosting platforms that inject it.
        if let Some(port) = lookup("PORT") {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid PORT: {}", port))?;
            config.server.bind_addr.set_port(port);
        }

        if let Some(origins) = lookup("RELAY_ALLOWED_ORIGINS") {
            config.relay.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(max) = lookup("RELAY_MAX_PAYLOAD_BYTES") {
            config.server.max_payload_bytes = max
                .parse::<usize>()
                .with_context(|| format!("Invalid RELAY_MAX_PAYLOAD_BYTES: {}", max))?;
        }

        if let Some(interval) = lookup("RELAY_HEARTBEAT_INTERVAL") {
            config.server.heartbeat_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid RELAY_HEARTBEAT_INTERVAL: {}", interval))?;
        }

        if let Some(policy) = lookup("RELAY_BROADCAST") {
            config.relay.broadcast = policy
                .parse::<BroadcastPolicy>()
                .with_context(|| format!("Invalid RELAY_BROADCAST: {}", policy))?;
        }

        if let Some(path) = lookup("RELAY_MIRROR_PATH") {
            if !path.is_empty() {
                config.relay.mirror_path = Some(PathBuf::from(path));
            }
        }

        if let Some(log_level) = lookup("RELAY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_payload_bytes == 0 {
            bail!("max_payload_bytes must be greater than 0");
        }

        if self.server.max_payload_bytes > 16 * 1024 * 1024 {
            bail!("max_payload_bytes cannot exceed 16MB");
        }

        if self.server.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than 0");
        }

        if self.server.outbound_queue == 0 {
            bail!("outbound_queue must be greater than 0");
        }

        let path = self.server.ws_path.as_str();
        if !path.starts_with('/') {
            bail!("ws_path must start with '/'");
        }

        if ["/status", "/health", "/metrics"].contains(&path) {
            bail!("ws_path '{}' collides with an HTTP endpoint", path);
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        for (i, origin) in self.relay.allowed_origins.iter().enumerate() {
            if origin.trim().is_empty() {
                bail!("Allowed origin {} is empty", i);
            }
        }

        if let Some(path) = &self.relay.mirror_path {
            if path.as_os_str().is_empty() {
                bail!("mirror_path must not be empty");
            }
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        allowed_origins: &[String],
        mirror_path: Option<&Path>,
        broadcast: Option<BroadcastPolicy>,
    ) {
        if let Some(bind_str) = bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if !allowed_origins.is_empty() {
            self.relay.allowed_origins = allowed_origins.to_vec();
            tracing::info!("CLI override: {} allowed origins", allowed_origins.len());
        }

        if let Some(path) = mirror_path {
            self.relay.mirror_path = Some(path.to_path_buf());
            tracing::info!("CLI override: mirror path set to {}", path.display());
        }

        if let Some(policy) = broadcast {
            self.relay.broadcast = policy;
            tracing::info!("CLI override: broadcast policy set to {}", policy);
        }
    }
}
