//! jsonrelay - WebSocket JSON relay server

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jsonrelay::{
    config::{BroadcastPolicy, ConfigManager},
    metrics::Metrics,
    RelayServer, ShutdownCoordinator,
};

/// CLI arguments for jsonrelay
#[derive(Parser, Debug)]
#[command(name = "jsonrelay")]
#[command(about = "WebSocket relay that caches and broadcasts the latest JSON payload")]
#[command(version)]
#[command(long_about = "
jsonrelay - WebSocket JSON relay server

Clients connect over WebSocket and send JSON objects. Each accepted object is
stamped with _meta.receivedAt, kept as the latest payload, and broadcast to
the other connected clients. New clients receive the latest payload first.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file (environment variables are ignored when it exists)
3. Environment variables
4. Built-in defaults

Environment variables:
  PORT                      - Listening port (default 8080)
  RELAY_BIND_ADDR           - Bind address (e.g., 0.0.0.0:8080)
  RELAY_ALLOWED_ORIGINS     - Comma separated origin allow-list
  RELAY_MAX_PAYLOAD_BYTES   - Maximum accepted message size
  RELAY_HEARTBEAT_INTERVAL  - Heartbeat interval (e.g., 30s)
  RELAY_BROADCAST           - 'others' or 'all'
  RELAY_MIRROR_PATH         - File the latest payload is mirrored to
  RELAY_LOG_LEVEL           - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "relay.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 0.0.0.0:8080)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Allowed origin, may be repeated
    #[arg(long = "allowed-origin", help = "Allowed WebSocket origin (repeatable)")]
    pub allowed_origins: Vec<String>,

    /// Mirror file for the latest payload
    #[arg(long, help = "File the latest payload is mirrored to")]
    pub mirror_path: Option<PathBuf>,

    /// Broadcast policy
    #[arg(long, help = "Broadcast policy: 'others' or 'all'")]
    pub broadcast: Option<BroadcastPolicy>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let from_file = args.config.exists();
    let mut config = if from_file {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        &args.allowed_origins,
        args.mirror_path.as_deref(),
        args.broadcast,
    );
    if let Some(level) = &args.log_level {
        config.monitoring.log_level = level.clone();
    }

    init_tracing(&args, &config.monitoring.log_level)?;

    info!("Starting jsonrelay v{}", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!("Configuration loaded from {}", args.config.display());
    } else {
        info!("Config file not found, using environment variables and defaults");
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  WebSocket path: {}", config.server.ws_path);
        info!("  Max payload: {} bytes", config.server.max_payload_bytes);
        info!("  Heartbeat interval: {:?}", config.server.heartbeat_interval);
        info!("  Broadcast policy: {}", config.relay.broadcast);
        info!(
            "  Origin allow-list: {}",
            if config.relay.allowed_origins.is_empty() {
                "disabled".to_string()
            } else {
                config.relay.allowed_origins.join(", ")
            }
        );
        info!(
            "  Mirror file: {}",
            config
                .relay
                .mirror_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );
        return Ok(());
    }

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let metrics = Arc::new(Metrics::new());

    let server = RelayServer::bind(config, metrics)
        .await
        .context("Failed to start relay server")?;

    let signal = shutdown_coordinator.signalled();
    let mut server_handle = tokio::spawn(server.serve_with_shutdown(signal));

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    tokio::select! {
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
                shutdown_coordinator.trigger();
            }
        }
        joined = &mut server_handle => {
            // The server only returns on its own after a fatal error.
            return match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
            };
        }
    }

    info!("Initiating graceful shutdown...");

    match tokio::time::timeout(shutdown_coordinator.timeout(), server_handle).await {
        Ok(Ok(Ok(()))) => info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => error!("Server task failed: {}", e),
        Err(_) => warn!("Shutdown timeout reached, exiting"),
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, log_level: &str) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { log_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
