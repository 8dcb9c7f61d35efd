//! jsonrelay Library
//!
//! WebSocket relay that accepts JSON objects from any client, keeps the most
//! recent one, and broadcasts it to the other connected clients. Plain HTTP
//! routes report status, health and Prometheus metrics.

pub mod config;
pub mod connection;
pub mod management;
pub mod metrics;
pub mod relay;
pub mod resource;
pub mod shutdown;

pub use config::Config;
pub use management::RelayServer;
pub use relay::{RelayHandle, RelaySnapshot};
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay server
pub type Result<T> = anyhow::Result<T>;
