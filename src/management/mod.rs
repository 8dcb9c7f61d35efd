//! HTTP Surface Module
//!
//! WebSocket endpoint plus the status, health and metrics routes.

pub mod api;
pub mod handlers;
pub mod server;
pub mod types;

pub use api::RelayApi;
pub use handlers::AppState;
pub use server::RelayServer;
pub use types::*;
