//! Connection Management Module
//!
//! Handles WebSocket connection admission and per-connection lifecycle.

pub mod handler;
pub mod origin;

pub use handler::{handle_socket, CloseReason, ConnectionSettings};
pub use origin::OriginPolicy;
