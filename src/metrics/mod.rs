//! Metrics Module
//!
//! Prometheus counters for connections, relayed payloads and failures.

pub mod collector;

pub use collector::Metrics;
