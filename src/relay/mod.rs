//! JSON Relay Module
//!
//! Connection registry, heartbeat state, payload validation, the latest
//! payload cache and the dispatcher task that ties them together.

pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod liveness;
pub mod message;
pub mod registry;

pub use cache::{LatestPayload, PayloadCache, PayloadMirror};
pub use dispatcher::{Dispatcher, DispatcherSettings, RelayEvent, RelayHandle, RelaySnapshot};
pub use error::RelayError;
pub use liveness::{Liveness, LivenessState, Probe};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Outbound};
