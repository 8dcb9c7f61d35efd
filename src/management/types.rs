//! HTTP API Types

use crate::resource::MemoryUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `GET /status`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub connections: usize,
    /// Seconds since the server started.
    pub uptime: f64,
    pub timestamp: String,
    pub latest_json: Option<Value>,
}

/// Body of `GET /health`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub memory_usage: MemoryUsage,
    pub uptime: f64,
}

/// Body returned when a request cannot be served
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
