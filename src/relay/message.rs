//! Payload validation and wire messages
//!
//! Inbound frames must be UTF-8 JSON objects no larger than the configured
//! limit. Accepted objects are stamped with a `_meta.receivedAt` timestamp
//! before they are cached and broadcast.

use super::RelayError;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::SystemTime;

/// Key holding receipt metadata on every relayed payload.
pub const META_KEY: &str = "_meta";

/// Error text shown to clients for any parse or shape failure.
pub const INVALID_FORMAT: &str = "Invalid message format";

/// Error text shown to clients for oversize frames.
pub const TOO_LARGE: &str = "Message too large";

/// Validate a raw frame. The size check happens before any decoding.
pub fn parse_payload(raw: &[u8], max_bytes: usize) -> Result<Map<String, Value>, RelayError> {
    if raw.len() > max_bytes {
        return Err(RelayError::TooLarge {
            size: raw.len(),
            max: max_bytes,
        });
    }

    let text = std::str::from_utf8(raw).map_err(|_| RelayError::InvalidUtf8)?;

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RelayError::NotAnObject),
        Err(e) => Err(RelayError::InvalidJson(e.to_string())),
    }
}

/// Replace `_meta` with fresh receipt metadata.
pub fn stamp(mut payload: Map<String, Value>, received_at: SystemTime) -> Map<String, Value> {
    payload.insert(
        META_KEY.to_string(),
        json!({ "receivedAt": format_timestamp(received_at) }),
    );
    payload
}

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn format_timestamp(t: SystemTime) -> String {
    humantime::format_rfc3339_millis(t).to_string()
}

/// Error payload sent back to the offending sender only
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    pub timestamp: String,
}

impl ErrorReply {
    pub fn from_error(err: &RelayError, now: SystemTime) -> Self {
        match err {
            RelayError::TooLarge { max, .. } => Self {
                error: TOO_LARGE,
                details: Some(err.to_string()),
                max_size: Some(*max),
                timestamp: format_timestamp(now),
            },
            _ => Self {
                error: INVALID_FORMAT,
                details: Some(err.to_string()),
                max_size: None,
                timestamp: format_timestamp(now),
            },
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and integers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"error\":\"{}\"}}", self.error))
    }
}
