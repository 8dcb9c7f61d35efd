//! Relay Errors

use thiserror::Error;

/// Reasons an inbound frame or an outbound delivery is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0}")]
    InvalidJson(String),

    #[error("Payload must be a JSON object")]
    NotAnObject,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("connection is closed")]
    ConnectionClosed,
}

impl RelayError {
    /// Short label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::TooLarge { .. } => "too_large",
            RelayError::InvalidUtf8 => "invalid_utf8",
            RelayError::InvalidJson(_) => "invalid_json",
            RelayError::NotAnObject => "not_an_object",
            RelayError::QueueFull => "queue_full",
            RelayError::ConnectionClosed => "connection_closed",
        }
    }
}
