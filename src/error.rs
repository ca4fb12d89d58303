//! Error types for the MirAIe session manager

use crate::config::ConfigError;
use crate::protocol::TopicError;
use crate::session::SessionState;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Crate-level error type
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: SessionState },
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Shutdown requested")]
    ShutdownRequested,
}

impl ClientError {
    /// Create a timeout error for a named operation
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    /// True for errors caused by an elapsed deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_) | Self::Timeout { .. })
    }
}

/// Result type for session operations
pub type ClientResult<T> = Result<T, ClientError>;

static SECRET_ASSIGNMENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|secret|authorization)[=:]\s*\S+").ok());

static BEARER_TOKEN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").ok());

const MAX_LOGGED_ERROR_LEN: usize = 500;

/// Strip credentials from error text before it reaches the logs
pub fn redact_secrets(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_ASSIGNMENT.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(pattern) = BEARER_TOKEN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "Bearer ***").to_string();
    }

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > MAX_LOGGED_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_LOGGED_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
