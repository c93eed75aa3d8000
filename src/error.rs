// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the hub replication core.
//!
//! Errors are categorized by their source (coordination backend, SQLite,
//! remote hub, webhook endpoint) and carry the channel/group context needed
//! to diagnose them from a log line.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Coordination` | Yes | Redis errors, session hiccups, lease renewals |
//! | `RemoteChannel` | Yes | Remote hub unreachable or returned garbage |
//! | `Delivery` | Yes | Webhook POST failed or returned non-200 |
//! | `CursorStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidRequest` | No | Malformed group or domain definition |
//! | `Forbidden` | No | Mutation of a replicated channel, domain collision |
//! | `Conflict` | No | Attempt to change an immutable group |
//! | `NotFound` | No | Named group/domain/channel does not exist |
//! | `StreamParse` | No | Malformed notification or remote payload |
//! | `InvalidState` | No | Component state machine violation |
//! | `Shutdown` | No | Component is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Leadership loss is deliberately absent: it is the cooperative
//! cancellation signal, not a failure.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur in the replication and delivery core.
#[derive(Error, Debug)]
pub enum HubError {
    /// Coordination backend error.
    ///
    /// Occurs when talking to the shared coordination service (Redis).
    /// Retryable: the leadership coordinator re-queues automatically.
    #[error("Coordination error ({operation}): {message}")]
    Coordination {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error during cursor or registry persistence.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request that can never succeed as written.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A request rejected by replication policy.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// An attempt to modify an immutable registration.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The named entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote hub channel failure.
    ///
    /// Network errors, unexpected status codes, unsupported key schemes.
    #[error("Remote channel error ({url}): {message}")]
    RemoteChannel { url: String, message: String },

    /// Webhook delivery failure. `target` is the group or callback URL.
    #[error("Delivery error ({target}): {message}")]
    Delivery { target: String, message: String },

    /// Malformed notification or payload.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// Component state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Create a coordination error from a redis::RedisError
    pub fn coordination(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Coordination {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a coordination error without source
    pub fn coordination_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Coordination {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a remote channel error.
    pub fn remote(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteChannel {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a delivery error.
    pub fn delivery(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Coordination { .. } => true,
            Self::RemoteChannel { .. } => true,
            Self::Delivery { .. } => true,
            Self::CursorStore(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidRequest(_) => false,
            Self::Forbidden(_) => false,
            Self::Conflict(_) => false,
            Self::NotFound(_) => false,
            Self::StreamParse(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for HubError {
    fn from(e: redis::RedisError) -> Self {
        Self::coordination("unknown", e)
    }
}
