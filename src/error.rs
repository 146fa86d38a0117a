//! Error types for dispatch operations.
//!
//! Each variant maps to an HTTP status for the REST surface and to an MCP
//! error for the tool surface.

use std::fmt;

use axum::response::{IntoResponse, Response};
use http::StatusCode;

use crate::pool::PoolError;

/// Errors that can occur while registering workers or dispatching runs.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Request parameters were rejected before any network call.
    InvalidRequest(String),

    /// A candidate worker failed its warm-up probe and was not admitted.
    ProbeFailed { address: String, reason: String },

    /// No worker was free for a fail-fast acquire.
    PoolEmpty,

    /// A leased worker answered with a non-success status.
    WorkerUnavailable {
        address: String,
        status: u16,
        body: String,
    },

    /// A leased worker could not be reached, or the call timed out.
    Unreachable { address: String, reason: String },

    /// The worker sent an event payload that could not be decoded.
    StreamDecode(String),

    /// The event stream ended without an `end` event.
    MissingEnd { address: String },

    /// The pool shut down while the request was waiting for a worker.
    Cancelled,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::ProbeFailed { address, reason } => {
                write!(f, "Failed to reach worker at {}. {}", address, reason)
            }
            Self::PoolEmpty => write!(f, "No worker available: pool is empty"),
            Self::WorkerUnavailable {
                address,
                status,
                body,
            } => write!(
                f,
                "Failed to run code on worker {}. Status code: {}, Response: {}",
                address, status, body
            ),
            Self::Unreachable { address, reason } => {
                write!(f, "Worker {} is unreachable: {}", address, reason)
            }
            Self::StreamDecode(msg) => write!(f, "Malformed event from worker: {}", msg),
            Self::MissingEnd { address } => {
                write!(f, "Worker {} closed the stream without an end event", address)
            }
            Self::Cancelled => write!(f, "Dispatch cancelled: pool is shutting down"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<PoolError> for DispatchError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Empty => Self::PoolEmpty,
            PoolError::Closed => Self::Cancelled,
        }
    }
}

impl DispatchError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ProbeFailed { .. } => "probe_failed",
            Self::PoolEmpty => "pool_empty",
            Self::WorkerUnavailable { .. } => "worker_unavailable",
            Self::Unreachable { .. } => "unreachable",
            Self::StreamDecode(_) => "stream_decode",
            Self::MissingEnd { .. } => "missing_end",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::ProbeFailed { .. } => StatusCode::BAD_REQUEST,
            Self::PoolEmpty | Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::WorkerUnavailable { .. }
            | Self::Unreachable { .. }
            | Self::StreamDecode(_)
            | Self::MissingEnd { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Convert this error to an MCP ErrorData for protocol responses.
    pub fn to_mcp_error(&self) -> rmcp::ErrorData {
        let data = serde_json::json!({
            "kind": self.kind(),
            "status": self.status_code().as_u16(),
        });
        match self {
            Self::InvalidRequest(msg) => rmcp::ErrorData::invalid_params(msg.clone(), Some(data)),
            _ => rmcp::ErrorData::internal_error(self.to_string(), Some(data)),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
