//! Error types for xzmcp
//!
//! This module defines all error types used throughout the crate, using
//! `thiserror` for ergonomic error handling. Every failure a caller can
//! observe is one of the [`XzmcpError`] variants; collaborators distinguish
//! kinds by matching on the variant (downcast from `anyhow::Error`), never
//! by inspecting message strings.

use thiserror::Error;

/// Main error type for xzmcp operations
///
/// This enum encompasses all possible errors that can occur during frame
/// encoding/decoding, transport I/O, request correlation, retry handling,
/// and the initialize handshake.
#[derive(Error, Debug)]
pub enum XzmcpError {
    /// The handshake produced a protocol version outside the accepted set
    #[error("protocol version mismatch: accepted one of {accepted:?}, got {got}")]
    VersionMismatch {
        /// Versions this client accepts
        accepted: Vec<String>,
        /// Version the server returned
        got: String,
    },

    /// A request or handshake deadline was exceeded
    #[error("timeout: method={method}")]
    Timeout {
        /// JSON-RPC method that timed out
        method: String,
    },

    /// The server returned a JSON-RPC error response
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Human-readable message from the server
        message: String,
        /// Optional structured error payload
        data: Option<serde_json::Value>,
    },

    /// Transport-level I/O failure (broken pipe, dead subprocess, EOF)
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation attempted on a closed transport, or in-flight during close
    #[error("transport closed")]
    TransportClosed,

    /// The request was explicitly cancelled before a response arrived
    #[error("request cancelled: method={method}")]
    Cancelled {
        /// JSON-RPC method of the cancelled request
        method: String,
    },

    /// Inbound frame was malformed or violated the JSON-RPC 2.0 shape
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation requires a capability the server did not advertise
    #[error("capability missing: {capability} (required by {method})")]
    CapabilityMissing {
        /// Capability key absent from the negotiated session context
        capability: &'static str,
        /// Operation that was attempted
        method: &'static str,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl XzmcpError {
    /// Whether this error is transient and safe to retry with a fresh
    /// request ID.
    ///
    /// Transport breakage and implementation-defined JSON-RPC errors
    /// (`-32000..=-32099`) are retryable; so are errors whose text carries
    /// an authentication signal (a collaborator may re-authenticate and
    /// resubmit). Structural failures, version mismatch, cancellation, and
    /// deadline expiry are permanent.
    pub fn retryable(&self) -> bool {
        match self {
            XzmcpError::Transport(_) | XzmcpError::TransportClosed => true,
            XzmcpError::Rpc { code, message, .. } => {
                (-32099..=-32000).contains(code) || is_auth_failure(message)
            }
            _ => false,
        }
    }
}

/// Heuristic for authentication-adjacent server errors surfaced in message
/// text. These must classify as retryable so callers can re-authenticate.
fn is_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("401") || lower.contains("unauthorized") || lower.contains("authentication")
}

/// Classify an `anyhow::Error` by downcasting to [`XzmcpError`].
///
/// Errors that are not an `XzmcpError` (wrapped I/O failures, context
/// chains from collaborators) are treated as non-retryable.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<XzmcpError>()
        .map(XzmcpError::retryable)
        .unwrap_or(false)
}

/// Result type alias for xzmcp operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
