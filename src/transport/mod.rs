//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that all MCP transport
//! implementations must satisfy. The canonical implementation is
//! [`stdio::StdioTransport`], which spawns a child process and communicates
//! over its stdin/stdout pipes using newline-delimited JSON. An in-process
//! [`fake::FakeTransport`] is available to tests.
//!
//! # Lifecycle
//!
//! A transport has three observable states, and transitions are one-way:
//!
//! ```text
//! Unopened --open()--> Open --close()--> Closed
//! ```
//!
//! Construction performs parameter capture ONLY. Every runtime-bound
//! primitive — channels, background tasks, streams — is allocated inside
//! `open()`. Allocating them at construction time deadlocks when the
//! transport is constructed while another concurrent scope on the same
//! runtime is active, so implementations must not create any such primitive
//! before `open()` is called.
//!
//! `close()` is idempotent and must run on every exit path of the caller's
//! scope; callers that cannot guarantee this get a best-effort cleanup from
//! `Drop`.
//!
//! # Framing
//!
//! The trait is intentionally minimal: callers `send` a serialized JSON-RPC
//! string and `receive` a stream of serialized JSON-RPC strings (one per
//! logical message, whitespace trimmed). Framing is the responsibility of
//! each concrete implementation.

use std::pin::Pin;

use futures::Stream;

use crate::error::Result;

/// Observable lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Constructed; no subprocess, channels, or tasks exist yet.
    Unopened,
    /// `open()` succeeded; the duplex stream is live.
    Open,
    /// `close()` ran (or open was skipped entirely); terminal.
    Closed,
}

/// Abstraction over MCP transport implementations.
///
/// All methods take `&self`; implementations use interior mutability so a
/// transport can be shared behind an `Arc` between the correlator and the
/// owner responsible for its lifecycle.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Transition from `Unopened` to `Open`: spawn the subprocess (or
    /// equivalent), allocate channels, and start the I/O tasks.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::XzmcpError::Transport`] if the underlying
    /// resource cannot be acquired, and
    /// [`crate::error::XzmcpError::TransportClosed`] if the transport was
    /// already closed.
    async fn open(&self) -> Result<()>;

    /// Send a complete JSON-RPC message string to the remote peer.
    ///
    /// The string MUST be a single, complete JSON object; the transport
    /// appends its own framing. Sends enqueue on a bounded outbound queue
    /// and suspend when it is full.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::XzmcpError::TransportClosed`] when the
    /// transport is not open, and
    /// [`crate::error::XzmcpError::Transport`] when the peer is gone.
    async fn send(&self, message: String) -> Result<()>;

    /// Returns a stream of inbound JSON-RPC message strings.
    ///
    /// Each item is a single, complete JSON object with surrounding
    /// whitespace stripped; empty lines never appear. The stream ends on
    /// EOF (peer death) or close. Calling this on a transport that is not
    /// open yields an immediately-ended stream.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + 'static>>;

    /// Returns a stream of transport-level diagnostic lines (child stderr
    /// for stdio). Diagnostic output MUST NOT be treated as an error
    /// condition.
    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + 'static>>;

    /// Transition to `Closed`: signal shutdown, release the peer, join the
    /// I/O tasks, and reap the subprocess. Idempotent; closing an
    /// `Unopened` transport is a no-op transition straight to `Closed`.
    async fn close(&self) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;
}

pub mod stdio;

#[cfg(test)]
pub mod fake;
