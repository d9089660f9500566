//! xzmcp - Async MCP (Model Context Protocol) client library
//!
//! This library implements the client side of MCP: a JSON-RPC 2.0 message
//! engine with correlated concurrent requests, a subprocess-backed stdio
//! transport, and the initialize/version-negotiation handshake, plus typed
//! wrappers for the standard MCP operations.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `frame`: JSON-RPC 2.0 frame codec (tagged union, encode/decode)
//! - `transport`: `Transport` trait and the stdio implementation
//! - `client`: request correlator, read loop, cancellation
//! - `retry`: bounded retry with a total deadline
//! - `protocol`: initialize state machine and the typed request API
//! - `notify`: server notification dispatch
//! - `config`: subprocess launch parameters
//! - `error`: error types and result aliases
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use xzmcp::config::ServerConfig;
//! use xzmcp::protocol::McpProtocol;
//! use xzmcp::transport::stdio::StdioTransport;
//! use xzmcp::types::{ClientCapabilities, Implementation};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(StdioTransport::new(
//!         ServerConfig::new("npx").args(["-y", "@modelcontextprotocol/server-everything"]),
//!     ));
//!
//!     let session = McpProtocol::connect(transport)
//!         .await?
//!         .initialize(
//!             Implementation::new("my-host", "1.0.0"),
//!             ClientCapabilities::default(),
//!         )
//!         .await?;
//!
//!     for tool in session.list_tools().await? {
//!         println!("{}", tool.name);
//!     }
//!
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod notify;
pub mod protocol;
pub mod retry;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use client::JsonRpcClient;
pub use config::ServerConfig;
pub use error::{Result, XzmcpError};
pub use frame::{Frame, RequestId};
pub use protocol::{InitializedMcpProtocol, McpProtocol, ServerCapabilityFlag, SessionContext};
pub use retry::RetryPolicy;
