//! Typed MCP lifecycle wrapper over [`JsonRpcClient`]
//!
//! This module provides the two types that represent the two phases of an
//! MCP client session:
//!
//! - [`McpProtocol`] -- an unestablished session. Call
//!   [`McpProtocol::initialize`] to perform the `initialize` /
//!   `notifications/initialized` handshake and receive an
//!   [`InitializedMcpProtocol`].
//! - [`InitializedMcpProtocol`] -- a fully negotiated session. All MCP
//!   operations (`tools/*`, `resources/*`, `prompts/*`,
//!   `sampling/createMessage`, `completion/complete`, `roots/list`, `ping`)
//!   are available as typed async methods, each gated on the negotiated
//!   capability set and routed through the retry engine.
//!
//! # Handshake
//!
//! Exactly one `initialize` request is sent per connection, before anything
//! else. The client offers [`LATEST_PROTOCOL_VERSION`] and accepts any
//! version in [`SUPPORTED_PROTOCOL_VERSIONS`]; any other choice by the
//! server fails the handshake with a `VersionMismatch` carrying both sides'
//! versions. `initialize` always raises on failure -- there is no "empty"
//! sentinel result -- and the error kind tells collaborators whether to
//! re-authenticate (retryable), downgrade, or abort.
//!
//! # Design
//!
//! Pagination is handled internally: `list_tools`, `list_resources`, and
//! `list_prompts` follow `nextCursor` until the server stops returning one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::JsonRpcClient;
use crate::error::{Result, XzmcpError};
use crate::notify::NotificationStream;
use crate::retry::{request_with_retry, RetryPolicy};
use crate::transport::Transport;
use crate::types::{
    CallToolParams, CallToolResult, ClientCapabilities, CompleteParams, CompleteResult,
    CreateMessageParams, CreateMessageResult, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult, ListRootsResult,
    ListToolsResult, McpTool, PaginatedParams, Prompt, ReadResourceResult, Resource,
    ResourceContents, ResourceUriParams, Root, ServerCapabilities, LATEST_PROTOCOL_VERSION,
    METHOD_COMPLETION_COMPLETE, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING,
    METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_RESOURCES_SUBSCRIBE, METHOD_RESOURCES_UNSUBSCRIBE, METHOD_ROOTS_LIST,
    METHOD_SAMPLING_CREATE_MESSAGE, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    SUPPORTED_PROTOCOL_VERSIONS,
};

/// Deadline for the `initialize` round trip, separate from per-request
/// retry deadlines.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Capability flags and session context
// ---------------------------------------------------------------------------

/// Identifies a capability a server may advertise during the handshake.
///
/// Used with [`InitializedMcpProtocol::capable`] to check whether the
/// negotiated server supports a feature before issuing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCapabilityFlag {
    /// Server exposes tools via `tools/list` and `tools/call`.
    Tools,
    /// Server exposes resources via `resources/list` and `resources/read`.
    Resources,
    /// Server exposes prompts via `prompts/list` and `prompts/get`.
    Prompts,
    /// Server supports `sampling/createMessage`.
    Sampling,
    /// Server supports `completion/complete`.
    Completions,
    /// Server supports `roots/list`.
    Roots,
    /// Server emits `notifications/message` log records.
    Logging,
}

impl ServerCapabilityFlag {
    /// The capability key as it appears in the `initialize` response.
    pub fn key(self) -> &'static str {
        match self {
            ServerCapabilityFlag::Tools => "tools",
            ServerCapabilityFlag::Resources => "resources",
            ServerCapabilityFlag::Prompts => "prompts",
            ServerCapabilityFlag::Sampling => "sampling",
            ServerCapabilityFlag::Completions => "completions",
            ServerCapabilityFlag::Roots => "roots",
            ServerCapabilityFlag::Logging => "logging",
        }
    }
}

/// The immutable outcome of a successful `initialize` handshake.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Protocol version both sides agreed on.
    pub protocol_version: String,
    /// The server's identity.
    pub server_info: Implementation,
    /// Capabilities the server advertised.
    pub server_capabilities: ServerCapabilities,
    /// Capabilities this client advertised.
    pub client_capabilities: ClientCapabilities,
    /// Optional usage instructions from the server.
    pub instructions: Option<String>,
}

// ---------------------------------------------------------------------------
// McpProtocol -- unestablished
// ---------------------------------------------------------------------------

/// An unestablished MCP client session.
///
/// Wraps a wired [`JsonRpcClient`] and provides [`McpProtocol::initialize`],
/// which performs the MCP handshake and returns an
/// [`InitializedMcpProtocol`].
#[derive(Debug)]
pub struct McpProtocol {
    client: JsonRpcClient,
}

impl McpProtocol {
    /// Wrap an existing client whose read loop is already running.
    pub fn new(client: JsonRpcClient) -> Self {
        Self { client }
    }

    /// Open `transport`, wire a [`JsonRpcClient`] to it, and start the read
    /// loop.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when `open()` fails; nothing is
    /// spawned in that case.
    pub async fn connect(transport: Arc<dyn Transport>) -> Result<Self> {
        transport.open().await?;
        let client = JsonRpcClient::new(transport);
        client.start_read_loop();
        Ok(Self { client })
    }

    /// Perform the `initialize` / `notifications/initialized` handshake.
    ///
    /// Sends `initialize` offering [`LATEST_PROTOCOL_VERSION`], validates
    /// that the server's chosen version is in
    /// [`SUPPORTED_PROTOCOL_VERSIONS`], emits the
    /// `notifications/initialized` notification, and returns the
    /// established session.
    ///
    /// # Errors
    ///
    /// Always raises on failure, with a kind collaborators can dispatch on:
    ///
    /// - [`XzmcpError::VersionMismatch`] -- the server chose a version
    ///   outside the accepted set; carries both sides' versions.
    /// - [`XzmcpError::Timeout`] -- no response within
    ///   [`HANDSHAKE_TIMEOUT`]; non-retryable at this layer.
    /// - [`XzmcpError::Rpc`] -- the server rejected the handshake;
    ///   authentication-like failures classify as retryable so the caller
    ///   can re-authenticate and reconnect.
    /// - [`XzmcpError::Transport`] / [`XzmcpError::TransportClosed`] -- the
    ///   connection died mid-handshake.
    pub async fn initialize(
        self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializedMcpProtocol> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: capabilities.clone(),
            client_info,
        };

        let response: InitializeResult = self
            .client
            .request(METHOD_INITIALIZE, params, Some(HANDSHAKE_TIMEOUT))
            .await?;

        // The server must pick a version we accept.
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(XzmcpError::VersionMismatch {
                accepted: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                got: response.protocol_version,
            }
            .into());
        }

        // Fire-and-forget; a lost notification is not fatal.
        if let Err(e) = self
            .client
            .notify(METHOD_INITIALIZED, serde_json::json!({}))
            .await
        {
            tracing::debug!("could not send initialized notification: {e}");
        }

        Ok(InitializedMcpProtocol {
            client: self.client,
            session: SessionContext {
                protocol_version: response.protocol_version,
                server_info: response.server_info,
                server_capabilities: response.capabilities,
                client_capabilities: capabilities,
                instructions: response.instructions,
            },
            retry: RetryPolicy::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// InitializedMcpProtocol -- fully negotiated session
// ---------------------------------------------------------------------------

/// A fully negotiated MCP client session.
///
/// Created by [`McpProtocol::initialize`]. Every operation checks the
/// negotiated capability set first (`ping` excepted) and goes through the
/// retry engine with this session's [`RetryPolicy`].
#[derive(Debug)]
pub struct InitializedMcpProtocol {
    client: JsonRpcClient,
    session: SessionContext,
    retry: RetryPolicy,
}

impl InitializedMcpProtocol {
    /// The immutable session context produced by the handshake.
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// The negotiated protocol version.
    pub fn protocol_version(&self) -> &str {
        &self.session.protocol_version
    }

    /// The underlying JSON-RPC client.
    pub fn client(&self) -> &JsonRpcClient {
        &self.client
    }

    /// Replace the retry policy applied to this session's operations.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the server advertised a capability during the handshake.
    ///
    /// The check is structural: the capability key being present (even as
    /// an empty object) means available.
    pub fn capable(&self, capability: ServerCapabilityFlag) -> bool {
        let caps = &self.session.server_capabilities;
        match capability {
            ServerCapabilityFlag::Tools => caps.tools.is_some(),
            ServerCapabilityFlag::Resources => caps.resources.is_some(),
            ServerCapabilityFlag::Prompts => caps.prompts.is_some(),
            ServerCapabilityFlag::Sampling => caps.sampling.is_some(),
            ServerCapabilityFlag::Completions => caps.completions.is_some(),
            ServerCapabilityFlag::Roots => caps.roots.is_some(),
            ServerCapabilityFlag::Logging => caps.logging.is_some(),
        }
    }

    fn require(&self, capability: ServerCapabilityFlag, method: &'static str) -> Result<()> {
        if self.capable(capability) {
            Ok(())
        } else {
            Err(XzmcpError::CapabilityMissing {
                capability: capability.key(),
                method,
            }
            .into())
        }
    }

    /// `resources/subscribe` needs the `subscribe` sub-flag, not just the
    /// resources capability.
    fn require_resource_subscriptions(&self, method: &'static str) -> Result<()> {
        let supported = self
            .session
            .server_capabilities
            .resources
            .as_ref()
            .and_then(|r| r.subscribe)
            .unwrap_or(false);
        if supported {
            Ok(())
        } else {
            Err(XzmcpError::CapabilityMissing {
                capability: "resources.subscribe",
                method,
            }
            .into())
        }
    }

    /// List all tools, following `nextCursor` pagination to exhaustion.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.require(ServerCapabilityFlag::Tools, METHOD_TOOLS_LIST)?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page: ListToolsResult = request_with_retry(
                &self.client,
                METHOD_TOOLS_LIST,
                PaginatedParams { cursor },
                &self.retry,
            )
            .await?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Invoke a named tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult> {
        self.require(ServerCapabilityFlag::Tools, METHOD_TOOLS_CALL)?;
        request_with_retry(
            &self.client,
            METHOD_TOOLS_CALL,
            CallToolParams {
                name: name.to_string(),
                arguments,
            },
            &self.retry,
        )
        .await
    }

    /// List all resources, following pagination to exhaustion.
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        self.require(ServerCapabilityFlag::Resources, METHOD_RESOURCES_LIST)?;

        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page: ListResourcesResult = request_with_retry(
                &self.client,
                METHOD_RESOURCES_LIST,
                PaginatedParams { cursor },
                &self.retry,
            )
            .await?;

            resources.extend(page.resources);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }
        Ok(resources)
    }

    /// Read the contents of a resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        self.require(ServerCapabilityFlag::Resources, METHOD_RESOURCES_READ)?;
        let result: ReadResourceResult = request_with_retry(
            &self.client,
            METHOD_RESOURCES_READ,
            ResourceUriParams {
                uri: uri.to_string(),
            },
            &self.retry,
        )
        .await?;
        Ok(result.contents)
    }

    /// Subscribe to update notifications for a resource URI.
    ///
    /// Updates arrive as `notifications/resources/updated`; observe them
    /// via [`InitializedMcpProtocol::notifications`].
    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        self.require_resource_subscriptions(METHOD_RESOURCES_SUBSCRIBE)?;
        let _: serde_json::Value = request_with_retry(
            &self.client,
            METHOD_RESOURCES_SUBSCRIBE,
            ResourceUriParams {
                uri: uri.to_string(),
            },
            &self.retry,
        )
        .await?;
        Ok(())
    }

    /// Remove a resource subscription.
    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        self.require_resource_subscriptions(METHOD_RESOURCES_UNSUBSCRIBE)?;
        let _: serde_json::Value = request_with_retry(
            &self.client,
            METHOD_RESOURCES_UNSUBSCRIBE,
            ResourceUriParams {
                uri: uri.to_string(),
            },
            &self.retry,
        )
        .await?;
        Ok(())
    }

    /// List all prompts, following pagination to exhaustion.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.require(ServerCapabilityFlag::Prompts, METHOD_PROMPTS_LIST)?;

        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page: ListPromptsResult = request_with_retry(
                &self.client,
                METHOD_PROMPTS_LIST,
                PaginatedParams { cursor },
                &self.retry,
            )
            .await?;

            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }
        Ok(prompts)
    }

    /// Retrieve a rendered prompt by name, substituting template arguments.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult> {
        self.require(ServerCapabilityFlag::Prompts, METHOD_PROMPTS_GET)?;
        request_with_retry(
            &self.client,
            METHOD_PROMPTS_GET,
            GetPromptParams {
                name: name.to_string(),
                arguments,
            },
            &self.retry,
        )
        .await
    }

    /// Ask the server to generate a completion sample.
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult> {
        self.require(ServerCapabilityFlag::Sampling, METHOD_SAMPLING_CREATE_MESSAGE)?;
        request_with_retry(
            &self.client,
            METHOD_SAMPLING_CREATE_MESSAGE,
            params,
            &self.retry,
        )
        .await
    }

    /// Request argument completions for a prompt or resource template.
    pub async fn complete(&self, params: CompleteParams) -> Result<CompleteResult> {
        self.require(ServerCapabilityFlag::Completions, METHOD_COMPLETION_COMPLETE)?;
        request_with_retry(&self.client, METHOD_COMPLETION_COMPLETE, params, &self.retry).await
    }

    /// List the server's filesystem roots.
    pub async fn list_roots(&self) -> Result<Vec<Root>> {
        self.require(ServerCapabilityFlag::Roots, METHOD_ROOTS_LIST)?;
        let result: ListRootsResult =
            request_with_retry(&self.client, METHOD_ROOTS_LIST, serde_json::json!({}), &self.retry)
                .await?;
        Ok(result.roots)
    }

    /// Liveness check. Always available; never gated on a capability.
    pub async fn ping(&self) -> Result<()> {
        let _: serde_json::Value =
            request_with_retry(&self.client, METHOD_PING, serde_json::json!({}), &self.retry)
                .await?;
        Ok(())
    }

    /// Subscribe to a server notification method.
    pub fn notifications(&self, method: impl Into<String>) -> NotificationStream {
        self.client.subscribe(method)
    }

    /// Register a handler for a server-initiated request (e.g.
    /// `sampling/createMessage` round trips started by the server).
    pub fn on_server_request<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(
                serde_json::Value,
            ) -> crate::client::BoxFuture<
                'static,
                std::result::Result<serde_json::Value, crate::frame::ErrorObject>,
            > + Send
            + Sync
            + 'static,
    {
        self.client.on_server_request(method, handler);
    }

    /// End the session: stop the read loop, fail in-flight requests with
    /// `TransportClosed`, and close the transport. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.client.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
