//! Async JSON-RPC 2.0 request correlator
//!
//! [`JsonRpcClient`] multiplexes concurrent requests over a single
//! [`Transport`]: it assigns IDs, registers a completion sink per in-flight
//! request, hands frames to the transport, and routes inbound frames back to
//! the right sink. Server notifications go to the embedded
//! [`NotificationDispatcher`]; server-initiated requests go to registered
//! handlers, defaulting to JSON-RPC `-32601 Method not found`.
//!
//! # Design
//!
//! - The client knows the transport; the transport never references the
//!   client. The read loop holds a clone of the client's shared state, so
//!   references stay one-directional.
//! - In-flight requests live in a map keyed by [`RequestId`] behind a
//!   `std::sync::Mutex`. The lock is held only to insert or remove entries,
//!   never across an await and never while firing a completion sink.
//! - Every submitted request resolves exactly once: with the response, a
//!   classified error, a cancellation, or `TransportClosed` when the
//!   connection goes away. IDs are never reused within a connection.
//! - A [`tokio_util::sync::CancellationToken`] stops the read loop; both
//!   the shutdown and EOF paths drain the in-flight map so no caller waits
//!   forever.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, XzmcpError};
use crate::frame::{ErrorObject, Frame, RequestId};
use crate::notify::{NotificationDispatcher, NotificationStream};
use crate::transport::Transport;
use crate::types::{CODE_INTERNAL_ERROR, CODE_METHOD_NOT_FOUND, NOTIF_CANCELLED};

/// Default timeout applied to every request when the caller does not
/// specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Convenience alias for a boxed, `Send`-safe async future.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A server-request handler: called with the raw `params` value and
/// returning either a raw `result` value or a JSON-RPC error object.
type ServerRequestHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<serde_json::Value, ErrorObject>>
        + Send
        + Sync
        + 'static,
>;

/// What a completion sink delivers: the raw `result` value or a classified
/// error.
type Outcome = std::result::Result<serde_json::Value, XzmcpError>;

/// One in-flight request: diagnostics plus the single-shot completion sink.
struct InFlight {
    method: String,
    tx: oneshot::Sender<Outcome>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    /// Monotonically increasing request ID counter; IDs are unique for the
    /// lifetime of the connection and never reused.
    next_id: AtomicI64,
    /// In-flight requests waiting for a response. Short-held lock, never
    /// held across a suspension point.
    pending: Mutex<HashMap<RequestId, InFlight>>,
    /// Registered handlers for server-initiated requests (method -> handler).
    server_handlers: Mutex<HashMap<String, ServerRequestHandler>>,
    /// Fan-out for server notifications.
    notifications: NotificationDispatcher,
    /// Stops the read loop and fences new submissions.
    shutdown: CancellationToken,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("next_id", &self.inner.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Transport-driving async JSON-RPC 2.0 client.
///
/// Cheap to clone; clones share the same transport, in-flight map, and
/// dispatcher.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use xzmcp::client::JsonRpcClient;
/// use xzmcp::config::ServerConfig;
/// use xzmcp::transport::{stdio::StdioTransport, Transport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = Arc::new(StdioTransport::new(ServerConfig::new("my-mcp-server")));
/// transport.open().await?;
///
/// let client = JsonRpcClient::new(transport);
/// client.start_read_loop();
///
/// let pong: serde_json::Value = client.request("ping", serde_json::json!({}), None).await?;
/// client.shutdown().await?;
/// # let _ = pong;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JsonRpcClient {
    inner: Arc<ClientInner>,
}

/// Handle to one submitted request.
///
/// Await the outcome with [`PendingCall::wait`], or abandon it by dropping
/// the handle — the in-flight entry is removed either way, so a late
/// response is discarded instead of leaking.
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    rx: Option<oneshot::Receiver<Outcome>>,
    client: JsonRpcClient,
}

impl PendingCall {
    /// The ID assigned to this request; pass to [`JsonRpcClient::cancel`].
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Await the single outcome of this request.
    ///
    /// Dropping the returned future mid-await abandons the request and
    /// removes its in-flight entry.
    pub async fn wait(mut self) -> Result<serde_json::Value> {
        let rx = self.rx.as_mut().expect("receiver present until completion");
        let outcome = rx.await;
        // The sink fired or is gone; either way the map entry no longer
        // exists, so Drop has nothing to clean up.
        self.rx = None;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            // The sink was dropped without firing: the connection is gone.
            Err(_) => Err(XzmcpError::TransportClosed.into()),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // If the caller abandoned the request (timeout, drop) the entry
        // must not linger; removing it makes any late response for this ID
        // a discard instead of a leak.
        if self.rx.is_some() {
            let mut pending = self
                .client
                .inner
                .pending
                .lock()
                .expect("pending lock poisoned");
            pending.remove(&self.id);
        }
    }
}

impl JsonRpcClient {
    /// Create a client over an opened transport.
    ///
    /// Call [`JsonRpcClient::start_read_loop`] before issuing requests.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                server_handlers: Mutex::new(HashMap::new()),
                notifications: NotificationDispatcher::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start the read loop as a background Tokio task.
    ///
    /// The loop consumes the transport's inbound stream and dispatches each
    /// frame: responses resolve their in-flight entry, notifications go to
    /// the dispatcher, server-initiated requests go to their handler (or a
    /// `-32601` reply). Malformed frames are logged and skipped; they never
    /// terminate the connection.
    ///
    /// When the stream ends (peer death) every in-flight request fails with
    /// a retryable transport error; on [`JsonRpcClient::shutdown`] they
    /// fail with `TransportClosed`.
    pub fn start_read_loop(&self) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut stream = inner.transport.receive();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = inner.shutdown.cancelled() => {
                        // shutdown() drains the map itself; this catches
                        // any submit that raced past the fence.
                        fail_all_pending(&inner, |_| XzmcpError::TransportClosed);
                        break;
                    }

                    maybe_msg = stream.next() => {
                        match maybe_msg {
                            Some(raw) => dispatch_frame(&inner, &raw),
                            None => {
                                // EOF: the subprocess (or peer) went away.
                                fail_all_pending(&inner, |_| XzmcpError::Transport(
                                    "transport stream ended before a response arrived".to_string(),
                                ));
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Submit a request and receive a [`PendingCall`] handle.
    ///
    /// The completion slot is registered before the frame is handed to the
    /// transport, so a response can never arrive before the client is ready
    /// to route it.
    pub async fn submit(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<PendingCall> {
        if self.inner.shutdown.is_cancelled() {
            return Err(XzmcpError::TransportClosed.into());
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            pending.insert(
                id.clone(),
                InFlight {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        let frame = Frame::request(id.clone(), method, params);
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                self.remove_pending(&id);
                return Err(e);
            }
        };

        if let Err(e) = self.inner.transport.send(encoded).await {
            self.remove_pending(&id);
            return Err(e);
        }

        Ok(PendingCall {
            id,
            rx: Some(rx),
            client: self.clone(),
        })
    }

    /// Send a request and await the typed response.
    ///
    /// Assigns the next monotonic ID, hands the frame to the transport, and
    /// waits for the matching response with a timeout (default
    /// [`DEFAULT_REQUEST_TIMEOUT`]). On timeout the in-flight entry is
    /// destroyed, so a late response is discarded with a diagnostic.
    ///
    /// # Errors
    ///
    /// Returns [`XzmcpError::Timeout`] when the deadline passes,
    /// [`XzmcpError::Rpc`] when the server answers with an error response,
    /// [`XzmcpError::TransportClosed`] / [`XzmcpError::Transport`] when the
    /// connection is gone, and [`XzmcpError::Serialization`] when the
    /// result does not match the caller's expected type.
    pub async fn request<P, R>(&self, method: &str, params: P, timeout: Option<Duration>) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(XzmcpError::Serialization)?;
        let call = self.submit(method, Some(params)).await?;

        let deadline = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let value = match tokio::time::timeout(deadline, call.wait()).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                // call was dropped by the timeout; its entry is gone.
                return Err(XzmcpError::Timeout {
                    method: method.to_string(),
                }
                .into());
            }
        };

        serde_json::from_value(value).map_err(|e| XzmcpError::Serialization(e).into())
    }

    /// Send a notification (no `id`, no response expected).
    pub async fn notify<P: serde::Serialize + Send>(&self, method: &str, params: P) -> Result<()> {
        let params = serde_json::to_value(params).map_err(XzmcpError::Serialization)?;
        let frame = Frame::notification(method, Some(params));
        self.inner.transport.send(frame.encode()?).await
    }

    /// Cancel an in-flight request.
    ///
    /// The entry is removed, its sink fires with
    /// [`XzmcpError::Cancelled`], and a best-effort
    /// `notifications/cancelled` is sent to the server. Cancelling a
    /// request that already resolved is a no-op.
    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) {
        let entry = {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            pending.remove(id)
        };

        let Some(entry) = entry else {
            return;
        };

        let _ = entry.tx.send(Err(XzmcpError::Cancelled {
            method: entry.method.clone(),
        }));

        let params = crate::types::CancelledParams {
            request_id: id.clone(),
            reason: reason.map(String::from),
        };
        if let Err(e) = self.notify(NOTIF_CANCELLED, params).await {
            tracing::debug!("could not send cancellation notification: {e}");
        }
    }

    /// Subscribe to a server notification method.
    pub fn subscribe(&self, method: impl Into<String>) -> NotificationStream {
        self.inner.notifications.subscribe(method)
    }

    /// Register a handler for a server-initiated request.
    ///
    /// When the read loop receives a request frame with a matching method,
    /// the handler runs on its own task (the reader is never blocked) and
    /// its return value is sent back as the response. Registering a second
    /// handler for the same method replaces the first.
    pub fn on_server_request<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<serde_json::Value, ErrorObject>>
            + Send
            + Sync
            + 'static,
    {
        let mut handlers = self
            .inner
            .server_handlers
            .lock()
            .expect("handlers lock poisoned");
        handlers.insert(method.into(), Arc::new(handler));
    }

    /// Stop the read loop, fail every in-flight request with
    /// `TransportClosed`, and close the transport.
    ///
    /// Idempotent; safe to call from any exit path.
    pub async fn shutdown(&self) -> Result<()> {
        fail_all_pending(&self.inner, |_| XzmcpError::TransportClosed);
        self.inner.shutdown.cancel();
        self.inner.transport.close().await
    }

    /// The transport this client drives.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    fn remove_pending(&self, id: &RequestId) {
        let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
        pending.remove(id);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

/// Drain the in-flight map, firing each sink with the given error.
fn fail_all_pending(inner: &ClientInner, make_err: impl Fn(&str) -> XzmcpError) {
    let drained: Vec<InFlight> = {
        let mut pending = inner.pending.lock().expect("pending lock poisoned");
        pending.drain().map(|(_, entry)| entry).collect()
    };
    for entry in drained {
        let method = entry.method.clone();
        let _ = entry.tx.send(Err(make_err(&method)));
    }
}

/// Classify and dispatch a single inbound frame.
///
/// Extracted from the loop body so the dispatch logic is unit-testable.
/// Synchronous: server-request handlers run on their own task, so the
/// reader is never blocked and never holds a lock while a sink fires.
fn dispatch_frame(inner: &Arc<ClientInner>, raw: &str) {
    let frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            // One bad frame never terminates the connection.
            tracing::warn!("skipping malformed inbound frame: {e}");
            return;
        }
    };

    match frame {
        Frame::Response { id, result } => complete(inner, &id, Ok(result)),
        Frame::Error { id: Some(id), error } => complete(
            inner,
            &id,
            Err(XzmcpError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
        ),
        Frame::Error { id: None, error } => {
            tracing::warn!(
                "server reported an error not tied to a request: {} (code {})",
                error.message,
                error.code
            );
        }
        Frame::Notification { method, params } => {
            inner
                .notifications
                .dispatch(&method, params.unwrap_or(serde_json::Value::Null));
        }
        Frame::Request { id, method, params } => {
            handle_server_request(inner, id, method, params.unwrap_or(serde_json::Value::Null));
        }
    }
}

/// Resolve an in-flight entry. The lock is released before the sink fires.
fn complete(inner: &ClientInner, id: &RequestId, outcome: Outcome) {
    let entry = {
        let mut pending = inner.pending.lock().expect("pending lock poisoned");
        pending.remove(id)
    };

    match entry {
        Some(entry) => {
            // Ignore send errors: the caller may have timed out or been
            // cancelled after we removed the entry.
            let _ = entry.tx.send(outcome);
        }
        None => {
            tracing::debug!("response for unknown or abandoned request id {id}; discarding");
        }
    }
}

/// Run the registered handler for a server-initiated request on its own
/// task and send the response, echoing the server's ID byte-for-byte.
fn handle_server_request(
    inner: &Arc<ClientInner>,
    id: RequestId,
    method: String,
    params: serde_json::Value,
) {
    let handler = {
        let handlers = inner
            .server_handlers
            .lock()
            .expect("handlers lock poisoned");
        handlers.get(&method).cloned()
    };

    let transport = Arc::clone(&inner.transport);
    tokio::spawn(async move {
        let frame = match handler {
            Some(handler) => match handler(params).await {
                Ok(result) => Frame::Response { id, result },
                Err(error) => Frame::Error {
                    id: Some(id),
                    error,
                },
            },
            None => Frame::Error {
                id: Some(id),
                error: ErrorObject {
                    code: CODE_METHOD_NOT_FOUND,
                    message: format!("Method not found: {method}"),
                    data: None,
                },
            },
        };

        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("could not encode server-request response: {e}");
                let fallback = Frame::Error {
                    id: None,
                    error: ErrorObject {
                        code: CODE_INTERNAL_ERROR,
                        message: "internal error".to_string(),
                        data: None,
                    },
                };
                match fallback.encode() {
                    Ok(encoded) => encoded,
                    Err(_) => return,
                }
            }
        };

        if let Err(e) = transport.send(encoded).await {
            tracing::debug!("could not send server-request response: {e}");
        }
    });
}
