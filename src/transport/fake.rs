//! In-process fake transport for unit and integration tests
//!
//! [`FakeTransport::new`] returns a `(FakeTransport, FakeTransportHandle)`
//! pair. Wire the transport into the code under test; from the test side,
//! use the handle to read what the client sent (`handle.outbound_rx`) and
//! to inject server messages (`handle.inbound_tx`).
//!
//! The fake honours the transport lifecycle: operations before `open()`
//! and after `close()` fail with `TransportClosed`, and `close()` ends the
//! inbound stream the same way child-process death does on the stdio
//! transport.

use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, XzmcpError};
use crate::transport::{Transport, TransportState};

const STATE_UNOPENED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// In-process fake transport for use in tests.
#[derive(Debug)]
pub struct FakeTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    inbound_inject_tx: mpsc::UnboundedSender<String>,
    /// Ends every receive() stream on close, even one parked in recv().
    closed: CancellationToken,
    state: AtomicU8,
}

/// Test-side handle complementing a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    /// Frames the client sent, in submission order.
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    /// Inject serialized server messages here.
    pub inbound_tx: mpsc::UnboundedSender<String>,
}

impl FakeTransportHandle {
    /// Inject a JSON value as one inbound message.
    pub fn inject(&self, value: serde_json::Value) {
        let _ = self.inbound_tx.send(value.to_string());
    }
}

impl FakeTransport {
    /// Create a new `(FakeTransport, FakeTransportHandle)` pair.
    pub fn new() -> (Self, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let transport = Self {
            outbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            inbound_inject_tx: inbound_tx.clone(),
            closed: CancellationToken::new(),
            state: AtomicU8::new(STATE_UNOPENED),
        };

        (
            transport,
            FakeTransportHandle {
                outbound_rx,
                inbound_tx,
            },
        )
    }

    /// Create an already-opened fake, for tests that do not exercise the
    /// lifecycle.
    pub fn opened() -> (Self, FakeTransportHandle) {
        let (transport, handle) = Self::new();
        transport.state.store(STATE_OPEN, Ordering::SeqCst);
        (transport, handle)
    }

    /// Inject a JSON value as one inbound message, without the handle.
    pub fn inject_response(&self, value: serde_json::Value) {
        let _ = self.inbound_inject_tx.send(value.to_string());
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn open(&self) -> Result<()> {
        match self.state.compare_exchange(
            STATE_UNOPENED,
            STATE_OPEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(STATE_OPEN) => {
                Err(XzmcpError::Transport("transport already open".into()).into())
            }
            Err(_) => Err(XzmcpError::TransportClosed.into()),
        }
    }

    async fn send(&self, message: String) -> Result<()> {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Err(XzmcpError::TransportClosed.into());
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| XzmcpError::Transport("fake outbound channel closed".into()).into())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + 'static>> {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Box::pin(futures::stream::empty());
        }
        let rx = Arc::clone(&self.inbound_rx);
        let closed = self.closed.clone();
        Box::pin(futures::stream::unfold(
            (rx, closed),
            |(rx, closed)| async move {
                let item = {
                    let mut guard = rx.lock().await;
                    tokio::select! {
                        _ = closed.cancelled() => None,
                        item = guard.recv() => item,
                    }
                }?;
                Some((item, (rx, closed)))
            },
        ))
    }

    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + 'static>> {
        Box::pin(futures::stream::empty())
    }

    async fn close(&self) -> Result<()> {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        // End the inbound stream the way EOF does on a real transport. The
        // token (rather than Receiver::close) avoids contending on the
        // receiver lock with a stream parked in recv().
        self.closed.cancel();
        Ok(())
    }

    fn state(&self) -> TransportState {
        match self.state.load(Ordering::SeqCst) {
            STATE_UNOPENED => TransportState::Unopened,
            STATE_OPEN => TransportState::Open,
            _ => TransportState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_send_and_inject_roundtrip() {
        let (transport, mut handle) = FakeTransport::opened();

        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
            .await
            .unwrap();
        let sent = handle.outbound_rx.recv().await.unwrap();
        assert!(sent.contains("ping"));

        handle.inject(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        let received = transport.receive().next().await.unwrap();
        assert!(received.contains("result"));
    }

    #[tokio::test]
    async fn test_lifecycle_is_enforced() {
        let (transport, _handle) = FakeTransport::new();
        assert_eq!(transport.state(), TransportState::Unopened);

        let err = transport.send("{}".to_string()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<XzmcpError>(),
            Some(XzmcpError::TransportClosed)
        ));

        assert_ok!(transport.open().await);
        assert_eq!(transport.state(), TransportState::Open);

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(transport.open().await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_inbound_stream() {
        let (transport, handle) = FakeTransport::opened();
        let mut stream = transport.receive();
        handle.inject(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        assert!(stream.next().await.is_some());

        transport.close().await.unwrap();
        assert!(stream.next().await.is_none(), "stream must end after close");
    }
}
