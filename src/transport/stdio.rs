//! Stdio transport for MCP child-process servers
//!
//! This module implements [`StdioTransport`], which spawns a child process
//! and communicates with it over its stdin/stdout pipes using
//! newline-delimited JSON framing. This is the standard transport for
//! locally-installed MCP servers.
//!
//! # Protocol
//!
//! - Outbound messages are written to the child's stdin as a single JSON
//!   object followed by a newline (`\n`), then flushed.
//! - Inbound messages are read from the child's stdout, one JSON object per
//!   line; surrounding whitespace is trimmed and empty lines are skipped.
//! - The child's stderr is forwarded to a diagnostic channel and logged via
//!   `tracing::debug!`. Per the MCP specification, stderr output MUST NOT
//!   be treated as an error condition.
//!
//! # Lifecycle
//!
//! [`StdioTransport::new`] captures the [`ServerConfig`] and nothing else.
//! The subprocess, all channels, and the writer/reader/stderr tasks are
//! created inside [`Transport::open`]; constructing the handle while
//! another concurrent scope is active on the same runtime is therefore
//! always safe. [`Transport::close`] is idempotent: it closes the child's
//! stdin (delivering EOF), cancels the I/O tasks, and reaps the process
//! with a bounded wait before resorting to a kill. Dropping an open
//! transport sends a best-effort SIGTERM (Unix) or `start_kill` (elsewhere).

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{Result, XzmcpError};
use crate::transport::{Transport, TransportState};

/// Depth of the inbound frame channel. A full channel blocks the reader
/// task, applying backpressure to the child.
const INBOUND_CHANNEL_DEPTH: usize = 100;

/// Depth of the outbound frame channel; senders suspend when full.
const OUTBOUND_CHANNEL_DEPTH: usize = 64;

/// Depth of the stderr diagnostic channel.
const STDERR_CHANNEL_DEPTH: usize = 100;

/// How long `close()` waits for the child to exit after stdin EOF before
/// killing it.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `close()` waits for each I/O task to finish.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime-bound half of the transport; exists only between `open()` and
/// `close()`.
#[derive(Debug)]
struct OpenState {
    /// Sender side of the stdin channel; `send()` writes here.
    stdin_tx: mpsc::Sender<String>,
    /// Shared receiver for stdout lines (one JSON message per line).
    stdout_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    /// Shared receiver for stderr lines (diagnostics only).
    stderr_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    /// Spawned child; owned here for reaping in `close()`.
    child: Child,
    /// Child PID captured at spawn time, for the `Drop` signal path.
    pid: Option<u32>,
    /// Cancels the reader and stderr tasks.
    shutdown: CancellationToken,
    /// Writer task handle.
    writer: JoinHandle<()>,
    /// Reader task handle.
    reader: JoinHandle<()>,
    /// Stderr drain task handle.
    stderr_task: JoinHandle<()>,
}

#[derive(Debug)]
enum State {
    Unopened,
    Open(Box<OpenState>),
    Closed,
}

/// Stdio-based MCP transport that drives a child process.
///
/// # Examples
///
/// ```no_run
/// use xzmcp::config::ServerConfig;
/// use xzmcp::transport::{stdio::StdioTransport, Transport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = StdioTransport::new(ServerConfig::new("npx").args([
///     "-y",
///     "@modelcontextprotocol/server-filesystem",
///     "/tmp",
/// ]));
/// transport.open().await?;
/// // ... use the transport ...
/// transport.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StdioTransport {
    config: ServerConfig,
    /// Lock discipline: held only for state inspection and swaps, never
    /// across an await.
    state: Mutex<State>,
}

impl StdioTransport {
    /// Capture launch parameters. No subprocess is spawned and no channel
    /// or task is created until [`Transport::open`] runs.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Unopened),
        }
    }

    /// Spawn the child and wire up the three I/O tasks.
    fn spawn_child(&self) -> Result<OpenState> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.envs(self.config.resolved_env());
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            XzmcpError::Transport(format!(
                "failed to spawn MCP server `{}`: {}",
                self.config.command, e
            ))
        })?;

        // Each handle is Some because Stdio::piped() was set above.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| XzmcpError::Transport("child stdin unavailable after spawn".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| XzmcpError::Transport("child stdout unavailable after spawn".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| XzmcpError::Transport("child stderr unavailable after spawn".into()))?;

        let pid = child.id();
        let shutdown = CancellationToken::new();

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_DEPTH);
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(INBOUND_CHANNEL_DEPTH);
        let (stderr_tx, stderr_rx) = mpsc::channel::<String>(STDERR_CHANNEL_DEPTH);

        // Writer task: drain the outbound queue to child stdin, one line
        // per frame, flushed. Exits when the channel closes (close()) or
        // the pipe breaks (child death).
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = stdin_rx.recv().await {
                let line = format!("{}\n", msg);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            // Dropping stdin here delivers EOF to the child.
        });

        // Reader task: frame child stdout into trimmed lines. A full
        // inbound channel suspends this task (backpressure). EOF means the
        // child exited; the dropped sender ends the receive() stream.
        let reader_token = shutdown.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    biased;
                    _ = reader_token.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let msg = trimmed.to_string();
                        tokio::select! {
                            biased;
                            _ = reader_token.cancelled() => break,
                            sent = stdout_tx.send(msg) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("mcp server stdout reached EOF");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("mcp server stdout read error: {}", e);
                        break;
                    }
                }
            }
        });

        // Stderr drain task: diagnostics only, never part of the frame
        // stream.
        let stderr_token = shutdown.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                let line = tokio::select! {
                    biased;
                    _ = stderr_token.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        tracing::debug!(target: "xzmcp::transport::stdio", "mcp server stderr: {}", line);
                        // A slow or absent diagnostic consumer must not
                        // stall the drain.
                        let _ = stderr_tx.try_send(line);
                    }
                    _ => break,
                }
            }
        });

        Ok(OpenState {
            stdin_tx,
            stdout_rx: Arc::new(tokio::sync::Mutex::new(stdout_rx)),
            stderr_rx: Arc::new(tokio::sync::Mutex::new(stderr_rx)),
            child,
            pid,
            shutdown,
            writer,
            reader,
            stderr_task,
        })
    }
}

/// Turn a shared receiver into an owned stream.
fn channel_stream(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
) -> std::pin::Pin<Box<dyn Stream<Item = String> + Send + 'static>> {
    Box::pin(futures::stream::unfold(rx, |rx| async move {
        let item = {
            let mut guard = rx.lock().await;
            guard.recv().await
        }?;
        Some((item, rx))
    }))
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn open(&self) -> Result<()> {
        // Reject re-open and open-after-close before doing any work.
        {
            let state = self.state.lock().expect("transport state lock poisoned");
            match &*state {
                State::Unopened => {}
                State::Open(_) => {
                    return Err(XzmcpError::Transport("transport already open".into()).into())
                }
                State::Closed => return Err(XzmcpError::TransportClosed.into()),
            }
        }

        let open = self.spawn_child()?;

        let mut state = self.state.lock().expect("transport state lock poisoned");
        match &*state {
            State::Unopened => {
                *state = State::Open(Box::new(open));
                Ok(())
            }
            // Lost a race with a concurrent open() or close(); tear down
            // the child we just spawned.
            _ => {
                open.shutdown.cancel();
                #[cfg(unix)]
                if let Some(pid) = open.pid {
                    // SAFETY: pid was obtained from the freshly spawned child.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                #[cfg(not(unix))]
                {
                    let mut open = open;
                    let _ = open.child.start_kill();
                }
                Err(XzmcpError::Transport("transport opened concurrently".into()).into())
            }
        }
    }

    async fn send(&self, message: String) -> Result<()> {
        // Clone the sender out of the lock so the bounded send below never
        // suspends while the state lock is held.
        let stdin_tx = {
            let state = self.state.lock().expect("transport state lock poisoned");
            match &*state {
                State::Open(open) => open.stdin_tx.clone(),
                _ => return Err(XzmcpError::TransportClosed.into()),
            }
        };

        stdin_tx
            .send(message)
            .await
            .map_err(|_| XzmcpError::Transport("child process stdin is gone".into()).into())
    }

    fn receive(&self) -> std::pin::Pin<Box<dyn Stream<Item = String> + Send + 'static>> {
        let state = self.state.lock().expect("transport state lock poisoned");
        match &*state {
            State::Open(open) => channel_stream(Arc::clone(&open.stdout_rx)),
            _ => Box::pin(futures::stream::empty()),
        }
    }

    fn receive_err(&self) -> std::pin::Pin<Box<dyn Stream<Item = String> + Send + 'static>> {
        let state = self.state.lock().expect("transport state lock poisoned");
        match &*state {
            State::Open(open) => channel_stream(Arc::clone(&open.stderr_rx)),
            _ => Box::pin(futures::stream::empty()),
        }
    }

    async fn close(&self) -> Result<()> {
        let open = {
            let mut state = self.state.lock().expect("transport state lock poisoned");
            match std::mem::replace(&mut *state, State::Closed) {
                State::Open(open) => open,
                // Unopened or already Closed: nothing to tear down.
                _ => return Ok(()),
            }
        };

        let OpenState {
            stdin_tx,
            child,
            shutdown,
            writer,
            reader,
            stderr_task,
            ..
        } = *open;
        let mut child = child;

        // Closing the outbound channel lets the writer drain and exit,
        // which drops stdin and delivers EOF to the child.
        drop(stdin_tx);
        shutdown.cancel();

        for mut handle in [writer, reader, stderr_task] {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("stdio transport task did not stop within {TASK_JOIN_TIMEOUT:?}");
                handle.abort();
            }
        }

        // Bounded wait for a graceful exit, then force-terminate.
        match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("mcp server exited with {}", status);
            }
            Ok(Err(e)) => {
                tracing::warn!("failed to reap mcp server: {}", e);
            }
            Err(_) => {
                tracing::warn!("mcp server did not exit within {REAP_TIMEOUT:?}; killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        Ok(())
    }

    fn state(&self) -> TransportState {
        let state = self.state.lock().expect("transport state lock poisoned");
        match &*state {
            State::Unopened => TransportState::Unopened,
            State::Open(_) => TransportState::Open,
            State::Closed => TransportState::Closed,
        }
    }
}

impl Drop for StdioTransport {
    /// Best-effort termination of the child process on drop.
    ///
    /// On Unix, sends SIGTERM to the child PID via `libc::kill`. On
    /// non-Unix platforms, calls `start_kill()` on the child handle. This
    /// method MUST NOT block.
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let State::Open(open) = &mut *state {
            #[cfg(unix)]
            {
                if let Some(pid) = open.pid {
                    // SAFETY: pid is a valid process ID obtained from
                    // tokio::process::Child at spawn time.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = open.child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn cat_transport() -> StdioTransport {
        StdioTransport::new(ServerConfig::new("cat"))
    }

    #[test]
    fn test_new_allocates_no_runtime_primitives() {
        // Constructing handles must work with no runtime at all; this test
        // body runs outside any tokio context.
        let handles: Vec<StdioTransport> = (0..100).map(|_| cat_transport()).collect();
        for t in &handles {
            assert_eq!(t.state(), TransportState::Unopened);
        }
    }

    #[tokio::test]
    async fn test_open_nonexistent_executable_returns_error() {
        let transport = StdioTransport::new(ServerConfig::new(
            "/nonexistent/binary/that/does/not/exist",
        ));
        let result = transport.open().await;
        assert!(result.is_err(), "expected error for missing executable");
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("failed to spawn"), "unexpected error: {msg}");
    }

    #[tokio::test]
    async fn test_send_before_open_is_transport_closed() {
        let transport = cat_transport();
        let err = transport.send("{}".to_string()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<XzmcpError>(),
            Some(XzmcpError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_echo_roundtrip_through_child() {
        let transport = cat_transport();
        if transport.open().await.is_err() {
            return; // `cat` unavailable in this environment
        }

        let msg = r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#.to_string();
        transport.send(msg.clone()).await.unwrap();

        let mut stream = transport.receive();
        let received = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended unexpectedly");
        assert_eq!(received, msg);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_observable() {
        let transport = cat_transport();
        if transport.open().await.is_err() {
            return;
        }
        assert_eq!(transport.state(), TransportState::Open);

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);

        // Second close is a no-op.
        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);

        // Operations after close fail with TransportClosed.
        let err = transport.send("{}".to_string()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<XzmcpError>(),
            Some(XzmcpError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_unopened_transport_is_a_no_op() {
        let transport = cat_transport();
        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);

        // A closed transport can never be opened.
        let err = transport.open().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<XzmcpError>(),
            Some(XzmcpError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_receive_ends_on_child_death() {
        let transport = cat_transport();
        if transport.open().await.is_err() {
            return;
        }

        let mut stream = transport.receive();

        // Closing stdin makes `cat` exit, which must end the stream rather
        // than hang it.
        {
            let mut state = transport.state.lock().unwrap();
            if let State::Open(open) = &mut *state {
                let (replacement_tx, _rx) = mpsc::channel(1);
                let stdin_tx = std::mem::replace(&mut open.stdin_tx, replacement_tx);
                drop(stdin_tx);
            }
        }

        let eof = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream did not end after child exit");
        assert!(eof.is_none(), "expected end-of-stream, got {eof:?}");

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_whitespace_and_empty_lines_are_skipped() {
        // `printf` writes a blank line, a padded line, and a normal line;
        // only the two JSON payloads may surface.
        let transport = StdioTransport::new(
            ServerConfig::new("printf").args([r#"\n  {"a":1}  \n{"b":2}\n"#]),
        );
        if transport.open().await.is_err() {
            return;
        }

        let mut stream = transport.receive();
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, r#"{"a":1}"#);
        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, r#"{"b":2}"#);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_with_working_dir_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = StdioTransport::new(ServerConfig::new("cat").cwd(tmp.path()));
        if transport.open().await.is_ok() {
            transport.close().await.unwrap();
        }
    }
}
