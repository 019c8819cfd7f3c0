//! Newline-delimited JSON-RPC transport with request/response correlation.
//!
//! One transport owns the write half of a child's stdin. Outbound writes
//! are serialized by the writer lock (one full line + flush),
//! while the wait for a response happens outside that lock on a oneshot
//! slot registered in [`PendingRequests`]. An independent read loop
//! ([`read_responses`]) resolves slots by id, so responses may arrive in
//! any order and concurrent callers never block each other's round-trips.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport is closed")]
    Closed,

    #[error("request {id} timed out after {}ms", .after.as_millis())]
    Timeout { id: u64, after: Duration },

    #[error("write timed out after {}ms", .after.as_millis())]
    WriteTimeout { after: Duration },

    #[error("request cancelled: {0}")]
    Cancelled(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending request table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome delivered to a waiting caller: the response, or the reason the
/// request was cancelled.
type SlotResult = Result<JsonRpcResponse, String>;

struct PendingInner {
    slots: HashMap<u64, oneshot::Sender<SlotResult>>,
    /// Set once the table has been drained; later registrations fail.
    closed: Option<String>,
}

/// In-flight requests keyed by id.
///
/// Each slot leaves the table exactly once: resolved by a matching
/// response, removed on timeout, or cancelled by [`cancel_all`].
///
/// [`cancel_all`]: PendingRequests::cancel_all
pub struct PendingRequests {
    inner: Mutex<PendingInner>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PendingInner {
                slots: HashMap::new(),
                closed: None,
            }),
        }
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<SlotResult>, TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        let prev = inner.slots.insert(id, tx);
        debug_assert!(prev.is_none(), "request id reused while pending: {id}");
        Ok(rx)
    }

    /// Hand a response to the waiter registered under its id.
    ///
    /// Returns `false` when nobody is waiting (unknown id, or the request
    /// already timed out); the response is dropped in that case.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        let slot = self.inner.lock().slots.remove(&id);
        match slot {
            Some(tx) => {
                // The receiver may have been dropped by a racing timeout.
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Forget a request without resolving it.
    pub fn remove(&self, id: u64) -> bool {
        self.inner.lock().slots.remove(&id).is_some()
    }

    /// Fail every pending request with `reason` and refuse new ones.
    /// Returns the number of requests cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_string());
            }
            inner.slots.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(reason.to_string()));
        }
        count
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Writer side
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How long `close` waits for the writer lock and the final shutdown.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// JSON-RPC client half over any line-oriented byte sink.
///
/// Every request is bounded by one deadline covering the wait for the
/// writer, the write itself, and the wait for the response. A write that
/// misses its deadline or fails may have left a partial line behind, so
/// the writer is dropped and the transport reports [`is_broken`].
///
/// [`is_broken`]: JsonRpcTransport::is_broken
pub struct JsonRpcTransport<W> {
    server_id: String,
    /// `None` once the transport has been closed or broken.
    writer: tokio::sync::Mutex<Option<W>>,
    next_id: AtomicU64,
    /// Fired by `close` and by a broken write; in-flight writers give up.
    closed: CancellationToken,
    broken: AtomicBool,
    pending: Arc<PendingRequests>,
    request_timeout: Duration,
}

/// The transport used for child processes.
pub type StdioTransport = JsonRpcTransport<ChildStdin>;

enum WriteError {
    Deadline,
    Failed(TransportError),
}

impl<W> JsonRpcTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        server_id: impl Into<String>,
        writer: W,
        pending: Arc<PendingRequests>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            broken: AtomicBool::new(false),
            pending,
            request_timeout,
        }
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send a request and wait for the response carrying the same id.
    ///
    /// Only the line write is serialized; the wait for the response runs
    /// without holding the writer. The whole call, including waiting for
    /// the writer, is bounded by `request_timeout`.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let deadline = Instant::now() + self.request_timeout;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        let rx = self.pending.register(id)?;

        tracing::debug!(server_id = %self.server_id, id, method, "sending MCP request");
        match self.write_by(&line, deadline).await {
            Ok(()) => {}
            Err(WriteError::Failed(e)) => {
                self.pending.remove(id);
                return Err(e);
            }
            Err(WriteError::Deadline) => {
                self.pending.remove(id);
                tracing::warn!(
                    server_id = %self.server_id,
                    id,
                    method,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "MCP request write stalled past its deadline"
                );
                return Err(self.timeout_error(id));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(reason))) => Err(TransportError::Cancelled(reason)),
            Ok(Err(_)) => Err(TransportError::Cancelled("response slot dropped".into())),
            Err(_) => {
                self.pending.remove(id);
                tracing::warn!(
                    server_id = %self.server_id,
                    id,
                    method,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "MCP request timed out"
                );
                Err(self.timeout_error(id))
            }
        }
    }

    fn timeout_error(&self, id: u64) -> TransportError {
        TransportError::Timeout {
            id,
            after: self.request_timeout,
        }
    }

    /// Send a notification (no id, no response).
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportError> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        tracing::debug!(server_id = %self.server_id, method, "sending MCP notification");
        let deadline = Instant::now() + self.request_timeout;
        match self.write_by(&line, deadline).await {
            Ok(()) => Ok(()),
            Err(WriteError::Failed(e)) => Err(e),
            Err(WriteError::Deadline) => Err(TransportError::WriteTimeout {
                after: self.request_timeout,
            }),
        }
    }

    /// Write one line, giving up at `deadline` or when the transport closes.
    async fn write_by(&self, line: &str, deadline: Instant) -> Result<(), WriteError> {
        let mut writer = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(WriteError::Failed(TransportError::Closed)),
            guard = self.writer.lock() => guard,
            _ = tokio::time::sleep_until(deadline) => return Err(WriteError::Deadline),
        };
        let Some(w) = writer.as_mut() else {
            return Err(WriteError::Failed(TransportError::Closed));
        };

        let outcome = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(WriteError::Failed(TransportError::Closed)),
            res = write_line(w, line) => res.map_err(|e| WriteError::Failed(e.into())),
            _ = tokio::time::sleep_until(deadline) => Err(WriteError::Deadline),
        };

        if outcome.is_err() {
            // A partial line may be on the wire; nothing after it would frame.
            *writer = None;
            if !self.closed.is_cancelled() {
                self.broken.store(true, Ordering::SeqCst);
                self.closed.cancel();
                tracing::warn!(server_id = %self.server_id, "MCP server stdin unusable, writer dropped");
            }
        }
        outcome
    }

    /// Close the write half. Bounded even while another caller is stuck
    /// writing; later sends fail with `Closed`.
    pub async fn close(&self) {
        self.closed.cancel();
        let writer = match tokio::time::timeout(CLOSE_GRACE, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                tracing::warn!(server_id = %self.server_id, "timed out waiting for MCP writer during close");
                return;
            }
        };
        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(server_id = %self.server_id, error = %e, "error closing MCP server stdin");
                }
                Err(_) => {
                    tracing::debug!(server_id = %self.server_id, "MCP server stdin shutdown stalled");
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// The writer failed or stalled mid-line; the connection cannot be reused.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Read loops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why a read loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLoopExit {
    /// The stream reached end-of-file or failed.
    StreamClosed,
    /// The session cancelled the loop.
    Cancelled,
}

/// Longest line echoed into a log record.
const MAX_LOGGED_LINE: usize = 512;

/// Read one message per line from `reader` and resolve matching slots in
/// `pending` until the stream ends or `cancel` fires.
///
/// Lines that fail to decode are logged and skipped. Messages without an
/// id (notifications), peer-initiated requests, and responses nobody is
/// waiting for are dropped.
pub async fn read_responses<R>(
    server_id: &str,
    reader: R,
    pending: &PendingRequests,
    cancel: &CancellationToken,
) -> ReadLoopExit
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadLoopExit::Cancelled,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => return ReadLoopExit::StreamClosed,
            Ok(_) => dispatch_line(server_id, &buf, pending),
            Err(e) => {
                tracing::warn!(server_id = %server_id, error = %e, "error reading MCP server stdout");
                return ReadLoopExit::StreamClosed;
            }
        }
    }
}

fn dispatch_line(server_id: &str, line: &[u8], pending: &PendingRequests) {
    let line = line.trim_ascii();
    if line.is_empty() {
        return;
    }

    let message = match serde_json::from_slice::<JsonRpcResponse>(line) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(
                server_id = %server_id,
                error = %e,
                line = %truncate_for_log(line),
                "undecodable line from MCP server, skipping"
            );
            return;
        }
    };

    if let Some(method) = &message.method {
        tracing::debug!(server_id = %server_id, method = %method, "ignoring peer-initiated MCP message");
        return;
    }

    match message.id {
        Some(id) => {
            if !pending.resolve(message) {
                tracing::debug!(server_id = %server_id, id, "dropping response for unknown or expired request");
            }
        }
        None => {
            tracing::debug!(server_id = %server_id, "dropping MCP message without id");
        }
    }
}

fn truncate_for_log(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    if text.len() <= MAX_LOGGED_LINE {
        return text.into_owned();
    }
    let mut end = MAX_LOGGED_LINE;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Bounded buffer of the most recent stderr lines from one process.
pub struct StderrTail {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The retained lines joined with newlines (empty if none).
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Forward every stderr line to the log (target `th_mcp_client::stderr`)
/// and keep the tail for failure reports. Never touches session state.
pub async fn read_diagnostics<R>(
    server_id: &str,
    reader: R,
    tail: &StderrTail,
    cancel: &CancellationToken,
) -> ReadLoopExit
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadLoopExit::Cancelled,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => return ReadLoopExit::StreamClosed,
            Ok(_) => {
                let line = String::from_utf8_lossy(buf.trim_ascii_end()).into_owned();
                if line.is_empty() {
                    continue;
                }
                tracing::info!(target: "th_mcp_client::stderr", server_id = %server_id, "{line}");
                tail.push(line);
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
