//! One tool-provider subprocess and its protocol state.
//!
//! Lifecycle: `Stopped → Starting → Ready`, with `Starting → Error` when
//! spawn or handshake fails and `Ready → Error` when the peer's stdout
//! closes or a write to its stdin stalls. [`McpSession::stop`] moves any state to `Stopped`. A session is
//! started at most once; restarting means building a new session.

use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use th_domain::config::{McpConfig, McpServerConfig};

use crate::manager::McpError;
use crate::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcResponse, McpTool, ToolsListResult, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::transport::{
    read_diagnostics, read_responses, PendingRequests, ReadLoopExit, StderrTail, StdioTransport,
};

/// How long the stderr loop may keep draining after the process is gone.
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(200);

const STREAM_CLOSED: &str = "MCP server stream closed";
const WRITER_BROKEN: &str = "MCP server stdin stalled or failed mid-write";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Ready,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Timing and identity policy shared by every session in a pool.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub client_name: String,
    pub stderr_tail_lines: usize,
}

impl SessionSettings {
    pub fn from_config(config: &McpConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            client_name: config.client_name.clone(),
            stderr_tail_lines: config.stderr_tail_lines,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&McpConfig::default())
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    pub tool_count: usize,
    pub pending_requests: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

struct Lifecycle {
    state: SessionState,
    last_error: Option<String>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
}

/// What the peer told us during the handshake.
struct Handshake {
    protocol_version: String,
    server_info: Implementation,
    capabilities: Value,
    tools: Vec<McpTool>,
}

/// Process handle and background loops, present between spawn and teardown.
struct Running {
    child: Child,
    stdout_cancel: CancellationToken,
    /// Cancels both loops if the session is dropped without `stop`.
    guard: DropGuard,
    stdout_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct McpSession {
    config: McpServerConfig,
    settings: SessionSettings,
    started: AtomicBool,
    lifecycle: Arc<RwLock<Lifecycle>>,
    pending: Arc<PendingRequests>,
    stderr_tail: Arc<StderrTail>,
    transport: RwLock<Option<Arc<StdioTransport>>>,
    handshake: RwLock<Option<Handshake>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl McpSession {
    pub fn new(config: McpServerConfig, settings: SessionSettings) -> Self {
        let stderr_tail = Arc::new(StderrTail::new(settings.stderr_tail_lines));
        Self {
            config,
            settings,
            started: AtomicBool::new(false),
            lifecycle: Arc::new(RwLock::new(Lifecycle {
                state: SessionState::Stopped,
                last_error: None,
                pid: None,
                started_at: None,
            })),
            pending: Arc::new(PendingRequests::new()),
            stderr_tail,
            transport: RwLock::new(None),
            handshake: RwLock::new(None),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.lifecycle.read().last_error.clone()
    }

    /// OS process id of the most recently spawned process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.lifecycle.read().pid
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Server identity from `initialize`; `None` unless ready.
    pub fn server_info(&self) -> Option<Implementation> {
        self.ready_view(|h| h.server_info.clone())
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.ready_view(|h| h.protocol_version.clone())
    }

    /// The peer's opaque capability descriptor; `None` unless ready.
    pub fn capabilities(&self) -> Option<Value> {
        self.ready_view(|h| h.capabilities.clone())
    }

    /// Tools discovered via `tools/list`; empty unless ready.
    pub fn tools(&self) -> Vec<McpTool> {
        self.ready_view(|h| h.tools.clone()).unwrap_or_default()
    }

    fn ready_view<T>(&self, f: impl FnOnce(&Handshake) -> T) -> Option<T> {
        if !self.is_ready() {
            return None;
        }
        self.handshake.read().as_ref().map(f)
    }

    pub fn status(&self) -> ServerStatus {
        let (state, last_error, pid, started_at) = {
            let lc = self.lifecycle.read();
            (lc.state, lc.last_error.clone(), lc.pid, lc.started_at)
        };
        let running = matches!(state, SessionState::Starting | SessionState::Ready);
        ServerStatus {
            id: self.config.id.clone(),
            name: self.name().to_string(),
            state,
            last_error,
            server_info: self.server_info(),
            tool_count: self.tools().len(),
            pending_requests: self.pending.len(),
            pid: if running { pid } else { None },
            started_at,
        }
    }

    fn not_ready(&self) -> McpError {
        McpError::NotReady {
            server: self.config.id.clone(),
            state: self.state(),
        }
    }

    // ── start ────────────────────────────────────────────────────────

    /// Spawn the process, run the handshake, and become `Ready`.
    ///
    /// On failure the session is left in `Error` with the failure recorded
    /// (including the tail of the peer's stderr) and the process reaped.
    pub async fn start(&self) -> Result<(), McpError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(McpError::AlreadyStarted(self.config.id.clone()));
        }

        {
            let mut lc = self.lifecycle.write();
            lc.state = SessionState::Starting;
            lc.last_error = None;
            lc.started_at = Some(Utc::now());
        }

        tracing::info!(
            server_id = %self.config.id,
            command = %self.config.command,
            "starting MCP server"
        );

        let outcome = match self.spawn_process().await {
            Ok(transport) => self.handshake(&transport).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(handshake) => {
                let tool_count = handshake.tools.len();
                let server_name = handshake.server_info.name.clone();
                *self.handshake.write() = Some(handshake);

                let became_ready = {
                    let mut lc = self.lifecycle.write();
                    if lc.state == SessionState::Starting {
                        lc.state = SessionState::Ready;
                        true
                    } else {
                        false
                    }
                };

                if became_ready {
                    tracing::info!(
                        server_id = %self.config.id,
                        server_name = %server_name,
                        tool_count,
                        "MCP server ready"
                    );
                    Ok(())
                } else {
                    // Stopped or lost its stream while the handshake finished.
                    let err = self.not_ready();
                    self.teardown("session left starting state").await;
                    Err(err)
                }
            }
            Err(e) => {
                self.teardown("session failed to start").await;
                let message = self.failure_message(&e);
                {
                    let mut lc = self.lifecycle.write();
                    if matches!(lc.state, SessionState::Starting | SessionState::Error) {
                        lc.state = SessionState::Error;
                        lc.last_error = Some(message.clone());
                    }
                }
                tracing::warn!(
                    server_id = %self.config.id,
                    error = %message,
                    "MCP server failed to start"
                );
                Err(e)
            }
        }
    }

    fn failure_message(&self, err: &McpError) -> String {
        let stderr = self.stderr_tail.snapshot();
        if stderr.is_empty() {
            err.to_string()
        } else {
            format!("{err} | stderr: {}", stderr.trim())
        }
    }

    async fn spawn_process(&self) -> Result<Arc<StdioTransport>, McpError> {
        let spawn_error = |reason: String| McpError::Spawn {
            server: self.config.id.clone(),
            reason,
        };

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("failed to capture child stdout".into()))?;
        let stderr = child.stderr.take();

        self.lifecycle.write().pid = child.id();

        let transport = Arc::new(StdioTransport::new(
            self.config.id.clone(),
            stdin,
            self.pending.clone(),
            self.settings.request_timeout,
        ));

        let cancel = CancellationToken::new();
        let stdout_cancel = cancel.child_token();

        let stdout_task = {
            let server_id = self.config.id.clone();
            let pending = self.pending.clone();
            let lifecycle = self.lifecycle.clone();
            let cancel = stdout_cancel.clone();
            tokio::spawn(async move {
                let exit = read_responses(&server_id, stdout, &pending, &cancel).await;
                if exit == ReadLoopExit::StreamClosed {
                    connection_lost(&server_id, &pending, &lifecycle, STREAM_CLOSED);
                }
            })
        };

        let stderr_task = stderr.map(|stderr| {
            let server_id = self.config.id.clone();
            let tail = self.stderr_tail.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                read_diagnostics(&server_id, stderr, &tail, &cancel).await;
            })
        });

        *self.running.lock().await = Some(Running {
            child,
            stdout_cancel,
            guard: cancel.drop_guard(),
            stdout_task,
            stderr_task,
        });
        *self.transport.write() = Some(transport.clone());

        Ok(transport)
    }

    async fn handshake(&self, transport: &StdioTransport) -> Result<Handshake, McpError> {
        let params = serde_json::to_value(InitializeParams::new(self.settings.client_name.as_str()))
            .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;

        let resp = transport.send_request(METHOD_INITIALIZE, Some(params)).await?;
        let init: InitializeResult = decode_result(resp, METHOD_INITIALIZE)?;
        tracing::debug!(
            server_id = %self.config.id,
            server_name = %init.server_info.name,
            protocol_version = %init.protocol_version,
            "MCP initialize response received"
        );

        transport.send_notification(METHOD_INITIALIZED, None).await?;

        let resp = transport.send_request(METHOD_TOOLS_LIST, None).await?;
        let listed: ToolsListResult = decode_result(resp, METHOD_TOOLS_LIST)?;

        Ok(Handshake {
            protocol_version: init.protocol_version,
            server_info: init.server_info,
            capabilities: init.capabilities,
            tools: listed.tools,
        })
    }

    // ── requests ─────────────────────────────────────────────────────

    /// Send a raw request on this session's connection.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let transport = self.transport.read().clone().ok_or_else(|| self.not_ready())?;
        self.request(&transport, method, params).await
    }

    async fn request(
        &self,
        transport: &StdioTransport,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let result = transport.send_request(method, params).await;
        if result.is_err() && transport.is_broken() {
            connection_lost(&self.config.id, &self.pending, &self.lifecycle, WRITER_BROKEN);
        }
        Ok(result?)
    }

    /// Invoke a tool. Fails with `NotReady` without any I/O unless the
    /// session is `Ready`. A result with `is_error` set is still `Ok`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        if !self.is_ready() {
            return Err(self.not_ready());
        }
        let transport = self.transport.read().clone().ok_or_else(|| self.not_ready())?;

        let params = CallToolParams {
            name: name.to_string(),
            arguments: (!arguments.is_null()).then_some(arguments),
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| McpError::Protocol(format!("failed to serialize tools/call params: {e}")))?;

        let resp = self.request(&transport, METHOD_TOOLS_CALL, Some(params)).await?;
        let result: CallToolResult = decode_result(resp, METHOD_TOOLS_CALL)?;
        if result.is_error {
            tracing::debug!(server_id = %self.config.id, tool = %name, "MCP tool reported an error");
        }
        Ok(result)
    }

    // ── stop ─────────────────────────────────────────────────────────

    /// Stop the session: cancel the read loops, close the pipes, terminate
    /// the process (killing it after the shutdown timeout), and cancel any
    /// pending requests. Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.state() == SessionState::Stopped && self.running.lock().await.is_none() {
            return;
        }
        tracing::info!(server_id = %self.config.id, "stopping MCP server");
        self.teardown("session stopped").await;
        self.lifecycle.write().state = SessionState::Stopped;
    }

    async fn teardown(&self, reason: &str) {
        let running = self.running.lock().await.take();
        let transport = self.transport.write().take();

        let cancelled = self.pending.cancel_all(reason);
        if cancelled > 0 {
            tracing::debug!(server_id = %self.config.id, cancelled, "cancelled in-flight MCP requests");
        }

        let Some(running) = running else {
            return;
        };
        let Running {
            mut child,
            stdout_cancel,
            guard,
            stdout_task,
            stderr_task,
        } = running;

        stdout_cancel.cancel();
        if let Some(transport) = transport {
            transport.close().await;
        }

        terminate(&self.config.id, &mut child, self.settings.shutdown_timeout).await;

        let _ = stdout_task.await;
        let cancel = guard.disarm();
        if let Some(mut task) = stderr_task {
            if tokio::time::timeout(STDERR_DRAIN_GRACE, &mut task).await.is_err() {
                cancel.cancel();
                let _ = task.await;
            }
        }
        cancel.cancel();
    }
}

/// Drain pending requests and move a live session to `Error`. The drain
/// happens under the state lock, so a woken waiter already sees `Error`.
fn connection_lost(
    server_id: &str,
    pending: &PendingRequests,
    lifecycle: &RwLock<Lifecycle>,
    cause: &str,
) {
    let mut lc = lifecycle.write();
    let cancelled = pending.cancel_all(cause);
    if matches!(lc.state, SessionState::Starting | SessionState::Ready) {
        lc.state = SessionState::Error;
        lc.last_error = Some(cause.to_string());
        tracing::warn!(
            server_id = %server_id,
            cause,
            cancelled,
            "MCP server connection lost"
        );
    }
}

/// Ask the process to exit, wait up to `grace`, then kill it.
async fn terminate(server_id: &str, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(server_id = %server_id, pid, error = %e, "failed to send SIGTERM");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(server_id = %server_id, ?status, "MCP server process exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(server_id = %server_id, error = %e, "error waiting for MCP server process");
        }
        Err(_) => {
            tracing::warn!(
                server_id = %server_id,
                grace_ms = grace.as_millis() as u64,
                "MCP server process did not exit within timeout, killing"
            );
            if let Err(e) = child.kill().await {
                tracing::warn!(server_id = %server_id, error = %e, "failed to kill MCP server process");
            }
        }
    }
}

fn decode_result<T: DeserializeOwned>(resp: JsonRpcResponse, method: &str) -> Result<T, McpError> {
    let value = resp.into_result()?;
    serde_json::from_value(value)
        .map_err(|e| McpError::Protocol(format!("failed to parse {method} result: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcError;

    fn config(id: &str, command: &str) -> McpServerConfig {
        McpServerConfig {
            id: id.into(),
            name: None,
            command: command.into(),
            args: vec![],
            enabled: true,
            cwd: None,
            env: Default::default(),
        }
    }

    #[test]
    fn new_session_is_stopped_and_empty() {
        let session = McpSession::new(config("a", "true"), SessionSettings::default());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.tools().is_empty());
        assert!(session.server_info().is_none());
        assert_eq!(session.status().tool_count, 0);
        assert_eq!(session.name(), "a");
    }

    #[tokio::test]
    async fn call_tool_before_start_is_not_ready() {
        let session = McpSession::new(config("a", "true"), SessionSettings::default());
        let err = session.call_tool("echo", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::NotReady { ref server, state: SessionState::Stopped } if server == "a"
        ));
    }

    #[tokio::test]
    async fn spawn_failure_enters_error() {
        let session = McpSession::new(
            config("missing", "/nonexistent/definitely-not-a-binary"),
            SessionSettings::default(),
        );
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, McpError::Spawn { .. }));
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.last_error().unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let session = McpSession::new(
            config("missing", "/nonexistent/definitely-not-a-binary"),
            SessionSettings::default(),
        );
        let _ = session.start().await;
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, McpError::AlreadyStarted(_)));
    }

    #[tokio::test]
    async fn stop_on_unstarted_session_is_noop() {
        let session = McpSession::new(config("a", "true"), SessionSettings::default());
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn stream_close_moves_ready_to_error_and_drains() {
        let pending = PendingRequests::new();
        let lifecycle = RwLock::new(Lifecycle {
            state: SessionState::Ready,
            last_error: None,
            pid: None,
            started_at: None,
        });
        connection_lost("a", &pending, &lifecycle, STREAM_CLOSED);
        assert_eq!(lifecycle.read().state, SessionState::Error);
        assert!(lifecycle.read().last_error.as_deref().unwrap().contains("stream closed"));
        assert!(pending.is_closed());
    }

    #[test]
    fn stream_close_after_stop_keeps_stopped() {
        let pending = PendingRequests::new();
        let lifecycle = RwLock::new(Lifecycle {
            state: SessionState::Stopped,
            last_error: None,
            pid: None,
            started_at: None,
        });
        connection_lost("a", &pending, &lifecycle, STREAM_CLOSED);
        assert_eq!(lifecycle.read().state, SessionState::Stopped);
        assert!(lifecycle.read().last_error.is_none());
    }

    #[test]
    fn decode_result_surfaces_remote_error() {
        let resp = JsonRpcResponse::failure(
            3,
            JsonRpcError {
                code: -32602,
                message: "bad params".into(),
                data: Some(serde_json::json!({"field": "name"})),
            },
        );
        let err = decode_result::<CallToolResult>(resp, METHOD_TOOLS_CALL).unwrap_err();
        match err {
            McpError::Remote { code, message, data } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad params");
                assert_eq!(data, Some(serde_json::json!({"field": "name"})));
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn decode_result_rejects_malformed_payload() {
        let resp = JsonRpcResponse::success(1, serde_json::json!({ "tools": "nope" }));
        let err = decode_result::<ToolsListResult>(resp, METHOD_TOOLS_LIST).unwrap_err();
        assert!(matches!(err, McpError::Protocol(ref m) if m.contains("tools/list")));
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(SessionState::Ready.to_string(), "ready");
        assert_eq!(
            serde_json::to_value(SessionState::Error).unwrap(),
            serde_json::json!("error")
        );
    }
}
