//! Pool manager: one [`McpSession`] per configured server, started
//! concurrently, with a flattened tool catalog and call routing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use th_domain::config::{McpConfig, McpServerConfig};

use crate::protocol::{CallToolResult, JsonRpcError, McpTool};
use crate::session::{McpSession, ServerStatus, SessionSettings, SessionState};
use crate::transport::TransportError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sessions keyed by server id, remembering configuration order so
/// snapshots are stable.
#[derive(Default)]
struct Registry {
    order: Vec<String>,
    sessions: HashMap<String, Arc<McpSession>>,
}

impl Registry {
    fn iter(&self) -> impl Iterator<Item = &Arc<McpSession>> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    fn clear(&mut self) -> Vec<Arc<McpSession>> {
        self.order.clear();
        self.sessions.drain().map(|(_, s)| s).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Manager that holds all MCP server sessions.
pub struct McpManager {
    settings: SessionSettings,
    registry: RwLock<Registry>,
}

impl McpManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Create an empty manager with default settings.
    pub fn empty() -> Self {
        Self::new(SessionSettings::default())
    }

    /// Build a manager from config and start every enabled server.
    ///
    /// Servers that fail to start stay registered in `Error`; they do not
    /// prevent the others from becoming ready.
    pub async fn from_config(config: &McpConfig) -> Self {
        let manager = Self::new(SessionSettings::from_config(config));
        manager.start_servers(&config.servers).await;
        manager
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Replace the pool with one session per enabled config and start them
    /// all concurrently. Returns once every start has finished, with the
    /// number of sessions that reached `Ready`.
    pub async fn start_servers(&self, configs: &[McpServerConfig]) -> usize {
        let mut registry = self.registry.write().await;

        let previous = registry.clear();
        if !previous.is_empty() {
            tracing::info!(count = previous.len(), "stopping previous MCP servers");
            futures_util::future::join_all(previous.iter().map(|s| s.stop())).await;
        }

        let mut seen = HashSet::new();
        for config in configs {
            if !config.enabled {
                tracing::debug!(server_id = %config.id, "MCP server disabled, skipping");
                continue;
            }
            if !seen.insert(config.id.clone()) {
                tracing::warn!(server_id = %config.id, "duplicate MCP server id, skipping");
                continue;
            }
            let session = Arc::new(McpSession::new(config.clone(), self.settings.clone()));
            registry.order.push(config.id.clone());
            registry.sessions.insert(config.id.clone(), session);
        }

        // Failures are recorded on each session; start() already logged them.
        let starts = registry.iter().map(|s| s.start());
        futures_util::future::join_all(starts).await;

        let ready = registry.iter().filter(|s| s.is_ready()).count();
        tracing::info!(
            total = registry.order.len(),
            ready,
            "MCP servers started"
        );
        ready
    }

    /// Sessions currently in `Ready`, in configuration order.
    pub async fn get_ready_servers(&self) -> Vec<Arc<McpSession>> {
        let registry = self.registry.read().await;
        registry.iter().filter(|s| s.is_ready()).cloned().collect()
    }

    /// Every registered session regardless of state.
    pub async fn get_all_servers(&self) -> Vec<Arc<McpSession>> {
        let registry = self.registry.read().await;
        registry.iter().cloned().collect()
    }

    pub async fn get_server(&self, server_id: &str) -> Option<Arc<McpSession>> {
        self.registry.read().await.sessions.get(server_id).cloned()
    }

    /// All tools of ready servers as `(server_id, tool)` pairs. Identically
    /// named tools on different servers are all returned.
    pub async fn get_all_tools(&self) -> Vec<(String, McpTool)> {
        self.get_ready_servers()
            .await
            .iter()
            .flat_map(|session| {
                let id = session.id().to_string();
                session.tools().into_iter().map(move |tool| (id.clone(), tool))
            })
            .collect()
    }

    /// Call a tool on a specific server.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let session = self
            .get_server(server_id)
            .await
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;

        session.call_tool(tool_name, arguments).await
    }

    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let registry = self.registry.read().await;
        registry.iter().map(|s| s.status()).collect()
    }

    /// Number of registered servers.
    pub async fn server_count(&self) -> usize {
        self.registry.read().await.order.len()
    }

    /// Total number of tools across ready servers.
    pub async fn tool_count(&self) -> usize {
        self.get_ready_servers()
            .await
            .iter()
            .map(|s| s.tools().len())
            .sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.order.is_empty()
    }

    /// Stop all servers concurrently and clear the registry.
    pub async fn stop_all(&self) {
        let mut registry = self.registry.write().await;
        let sessions = registry.clear();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "stopping all MCP servers");
        futures_util::future::join_all(sessions.iter().map(|s| s.stop())).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to spawn MCP server '{server}': {reason}")]
    Spawn { server: String, reason: String },

    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP server error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: SessionState },

    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP server '{0}' has already been started")]
    AlreadyStarted(String),
}

impl McpError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            McpError::Transport(TransportError::Timeout { .. } | TransportError::WriteTimeout { .. })
        )
    }
}

impl From<JsonRpcError> for McpError {
    fn from(e: JsonRpcError) -> Self {
        McpError::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

impl From<McpError> for th_domain::error::Error {
    fn from(e: McpError) -> Self {
        th_domain::error::Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn missing(id: &str) -> McpServerConfig {
        McpServerConfig {
            id: id.into(),
            name: None,
            command: "/nonexistent/toolhost-missing-binary".into(),
            args: vec![],
            enabled: true,
            cwd: None,
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn empty_manager() {
        let manager = McpManager::empty();
        assert!(manager.is_empty().await);
        assert_eq!(manager.server_count().await, 0);
        assert_eq!(manager.tool_count().await, 0);
        assert!(manager.get_all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let manager = McpManager::empty();
        let err = manager
            .call_tool("nope", "echo", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound(ref id) if id == "nope"));
    }

    #[tokio::test]
    async fn failed_spawns_are_isolated_and_registered() {
        let manager = McpManager::empty();
        let ready = manager.start_servers(&[missing("a"), missing("b")]).await;
        assert_eq!(ready, 0);

        let all = manager.get_all_servers().await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.state() == SessionState::Error));
        assert!(manager.get_ready_servers().await.is_empty());

        let err = manager.call_tool("a", "echo", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::NotReady { state: SessionState::Error, .. }
        ));
    }

    #[tokio::test]
    async fn disabled_and_duplicate_configs_are_skipped() {
        let mut disabled = missing("off");
        disabled.enabled = false;
        let mut dup = missing("a");
        dup.name = Some("second".into());

        let manager = McpManager::empty();
        manager
            .start_servers(&[missing("a"), disabled, dup])
            .await;

        let ids: Vec<String> = manager
            .get_all_servers()
            .await
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a"]);
        let first = manager.get_server("a").await.unwrap();
        assert_eq!(first.name(), "a");
    }

    #[tokio::test]
    async fn stop_all_clears_registry() {
        let manager = McpManager::empty();
        manager.start_servers(&[missing("a")]).await;
        manager.stop_all().await;
        assert!(manager.is_empty().await);
        assert!(manager.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn restart_replaces_previous_sessions() {
        let manager = McpManager::empty();
        manager.start_servers(&[missing("a")]).await;
        let old = manager.get_server("a").await.unwrap();

        manager.start_servers(&[missing("b")]).await;
        assert_eq!(old.state(), SessionState::Stopped);
        assert!(manager.get_server("a").await.is_none());
        assert!(manager.get_server("b").await.is_some());
    }

    #[test]
    fn remote_error_conversion() {
        let err: McpError = JsonRpcError {
            code: -32601,
            message: "method not found".into(),
            data: None,
        }
        .into();
        assert_eq!(err.to_string(), "MCP server error -32601: method not found");
        assert!(!err.is_timeout());

        let timeout = McpError::Transport(TransportError::Timeout {
            id: 4,
            after: Duration::from_millis(10),
        });
        assert!(timeout.is_timeout());
    }
}
