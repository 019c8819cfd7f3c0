//! MCP (Model Context Protocol) configuration types.
//!
//! These are lightweight config structs used to deserialize the `[mcp]`
//! section of the toolhost config. The session and pool logic lives in
//! the `th-mcp-client` crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level MCP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// How long a single request waits for its response.
    #[serde(default = "d_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long `stop` waits for a graceful exit before killing.
    #[serde(default = "d_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Sent as `clientInfo.name` during `initialize`.
    #[serde(default = "d_client_name")]
    pub client_name: String,

    /// Number of trailing stderr lines kept per server for diagnostics.
    #[serde(default = "d_stderr_tail_lines")]
    pub stderr_tail_lines: usize,

    /// List of MCP server definitions.
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

impl McpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: d_request_timeout_ms(),
            shutdown_timeout_ms: d_shutdown_timeout_ms(),
            client_name: d_client_name(),
            stderr_tail_lines: d_stderr_tail_lines(),
            servers: Vec::new(),
        }
    }
}

fn d_request_timeout_ms() -> u64 {
    30_000
}

fn d_shutdown_timeout_ms() -> u64 {
    5_000
}

fn d_client_name() -> String {
    "toolhost".into()
}

fn d_stderr_tail_lines() -> usize {
    20
}

/// Configuration for a single tool-provider subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique identifier for this server (registry key, used to route calls).
    pub id: String,

    /// Human-readable name. Falls back to `id` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The command to spawn (e.g. `"npx"`).
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Disabled servers are skipped at startup.
    #[serde(default = "d_true")]
    pub enabled: bool,

    /// Working directory for the spawned process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Environment variables merged onto the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl McpServerConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn d_true() -> bool {
    true
}
