//! `th-mcp-client`: supervision of MCP tool-provider subprocesses.
//!
//! This crate provides:
//! - JSON-RPC 2.0 and MCP payload types ([`protocol`]).
//! - A line-oriented transport that correlates concurrent requests with
//!   responses arriving in any order ([`transport`]).
//! - [`McpSession`], one subprocess through spawn, handshake, tool calls,
//!   and shutdown.
//! - [`McpManager`], a pool of sessions with a shared tool catalog.
//!
//! # Usage
//!
//! ```rust,ignore
//! use th_mcp_client::McpManager;
//!
//! let config = th_domain::config::Config::from_toml_file("toolhost.toml")?;
//! let manager = McpManager::from_config(&config.mcp).await;
//!
//! for (server_id, tool) in manager.get_all_tools().await {
//!     println!("{server_id}/{}", tool.name);
//! }
//!
//! let result = manager
//!     .call_tool("filesystem", "read_file", json!({"path": "/tmp/test.txt"}))
//!     .await?;
//! manager.stop_all().await;
//! ```

pub mod config;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience.
pub use config::{McpConfig, McpServerConfig};
pub use manager::{McpError, McpManager};
pub use protocol::{CallToolResult, McpTool, ToolContent};
pub use session::{McpSession, ServerStatus, SessionSettings, SessionState};
pub use transport::TransportError;
