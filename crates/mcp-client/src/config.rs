//! MCP configuration types, re-exported from `th-domain`.
//!
//! The canonical definitions live in `th_domain::config` so the CLI's
//! config loader can include them without depending on this crate.

pub use th_domain::config::{McpConfig, McpServerConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use std::time::Duration;

    #[test]
    fn empty_config_defaults() {
        let cfg: McpConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn deserialize_server_config() {
        let raw = r#"{
            "id": "filesystem",
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
        }"#;
        let cfg: McpServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.id, "filesystem");
        assert_eq!(cfg.command, "npx");
        assert_eq!(cfg.args.len(), 3);
        assert!(cfg.enabled);
    }

    #[test]
    fn deserialize_with_env() {
        let raw = r#"{
            "id": "test",
            "command": "node",
            "args": ["server.js"],
            "env": { "NODE_ENV": "production" }
        }"#;
        let cfg: McpServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.env.get("NODE_ENV").unwrap(), "production");
    }

    #[test]
    fn settings_follow_config() {
        let cfg: McpConfig = serde_json::from_str(
            r#"{ "request_timeout_ms": 250, "shutdown_timeout_ms": 100, "client_name": "inspector" }"#,
        )
        .unwrap();
        let settings = SessionSettings::from_config(&cfg);
        assert_eq!(settings.request_timeout, Duration::from_millis(250));
        assert_eq!(settings.shutdown_timeout, Duration::from_millis(100));
        assert_eq!(settings.client_name, "inspector");
        assert_eq!(settings.stderr_tail_lines, 20);
    }
}
