#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use th_mcp_client::{McpServerConfig, SessionSettings};

/// A server config that launches the stub peer in `mode`.
pub fn stub(id: &str, mode: &str) -> McpServerConfig {
    stub_with_env(id, mode, &[])
}

pub fn stub_with_env(id: &str, mode: &str, extra: &[(&str, &str)]) -> McpServerConfig {
    let mut env = HashMap::new();
    env.insert("STUB_MODE".to_string(), mode.to_string());
    for (k, v) in extra {
        env.insert(k.to_string(), v.to_string());
    }
    McpServerConfig {
        id: id.into(),
        name: None,
        command: env!("CARGO_BIN_EXE_th-stub-peer").into(),
        args: vec![],
        enabled: true,
        cwd: None,
        env,
    }
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        request_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        client_name: "toolhost-test".into(),
        stderr_tail_lines: 20,
    }
}
