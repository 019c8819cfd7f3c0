use std::time::Duration;

use th_domain::config::Config;

#[test]
fn default_timeouts_match_reference_policy() {
    let config = Config::default();
    assert_eq!(config.mcp.request_timeout(), Duration::from_secs(30));
    assert_eq!(config.mcp.shutdown_timeout(), Duration::from_secs(5));
}

#[test]
fn default_client_name() {
    let config = Config::default();
    assert_eq!(config.mcp.client_name, "toolhost");
}

#[test]
fn empty_document_parses() {
    let config: Config = toml::from_str("").unwrap();
    assert!(config.mcp.servers.is_empty());
    assert_eq!(config.mcp.stderr_tail_lines, 20);
}

#[test]
fn server_list_parses() {
    let toml_str = r#"
[mcp]
request_timeout_ms = 1500

[[mcp.servers]]
id = "filesystem"
name = "Filesystem"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
env = { NODE_ENV = "production" }

[[mcp.servers]]
id = "git"
command = "uvx"
enabled = false
cwd = "/srv/repo"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.mcp.request_timeout(), Duration::from_millis(1500));
    assert_eq!(config.mcp.servers.len(), 2);

    let fs = &config.mcp.servers[0];
    assert_eq!(fs.display_name(), "Filesystem");
    assert_eq!(fs.args.len(), 3);
    assert_eq!(fs.env.get("NODE_ENV").map(String::as_str), Some("production"));
    assert!(fs.enabled);

    let git = &config.mcp.servers[1];
    assert_eq!(git.display_name(), "git");
    assert!(!git.enabled);
    assert_eq!(git.cwd.as_deref(), Some("/srv/repo"));
}

#[test]
fn server_config_parses_from_json() {
    let raw = r#"{ "id": "test", "command": "echo" }"#;
    let cfg: th_domain::config::McpServerConfig = serde_json::from_str(raw).unwrap();
    assert!(cfg.enabled);
    assert!(cfg.args.is_empty());
    assert!(cfg.env.is_empty());
}

#[test]
fn show_output_roundtrips_through_toml() {
    let mut config = Config::default();
    config.mcp.servers.push(th_domain::config::McpServerConfig {
        id: "a".into(),
        name: None,
        command: "a-server".into(),
        args: vec!["--stdio".into()],
        env: Default::default(),
        enabled: true,
        cwd: None,
    });
    let rendered = toml::to_string_pretty(&config).unwrap();
    let parsed: Config = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed.mcp.servers[0].command, "a-server");
    assert_eq!(parsed.mcp.servers[0].args, vec!["--stdio".to_string()]);
}
