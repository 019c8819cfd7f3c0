//! `toolhost tools` and `toolhost call`: one-shot catalog and invocation.

use serde_json::{json, Value};

use th_domain::config::Config;
use th_mcp_client::{CallToolResult, McpManager, SessionSettings, SessionState, ToolContent};

/// Start the configured servers (or just `only`) and warn about any that
/// failed to come up.
pub(crate) async fn start_pool(config: &Config, only: Option<&str>) -> McpManager {
    let manager = McpManager::new(SessionSettings::from_config(&config.mcp));
    let servers: Vec<_> = config
        .mcp
        .servers
        .iter()
        .filter(|s| only.map_or(true, |id| s.id == id))
        .cloned()
        .collect();
    manager.start_servers(&servers).await;

    for status in manager.statuses().await {
        if status.state == SessionState::Error {
            eprintln!(
                "warning: server '{}' failed to start: {}",
                status.id,
                status.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    manager
}

/// Print the combined tool catalog of every ready server.
pub async fn list(config: &Config, json_output: bool) -> anyhow::Result<()> {
    let manager = start_pool(config, None).await;
    let tools = manager.get_all_tools().await;
    manager.stop_all().await;

    if json_output {
        let entries: Vec<Value> = tools
            .iter()
            .map(|(server, tool)| {
                json!({
                    "server": server,
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if tools.is_empty() {
        println!("No tools available.");
        return Ok(());
    }
    let width = tools
        .iter()
        .map(|(server, tool)| server.len() + tool.name.len() + 1)
        .max()
        .unwrap_or(0);
    for (server, tool) in &tools {
        let qualified = format!("{server}/{}", tool.name);
        match &tool.description {
            Some(desc) => println!("{qualified:<width$}  {desc}"),
            None => println!("{qualified}"),
        }
    }
    Ok(())
}

/// Invoke a single tool. Returns `false` when the call failed or the tool
/// flagged its result as an error.
pub async fn call(
    config: &Config,
    server: &str,
    tool: &str,
    args: Option<&str>,
    json_output: bool,
) -> anyhow::Result<bool> {
    let arguments = match args {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("--args is not valid JSON: {e}"))?,
        None => json!({}),
    };

    let manager = start_pool(config, Some(server)).await;
    let outcome = manager.call_tool(server, tool, arguments).await;
    manager.stop_all().await;

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(false);
        }
    };

    if json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(!result.is_error)
}

fn print_result(result: &CallToolResult) {
    for item in &result.content {
        let line = describe_content(item);
        if result.is_error {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

fn describe_content(item: &ToolContent) -> String {
    if let Some(text) = &item.text {
        return text.clone();
    }
    let mime = item.mime_type.as_deref().unwrap_or("unknown");
    let size = item.data.as_ref().map_or(0, String::len);
    format!("[{} {mime}, {size} bytes]", item.content_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_is_printed_verbatim() {
        let item = ToolContent {
            content_type: "text".into(),
            text: Some("hello".into()),
            data: None,
            mime_type: None,
        };
        assert_eq!(describe_content(&item), "hello");
    }

    #[test]
    fn binary_content_is_summarized() {
        let item = ToolContent {
            content_type: "image".into(),
            text: None,
            data: Some("aGVsbG8=".into()),
            mime_type: Some("image/png".into()),
        };
        assert_eq!(describe_content(&item), "[image image/png, 8 bytes]");
    }

    #[tokio::test]
    async fn call_rejects_malformed_args() {
        let err = call(&Config::default(), "fs", "read", Some("{nope"), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--args"));
    }

    #[tokio::test]
    async fn call_on_unknown_server_fails() {
        let ok = call(&Config::default(), "fs", "read", None, false).await.unwrap();
        assert!(!ok);
    }
}
