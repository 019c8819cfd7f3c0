//! `toolhost status`: start the pool once and report per-server state.

use th_domain::config::Config;
use th_mcp_client::ServerStatus;

use super::tools::start_pool;

pub async fn run(config: &Config, json_output: bool) -> anyhow::Result<()> {
    let manager = start_pool(config, None).await;
    let statuses = manager.statuses().await;
    manager.stop_all().await;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }
    for status in &statuses {
        println!("{}", format_status(status));
    }
    Ok(())
}

fn format_status(status: &ServerStatus) -> String {
    let mut line = format!("{:<20} {:<8}", status.id, status.state.to_string());
    match (&status.server_info, &status.last_error) {
        (Some(info), _) => {
            line.push_str(&format!(
                " {} {} ({} tools)",
                info.name, info.version, status.tool_count
            ));
        }
        (None, Some(err)) => line.push_str(&format!(" {err}")),
        (None, None) => {}
    }
    line.trim_end().to_string()
}
