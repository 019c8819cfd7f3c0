mod common;

use serde_json::json;
use th_mcp_client::{McpError, McpManager, SessionState};

#[tokio::test]
async fn one_failing_server_does_not_affect_the_others() {
    let manager = McpManager::new(common::settings());
    let ready = manager
        .start_servers(&[
            common::stub("a", "normal"),
            common::stub("b", "exit"),
            common::stub_with_env("c", "normal", &[("STUB_NAME", "gamma")]),
        ])
        .await;
    assert_eq!(ready, 2);

    let ready_ids: Vec<String> = manager
        .get_ready_servers()
        .await
        .iter()
        .map(|s| s.id().to_string())
        .collect();
    assert_eq!(ready_ids, vec!["a", "c"]);

    let b = manager.get_server("b").await.unwrap();
    assert_eq!(b.state(), SessionState::Error);
    assert!(b.last_error().is_some());
    assert_eq!(manager.get_all_servers().await.len(), 3);

    let err = manager.call_tool("b", "echo", json!({})).await.unwrap_err();
    assert!(matches!(err, McpError::NotReady { state: SessionState::Error, .. }));

    let result = manager
        .call_tool("c", "echo", json!({ "text": "via pool" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "via pool");

    manager.stop_all().await;
}

#[tokio::test]
async fn catalog_flattens_ready_servers() {
    let manager = McpManager::new(common::settings());
    manager
        .start_servers(&[common::stub("a", "normal"), common::stub("c", "normal")])
        .await;

    let tools = manager.get_all_tools().await;
    assert_eq!(tools.len(), 12);
    assert_eq!(manager.tool_count().await, 12);
    let echoes: Vec<&str> = tools
        .iter()
        .filter(|(_, t)| t.name == "echo")
        .map(|(id, _)| id.as_str())
        .collect();
    assert_eq!(echoes, vec!["a", "c"]);

    manager.stop_all().await;
}

#[tokio::test]
async fn unknown_server_is_rejected() {
    let manager = McpManager::new(common::settings());
    manager.start_servers(&[common::stub("a", "normal")]).await;

    let err = manager.call_tool("zzz", "echo", json!({})).await.unwrap_err();
    assert!(matches!(err, McpError::ServerNotFound(ref id) if id == "zzz"));

    manager.stop_all().await;
}

#[tokio::test]
async fn disabled_servers_are_not_started() {
    let mut off = common::stub("off", "normal");
    off.enabled = false;

    let manager = McpManager::new(common::settings());
    manager.start_servers(&[common::stub("a", "normal"), off]).await;

    assert_eq!(manager.server_count().await, 1);
    assert!(manager.get_server("off").await.is_none());

    manager.stop_all().await;
}

#[tokio::test]
async fn stop_all_stops_and_clears() {
    let manager = McpManager::new(common::settings());
    manager
        .start_servers(&[common::stub("a", "normal"), common::stub("b", "normal")])
        .await;
    let sessions = manager.get_all_servers().await;

    manager.stop_all().await;

    assert!(manager.is_empty().await);
    assert!(manager.get_all_tools().await.is_empty());
    assert!(sessions.iter().all(|s| s.state() == SessionState::Stopped));
}

#[tokio::test]
async fn statuses_serialize_for_display() {
    let manager = McpManager::new(common::settings());
    manager
        .start_servers(&[common::stub("a", "normal"), common::stub("b", "exit")])
        .await;

    let statuses = manager.statuses().await;
    let value = serde_json::to_value(&statuses).unwrap();
    assert_eq!(value[0]["id"], "a");
    assert_eq!(value[0]["state"], "ready");
    assert_eq!(value[0]["tool_count"], 6);
    assert_eq!(value[1]["state"], "error");
    assert!(value[1]["last_error"].is_string());
    assert!(value[1].get("pid").is_none());

    manager.stop_all().await;
}
