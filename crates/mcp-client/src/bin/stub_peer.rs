//! Scriptable MCP peer used by the integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and logs to stderr.
//!
//! Tools:
//!   echo  : returns `arguments.text` (or the raw arguments)
//!   slow  : replies after `arguments.ms` milliseconds (default 200)
//!   fail  : result with `isError: true`
//!   boom  : JSON-RPC error object
//!   hang  : never replies
//!   die   : exits with status 7 without replying
//!
//! Env vars:
//!   STUB_MODE  : normal | exit | stubborn | mute | deaf (default: normal);
//!                deaf answers the handshake, then stops reading stdin
//!   STUB_NAME  : serverInfo.name (default: "stub")
//!   STUB_NOISE : when set, emit a garbage line and a notification before
//!                 the initialize response

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Exit,
    Stubborn,
    Mute,
    Deaf,
}

impl Mode {
    fn from_env() -> Self {
        match std::env::var("STUB_MODE").as_deref() {
            Ok("exit") => Mode::Exit,
            Ok("stubborn") => Mode::Stubborn,
            Ok("mute") => Mode::Mute,
            Ok("deaf") => Mode::Deaf,
            _ => Mode::Normal,
        }
    }
}

type Out = Arc<Mutex<Stdout>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = Mode::from_env();
    let name = std::env::var("STUB_NAME").unwrap_or_else(|_| "stub".into());
    let noise = std::env::var_os("STUB_NOISE").is_some();

    eprintln!("stub: starting in {mode:?} mode");

    if mode == Mode::Exit {
        eprintln!("stub: fatal: refusing to start");
        std::process::exit(3);
    }

    if mode == Mode::Stubborn {
        ignore_sigterm()?;
    }

    let out: Out = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if mode == Mode::Mute {
            continue;
        }
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("stub: bad input line: {e}");
                continue;
            }
        };
        let Some(id) = msg.get("id").cloned() else {
            eprintln!("stub: notification {}", msg["method"]);
            continue;
        };
        let method = msg["method"].as_str().unwrap_or_default().to_string();
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "initialize" => {
                if noise {
                    write_raw(&out, "this is not json").await?;
                    write_raw(
                        &out,
                        r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}"#,
                    )
                    .await?;
                }
                let result = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": name, "version": "0.1" }
                });
                reply(&out, id, result).await?;
            }
            "tools/list" => {
                reply(&out, id, json!({ "tools": tool_list() })).await?;
                if mode == Mode::Deaf {
                    eprintln!("stub: no longer reading stdin");
                    std::future::pending::<()>().await;
                }
            }
            "tools/call" => call_tool(&out, id, params).await?,
            other => {
                reply_error(&out, id, -32601, &format!("method not found: {other}"), None).await?;
            }
        }
    }

    eprintln!("stub: stdin closed");
    if mode == Mode::Stubborn {
        eprintln!("stub: ignoring stdin close");
        std::future::pending::<()>().await;
    }
    Ok(())
}

fn tool_list() -> Value {
    let schema = json!({ "type": "object" });
    json!([
        { "name": "echo", "description": "Echo the text argument", "inputSchema": {
            "type": "object", "properties": { "text": { "type": "string" } } } },
        { "name": "slow", "description": "Reply after a delay", "inputSchema": schema },
        { "name": "fail", "description": "Always reports a tool error", "inputSchema": schema },
        { "name": "boom", "description": "Always returns a JSON-RPC error", "inputSchema": schema },
        { "name": "hang", "inputSchema": schema },
        { "name": "die", "description": "Exit without replying", "inputSchema": schema },
    ])
}

async fn call_tool(out: &Out, id: Value, params: Value) -> anyhow::Result<()> {
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);
    match params["name"].as_str().unwrap_or_default() {
        "echo" => {
            let text = match args.get("text").and_then(Value::as_str) {
                Some(t) => t.to_string(),
                None => args.to_string(),
            };
            reply(out, id, text_result(&text, false)).await
        }
        "slow" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(200);
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if let Err(e) = reply(&out, id, text_result(&format!("slow:{ms}"), false)).await {
                    eprintln!("stub: write failed: {e}");
                }
            });
            Ok(())
        }
        "fail" => reply(out, id, text_result("tool failed", true)).await,
        "boom" => reply_error(out, id, -32000, "boom", Some(json!({ "detail": "kaboom" }))).await,
        "hang" => Ok(()),
        "die" => {
            eprintln!("stub: exiting mid-request");
            std::process::exit(7);
        }
        other => reply_error(out, id, -32602, &format!("unknown tool: {other}"), None).await,
    }
}

fn text_result(text: &str, is_error: bool) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": is_error })
}

async fn reply(out: &Out, id: Value, result: Value) -> anyhow::Result<()> {
    let msg = json!({ "jsonrpc": "2.0", "id": id, "result": result });
    write_raw(out, &msg.to_string()).await
}

async fn reply_error(
    out: &Out,
    id: Value,
    code: i64,
    message: &str,
    data: Option<Value>,
) -> anyhow::Result<()> {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    let msg = json!({ "jsonrpc": "2.0", "id": id, "error": error });
    write_raw(out, &msg.to_string()).await
}

async fn write_raw(out: &Out, line: &str) -> anyhow::Result<()> {
    let mut out = out.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}

#[cfg(unix)]
fn ignore_sigterm() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        while term.recv().await.is_some() {
            eprintln!("stub: ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm() -> anyhow::Result<()> {
    Ok(())
}
