//! MCP stdio transport: one JSON-RPC message per line on stdin, one
//! response per line on stdout.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use zimi_core::Server;

use crate::protocol::dispatch_jsonrpc;

/// Run the MCP stdio server loop until stdin closes.
pub async fn run_stdio(server: Arc<Server>) {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();
    let mut initialized = false;

    {
        let registry = server.registry.read().await;
        let names: Vec<&str> = registry.iter().map(|(_, info)| info.short_name.as_str()).collect();
        tracing::info!(archives = names.len(), names = names.join(", ").as_str(), "MCP server ready");
    }

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                let err = json!({ "jsonrpc": "2.0", "id": null, "error": { "code": -32700, "message": "Parse error" } });
                write_line(&mut stdout, &err).await;
                continue;
            }
        };

        let method = msg["method"].as_str().unwrap_or("");

        if method == "notifications/initialized" || method == "notifications/cancelled" {
            continue;
        }

        if !initialized && method != "initialize" && method != "ping" {
            if let Some(id) = msg.get("id").cloned() {
                let err = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32002, "message": "Server not initialized. Send 'initialize' first." }
                });
                write_line(&mut stdout, &err).await;
            }
            continue;
        }

        if let Some(response) = dispatch_jsonrpc(&server, &msg).await {
            if method == "initialize" {
                initialized = true;
            }
            write_line(&mut stdout, &response).await;
        }
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, value: &serde_json::Value) {
    let mut line = serde_json::to_string(value).unwrap_or_default();
    line.push('\n');
    let _ = stdout.write_all(line.as_bytes()).await;
    let _ = stdout.flush().await;
}
