//! Streamable HTTP transport for the MCP protocol.
//!
//! `POST /mcp` for JSON-RPC request/response (single object or batch array),
//! `DELETE /mcp` for session termination, `GET /mcp` returns 405 — this
//! transport never pushes server-initiated notifications.
//!
//! Session management via the `Mcp-Session-Id` header, created on
//! `initialize` and required on every request after.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use dashmap::DashMap;
use serde_json::{json, Value};
use uuid::Uuid;

use zimi_core::Server;

use crate::protocol::{dispatch_jsonrpc, negotiate_version};

const SESSION_HEADER: &str = "mcp-session-id";

struct McpSession {
    #[allow(dead_code)]
    protocol_version: String,
    last_activity: Instant,
}

type SessionStore = DashMap<String, McpSession>;

#[derive(Clone)]
pub struct McpAppContext {
    server: Arc<Server>,
    sessions: Arc<SessionStore>,
}

/// Router for the `/mcp` streamable HTTP transport, mounted alongside the
/// main content API by the server binary.
pub fn router(server: Arc<Server>) -> Router {
    let ctx = McpAppContext { server, sessions: Arc::new(DashMap::new()) };
    Router::new().route("/mcp", post(handle_post).delete(handle_delete).get(handle_get)).with_state(ctx)
}

async fn handle_post(State(ctx): State<McpAppContext>, headers: HeaderMap, body: String) -> Result<Response, Response> {
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => {
            let err = json!({ "jsonrpc": "2.0", "id": null, "error": { "code": -32700, "message": "Parse error" } });
            return Ok(json_response(StatusCode::BAD_REQUEST, &err));
        }
    };

    let is_batch = parsed.is_array();
    let requests: Vec<Value> = if is_batch { parsed.as_array().unwrap().clone() } else { vec![parsed] };
    let has_initialize = requests.iter().any(|r| r["method"].as_str() == Some("initialize"));

    let session_id = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string());

    if !has_initialize {
        match session_id.as_ref() {
            Some(sid) if ctx.sessions.contains_key(sid) => {}
            Some(_) => return Err(error_response(StatusCode::BAD_REQUEST, "Invalid or expired session ID")),
            None => return Err(error_response(StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header. Send 'initialize' first.")),
        }
    }

    let mut responses = Vec::new();
    let mut new_session_id: Option<String> = None;

    for req in &requests {
        let method = req["method"].as_str().unwrap_or("");

        if method == "initialize" {
            let client_version = req["params"]["protocolVersion"].as_str().unwrap_or("");
            let negotiated = negotiate_version(client_version);
            let sid = Uuid::new_v4().to_string();
            ctx.sessions.insert(sid.clone(), McpSession { protocol_version: negotiated.to_string(), last_activity: Instant::now() });
            new_session_id = Some(sid);

            if let Some(resp) = dispatch_jsonrpc(&ctx.server, req).await {
                responses.push(resp);
            }
        } else if method.starts_with("notifications/") {
            if let Some(sid) = session_id.as_ref() {
                if let Some(mut s) = ctx.sessions.get_mut(sid) {
                    s.last_activity = Instant::now();
                }
            }
        } else {
            if let Some(sid) = session_id.as_ref().or(new_session_id.as_ref()) {
                if let Some(mut s) = ctx.sessions.get_mut(sid) {
                    s.last_activity = Instant::now();
                }
            }
            if let Some(resp) = dispatch_jsonrpc(&ctx.server, req).await {
                responses.push(resp);
            }
        }
    }

    if responses.is_empty() {
        return Ok(Response::builder().status(StatusCode::ACCEPTED).body(Body::empty()).unwrap());
    }

    let body_json = if is_batch { serde_json::to_string(&responses).unwrap() } else { serde_json::to_string(&responses[0]).unwrap() };
    let mut builder = Response::builder().status(StatusCode::OK).header("content-type", "application/json");
    if let Some(sid) = &new_session_id {
        builder = builder.header(SESSION_HEADER, sid);
    }
    Ok(builder.body(Body::from(body_json)).unwrap())
}

async fn handle_delete(State(ctx): State<McpAppContext>, headers: HeaderMap) -> StatusCode {
    if let Some(sid) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        ctx.sessions.remove(sid);
    }
    StatusCode::OK
}

async fn handle_get() -> StatusCode {
    StatusCode::METHOD_NOT_ALLOWED
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    Response::builder().status(status).header("content-type", "application/json").body(Body::from(serde_json::to_string(body).unwrap())).unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({ "jsonrpc": "2.0", "id": null, "error": { "code": -32600, "message": message } });
    json_response(status, &body)
}
