//! Integration smoke tests for the fully assembled `zimi-serve` app: the
//! merged HTTP API, MCP transport, and `/health` route with production
//! layers applied, driven in-process with no real socket bound.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use zimi_core::reader::placeholder_open;
use zimi_core::{Config, Server};
use zimi_server::build_app;

async fn empty_server() -> Arc<Server> {
    let zim_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let config = Config {
        zim_dir: zim_dir.path().to_path_buf(),
        data_dir: data_dir.path().to_path_buf(),
        manage_enabled: false,
        manage_password_env: None,
        rate_limit: 0,
        auto_update_env: None,
        update_freq_env: None,
    };
    let server = Server::new(config, placeholder_open()).await;
    std::mem::forget(zim_dir);
    std::mem::forget(data_dir);
    server
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = build_app(empty_server().await);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_and_mcp_transports_share_one_router() {
    let app = build_app(empty_server().await);

    let list_response = app
        .clone()
        .oneshot(Request::builder().uri("/list").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(list_response.status(), StatusCode::OK);

    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {"protocolVersion": "2025-06-18"},
    });
    let mcp_response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("content-type", "application/json")
                .header("accept", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(mcp_response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = build_app(empty_server().await);
    let response = app
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
