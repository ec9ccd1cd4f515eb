//! Rate limiting and manage-mode bearer auth, as `axum::middleware::from_fn_with_state`
//! layers, grounded in `_check_rate_limit` / `_check_manage_auth` from
//! `zimi/server.py`.

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use std::net::SocketAddr;

use crate::AppContext;

/// Client IP, preferring the first `X-Forwarded-For` hop over the TCP peer
/// address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    peer.map(|a| a.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

/// Only applied to the read/search surface: `/search`, `/read`, `/suggest`,
/// `/snippet`, `/random`, `POST /resolve`, `DELETE /collections`.
pub async fn rate_limit(
    State(ctx): State<AppContext>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let ip = client_ip(&headers, Some(peer));
    if let Some(retry_after) = ctx.server.rate_limiter.check(&ip) {
        ctx.server.metrics.record_rate_limited();
        let mut response =
            (StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({ "error": "rate limited" }))).into_response();
        if let Ok(val) = retry_after.to_string().parse() {
            response.headers_mut().insert("retry-after", val);
        }
        return response;
    }
    next.run(request).await
}

/// Gate for `/manage/*` endpoints, excluding the always-public
/// `/manage/has-password` probe (left unlayered by the router).
pub async fn manage_auth(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if !ctx.server.config.manage_enabled {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "management is disabled" })))
            .into_response();
    }
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if !ctx.server.manage_password.check(token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized", "needs_password": true })),
        )
            .into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "203.0.113.5");
    }

    #[test]
    fn client_ip_falls_back_to_peer_address() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "127.0.0.1");
    }
}
