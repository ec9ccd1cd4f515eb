//! HTTP API layer for Zimi: axum handlers over `zimi_core::Server`.
//! The `zimi-server` binary crate assembles these routes into the full
//! `Router` and adds the `tower-http` layers.

pub mod api;
pub mod content;
pub mod middleware;

use std::sync::Arc;

use axum::extract::FromRef;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use zimi_core::AppError;

/// Shared state every handler receives.
#[derive(Clone)]
pub struct AppContext {
    pub server: Arc<zimi_core::Server>,
}

impl FromRef<AppContext> for Arc<zimi_core::Server> {
    fn from_ref(ctx: &AppContext) -> Self {
        ctx.server.clone()
    }
}

/// Local wrapper so handlers can `?` an `AppError` straight into an axum
/// response — `AppError` itself lives in `zimi-core` so it can't carry an
/// `IntoResponse` impl here directly.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if let AppError::RateLimited { retry_after } = &self.0 {
            body["retry_after"] = serde_json::json!(retry_after);
        }
        if matches!(self.0, AppError::Unauthorized) {
            body["needs_password"] = serde_json::json!(true);
        }
        (status, Json(body)).into_response()
    }
}
