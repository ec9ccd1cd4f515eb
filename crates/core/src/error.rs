//! Application error kinds shared by the HTTP layer, the CLI, and the MCP bridge.
//!
//! Uniform JSON error body across every handler: `{"error": "..."}`, with
//! `needs_password` / `retry_after` merged in by callers that need them.

use serde::Serialize;
use std::fmt;

/// Uniform error type for all fallible server operations.
#[derive(Debug)]
pub enum AppError {
    /// 400 — bad/missing parameters, unknown archive or collection, path traversal, oversized body.
    Client(String),
    /// 404 — missing route, archive, entry, download id, static file.
    NotFound(String),
    /// 401 — management endpoint without a valid password.
    Unauthorized,
    /// 429 — rate limited, with seconds until retry.
    RateLimited { retry_after: u64 },
    /// 502 — remote catalog fetch/parse failure.
    Upstream(String),
    /// 500 — uncaught internal error.
    Internal(String),
    /// 413 — entry or request body too large.
    TooLarge(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Client(m) => write!(f, "{m}"),
            AppError::NotFound(m) => write!(f, "{m}"),
            AppError::Unauthorized => write!(f, "unauthorized"),
            AppError::RateLimited { .. } => write!(f, "rate limited"),
            AppError::Upstream(m) => write!(f, "{m}"),
            AppError::Internal(m) => write!(f, "{m}"),
            AppError::TooLarge(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for AppError {}

/// Standard JSON error body. Extra fields are merged in by callers that need
/// `needs_password` or `retry_after`.
#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl AppError {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Client(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::Unauthorized => 401,
            AppError::RateLimited { .. } => 429,
            AppError::Upstream(_) => 502,
            AppError::Internal(_) => 500,
            AppError::TooLarge(_) => 413,
        }
    }

    pub fn client<S: Into<String>>(msg: S) -> Self {
        AppError::Client(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        AppError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_the_right_http_codes() {
        assert_eq!(AppError::client("x").status_code(), 400);
        assert_eq!(AppError::not_found("x").status_code(), 404);
        assert_eq!(AppError::Unauthorized.status_code(), 401);
        assert_eq!(AppError::RateLimited { retry_after: 5 }.status_code(), 429);
        assert_eq!(AppError::Upstream("x".into()).status_code(), 502);
        assert_eq!(AppError::internal("x").status_code(), 500);
        assert_eq!(AppError::TooLarge("x".into()).status_code(), 413);
    }
}
