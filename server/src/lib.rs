//! Library half of the Zimi server binary: assembling the axum app and the
//! auto-update background task. Kept separate from `main.rs` so integration
//! tests can exercise the fully wired app without spawning a real process.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use zimi_core::autoupdate::PendingUpdate;
use zimi_core::Server;

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    zim_count: usize,
    pdf_support: bool,
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn health(State(server): State<Arc<Server>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        zim_count: server.archive_count().await,
        pdf_support: true,
    })
}

/// Builds the merged HTTP API + MCP transport router, with the same
/// tracing/compression/CORS layers the binary serves in production.
pub fn build_app(server: Arc<Server>) -> Router {
    let ctx = zimi_http::AppContext { server: server.clone() };
    Router::new()
        .merge(zimi_http::api::router(ctx))
        .merge(zimi_mcp::router(server.clone()))
        .route("/health", get(health).with_state(server))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// Background task that checks the Kiwix catalog for newer versions of
/// installed archives and starts their downloads, per `auto_update.json`.
/// Runs for the lifetime of the process; `run_loop` returns once auto-update
/// is disabled, and this task is simply dropped.
pub fn spawn_auto_update_loop(server: Arc<Server>) {
    tokio::spawn(async move {
        let check_server = server.clone();
        let downloading_server = server.clone();
        let start_server = server.clone();

        zimi_core::autoupdate::run_loop(
            &server.auto_update,
            Duration::from_secs(30),
            move || {
                let server = check_server.clone();
                Box::pin(async move {
                    let installed: Vec<(String, String)> = {
                        let registry = server.registry.read().await;
                        registry
                            .iter()
                            .filter_map(|(_, info)| {
                                let filename = info.path.file_name()?.to_string_lossy().into_owned();
                                Some((info.short_name.clone(), filename))
                            })
                            .collect()
                    };
                    let client = reqwest::Client::new();
                    zimi_core::catalog::check_updates(&client, &installed)
                        .await
                        .into_iter()
                        .map(|u| PendingUpdate { name: u.name, download_url: u.download_url })
                        .collect()
                })
            },
            move |filename| downloading_server.downloads.is_downloading(filename),
            move |url| {
                let server = start_server.clone();
                let url = url.to_string();
                let complete_server = server.clone();
                let failure_server = server.clone();
                server
                    .downloads
                    .clone()
                    .start(
                        url,
                        false,
                        move |filename, is_update| {
                            let server = complete_server.clone();
                            let filename = filename.to_string();
                            tokio::spawn(async move {
                                server.refresh_library(true).await;
                                let event = if is_update { "updated" } else { "download" };
                                server.history.append(
                                    zimi_core::history::HistoryEvent::new(event, unix_now()).with("filename", filename),
                                );
                            });
                        },
                        move |filename, error| {
                            failure_server.history.append(
                                zimi_core::history::HistoryEvent::new("download_failed", unix_now())
                                    .with("filename", filename)
                                    .with("error", error),
                            );
                        },
                    )
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            },
        )
        .await;
    });
}

/// Background task that periodically snapshots the suggest cache to
/// `suggest_cache.json` so warm titles survive a restart. Runs for the
/// lifetime of the process.
pub fn spawn_suggest_cache_persist_loop(server: Arc<Server>) {
    tokio::spawn(async move {
        zimi_core::search::run_persist_loop(&server.search, Duration::from_secs(60)).await;
    });
}
