//! Zimi server binary — thin CLI shell that wires `zimi-core`, `zimi-http`,
//! and `zimi-mcp` into one process: the HTTP API by default, or the MCP
//! stdio transport with `--mcp`.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use zimi_core::config::Config;
use zimi_core::reader::placeholder_open;
use zimi_core::Server;
use zimi_server::{build_app, spawn_auto_update_loop, spawn_suggest_cache_persist_loop};

/// Zimi — offline ZIM-archive knowledge server.
#[derive(Parser)]
#[command(name = "zimi-serve", version, about, long_about = None)]
struct Cli {
    /// Directory containing installed `.zim` files (overrides `ZIM_DIR`)
    #[arg(long)]
    zim_dir: Option<PathBuf>,

    /// Directory for the metadata cache, title indexes, history, and collections
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run as an MCP stdio server instead of the HTTP API
    #[arg(long)]
    mcp: bool,

    /// Port to bind the HTTP API to (ignored with --mcp)
    #[arg(long, default_value = "8765")]
    port: u16,

    /// Bind to 0.0.0.0 instead of 127.0.0.1
    #[arg(long)]
    bind_all: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("zimi=info".parse().unwrap()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(zim_dir) = cli.zim_dir {
        config.zim_dir = zim_dir;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let server = Server::new(config, placeholder_open()).await;
    spawn_auto_update_loop(server.clone());
    spawn_suggest_cache_persist_loop(server.clone());

    if cli.mcp {
        zimi_mcp::run_stdio(server).await;
        return;
    }

    let app = build_app(server);

    let host = if cli.bind_all { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    let addr = SocketAddr::from((host, cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!(%addr, error = %e, "failed to bind");
        std::process::exit(1);
    });
    tracing::info!(%addr, "zimi listening");
    axum::serve(listener, app.into_make_service()).await.expect("server error");
}
