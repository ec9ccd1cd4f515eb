//! Zimi CLI — search, read, and serve a local ZIM library directly against
//! `zimi-core`, with no server process required for the read-only commands.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use zimi_core::config::Config;
use zimi_core::reader::placeholder_open;
use zimi_core::Server;

/// Zimi — offline ZIM-archive search and serving.
#[derive(Parser)]
#[command(name = "zimi", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory containing installed `.zim` files
    #[arg(long, global = true, default_value = "./zims")]
    zim_dir: PathBuf,

    /// Directory for the metadata cache, title indexes, history, and collections
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Full two-phase search across the library (or one archive with --scope)
    Search {
        query: String,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Run only the fast title-index phase
        #[arg(long)]
        fast: bool,
    },
    /// Title-suggestion type-ahead lookup
    Suggest {
        query: String,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Print one entry's raw bytes from an archive
    Read {
        archive: String,
        path: String,
    },
    /// List every installed archive
    List,
    /// Print a random article path, optionally scoped to one archive
    Random {
        #[arg(long)]
        scope: Option<String>,
    },
    /// Run the HTTP API on the given port
    Serve {
        #[arg(long, default_value = "8765")]
        port: u16,
    },
}

fn config(cli: &Cli) -> Config {
    Config {
        zim_dir: cli.zim_dir.clone(),
        data_dir: cli.data_dir.clone(),
        manage_enabled: true,
        manage_password_env: None,
        rate_limit: 0,
        auto_update_env: None,
        update_freq_env: None,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("zimi=info".parse().unwrap()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let server = Server::new(config(&cli), placeholder_open()).await;

    match &cli.command {
        Commands::Search { query, scope, limit, fast } => run_search(&server, &cli, query, scope.as_deref(), *limit, *fast).await,
        Commands::Suggest { query, scope, limit } => run_suggest(&server, &cli, query, scope.as_deref(), *limit).await,
        Commands::Read { archive, path } => run_read(&server, &cli, archive, path).await,
        Commands::List => run_list(&server, &cli).await,
        Commands::Random { scope } => run_random(&server, &cli, scope.as_deref()).await,
        Commands::Serve { port } => run_serve(server, *port).await,
    }
}

async fn scope_targets(
    server: &Server,
    scope: Option<&str>,
) -> Vec<(zimi_core::registry::ArchiveId, zimi_core::registry::ArchiveInfo)> {
    let registry = server.registry.read().await;
    match scope {
        None => registry.iter().map(|(id, info)| (id, info.clone())).collect(),
        Some(name) => match registry.id_of(name) {
            Some(id) => vec![(id, registry.get(id).expect("id_of and get agree").clone())],
            None => {
                eprintln!("unknown archive '{name}'");
                std::process::exit(1);
            }
        },
    }
}

async fn run_search(server: &Server, cli: &Cli, query: &str, scope: Option<&str>, limit: usize, fast: bool) {
    let targets = scope_targets(server, scope).await;
    let response = if fast {
        server.search.fast_phase(&targets, &server.title_index, &server.pools, &server.open, query, limit).await
    } else {
        server.search.full_phase(&targets, &server.pools, &server.open, query, limit, scope.is_some()).await
    };

    if cli.json {
        let items: Vec<serde_json::Value> = response
            .results
            .iter()
            .map(|r| serde_json::json!({ "archive": r.archive, "path": r.path, "title": r.title, "score": r.score }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&items).unwrap());
    } else {
        if response.results.is_empty() {
            eprintln!("No results for '{query}'");
            std::process::exit(1);
        }
        for r in &response.results {
            println!("{:<20} {:<50} {:>6.1}", r.archive, r.title, r.score);
        }
        eprintln!("\n{} results ({} archives)", response.total, response.by_source.len());
    }
}

async fn run_suggest(server: &Server, cli: &Cli, query: &str, scope: Option<&str>, limit: usize) {
    let targets = scope_targets(server, scope).await;
    let response = server.search.fast_phase(&targets, &server.title_index, &server.pools, &server.open, query, limit).await;

    if cli.json {
        let items: Vec<serde_json::Value> =
            response.results.iter().map(|r| serde_json::json!({ "archive": r.archive, "path": r.path, "title": r.title })).collect();
        println!("{}", serde_json::to_string_pretty(&items).unwrap());
    } else {
        for r in &response.results {
            println!("{:<20} {}", r.archive, r.title);
        }
    }
}

async fn run_read(server: &Server, cli: &Cli, archive: &str, path: &str) {
    let registry = server.registry.read().await;
    let Some(id) = registry.id_of(archive) else {
        eprintln!("unknown archive '{archive}'");
        std::process::exit(1);
    };
    let info = registry.get(id).expect("id_of and get agree").clone();
    drop(registry);

    let guard = match server.pools.content.get(id, &info.path, &server.open).await {
        Ok(g) => g,
        Err(e) => {
            eprintln!("failed to open '{archive}': {e}");
            std::process::exit(1);
        }
    };
    let reader = guard.as_ref().expect("just opened");
    let Some(entry) = zimi_http::content::resolve_entry(reader.as_ref(), path) else {
        eprintln!("entry not found: {path}");
        std::process::exit(1);
    };

    if cli.json {
        let output = serde_json::json!({
            "path": entry.path,
            "title": entry.title,
            "mimetype": entry.mimetype,
            "size": entry.size(),
        });
        println!("{}", serde_json::to_string_pretty(&output).unwrap());
    } else {
        use std::io::Write;
        std::io::stdout().write_all(&entry.content).ok();
    }
}

async fn run_list(server: &Server, cli: &Cli) {
    let registry = server.registry.read().await;
    if cli.json {
        let items: Vec<serde_json::Value> = registry
            .iter()
            .map(|(_, info)| {
                serde_json::json!({
                    "name": info.short_name,
                    "title": info.title,
                    "entry_count": info.entry_count,
                    "category": info.category,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items).unwrap());
    } else {
        for (_, info) in registry.iter() {
            println!("{:<20} {:<40} {}", info.short_name, info.title, info.entry_count.unwrap_or(0));
        }
        eprintln!("\n{} archives", registry.len());
    }
}

async fn run_random(server: &Server, cli: &Cli, scope: Option<&str>) {
    let targets = scope_targets(server, scope).await;
    if targets.is_empty() {
        eprintln!("no archives installed");
        std::process::exit(1);
    }
    let seed = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
    let (id, info) = &targets[(seed as usize) % targets.len()];
    let guard = server.pools.content.get(*id, &info.path, &server.open).await.expect("mock reader never fails to open");
    let reader = guard.as_ref().expect("just opened");
    let Some(path) = reader.random_path(seed) else {
        eprintln!("archive '{}' has no articles", info.short_name);
        std::process::exit(1);
    };

    if cli.json {
        println!("{}", serde_json::json!({ "archive": info.short_name, "path": path }));
    } else {
        println!("{}/{}", info.short_name, path);
    }
}

async fn run_serve(server: Arc<Server>, port: u16) {
    let ctx = zimi_http::AppContext { server };
    let app = zimi_http::api::router(ctx);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "zimi listening");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");
    axum::serve(listener, app.into_make_service()).await.expect("server error");
}
