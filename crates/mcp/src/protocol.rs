//! JSON-RPC 2.0 dispatch shared by the stdio and HTTP transports.
//!
//! Six tools, all read-only against a live `zimi_core::Server`: search,
//! suggest, read, list, random, and cross-archive resolve. No mutating
//! tools — installing or deleting archives stays behind the `/manage`
//! HTTP surface, not exposed here.

use std::sync::Arc;

use serde_json::{json, Value};

use zimi_core::registry::{ArchiveId, ArchiveInfo};
use zimi_core::Server;

pub(crate) const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2024-11-05"];
pub(crate) const LATEST_VERSION: &str = "2025-06-18";

/// Entry bodies longer than this are truncated in tool output — keeps a
/// single `zim_read` call from blowing an agent's context budget on one
/// large article.
const MAX_CONTENT_READ: usize = 64 * 1024;

pub(crate) fn negotiate_version(client_version: &str) -> &'static str {
    if let Some(v) = SUPPORTED_VERSIONS.iter().find(|&&v| v == client_version) {
        v
    } else {
        LATEST_VERSION
    }
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

fn tool_definitions() -> Value {
    let ro = json!({
        "readOnlyHint": true,
        "destructiveHint": false,
        "idempotentHint": true,
        "openWorldHint": false
    });

    json!([
        {
            "name": "zim_search",
            "annotations": ro,
            "description": "Full two-phase search across installed ZIM archives (title-index fast phase plus full-text phase). Use this first to find articles by keyword.\n\nReturns entries ranked by relevance, each with archive, path, title, and score.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search terms" },
                    "scope": { "type": "string", "description": "Archive short name to restrict the search to (default: all installed archives)" },
                    "limit": { "type": "integer", "description": "Max results (default: 20)" },
                    "fast": { "type": "boolean", "description": "Run only the fast title-index phase, skipping full text search" }
                },
                "required": ["query"]
            }
        },
        {
            "name": "zim_suggest",
            "annotations": ro,
            "description": "Title-suggestion type-ahead lookup, for completing a partial title rather than a full search.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Title prefix" },
                    "scope": { "type": "string", "description": "Archive short name to restrict to (default: all installed archives)" },
                    "limit": { "type": "integer", "description": "Max results (default: 10)" }
                },
                "required": ["query"]
            }
        },
        {
            "name": "zim_read",
            "annotations": ro,
            "description": "Read one entry's content out of a specific archive by its in-archive path. Follow up a zim_search hit with this to get the full article.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "archive": { "type": "string", "description": "Archive short name, as returned by zim_search or zim_list" },
                    "path": { "type": "string", "description": "Entry path within the archive, e.g. 'A/Python'" }
                },
                "required": ["archive", "path"]
            }
        },
        {
            "name": "zim_list",
            "annotations": ro,
            "description": "List every installed archive with its title and entry count.",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "zim_random",
            "annotations": ro,
            "description": "Pick a random entry path, optionally restricted to one archive.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "scope": { "type": "string", "description": "Archive short name to restrict to (default: any installed archive)" }
                }
            }
        },
        {
            "name": "zim_resolve",
            "annotations": ro,
            "description": "Resolve an external URL an archive's HTML links to (e.g. 'en.wikipedia.org/wiki/Foo') to an in-archive entry, if one is installed.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "host": { "type": "string", "description": "Hostname from the external link, e.g. 'en.wikipedia.org'" },
                    "path": { "type": "string", "description": "Path from the external link, e.g. '/wiki/Foo'" },
                    "from": { "type": "string", "description": "Short name of the archive the link was found in, for cross-reference tracking" }
                },
                "required": ["host", "path"]
            }
        }
    ])
}

// ---------------------------------------------------------------------------
// Tool call handlers
// ---------------------------------------------------------------------------

async fn scope_targets(server: &Server, scope: Option<&str>) -> Result<Vec<(ArchiveId, ArchiveInfo)>, String> {
    let registry = server.registry.read().await;
    match scope {
        None => Ok(registry.iter().map(|(id, info)| (id, info.clone())).collect()),
        Some(name) => match registry.id_of(name) {
            Some(id) => Ok(vec![(id, registry.get(id).expect("id_of and get agree").clone())]),
            None => Err(format!("Error: unknown archive '{name}'")),
        },
    }
}

async fn tool_search(server: &Server, args: &Value) -> (String, bool) {
    let query = match args.get("query").and_then(|v| v.as_str()).filter(|q| !q.is_empty()) {
        Some(q) => q,
        None => return ("Error: 'query' is required".into(), true),
    };
    let scope = args.get("scope").and_then(|v| v.as_str());
    let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
    let fast = args.get("fast").and_then(|v| v.as_bool()).unwrap_or(false);

    let targets = match scope_targets(server, scope).await {
        Ok(t) => t,
        Err(e) => return (e, true),
    };
    let response = if fast {
        server.search.fast_phase(&targets, &server.title_index, &server.pools, &server.open, query, limit).await
    } else {
        server.search.full_phase(&targets, &server.pools, &server.open, query, limit, scope.is_some()).await
    };

    if response.results.is_empty() {
        return (format!("No results for '{query}'"), false);
    }
    let mut out = format!("{} results across {} archives\n\n", response.total, response.by_source.len());
    for r in &response.results {
        out.push_str(&format!("{:<20} {:>6.1}  {}  ({})\n", r.archive, r.score, r.title, r.path));
    }
    (out, false)
}

async fn tool_suggest(server: &Server, args: &Value) -> (String, bool) {
    let query = match args.get("query").and_then(|v| v.as_str()).filter(|q| !q.is_empty()) {
        Some(q) => q,
        None => return ("Error: 'query' is required".into(), true),
    };
    let scope = args.get("scope").and_then(|v| v.as_str());
    let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;

    let targets = match scope_targets(server, scope).await {
        Ok(t) => t,
        Err(e) => return (e, true),
    };
    let response = server.search.fast_phase(&targets, &server.title_index, &server.pools, &server.open, query, limit).await;
    if response.results.is_empty() {
        return (format!("No suggestions for '{query}'"), false);
    }
    let mut out = String::new();
    for r in &response.results {
        out.push_str(&format!("{:<20} {}  ({})\n", r.archive, r.title, r.path));
    }
    (out, false)
}

async fn tool_read(server: &Server, args: &Value) -> (String, bool) {
    let archive = match args.get("archive").and_then(|v| v.as_str()) {
        Some(a) => a,
        None => return ("Error: 'archive' is required".into(), true),
    };
    let path = match args.get("path").and_then(|v| v.as_str()) {
        Some(p) => p,
        None => return ("Error: 'path' is required".into(), true),
    };

    let registry = server.registry.read().await;
    let Some(id) = registry.id_of(archive) else {
        return (format!("Error: unknown archive '{archive}'"), true);
    };
    let info = registry.get(id).expect("id_of and get agree").clone();
    drop(registry);

    let guard = match server.pools.content.get(id, &info.path, &server.open).await {
        Ok(g) => g,
        Err(e) => return (format!("Error: failed to open '{archive}': {e}"), true),
    };
    let reader = guard.as_ref().expect("just opened");
    let Some(entry) = zimi_http::content::resolve_entry(reader.as_ref(), path) else {
        return (format!("Error: entry not found: {path}"), true);
    };

    if entry.mimetype.starts_with("text/") || entry.mimetype.contains("json") {
        let text = String::from_utf8_lossy(&entry.content);
        let body = if text.len() > MAX_CONTENT_READ {
            let mut end = MAX_CONTENT_READ;
            while !text.is_char_boundary(end) && end > 0 {
                end -= 1;
            }
            format!("{}\n\n[truncated at {}KB]", &text[..end], MAX_CONTENT_READ / 1024)
        } else {
            text.into_owned()
        };
        (format!("# {} ({}, {} bytes)\n\n{}", entry.title, entry.mimetype, entry.size(), body), false)
    } else {
        (format!("# {} ({}, {} bytes) — binary content, not shown", entry.title, entry.mimetype, entry.size()), false)
    }
}

async fn tool_list(server: &Server) -> (String, bool) {
    let registry = server.registry.read().await;
    if registry.iter().next().is_none() {
        return ("No archives installed".into(), false);
    }
    let mut out = String::new();
    for (_, info) in registry.iter() {
        out.push_str(&format!("{:<20} {:<40} {} entries\n", info.short_name, info.title, info.entry_count.unwrap_or(0)));
    }
    (out, false)
}

async fn tool_random(server: &Server, args: &Value) -> (String, bool) {
    let scope = args.get("scope").and_then(|v| v.as_str());
    let targets = match scope_targets(server, scope).await {
        Ok(t) => t,
        Err(e) => return (e, true),
    };
    if targets.is_empty() {
        return ("Error: no archives installed".into(), true);
    }
    let seed = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
    let (id, info) = &targets[(seed as usize) % targets.len()];
    let guard = match server.pools.content.get(*id, &info.path, &server.open).await {
        Ok(g) => g,
        Err(e) => return (format!("Error: failed to open '{}': {e}", info.short_name), true),
    };
    let reader = guard.as_ref().expect("just opened");
    match reader.random_path(seed) {
        Some(path) => (format!("{}/{}", info.short_name, path), false),
        None => (format!("Error: archive '{}' has no articles", info.short_name), true),
    }
}

async fn tool_resolve(server: &Server, args: &Value) -> (String, bool) {
    let host = args.get("host").and_then(|v| v.as_str()).unwrap_or("");
    let path = match args.get("path").and_then(|v| v.as_str()) {
        Some(p) => p,
        None => return ("Error: 'path' is required".into(), true),
    };
    if host.is_empty() {
        return ("Error: 'host' is required".into(), true);
    }
    let from_name = args.get("from").and_then(|v| v.as_str());

    let domain_map = server.domain_map.read().await;
    let registry = server.registry.read().await;
    let from_id = from_name.and_then(|f| registry.id_of(f));

    match zimi_core::resolve::resolve(&domain_map, &registry, &server.pools.content, &server.open, host, path, from_id).await {
        Some((id, resolved_path)) => {
            let info = registry.get(id).expect("resolve returned a live id");
            (format!("{}/{}", info.short_name, resolved_path), false)
        }
        None => (format!("Error: could not resolve {host}{path}"), true),
    }
}

async fn dispatch_tool_call(server: &Server, name: &str, args: &Value) -> (String, bool) {
    match name {
        "zim_search" => tool_search(server, args).await,
        "zim_suggest" => tool_suggest(server, args).await,
        "zim_read" => tool_read(server, args).await,
        "zim_list" => tool_list(server).await,
        "zim_random" => tool_random(server, args).await,
        "zim_resolve" => tool_resolve(server, args).await,
        other => (format!("Error: unknown tool '{other}'"), true),
    }
}

// ---------------------------------------------------------------------------
// Shared JSON-RPC dispatch (used by both stdio and HTTP transports)
// ---------------------------------------------------------------------------

/// Process a single JSON-RPC request and return the response.
///
/// Returns `None` for notifications (no `id` field) — the caller is
/// responsible for init-ordering enforcement before calling this.
pub async fn dispatch_jsonrpc(server: &Arc<Server>, msg: &Value) -> Option<Value> {
    let method = msg["method"].as_str().unwrap_or("");
    let id = msg.get("id").cloned();

    if id.is_none() || method.starts_with("notifications/") {
        return None;
    }

    let response = match method {
        "initialize" => {
            let client_version = msg["params"]["protocolVersion"].as_str().unwrap_or("");
            let negotiated = negotiate_version(client_version);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": negotiated,
                    "capabilities": {
                        "tools": { "listChanged": false },
                        "prompts": { "listChanged": false },
                        "resources": { "listChanged": false }
                    },
                    "serverInfo": {
                        "name": "zimi",
                        "version": env!("CARGO_PKG_VERSION")
                    },
                    "instructions": "Zimi — search and read offline ZIM archives. Start with zim_search for discovery, zim_suggest for title completion. Use zim_read to fetch an entry's content. zim_list shows installed archives; zim_resolve follows a cross-archive link."
                }
            })
        }
        "tools/list" => {
            json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": tool_definitions() } })
        }
        "tools/call" => {
            let tool_name = msg["params"]["name"].as_str().unwrap_or("");
            let arguments = msg["params"].get("arguments").cloned().unwrap_or_else(|| json!({}));
            let (text, is_error) = dispatch_tool_call(server, tool_name, &arguments).await;

            // Never set isError: true at the JSON-RPC layer — prefix the text
            // instead so the agent can detect the failure without the host
            // treating this call (and any sibling parallel calls) as fatal.
            let content_text = if is_error { format!("\u{26a0} Error: {text}") } else { text };
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{ "type": "text", "text": content_text }],
                    "isError": false
                }
            })
        }
        "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
        _ => json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32601, "message": "Method not found" } }),
    };

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_version_echoes_known_version() {
        assert_eq!(negotiate_version("2024-11-05"), "2024-11-05");
    }

    #[test]
    fn negotiate_version_falls_back_to_latest() {
        assert_eq!(negotiate_version("1999-01-01"), LATEST_VERSION);
    }

    #[test]
    fn tool_definitions_names_all_six_tools() {
        let defs = tool_definitions();
        let names: Vec<&str> = defs.as_array().unwrap().iter().map(|d| d["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["zim_search", "zim_suggest", "zim_read", "zim_list", "zim_random", "zim_resolve"]);
    }

    async fn empty_server() -> Arc<Server> {
        use zimi_core::reader::placeholder_open;
        use zimi_core::Config;

        let zim_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let config = Config {
            zim_dir: zim_dir.path().to_path_buf(),
            data_dir: data_dir.path().to_path_buf(),
            manage_enabled: false,
            manage_password_env: None,
            rate_limit: 60,
            auto_update_env: None,
            update_freq_env: None,
        };
        let server = Server::new(config, placeholder_open()).await;
        // Keep the temp dirs alive for the server's lifetime by leaking them;
        // tests are short-lived processes so this is fine.
        std::mem::forget(zim_dir);
        std::mem::forget(data_dir);
        server
    }

    #[tokio::test]
    async fn initialize_negotiates_version_and_names_the_server() {
        let server = empty_server().await;
        let msg = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": { "protocolVersion": "2024-11-05" } });
        let resp = dispatch_jsonrpc(&server, &msg).await.unwrap();
        assert_eq!(resp["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(resp["result"]["serverInfo"]["name"], "zimi");
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let server = empty_server().await;
        let msg = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        assert!(dispatch_jsonrpc(&server, &msg).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let server = empty_server().await;
        let msg = json!({ "jsonrpc": "2.0", "id": 2, "method": "frobnicate" });
        let resp = dispatch_jsonrpc(&server, &msg).await.unwrap();
        assert_eq!(resp["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn zim_list_on_empty_library_says_so() {
        let server = empty_server().await;
        let msg = json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": { "name": "zim_list", "arguments": {} }
        });
        let resp = dispatch_jsonrpc(&server, &msg).await.unwrap();
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("No archives installed"));
        assert_eq!(resp["result"]["isError"], false);
    }

    #[tokio::test]
    async fn zim_search_without_query_reports_error_in_content_text() {
        let server = empty_server().await;
        let msg = json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": { "name": "zim_search", "arguments": {} }
        });
        let resp = dispatch_jsonrpc(&server, &msg).await.unwrap();
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("query"));
        // isError is never set true at the JSON-RPC layer, even on failure.
        assert_eq!(resp["result"]["isError"], false);
    }
}
