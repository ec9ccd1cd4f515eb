//! HTTP handlers for the Zimi reader/manage API: a `read_state()` /
//! `Result<Json<T>, (StatusCode, Json<Value>)>` handler idiom wired against
//! `zimi_core::Server`'s sub-services.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;

use zimi_core::metrics::UsageEvent;
use zimi_core::registry::{ArchiveId, ArchiveInfo};
use zimi_core::Server;

use crate::content::{self, ContentOutcome};
use crate::{AppContext, ApiError};

type ApiResult<T> = Result<T, ApiError>;

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(zimi_core::AppError::client(msg))
}

fn not_found(msg: impl Into<String>) -> ApiError {
    ApiError(zimi_core::AppError::not_found(msg))
}

/// Resolve `scope` (an archive short name, or empty for "every archive") into
/// the target list the search/resolve paths operate over.
async fn scope_targets(server: &Server, scope: &str) -> ApiResult<Vec<(ArchiveId, ArchiveInfo)>> {
    let registry = server.registry.read().await;
    if scope.is_empty() {
        return Ok(registry.iter().map(|(id, info)| (id, info.clone())).collect());
    }
    let id = registry.id_of(scope).ok_or_else(|| not_found(format!("unknown archive '{scope}'")))?;
    let info = registry.get(id).expect("id_of and get agree").clone();
    Ok(vec![(id, info)])
}

// ---------------------------------------------------------------------------
// Search / suggest / random
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SearchQuery {
    q: String,
    #[serde(default)]
    scope: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    fast: bool,
}

fn default_limit() -> usize {
    20
}

#[derive(Serialize)]
struct SearchResultJson {
    origin: &'static str,
    archive: String,
    path: String,
    title: String,
    snippet: Option<String>,
    score: f64,
}

#[derive(Serialize)]
struct SearchResponseJson {
    results: Vec<SearchResultJson>,
    by_source: std::collections::HashMap<String, usize>,
    total: usize,
    elapsed_seconds: f64,
    partial: bool,
}

impl From<zimi_core::search::SearchResponse> for SearchResponseJson {
    fn from(r: zimi_core::search::SearchResponse) -> Self {
        Self {
            results: r
                .results
                .into_iter()
                .map(|res| SearchResultJson {
                    origin: match res.origin {
                        zimi_core::search::SearchOrigin::Fast => "fast",
                        zimi_core::search::SearchOrigin::Full => "full",
                    },
                    archive: res.archive,
                    path: res.path,
                    title: res.title,
                    snippet: res.snippet,
                    score: res.score,
                })
                .collect(),
            by_source: r.by_source,
            total: r.total,
            elapsed_seconds: r.elapsed_seconds,
            partial: r.partial,
        }
    }
}

/// `GET /search` — `fast=1` runs only the title-index phase the UI fires
/// first; otherwise both phases run and the caller gets the merged full
/// response.
pub async fn search(State(ctx): State<AppContext>, Query(q): Query<SearchQuery>) -> ApiResult<Json<SearchResponseJson>> {
    if q.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    ctx.server.usage.record(UsageEvent::Search, None, &ctx.server.known_zim_names().await);
    let targets = scope_targets(&ctx.server, &q.scope).await?;
    let single_archive_scope = !q.scope.is_empty();

    if let Some(cached) = ctx.server.search.search_cache.get(&q.q, &q.scope, q.limit, q.fast) {
        return Ok(Json(cached.into()));
    }

    let response = if q.fast {
        ctx.server
            .search
            .fast_phase(&targets, &ctx.server.title_index, &ctx.server.pools, &ctx.server.open, &q.q, q.limit)
            .await
    } else {
        ctx.server
            .search
            .full_phase(&targets, &ctx.server.pools, &ctx.server.open, &q.q, q.limit, single_archive_scope)
            .await
    };
    ctx.server.search.search_cache.put(&q.q, &q.scope, q.limit, q.fast, response.clone());
    Ok(Json(response.into()))
}

#[derive(Deserialize)]
pub struct SuggestQuery {
    q: String,
    #[serde(default)]
    scope: String,
    #[serde(default = "default_suggest_limit")]
    limit: usize,
}

fn default_suggest_limit() -> usize {
    10
}

/// `GET /suggest` — always the fast phase; the search box's type-ahead.
pub async fn suggest(State(ctx): State<AppContext>, Query(q): Query<SuggestQuery>) -> ApiResult<Json<SearchResponseJson>> {
    if q.q.trim().is_empty() {
        return Ok(Json(SearchResponseJson {
            results: vec![],
            by_source: Default::default(),
            total: 0,
            elapsed_seconds: 0.0,
            partial: false,
        }));
    }
    let targets = scope_targets(&ctx.server, &q.scope).await?;
    let response = ctx
        .server
        .search
        .fast_phase(&targets, &ctx.server.title_index, &ctx.server.pools, &ctx.server.open, &q.q, q.limit)
        .await;
    Ok(Json(response.into()))
}

#[derive(Deserialize)]
pub struct RandomQuery {
    #[serde(default)]
    scope: String,
    #[serde(default)]
    thumb: bool,
    #[serde(default)]
    require_thumb: bool,
    /// `MMDD`; only consulted on the first attempt, as a deterministic seed
    /// ingredient (no dedicated dated-entry index is kept per archive).
    date: Option<String>,
    /// Salts the per-attempt seed so the same `(archive, seed)` pair always
    /// lands on the same article (daily-puzzle style determinism).
    seed: Option<String>,
    #[serde(default)]
    with_date: bool,
}

#[derive(Serialize)]
struct RandomResponse {
    archive: String,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blurb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attribution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    part_of_speech: Option<String>,
}

/// `GET /random` — a random article, scoped to one archive or the whole
/// library. `thumb`/`require_thumb` pull in a preview (retrying up to a few
/// times to find one with a thumbnail); Wiktionary archives retry harder to
/// skip non-English or "boring" inflected-form entries.
pub async fn random(State(ctx): State<AppContext>, Query(q): Query<RandomQuery>) -> ApiResult<Json<RandomResponse>> {
    let targets = scope_targets(&ctx.server, &q.scope).await?;
    if targets.is_empty() {
        return Err(not_found("no archives installed"));
    }
    let base_seed = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
    let (id, info) = &targets[(base_seed as usize) % targets.len()];
    let guard = ctx
        .server
        .pools
        .content
        .get(*id, &info.path, &ctx.server.open)
        .await
        .map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())))?;
    let reader = guard.as_ref().ok_or_else(|| not_found("archive failed to open"))?;

    let is_wiktionary = info.short_name.to_lowercase().contains("wiktionary");
    let want_preview = q.thumb || q.require_thumb || is_wiktionary;
    let max_tries: u64 = if is_wiktionary { 50 } else if q.require_thumb { 5 } else { 1 };

    let seed_for = |attempt: u64| -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        info.short_name.hash(&mut hasher);
        attempt.hash(&mut hasher);
        if let Some(s) = &q.seed {
            s.hash(&mut hasher);
        } else {
            base_seed.wrapping_add(attempt).hash(&mut hasher);
        }
        if attempt == 0 {
            if let Some(d) = &q.date {
                if d.len() == 4 {
                    d.hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    };

    let mut picked: Option<(String, Option<zimi_core::preview::Preview>)> = None;
    let mut fallback: Option<(String, Option<zimi_core::preview::Preview>)> = None;

    for attempt in 0..max_tries {
        let Some(path) = reader.random_path(seed_for(attempt)) else { continue };
        let preview = want_preview.then(|| zimi_core::preview::extract_preview(reader.as_ref(), &info.short_name, &path));

        if is_wiktionary {
            if let Some(p) = &preview {
                if p.non_english || p.boring {
                    fallback.get_or_insert_with(|| (path.clone(), preview.clone()));
                    continue;
                }
            }
            picked = Some((path, preview));
            break;
        }

        let has_thumb = preview.as_ref().and_then(|p| p.thumbnail.as_ref()).is_some();
        if !q.require_thumb || has_thumb {
            picked = Some((path, preview));
            break;
        }
        fallback.get_or_insert_with(|| (path.clone(), preview.clone()));
    }

    let (path, preview) = picked.or(fallback).ok_or_else(|| not_found("archive has no articles"))?;
    let mut response = RandomResponse {
        archive: info.short_name.clone(),
        path,
        title: None,
        thumbnail: None,
        blurb: None,
        attribution: None,
        speaker: None,
        author: None,
        part_of_speech: None,
    };
    if let Some(p) = preview {
        response.title = p.title;
        response.thumbnail = p.thumbnail;
        response.blurb = p.blurb;
        response.attribution = p.attribution;
        response.speaker = p.speaker;
        response.author = p.author;
        response.part_of_speech = p.part_of_speech;
    }
    let _ = q.with_date; // xkcd date lookup needs a per-archive dated-entry index we don't keep; left for a future pass.
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Plaintext read / snippet
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ReadQuery {
    zim: String,
    path: String,
    max_length: Option<usize>,
}

#[derive(Serialize)]
struct ReadResponse {
    archive: String,
    path: String,
    text: String,
}

/// `GET /read` — the plaintext rendering of one article, optionally
/// truncated to `max_length` characters.
pub async fn read_article(State(ctx): State<AppContext>, Query(q): Query<ReadQuery>) -> ApiResult<Json<ReadResponse>> {
    let registry = ctx.server.registry.read().await;
    let id = registry.id_of(&q.zim).ok_or_else(|| not_found(format!("unknown archive '{}'", q.zim)))?;
    let info = registry.get(id).expect("id_of and get agree").clone();
    drop(registry);

    let guard = ctx
        .server
        .pools
        .content
        .get(id, &info.path, &ctx.server.open)
        .await
        .map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())))?;
    let reader = guard.as_ref().ok_or_else(|| not_found("archive failed to open"))?;
    let text = zimi_core::preview::plain_text(reader.as_ref(), &q.path, q.max_length).ok_or_else(|| not_found("entry not found"))?;

    ctx.server.usage.record(UsageEvent::Read, Some(&q.zim), &[q.zim.clone()]);
    Ok(Json(ReadResponse { archive: q.zim, path: q.path, text }))
}

#[derive(Deserialize)]
pub struct SnippetQuery {
    zim: String,
    path: String,
}

#[derive(Serialize)]
struct SnippetResponse {
    title: Option<String>,
    thumbnail: Option<String>,
    blurb: Option<String>,
    attribution: Option<String>,
    speaker: Option<String>,
    author: Option<String>,
    part_of_speech: Option<String>,
}

impl From<zimi_core::preview::Preview> for SnippetResponse {
    fn from(p: zimi_core::preview::Preview) -> Self {
        Self {
            title: p.title,
            thumbnail: p.thumbnail,
            blurb: p.blurb,
            attribution: p.attribution,
            speaker: p.speaker,
            author: p.author,
            part_of_speech: p.part_of_speech,
        }
    }
}

/// `GET /snippet` — a short preview (thumbnail + blurb + typed metadata)
/// for one article, for link-preview-style summaries.
pub async fn snippet(State(ctx): State<AppContext>, Query(q): Query<SnippetQuery>) -> ApiResult<Json<SnippetResponse>> {
    let registry = ctx.server.registry.read().await;
    let id = registry.id_of(&q.zim).ok_or_else(|| not_found(format!("unknown archive '{}'", q.zim)))?;
    let info = registry.get(id).expect("id_of and get agree").clone();
    drop(registry);

    let guard = ctx
        .server
        .pools
        .content
        .get(id, &info.path, &ctx.server.open)
        .await
        .map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())))?;
    let reader = guard.as_ref().ok_or_else(|| not_found("archive failed to open"))?;
    let preview = zimi_core::preview::extract_preview(reader.as_ref(), &q.zim, &q.path);
    Ok(Json(preview.into()))
}

// ---------------------------------------------------------------------------
// Library listing
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ArchiveSummary {
    name: String,
    title: String,
    description: String,
    category: Option<&'static str>,
    publication_date: Option<String>,
    has_icon: bool,
    entry_count: Option<u64>,
    favorite: bool,
}

/// `GET /list` — every installed archive plus its favorite flag.
pub async fn list(State(ctx): State<AppContext>) -> Json<Vec<ArchiveSummary>> {
    let registry = ctx.server.registry.read().await;
    let favorites = ctx.server.collections.snapshot().favorites;
    let out = registry
        .iter()
        .map(|(_, info)| ArchiveSummary {
            name: info.short_name.clone(),
            title: info.title.clone(),
            description: info.description.clone(),
            category: info.category,
            publication_date: info.publication_date.clone(),
            has_icon: info.has_icon,
            entry_count: info.entry_count,
            favorite: favorites.contains(&info.short_name),
        })
        .collect();
    Json(out)
}

// ---------------------------------------------------------------------------
// Collections / favorites
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CollectionsResponseJson {
    favorites: Vec<String>,
    collections: std::collections::HashMap<String, CollectionJson>,
}

#[derive(Serialize)]
struct CollectionJson {
    label: String,
    zims: Vec<String>,
}

impl From<zimi_core::collections::CollectionsData> for CollectionsResponseJson {
    fn from(d: zimi_core::collections::CollectionsData) -> Self {
        Self {
            favorites: d.favorites,
            collections: d
                .collections
                .into_iter()
                .map(|(k, v)| (k, CollectionJson { label: v.label, zims: v.zims }))
                .collect(),
        }
    }
}

pub async fn get_collections(State(ctx): State<AppContext>) -> Json<CollectionsResponseJson> {
    Json(ctx.server.collections.snapshot().into())
}

#[derive(Deserialize)]
pub struct UpsertCollectionRequest {
    name: String,
    label: String,
    #[serde(default)]
    zims: Vec<String>,
}

/// `POST /collections` — create or replace a named collection.
pub async fn upsert_collection(
    State(ctx): State<AppContext>,
    Json(body): Json<UpsertCollectionRequest>,
) -> ApiResult<StatusCode> {
    ctx.server.collections.upsert_collection(&body.name, &body.label, body.zims)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /collections/:name`.
pub async fn delete_collection(State(ctx): State<AppContext>, AxumPath(name): AxumPath<String>) -> StatusCode {
    if ctx.server.collections.delete_collection(&name) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Deserialize)]
pub struct FavoriteRequest {
    zim_name: String,
}

#[derive(Serialize)]
struct FavoriteResponse {
    favorite: bool,
}

/// `POST /favorites` — toggles the named archive's favorite flag.
pub async fn toggle_favorite(
    State(ctx): State<AppContext>,
    Json(body): Json<FavoriteRequest>,
) -> ApiResult<Json<FavoriteResponse>> {
    let known = ctx.server.known_zim_names().await;
    let favorite = ctx.server.collections.toggle_favorite(&body.zim_name, &known)?;
    Ok(Json(FavoriteResponse { favorite }))
}

// ---------------------------------------------------------------------------
// Cross-archive resolve
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ResolveQuery {
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    from: Option<String>,
}

#[derive(Serialize)]
struct ResolveResponse {
    archive: String,
    path: String,
}

async fn do_resolve(server: &Server, host: &str, path: &str, from: Option<&str>) -> ApiResult<Json<ResolveResponse>> {
    let registry = server.registry.read().await;
    let from_id = from.and_then(|n| registry.id_of(n));
    let domain_map = server.domain_map.read().await;
    let hit = zimi_core::resolve::resolve(&domain_map, &registry, &server.pools.content, &server.open, host, path, from_id)
        .await
        .ok_or_else(|| not_found("no installed archive serves that URL"))?;
    let info = registry.get(hit.0).expect("resolve only returns known ids");
    Ok(Json(ResolveResponse { archive: info.short_name.clone(), path: hit.1 }))
}

pub async fn resolve_get(State(ctx): State<AppContext>, Query(q): Query<ResolveQuery>) -> ApiResult<Json<ResolveResponse>> {
    do_resolve(&ctx.server, &q.host, &q.path, q.from.as_deref()).await
}

pub async fn resolve_post(State(ctx): State<AppContext>, Json(q): Json<ResolveQuery>) -> ApiResult<Json<ResolveResponse>> {
    do_resolve(&ctx.server, &q.host, &q.path, q.from.as_deref()).await
}

// ---------------------------------------------------------------------------
// Content serving
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ContentQuery {
    #[serde(default)]
    raw: bool,
    #[serde(default)]
    view: bool,
}

/// `GET /w/:archive/*entry_path` — the content-serving endpoint. Decides the
/// outcome via `content::resolve_content`, then turns it into an axum
/// response.
pub async fn read_content(
    State(ctx): State<AppContext>,
    AxumPath((archive, entry_path)): AxumPath<(String, String)>,
    Query(q): Query<ContentQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let registry = ctx.server.registry.read().await;
    let id = registry.id_of(&archive).ok_or_else(|| not_found(format!("unknown archive '{archive}'")))?;
    let info = registry.get(id).expect("id_of and get agree").clone();
    drop(registry);

    let guard = ctx
        .server
        .pools
        .content
        .get(id, &info.path, &ctx.server.open)
        .await
        .map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())))?;
    let reader = guard.as_ref().ok_or_else(|| not_found("archive failed to open"))?;

    // A bare `/w/<archive>/` with no further path is the document-level
    // navigation case the front end's SPA shell owns, unless `?raw=1`.
    let is_document_navigation = entry_path.is_empty() || !entry_path.contains('/');
    let range_header = headers.get(axum::http::header::RANGE).and_then(|v| v.to_str().ok());
    let outcome = content::resolve_content(reader.as_ref(), &archive, &entry_path, q.raw, q.view, is_document_navigation, range_header);

    ctx.server.usage.record(UsageEvent::Read, Some(&archive), &[archive.clone()]);

    match outcome {
        ContentOutcome::Shell => Ok((StatusCode::OK, Json(json!({ "shell": true }))).into_response()),
        ContentOutcome::Redirect { location } => {
            Ok(axum::response::Redirect::to(&location).into_response())
        }
        ContentOutcome::TooLarge => Err(ApiError(zimi_core::AppError::TooLarge("entry exceeds the serving size ceiling".into()))),
        ContentOutcome::NotFound => Err(not_found("entry not found")),
        ContentOutcome::Body { mime, bytes, is_epub, etag, range, accept_ranges } => {
            if headers.get(axum::http::header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some(etag.as_str()) {
                return Response::builder()
                    .status(StatusCode::NOT_MODIFIED)
                    .header(axum::http::header::ETAG, etag)
                    .body(axum::body::Body::empty())
                    .map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())));
            }
            let mut builder = Response::builder()
                .header(axum::http::header::CONTENT_TYPE, &mime)
                .header(axum::http::header::ETAG, &etag)
                .header(axum::http::header::CACHE_CONTROL, "public, max-age=86400, immutable");
            if is_epub {
                builder = builder.header(axum::http::header::CONTENT_DISPOSITION, "attachment");
            }
            if mime.starts_with("text/html") {
                builder = builder.header(
                    "content-security-policy",
                    "default-src 'self'; style-src 'self' 'unsafe-inline'; script-src 'self' 'unsafe-inline'; connect-src 'self'; frame-ancestors 'self'",
                );
            }
            if accept_ranges {
                builder = builder.header(axum::http::header::ACCEPT_RANGES, "bytes");
            }
            let body = if let Some(r) = range {
                builder = builder
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(axum::http::header::CONTENT_RANGE, format!("bytes {}-{}/{}", r.start, r.end, r.total));
                bytes[r.start as usize..=r.end as usize].to_vec()
            } else {
                bytes
            };
            builder.body(axum::body::Body::from(body)).map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())))
        }
    }
}

// ---------------------------------------------------------------------------
// Management — status, stats, usage
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ManageStatus {
    enabled: bool,
    has_password: bool,
}

pub async fn manage_status(State(ctx): State<AppContext>) -> Json<ManageStatus> {
    Json(ManageStatus { enabled: ctx.server.config.manage_enabled, has_password: ctx.server.manage_password.is_set() })
}

/// `GET /manage/has-password` — the one manage-prefixed probe left
/// unauthenticated so the UI can ask "is a password already set" before the
/// user has one to send.
pub async fn has_password(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(json!({ "has_password": ctx.server.manage_password.is_set() }))
}

pub async fn manage_stats(State(ctx): State<AppContext>) -> Json<zimi_core::metrics::MetricsSnapshot> {
    Json(ctx.server.metrics.snapshot())
}

pub async fn manage_usage(State(ctx): State<AppContext>) -> Json<zimi_core::metrics::UsageSnapshot> {
    Json(ctx.server.usage.snapshot())
}

pub async fn manage_history(State(ctx): State<AppContext>) -> Json<Vec<zimi_core::history::HistoryEvent>> {
    Json(ctx.server.history.list())
}

pub async fn manage_downloads(State(ctx): State<AppContext>) -> Json<Vec<DownloadRecordJson>> {
    Json(ctx.server.downloads.list().into_iter().map(Into::into).collect())
}

#[derive(Serialize)]
pub struct DownloadRecordJson {
    id: String,
    url: String,
    filename: String,
    is_update: bool,
    status: &'static str,
    bytes_downloaded: u64,
    total_bytes: Option<u64>,
    error: Option<String>,
}

impl From<zimi_core::download::DownloadRecord> for DownloadRecordJson {
    fn from(r: zimi_core::download::DownloadRecord) -> Self {
        Self {
            id: r.id.to_string(),
            url: r.url,
            filename: r.filename,
            is_update: r.is_update,
            status: match r.status {
                zimi_core::download::DownloadStatus::Downloading => "downloading",
                zimi_core::download::DownloadStatus::Completed => "completed",
                zimi_core::download::DownloadStatus::Failed => "failed",
                zimi_core::download::DownloadStatus::Cancelled => "cancelled",
            },
            bytes_downloaded: r.bytes_downloaded,
            total_bytes: r.total_bytes,
            error: r.error,
        }
    }
}

// ---------------------------------------------------------------------------
// Management — catalog, downloads, library mutation
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CatalogQuery {
    #[serde(default)]
    query: String,
    #[serde(default = "default_catalog_lang")]
    lang: String,
    #[serde(default = "default_catalog_page")]
    count: u32,
    #[serde(default)]
    offset: u32,
}

fn default_catalog_lang() -> String {
    "eng".to_string()
}

fn default_catalog_page() -> u32 {
    50
}

/// `GET /manage/catalog` — one page of the Kiwix OPDS catalog, with
/// already-installed archives flagged.
pub async fn manage_catalog(
    State(ctx): State<AppContext>,
    Query(q): Query<CatalogQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let client = reqwest::Client::new();
    let (total, mut entries) =
        zimi_core::catalog::fetch_page(&client, &q.query, &q.lang, q.count, q.offset).await.map_err(ApiError)?;
    let installed: std::collections::HashSet<String> = {
        let registry = ctx.server.registry.read().await;
        registry
            .iter()
            .filter_map(|(_, info)| info.path.file_name().map(|f| f.to_string_lossy().trim_end_matches(".zim").to_string()))
            .collect()
    };
    zimi_core::catalog::mark_installed(&mut entries, &installed);
    Ok(Json(json!({ "total": total, "entries": entries })))
}

/// `GET /manage/check-updates` — cross-reference installed archives against
/// the full catalog for newer dated releases.
pub async fn manage_check_updates(State(ctx): State<AppContext>) -> Json<Vec<AvailableUpdateJson>> {
    let client = reqwest::Client::new();
    let installed: Vec<(String, String)> = {
        let registry = ctx.server.registry.read().await;
        registry
            .iter()
            .filter_map(|(_, info)| {
                info.path.file_name().map(|f| (info.short_name.clone(), f.to_string_lossy().into_owned()))
            })
            .collect()
    };
    let updates = zimi_core::catalog::check_updates(&client, &installed).await;
    Json(updates.into_iter().map(Into::into).collect())
}

#[derive(Serialize)]
pub struct AvailableUpdateJson {
    name: String,
    installed_file: String,
    installed_date: String,
    latest_date: String,
    download_url: String,
    title: String,
    size_bytes: u64,
}

impl From<zimi_core::catalog::AvailableUpdate> for AvailableUpdateJson {
    fn from(u: zimi_core::catalog::AvailableUpdate) -> Self {
        Self {
            name: u.name,
            installed_file: u.installed_file,
            installed_date: u.installed_date,
            latest_date: u.latest_date,
            download_url: u.download_url,
            title: u.title,
            size_bytes: u.size_bytes,
        }
    }
}

#[derive(Deserialize)]
pub struct DownloadRequest {
    url: String,
    #[serde(default)]
    allow_any_https_host: bool,
}

#[derive(Serialize)]
struct DownloadStartedResponse {
    id: String,
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// `POST /manage/download` — start (or resume tracking) a ZIM download into
/// the library directory; a completed transfer triggers a library refresh
/// and a `download`/`updated` history event, a non-cancelled failure logs
/// `download_failed`.
pub async fn manage_download(
    State(ctx): State<AppContext>,
    Json(body): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadStartedResponse>> {
    let server: Arc<Server> = ctx.server.clone();
    let complete_server = server.clone();
    let failure_server = server.clone();
    let id = server
        .downloads
        .clone()
        .start(
            body.url,
            body.allow_any_https_host,
            move |filename, is_update| {
                let server = complete_server.clone();
                let filename = filename.to_string();
                tokio::spawn(async move {
                    server.refresh_library(true).await;
                    let event = if is_update { "updated" } else { "download" };
                    server
                        .history
                        .append(zimi_core::history::HistoryEvent::new(event, unix_now()).with("filename", filename));
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
        .map_err(ApiError)?;
    Ok(Json(DownloadStartedResponse { id: id.to_string() }))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    id: String,
}

pub async fn manage_cancel(State(ctx): State<AppContext>, Json(body): Json<CancelRequest>) -> ApiResult<StatusCode> {
    let id = uuid::Uuid::parse_str(&body.id).map_err(|_| bad_request("invalid download id"))?;
    if ctx.server.downloads.cancel(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("no such download"))
    }
}

/// `POST /manage/refresh` — rescan the ZIM directory.
#[derive(Deserialize, Default)]
pub struct RefreshRequest {
    #[serde(default)]
    force: bool,
}

pub async fn manage_refresh(State(ctx): State<AppContext>, body: Option<Json<RefreshRequest>>) -> Json<serde_json::Value> {
    let force = body.map(|b| b.0.force).unwrap_or(false);
    ctx.server.refresh_library(force).await;
    Json(json!({ "archives": ctx.server.archive_count().await }))
}

#[derive(Deserialize)]
pub struct BuildFtsRequest {
    archive: String,
}

/// `POST /manage/build-fts` — add an FTS5 table to an archive's title index
/// that was built without one.
pub async fn manage_build_fts(
    State(ctx): State<AppContext>,
    Json(body): Json<BuildFtsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let added = zimi_core::title_index::build_fts_in_place(ctx.server.title_index.dir(), &body.archive)
        .map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())))?;
    Ok(Json(json!({ "added": added })))
}

#[derive(Deserialize)]
pub struct DeleteArchiveRequest {
    archive: String,
}

/// `POST /manage/delete` — remove an installed archive's ZIM file from disk
/// and refresh the library.
pub async fn manage_delete(
    State(ctx): State<AppContext>,
    Json(body): Json<DeleteArchiveRequest>,
) -> ApiResult<StatusCode> {
    let path = {
        let registry = ctx.server.registry.read().await;
        let id = registry.id_of(&body.archive).ok_or_else(|| not_found("unknown archive"))?;
        registry.get(id).expect("id_of and get agree").path.clone()
    };
    tokio::fs::remove_file(&path).await.map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())))?;
    ctx.server.refresh_library(true).await;
    ctx.server
        .history
        .append(zimi_core::history::HistoryEvent::new("deleted", unix_now()).with("archive", body.archive));
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /manage/clear-downloads` is intentionally absent: completed
/// transfer records age out of `DownloadManager` on their own retention
/// timer, so there is nothing for an endpoint to clear.

// ---------------------------------------------------------------------------
// Management — auto-update, password
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AutoUpdateStatus {
    enabled: bool,
    frequency: &'static str,
    env_locked: bool,
}

pub async fn manage_auto_update_status(State(ctx): State<AppContext>) -> Json<AutoUpdateStatus> {
    Json(AutoUpdateStatus {
        enabled: ctx.server.auto_update.enabled(),
        frequency: ctx.server.auto_update.frequency().as_str(),
        env_locked: ctx.server.auto_update.env_locked(),
    })
}

#[derive(Deserialize)]
pub struct SetAutoUpdateRequest {
    enabled: bool,
    frequency: String,
}

pub async fn manage_set_auto_update(
    State(ctx): State<AppContext>,
    Json(body): Json<SetAutoUpdateRequest>,
) -> ApiResult<Json<AutoUpdateStatus>> {
    let frequency = zimi_core::autoupdate::UpdateFrequency::parse_strict(&body.frequency)
        .ok_or_else(|| bad_request("frequency must be one of daily, weekly, monthly"))?;
    if !ctx.server.auto_update.set(body.enabled, frequency) {
        return Err(bad_request("auto-update is pinned by the environment and cannot be changed here"));
    }
    Ok(Json(AutoUpdateStatus {
        enabled: ctx.server.auto_update.enabled(),
        frequency: ctx.server.auto_update.frequency().as_str(),
        env_locked: ctx.server.auto_update.env_locked(),
    }))
}

#[derive(Deserialize)]
pub struct SetPasswordRequest {
    password: String,
}

pub async fn manage_set_password(
    State(ctx): State<AppContext>,
    Json(body): Json<SetPasswordRequest>,
) -> ApiResult<StatusCode> {
    ctx.server
        .manage_password
        .set(&body.password)
        .map_err(|e| ApiError(zimi_core::AppError::internal(e.to_string())))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Every route this crate owns, with the rate-limit and manage-auth layers
/// applied to the read/search and manage route groups. `zimi-server`'s
/// `main.rs` merges this into the outer `Router` and adds the
/// `tower-http` layers (tracing, compression, CORS).
pub fn router(ctx: AppContext) -> Router {
    let limited = Router::new()
        .route("/search", get(search))
        .route("/suggest", get(suggest))
        .route("/read", get(read_article))
        .route("/snippet", get(snippet))
        .route("/random", get(random))
        .route("/resolve", get(resolve_get).post(resolve_post))
        .route("/collections/:name", delete(delete_collection))
        .route_layer(axum::middleware::from_fn_with_state(ctx.clone(), crate::middleware::rate_limit));

    let manage = Router::new()
        .route("/manage/status", get(manage_status))
        .route("/manage/stats", get(manage_stats))
        .route("/manage/usage", get(manage_usage))
        .route("/manage/history", get(manage_history))
        .route("/manage/downloads", get(manage_downloads))
        .route("/manage/catalog", get(manage_catalog))
        .route("/manage/check-updates", get(manage_check_updates))
        .route("/manage/download", post(manage_download))
        .route("/manage/cancel", post(manage_cancel))
        .route("/manage/refresh", post(manage_refresh))
        .route("/manage/build-fts", post(manage_build_fts))
        .route("/manage/delete", post(manage_delete))
        .route("/manage/auto-update", get(manage_auto_update_status).post(manage_set_auto_update))
        .route("/manage/set-password", post(manage_set_password))
        .route_layer(axum::middleware::from_fn_with_state(ctx.clone(), crate::middleware::manage_auth));

    Router::new()
        .merge(limited)
        .merge(manage)
        .route("/manage/has-password", get(has_password))
        .route("/list", get(list))
        .route("/collections", get(get_collections).post(upsert_collection))
        .route("/favorites", post(toggle_favorite))
        .route("/w/:archive/*entry_path", get(read_content))
        .with_state(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use zimi_core::reader::placeholder_open;
    use zimi_core::Config;

    async fn test_server() -> Arc<Server> {
        let zim_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let config = Config {
            zim_dir: zim_dir.path().to_path_buf(),
            data_dir: data_dir.path().to_path_buf(),
            manage_enabled: true,
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
    async fn list_on_an_empty_library_returns_an_empty_array() {
        let server = test_server().await;
        let app = router(AppContext { server });

        let response = app.oneshot(Request::builder().uri("/list").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn manage_status_requires_no_password_by_default() {
        let server = test_server().await;
        let app = router(AppContext { server });

        let response = app.oneshot(Request::builder().uri("/manage/status").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn resolve_unknown_host_is_not_found() {
        let server = test_server().await;
        let app = router(AppContext { server });

        let response = app
            .oneshot(Request::builder().uri("/resolve?host=nowhere.example&path=/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn read_content_for_unknown_archive_is_not_found() {
        let server = test_server().await;
        let app = router(AppContext { server });

        let response = app.oneshot(Request::builder().uri("/w/nope/A/Foo").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
