//! The two-phase search pipeline: a cheap title-only fast
//! phase the UI fires first, and a full Xapian-style phase fired right
//! behind it, merged by the caller. Grounded verbatim in `_clean_query`,
//! `_score_result`, `search_all`, `STOP_WORDS` from `zimi.py`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::pool::{ArchivePools, OpenFn};
use crate::reader::ZimReader;
use crate::registry::{ArchiveId, ArchiveInfo};
use crate::title_index::TitleIndexPool;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "how", "i",
    "in", "is", "it", "its", "my", "not", "of", "on", "or", "so", "that", "the", "this", "to",
    "was", "we", "what", "when", "where", "which", "who", "will", "with", "you",
];

const FULL_PHASE_DEADLINE: Duration = Duration::from_secs(30);
const SUGGEST_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const SEARCH_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const SEARCH_CACHE_TTL_REACCESSED: Duration = Duration::from_secs(30 * 60);
const SEARCH_CACHE_MAX_ENTRIES: usize = 100;

/// Where a surviving result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOrigin {
    Fast,
    Full,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub origin: SearchOrigin,
    pub archive: String,
    pub path: String,
    pub title: String,
    pub snippet: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub by_source: HashMap<String, usize>,
    pub total: usize,
    pub elapsed_seconds: f64,
    pub partial: bool,
}

/// Strip stop words outside balanced double quotes; quoted phrases are kept
/// verbatim. Falls back to the raw query if stripping empties it. Skipped
/// entirely when the scope is a single archive.
pub fn clean_query(query: &str, single_archive_scope: bool) -> String {
    if single_archive_scope {
        return query.to_string();
    }
    let mut out_words: Vec<String> = Vec::new();
    let mut in_quotes = false;
    let mut quoted_buf = String::new();

    for ch in query.chars() {
        if ch == '"' {
            if in_quotes {
                out_words.push(format!("\"{quoted_buf}\""));
                quoted_buf.clear();
            }
            in_quotes = !in_quotes;
            continue;
        }
        if in_quotes {
            quoted_buf.push(ch);
        }
    }
    // Re-scan for the non-quoted words, stripping anything inside quotes first
    // so stop-word filtering never touches quoted text.
    let mut masked = String::with_capacity(query.len());
    let mut in_q = false;
    for ch in query.chars() {
        if ch == '"' {
            in_q = !in_q;
            masked.push(' ');
            continue;
        }
        masked.push(if in_q { ' ' } else { ch });
    }
    for word in masked.split_whitespace() {
        if !STOP_WORDS.contains(&word.to_lowercase().as_str()) {
            out_words.push(word.to_string());
        }
    }

    let cleaned = out_words.join(" ");
    if cleaned.trim().is_empty() {
        query.to_string()
    } else {
        cleaned
    }
}

fn title_score(query_words: &[&str], title_lower: &str) -> f64 {
    if query_words.is_empty() {
        return 0.0;
    }
    let joined = query_words.join(" ");
    if title_lower.contains(&joined) {
        return 100.0;
    }
    let hits = query_words.iter().filter(|w| title_lower.contains(**w)).count();
    if hits == query_words.len() {
        80.0
    } else if hits > 0 {
        50.0 * hits as f64 / query_words.len() as f64
    } else {
        0.0
    }
}

fn rank_score(rank: usize, title_score: f64) -> f64 {
    let raw = 20.0 / (rank as f64 + 1.0);
    if title_score == 0.0 {
        raw.min(5.0)
    } else {
        raw
    }
}

fn auth_score(entries: u64) -> f64 {
    (entries.max(1) as f64).log10() / 2.0
}

fn score(query_words: &[&str], title: &str, rank: usize, entries: u64) -> f64 {
    let title_lower = title.to_lowercase();
    let t = title_score(query_words, &title_lower);
    let r = rank_score(rank, t);
    let a = auth_score(entries).min(5.0);
    t + r + a
}

/// Matches the junk-path regex `questions/tagged/|/tags$|/tags/page` from
/// `search_all`, without pulling in a regex for three
/// literal alternatives.
fn is_junk_path(path: &str) -> bool {
    path.contains("questions/tagged/") || path.ends_with("/tags") || path.contains("/tags/page")
}

// ---------------------------------------------------------------------------
// Suggest cache
// ---------------------------------------------------------------------------

struct SuggestCacheEntry {
    hits: Vec<(String, String)>,
    created: Instant,
}

/// One row of the on-disk snapshot. `Instant` isn't serializable, so a
/// reloaded entry is re-stamped `created: Instant::now()` rather than
/// carrying its original age across a restart.
#[derive(Serialize, Deserialize)]
struct PersistedSuggestEntry {
    query: String,
    archive: String,
    hits: Vec<(String, String)>,
}

/// Cache of fast-phase title hits keyed by (lowercased query, archive).
/// Optionally backed by a `suggest_cache.json` snapshot under a data
/// directory, loaded once at startup and flushed periodically by
/// `run_persist_loop` rather than on every write.
#[derive(Default)]
pub struct SuggestCache {
    entries: Mutex<HashMap<(String, String), SuggestCacheEntry>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl SuggestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a prior snapshot from `<data_dir>/suggest_cache.json`, if one
    /// exists and parses. A missing or corrupt file starts empty, matching
    /// `HistoryLog::new`'s tolerance for a blank data directory.
    pub fn with_persistence(data_dir: &Path) -> Self {
        let path = data_dir.join("suggest_cache.json");
        let mut entries = HashMap::new();
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(rows) = serde_json::from_str::<Vec<PersistedSuggestEntry>>(&raw) {
                for row in rows {
                    entries.insert((row.query, row.archive), SuggestCacheEntry { hits: row.hits, created: Instant::now() });
                }
            }
        }
        Self { entries: Mutex::new(entries), path: Some(path), dirty: AtomicBool::new(false) }
    }

    fn get(&self, query: &str, archive: &str) -> Option<Vec<(String, String)>> {
        let mut map = self.entries.lock().unwrap();
        let key = (query.to_lowercase(), archive.to_string());
        if let Some(e) = map.get(&key) {
            if e.created.elapsed() < SUGGEST_CACHE_TTL {
                return Some(e.hits.clone());
            }
            map.remove(&key);
        }
        None
    }

    fn put(&self, query: &str, archive: &str, hits: Vec<(String, String)>) {
        let key = (query.to_lowercase(), archive.to_string());
        self.entries.lock().unwrap().insert(key, SuggestCacheEntry { hits, created: Instant::now() });
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Write the current entries to disk if anything changed since the last
    /// flush, via the same write-to-tmp-then-rename pattern `HistoryLog`
    /// uses. A no-op when constructed with `new()` (no path).
    pub fn flush_if_dirty(&self) {
        let Some(path) = &self.path else { return };
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return;
        }
        let rows: Vec<PersistedSuggestEntry> = {
            let map = self.entries.lock().unwrap();
            map.iter()
                .map(|((query, archive), entry)| PersistedSuggestEntry {
                    query: query.clone(),
                    archive: archive.clone(),
                    hits: entry.hits.clone(),
                })
                .collect()
        };
        let Ok(json) = serde_json::to_string(&rows) else { return };
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let tmp = path.with_extension("json.tmp");
        if std::fs::write(&tmp, json).is_err() {
            tracing::warn!(path = %path.display(), "failed to write suggest cache snapshot");
            return;
        }
        if std::fs::rename(&tmp, path).is_err() {
            tracing::warn!(path = %path.display(), "failed to rename suggest cache snapshot into place");
        }
    }
}

// ---------------------------------------------------------------------------
// Search result cache
// ---------------------------------------------------------------------------

struct SearchCacheEntry {
    response: SearchResponse,
    created: Instant,
    access_count: u32,
}

/// Cache of full search responses keyed by (query, scope, limit, fast flag).
/// TTL 15 min, extended to 30 min once re-accessed; bounded to 100 entries,
/// evicted by oldest creation time.
#[derive(Default)]
pub struct SearchCache {
    entries: Mutex<HashMap<(String, String, usize, bool), SearchCacheEntry>>,
}

impl SearchCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(query: &str, scope: &str, limit: usize, fast: bool) -> (String, String, usize, bool) {
        (query.to_lowercase(), scope.to_string(), limit, fast)
    }

    pub fn get(&self, query: &str, scope: &str, limit: usize, fast: bool) -> Option<SearchResponse> {
        let mut map = self.entries.lock().unwrap();
        let key = Self::key(query, scope, limit, fast);
        let ttl = {
            let Some(e) = map.get(&key) else { return None };
            if e.access_count > 0 { SEARCH_CACHE_TTL_REACCESSED } else { SEARCH_CACHE_TTL }
        };
        if let Some(e) = map.get_mut(&key) {
            if e.created.elapsed() < ttl {
                e.access_count += 1;
                return Some(e.response.clone());
            }
        }
        map.remove(&key);
        None
    }

    pub fn put(&self, query: &str, scope: &str, limit: usize, fast: bool, response: SearchResponse) {
        let mut map = self.entries.lock().unwrap();
        if map.len() >= SEARCH_CACHE_MAX_ENTRIES {
            if let Some(oldest_key) = map.iter().min_by_key(|(_, e)| e.created).map(|(k, _)| k.clone()) {
                map.remove(&oldest_key);
            }
        }
        let key = Self::key(query, scope, limit, fast);
        map.insert(key, SearchCacheEntry { response, created: Instant::now(), access_count: 0 });
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

// ---------------------------------------------------------------------------
// Target selection
// ---------------------------------------------------------------------------

/// Order targets ascending by entry count so cheap archives report first
///.
pub fn order_targets(targets: &[(ArchiveId, ArchiveInfo)]) -> Vec<(ArchiveId, ArchiveInfo)> {
    let mut v = targets.to_vec();
    v.sort_by_key(|(_, info)| info.entry_count.unwrap_or(u64::MAX));
    v
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs both search phases against a fixed set of archive pools and a title
/// index. Holds the suggest and search result caches.
pub struct SearchEngine {
    pub suggest_cache: SuggestCache,
    pub search_cache: SearchCache,
}

impl SearchEngine {
    pub fn new() -> Self {
        Self { suggest_cache: SuggestCache::new(), search_cache: SearchCache::new() }
    }

    /// Like `new`, but backs the suggest cache with a `suggest_cache.json`
    /// snapshot under `data_dir` so warm titles survive a restart.
    pub fn with_persistence(data_dir: &Path) -> Self {
        Self { suggest_cache: SuggestCache::with_persistence(data_dir), search_cache: SearchCache::new() }
    }

    pub fn clear_caches(&self) {
        self.suggest_cache.clear();
        self.search_cache.clear();
    }

    /// Fast phase: title index (or suggestion-tree fallback) over every
    /// target, via the suggest pool. No time budget.
    pub async fn fast_phase(
        &self,
        targets: &[(ArchiveId, ArchiveInfo)],
        title_index: &TitleIndexPool,
        pools: &ArchivePools,
        open: &OpenFn,
        query: &str,
        limit: usize,
    ) -> SearchResponse {
        let start = Instant::now();
        let ordered = order_targets(targets);
        let mut by_source = HashMap::new();
        let mut results = Vec::new();

        for (id, info) in &ordered {
            if let Some(cached) = self.suggest_cache.get(query, &info.short_name) {
                for (rank, (path, title)) in cached.iter().enumerate() {
                    results.push(build_result(SearchOrigin::Fast, info, path, title, rank));
                }
                continue;
            }

            let index_hits = title_index.search(*id, &info.short_name, query, limit);
            let resolved = match index_hits {
                Some(hits) if !hits.is_empty() => {
                    Some(hits.into_iter().map(|h| (h.path, h.title)).collect::<Vec<_>>())
                }
                // Index miss, absence, or an empty in-memory filter result:
                // fall back to the reader's suggestion tree.
                _ => self.suggest_fallback(*id, info, pools, open, query, limit).await,
            };

            if let Some(pairs) = resolved {
                for (rank, (path, title)) in pairs.iter().enumerate() {
                    results.push(build_result(SearchOrigin::Fast, info, path, title, rank));
                }
            }
        }

        for r in &results {
            *by_source.entry(r.archive.clone()).or_insert(0) += 1;
        }
        let total = results.len();
        SearchResponse {
            results,
            by_source,
            total,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            partial: true,
        }
    }

    async fn suggest_fallback(
        &self,
        id: ArchiveId,
        info: &ArchiveInfo,
        pools: &ArchivePools,
        open: &OpenFn,
        query: &str,
        limit: usize,
    ) -> Option<Vec<(String, String)>> {
        let guard = pools.suggest.get(id, &info.path, open).await.ok()?;
        let reader = guard.as_ref()?;
        let hits = reader.suggest(query, limit);
        if hits.is_empty() {
            return None;
        }
        let pairs: Vec<(String, String)> = hits.into_iter().map(|h| (h.path, h.title)).collect();
        self.suggest_cache.put(query, &info.short_name, pairs.clone());
        Some(pairs)
    }

    /// Full phase: per-target FTS fan-out, each under a 30s deadline, over
    /// the `fts` pool.
    pub async fn full_phase(
        &self,
        targets: &[(ArchiveId, ArchiveInfo)],
        pools: &ArchivePools,
        open: &OpenFn,
        raw_query: &str,
        limit: usize,
        single_archive_scope: bool,
    ) -> SearchResponse {
        let start = Instant::now();
        let query = clean_query(raw_query, single_archive_scope);
        let query_words: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
        let ordered = order_targets(targets);
        let want_snippets = targets.len() == 1;

        // Per-target futures borrow `pools`/`self` rather than owning a
        // `tokio::spawn`'d task, so each one still yields at every `.await`
        // on its own archive lock without requiring `'static` captures —
        // the per-archive mutex is what actually lets two targets' FTS
        // queries overlap.
        let fetches = ordered.into_iter().map(|(id, info)| {
            let query = &query;
            let query_words = &query_words;
            async move {
                let guard = pools.fts.get(id, &info.path, open).await.ok()?;
                let reader = guard.as_ref()?;
                let entries = info.entry_count.unwrap_or(0);
                let hits = reader.fts_search(query, limit);
                let qw: Vec<&str> = query_words.iter().map(String::as_str).collect();
                let mut out = Vec::new();
                for h in hits {
                    if is_junk_path(&h.path) {
                        continue;
                    }
                    let snippet = if want_snippets {
                        reader.get_entry_by_path(&h.path).map(|e| snippet_from_body(&e.content))
                    } else {
                        None
                    };
                    let s = score(&qw, &h.title, h.rank, entries);
                    out.push((info.short_name.clone(), h.path, h.title, snippet, s));
                }
                Some(out)
            }
        });
        let timed: Vec<_> =
            fetches.map(|fut| tokio::time::timeout(FULL_PHASE_DEADLINE, fut)).collect();
        let joined = futures_util::future::join_all(timed).await;

        let mut results = Vec::new();
        let mut by_source = HashMap::new();
        let mut partial = false;
        for outcome in joined {
            match outcome {
                Ok(Some(hits)) => {
                    for (archive, path, title, snippet, s) in hits {
                        *by_source.entry(archive.clone()).or_insert(0) += 1;
                        results.push(SearchResult {
                            origin: SearchOrigin::Full,
                            archive,
                            path,
                            title,
                            snippet,
                            score: s,
                        });
                    }
                }
                Ok(None) => {}
                Err(_elapsed) => partial = true,
            }
        }

        let (results, total) = merge_sort_dedupe(results);
        SearchResponse {
            results,
            by_source,
            total,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            partial,
        }
    }
}

impl Default for SearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically flush the suggest cache to disk until the process exits.
/// Mirrors `autoupdate::run_loop`'s shape: the core crate owns the loop
/// body, the binary crate owns spawning it onto a task.
pub async fn run_persist_loop(engine: &SearchEngine, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        engine.suggest_cache.flush_if_dirty();
    }
}

/// Title hits carry no FTS rank signal of their own; treat them as a full
/// title match (a title-index/suggestion hit is definitionally a title
/// match) so they sort ahead of low-confidence full-phase hits.
fn build_result(origin: SearchOrigin, info: &ArchiveInfo, path: &str, title: &str, rank: usize) -> SearchResult {
    let s = rank_score(rank, 100.0) + auth_score(info.entry_count.unwrap_or(0)).min(5.0);
    SearchResult {
        origin,
        archive: info.short_name.clone(),
        path: path.to_string(),
        title: title.to_string(),
        snippet: None,
        score: s,
    }
}

fn snippet_from_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let stripped: String = {
        let plain = regex::Regex::new(r"<[^>]+>").unwrap().replace_all(&text, " ").into_owned();
        plain.split_whitespace().collect::<Vec<_>>().join(" ")
    };
    stripped.chars().take(240).collect()
}

/// Sort by score descending (stable), dedupe by lowercased-trimmed title
/// keeping the first (highest-scoring) occurrence.
fn merge_sort_dedupe(mut results: Vec<SearchResult>) -> (Vec<SearchResult>, usize) {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(results.len());
    for r in results {
        let key = r.title.trim().to_lowercase();
        if seen.insert(key) {
            out.push(r);
        }
    }
    let total = out.len();
    (out, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_stripped_outside_quotes() {
        let cleaned = clean_query("what is the capital of france", false);
        assert_eq!(cleaned, "capital france");
    }

    #[test]
    fn quoted_phrase_preserved_verbatim() {
        let cleaned = clean_query(r#"the "state of the union" address"#, false);
        assert!(cleaned.contains("state of the union"));
        assert!(cleaned.contains("address"));
    }

    #[test]
    fn empty_after_cleaning_falls_back_to_raw() {
        let cleaned = clean_query("the a an", false);
        assert_eq!(cleaned, "the a an");
    }

    #[test]
    fn single_archive_scope_skips_cleaning() {
        let cleaned = clean_query("the matrix", true);
        assert_eq!(cleaned, "the matrix");
    }

    #[test]
    fn title_score_contiguous_substring_scores_highest() {
        let words = ["rust", "book"];
        assert_eq!(title_score(&words, "the rust book"), 100.0);
    }

    #[test]
    fn title_score_all_words_present_scores_80() {
        let words = ["rust", "book"];
        assert_eq!(title_score(&words, "book about rust"), 80.0);
    }

    #[test]
    fn title_score_partial_words_scales_with_hits() {
        let words = ["rust", "book", "guide"];
        assert_eq!(title_score(&words, "rust language"), 50.0 / 3.0);
    }

    #[test]
    fn rank_score_capped_when_no_title_match() {
        assert!(rank_score(0, 0.0) <= 5.0);
        assert!(rank_score(0, 100.0) > 5.0);
    }

    #[test]
    fn merge_dedupes_by_trimmed_lowercased_title_keeping_highest_score() {
        let a = SearchResult {
            origin: SearchOrigin::Full,
            archive: "a".into(),
            path: "A/1".into(),
            title: "Python".into(),
            snippet: None,
            score: 90.0,
        };
        let b = SearchResult {
            origin: SearchOrigin::Full,
            archive: "b".into(),
            path: "B/1".into(),
            title: "  python ".into(),
            snippet: None,
            score: 50.0,
        };
        let (out, total) = merge_sort_dedupe(vec![b, a]);
        assert_eq!(total, 1);
        assert_eq!(out[0].score, 90.0);
    }

    #[test]
    fn junk_paths_are_recognized() {
        assert!(is_junk_path("questions/tagged/rust"));
        assert!(is_junk_path("foo/tags"));
        assert!(!is_junk_path("A/Python"));
    }

    #[test]
    fn suggest_cache_without_persistence_is_a_no_op_flush() {
        let cache = SuggestCache::new();
        cache.put("rust", "wikipedia", vec![("A/Rust".into(), "Rust".into())]);
        cache.flush_if_dirty(); // no path set; must not panic
    }

    #[test]
    fn suggest_cache_persists_and_reloads_across_construction() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = SuggestCache::with_persistence(dir.path());
            cache.put("rust", "wikipedia", vec![("A/Rust".into(), "Rust".into())]);
            cache.flush_if_dirty();
        }
        let reloaded = SuggestCache::with_persistence(dir.path());
        assert_eq!(reloaded.get("rust", "wikipedia"), Some(vec![("A/Rust".into(), "Rust".into())]));
    }

    #[test]
    fn suggest_cache_flush_is_a_no_op_when_not_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suggest_cache.json");
        let cache = SuggestCache::with_persistence(dir.path());
        cache.flush_if_dirty();
        assert!(!path.exists());
    }

    #[test]
    fn suggest_cache_missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SuggestCache::with_persistence(dir.path());
        assert!(cache.get("rust", "wikipedia").is_none());
    }
}
