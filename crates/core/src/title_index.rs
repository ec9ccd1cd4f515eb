//! Per-archive title index: a B-tree-indexed row store plus an optional
//! FTS5 inverted table, giving sub-10ms title lookups that would otherwise
//! mean seconds of random I/O on spinning media. Grounded
//! verbatim in `_build_title_index` / `_title_index_search` / `_get_title_db`
//! in `zimi.py`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rusqlite::Connection;

use crate::reader::ZimReader;
use crate::registry::ArchiveId;

/// Bump to force a rebuild of every index (v1: initial schema with FTS5).
pub const SCHEMA_VERSION: &str = "1";
/// Archives above this many indexable entries skip the FTS5 build at
/// construction time (can be triggered manually later).
pub const FTS5_ENTRY_THRESHOLD: u64 = 2_000_000;
/// Indexes above this on-disk size are never auto-upgraded with FTS5.
pub const FTS5_AUTO_BUILD_MAX_BYTES: u64 = 2_500 * 1024 * 1024;

const BATCH_SIZE: usize = 10_000;

const ASSET_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "avif", "css", "js", "json", "woff",
    "woff2", "ttf", "eot", "otf", "mp3", "mp4", "ogg", "wav", "webm",
];

fn is_asset_path(path: &str) -> bool {
    path.rsplit_once('.').map(|(_, ext)| ASSET_EXTENSIONS.contains(&ext.to_lowercase().as_str())).unwrap_or(false)
}

fn mtime_key(mtime: SystemTime) -> String {
    mtime.duration_since(UNIX_EPOCH).map(|d| format!("{:.3}", d.as_secs_f64())).unwrap_or_default()
}

/// One title-search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct TitleHit {
    pub path: String,
    pub title: String,
}

fn db_path(dir: &Path, archive: &str) -> PathBuf {
    dir.join(format!("{archive}.db"))
}

/// Is the on-disk index for `archive` current (schema version + archive
/// mtime both match)? Absence or mismatch both report `false`.
pub fn is_current(dir: &Path, archive: &str, archive_mtime: SystemTime) -> bool {
    let path = db_path(dir, archive);
    if !path.exists() {
        return false;
    }
    let Ok(conn) = Connection::open_with_flags(&path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY) else {
        return false;
    };
    let mtime: Option<String> =
        conn.query_row("SELECT value FROM meta WHERE key='zim_mtime'", [], |r| r.get(0)).ok();
    let version: Option<String> =
        conn.query_row("SELECT value FROM meta WHERE key='schema_version'", [], |r| r.get(0)).ok();
    mtime.as_deref() == Some(mtime_key(archive_mtime).as_str()) && version.as_deref() == Some(SCHEMA_VERSION)
}

/// Build (or rebuild) the title index for one archive. Opens a dedicated
/// reader handle — never touches a pooled handle, so this never needs the
/// library lock. Writes to a `.tmp` file and atomically renames on success;
/// deletes the temp file and leaves any existing index intact on failure.
pub fn build(
    dir: &Path,
    archive: &str,
    archive_path: &Path,
    archive_mtime: SystemTime,
    reader: &dyn ZimReader,
    force_fts: bool,
) -> rusqlite::Result<usize> {
    std::fs::create_dir_all(dir).ok();
    let final_path = db_path(dir, archive);
    let tmp_path = final_path.with_extension("db.tmp");
    let _ = std::fs::remove_file(&tmp_path);

    let build_result = (|| -> rusqlite::Result<usize> {
        let conn = Connection::open(&tmp_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.execute("CREATE TABLE titles (path TEXT PRIMARY KEY, title TEXT, title_lower TEXT)", [])?;
        conn.execute("CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT)", [])?;

        let mut count = 0usize;
        let mut batch: Vec<(String, String, String)> = Vec::with_capacity(BATCH_SIZE);
        let total = reader.entry_count();
        for id in 0..total {
            let Some(entry) = reader.get_entry_by_id(id) else { continue };
            if entry.is_redirect() || is_asset_path(&entry.path) || entry.title.is_empty() {
                continue;
            }
            batch.push((entry.path.clone(), entry.title.clone(), entry.title.to_lowercase()));
            if batch.len() >= BATCH_SIZE {
                insert_batch(&conn, &batch)?;
                count += batch.len();
                batch.clear();
            }
        }
        if !batch.is_empty() {
            insert_batch(&conn, &batch)?;
            count += batch.len();
        }

        if count == 0 {
            return Ok(0);
        }

        conn.execute("CREATE INDEX idx_prefix ON titles(title_lower)", [])?;

        let has_fts = force_fts || count as u64 <= FTS5_ENTRY_THRESHOLD;
        if has_fts {
            conn.execute(
                "CREATE VIRTUAL TABLE titles_fts USING fts5(path UNINDEXED, title, tokenize='unicode61')",
                [],
            )?;
            conn.execute("INSERT INTO titles_fts(path, title) SELECT path, title FROM titles", [])?;
        }

        conn.execute("INSERT INTO meta VALUES ('schema_version', ?1)", [SCHEMA_VERSION])?;
        conn.execute("INSERT INTO meta VALUES ('zim_mtime', ?1)", [mtime_key(archive_mtime)])?;
        conn.execute("INSERT INTO meta VALUES ('entry_count', ?1)", [count.to_string()])?;
        conn.execute(
            "INSERT INTO meta VALUES ('has_fts', ?1)",
            [if has_fts { "1" } else { "0" }],
        )?;
        Ok(count)
    })();

    match build_result {
        Ok(0) => {
            let _ = std::fs::remove_file(&tmp_path);
            Ok(0)
        }
        Ok(count) => {
            std::fs::rename(&tmp_path, &final_path)
                .map_err(|e| rusqlite::Error::ModuleError(format!("atomic replace failed: {e}")))?;
            Ok(count)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn insert_batch(conn: &Connection, batch: &[(String, String, String)]) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached("INSERT OR IGNORE INTO titles VALUES (?1, ?2, ?3)")?;
        for (path, title, lower) in batch {
            stmt.execute(rusqlite::params![path, title, lower])?;
        }
    }
    tx.commit()
}

/// Add an FTS5 table to an index that was built without one. Reads straight
/// from the existing `titles` table — no archive rescan needed.
pub fn build_fts_in_place(dir: &Path, archive: &str) -> rusqlite::Result<bool> {
    let path = db_path(dir, archive);
    let conn = Connection::open(&path)?;
    let exists: Option<String> = conn
        .query_row("SELECT name FROM sqlite_master WHERE name='titles_fts'", [], |r| r.get(0))
        .ok();
    if exists.is_some() {
        return Ok(false);
    }
    conn.execute(
        "CREATE VIRTUAL TABLE titles_fts USING fts5(path UNINDEXED, title, tokenize='unicode61')",
        [],
    )?;
    conn.execute("INSERT INTO titles_fts(path, title) SELECT path, title FROM titles", [])?;
    conn.execute("INSERT OR REPLACE INTO meta VALUES ('has_fts', '1')", [])?;
    Ok(true)
}

/// Pooled, long-lived title-index connections, one per archive. Holding a
/// live mmap'd connection avoids the ~10ms reconnect cost per query that
/// would otherwise dominate multi-archive fan-out on spinning disks.
pub struct TitleIndexPool {
    dir: PathBuf,
    conns: DashMap<ArchiveId, Mutex<Connection>>,
}

impl TitleIndexPool {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, conns: DashMap::new() }
    }

    pub fn evict(&self, id: ArchiveId) {
        self.conns.remove(&id);
    }

    /// The directory title indexes live under, for callers that need to
    /// rebuild or extend an index file directly (e.g. `build_fts_in_place`).
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn connection_for(&self, id: ArchiveId, archive: &str) -> Option<()> {
        if self.conns.contains_key(&id) {
            return Some(());
        }
        let path = db_path(&self.dir, archive);
        if !path.exists() {
            return None;
        }
        let conn = Connection::open_with_flags(&path, rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE).ok()?;
        let _ = conn.pragma_update(None, "mmap_size", 64 * 1024 * 1024i64);
        self.conns.insert(id, Mutex::new(conn));
        Some(())
    }

    /// Search the title index. `None` means "no current index / query
    /// failed" — callers fall back to the suggestion tree.
    /// Single-word queries do a B-tree prefix range scan; multi-word
    /// queries prefix-scan the first word then filter in memory for the
    /// remaining words as substrings — this outperforms an FTS5 query on
    /// large, cold archives.
    pub fn search(&self, id: ArchiveId, archive: &str, query: &str, limit: usize) -> Option<Vec<TitleHit>> {
        self.connection_for(id, archive)?;
        let entry = self.conns.get(&id)?;
        let conn = entry.lock().unwrap();
        let q = query.to_lowercase();
        let words: Vec<&str> = q.split_whitespace().collect();
        if words.is_empty() {
            return Some(Vec::new());
        }

        let result = if words.len() == 1 {
            prefix_scan(&conn, words[0], limit)
        } else {
            multi_word_scan(&conn, &words, limit)
        };

        match result {
            Ok(hits) => Some(hits),
            Err(e) => {
                tracing::warn!(archive, error = %e, "title index query failed, evicting connection");
                drop(conn);
                drop(entry);
                self.conns.remove(&id);
                None
            }
        }
    }
}

fn next_codepoint_upper_bound(prefix: &str) -> String {
    let mut chars: Vec<char> = prefix.chars().collect();
    if let Some(last) = chars.pop() {
        let bumped = char::from_u32(last as u32 + 1).unwrap_or(last);
        chars.push(bumped);
    }
    chars.into_iter().collect()
}

fn prefix_scan(conn: &Connection, word: &str, limit: usize) -> rusqlite::Result<Vec<TitleHit>> {
    let upper = next_codepoint_upper_bound(word);
    let mut stmt = conn.prepare_cached(
        "SELECT path, title FROM titles WHERE title_lower >= ?1 AND title_lower < ?2 LIMIT ?3",
    )?;
    let rows = stmt.query_map(rusqlite::params![word, upper, limit as i64], |r| {
        Ok(TitleHit { path: r.get(0)?, title: r.get(1)? })
    })?;
    rows.collect()
}

fn multi_word_scan(conn: &Connection, words: &[&str], limit: usize) -> rusqlite::Result<Vec<TitleHit>> {
    let upper = next_codepoint_upper_bound(words[0]);
    let fetch = (limit * 20).max(limit);
    let mut stmt = conn.prepare_cached(
        "SELECT path, title, title_lower FROM titles WHERE title_lower >= ?1 AND title_lower < ?2 LIMIT ?3",
    )?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map(rusqlite::params![words[0], upper, fetch as i64], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let rest = &words[1..];
    let hits: Vec<TitleHit> = rows
        .into_iter()
        .filter(|(_, _, lower)| rest.iter().all(|w| lower.contains(w)))
        .take(limit)
        .map(|(path, title, _)| TitleHit { path, title })
        .collect();
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{MockZimReader, ZimEntry, ZimMetadata};
    use tempfile::tempdir;

    fn reader_with_titles(titles: &[&str]) -> MockZimReader {
        let entries = titles
            .iter()
            .enumerate()
            .map(|(i, t)| ZimEntry {
                path: format!("A/{i}"),
                title: t.to_string(),
                mimetype: "text/html".into(),
                content: vec![],
                redirect_target: None,
            })
            .collect();
        MockZimReader::new(entries, ZimMetadata::default())
    }

    #[test]
    fn build_then_search_single_word_prefix() {
        let dir = tempdir().unwrap();
        let reader = reader_with_titles(&["Python Tutorial", "Python Standard Library", "Rust Book"]);
        let count = build(dir.path(), "devdocs", Path::new("/zims/devdocs.zim"), UNIX_EPOCH, &reader, false)
            .unwrap();
        assert_eq!(count, 3);

        let pool = TitleIndexPool::new(dir.path().to_path_buf());
        let hits = pool.search(ArchiveId(0), "devdocs", "python", 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn multi_word_query_filters_by_substring() {
        let dir = tempdir().unwrap();
        let reader = reader_with_titles(&["Python Tutorial", "Python Standard Library", "Python asyncio guide"]);
        build(dir.path(), "devdocs", Path::new("/zims/devdocs.zim"), UNIX_EPOCH, &reader, false).unwrap();

        let pool = TitleIndexPool::new(dir.path().to_path_buf());
        let hits = pool.search(ArchiveId(0), "devdocs", "python asyncio", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Python asyncio guide");
    }

    #[test]
    fn currency_check_detects_stale_mtime() {
        let dir = tempdir().unwrap();
        let reader = reader_with_titles(&["Alpha"]);
        let mtime = UNIX_EPOCH + std::time::Duration::from_secs(100);
        build(dir.path(), "a", Path::new("/zims/a.zim"), mtime, &reader, false).unwrap();
        assert!(is_current(dir.path(), "a", mtime));
        let other_mtime = UNIX_EPOCH + std::time::Duration::from_secs(200);
        assert!(!is_current(dir.path(), "a", other_mtime));
    }

    #[test]
    fn zero_indexable_entries_produces_no_index_file() {
        let dir = tempdir().unwrap();
        let reader = reader_with_titles(&[]);
        let count = build(dir.path(), "empty", Path::new("/zims/empty.zim"), UNIX_EPOCH, &reader, false).unwrap();
        assert_eq!(count, 0);
        assert!(!dir.path().join("empty.db").exists());
    }
}
