//! `ZimReader` — the archive-reader boundary.
//!
//! The real Kiwix archive format is read via the `libzim` C++ library over
//! FFI; no such crate is available in this workspace's dependency set. This
//! trait captures exactly the operations the rest of the system needs from
//! it: entry lookup by path, entry iteration by id,
//! metadata, a Xapian-style full-text query, and title suggestion. A real
//! binding implements this trait; `MockZimReader` is the in-memory stand-in
//! used by every test and by the bundled end-to-end fixtures.

use std::collections::HashMap;

/// A single addressable item inside an archive.
#[derive(Debug, Clone)]
pub struct ZimEntry {
    pub path: String,
    pub title: String,
    pub mimetype: String,
    pub content: Vec<u8>,
    pub redirect_target: Option<String>,
}

impl ZimEntry {
    pub fn is_redirect(&self) -> bool {
        self.redirect_target.is_some()
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Metadata block exposed by the archive container (title, description, …).
#[derive(Debug, Clone, Default)]
pub struct ZimMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub source: Option<String>,
    pub main_page: Option<String>,
    pub illustration_48x48: Option<Vec<u8>>,
}

/// A single full-text search hit, ranked within its own archive.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub path: String,
    pub title: String,
    pub rank: usize,
}

/// A single title-suggestion hit.
#[derive(Debug, Clone)]
pub struct SuggestHit {
    pub path: String,
    pub title: String,
}

/// Archive-reader operations needed by the rest of the system. Not
/// thread-safe on a single handle — callers serialize access to one handle
/// via a per-archive lock.
pub trait ZimReader: Send {
    fn get_entry_by_path(&self, path: &str) -> Option<ZimEntry>;
    fn get_entry_by_id(&self, id: u64) -> Option<ZimEntry>;
    fn entry_count(&self) -> u64;
    fn metadata(&self) -> &ZimMetadata;
    /// Xapian-style full text query over entry bodies, best `limit` hits.
    fn fts_search(&self, query: &str, limit: usize) -> Vec<FtsHit>;
    /// Title-suggestion tree lookup, used as the fast-phase fallback.
    fn suggest(&self, query: &str, limit: usize) -> Vec<SuggestHit>;
    /// A pseudo-random entry path, or None if the archive has no articles.
    fn random_path(&self, seed: u64) -> Option<String>;
}

/// In-memory `ZimReader` backed by a path → entry table. Used for tests and
/// as the reference fixture the rest of this crate is developed against.
pub struct MockZimReader {
    entries: HashMap<String, ZimEntry>,
    order: Vec<String>,
    metadata: ZimMetadata,
}

impl MockZimReader {
    pub fn new(entries: Vec<ZimEntry>, metadata: ZimMetadata) -> Self {
        let order: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
        let entries = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        Self { entries, order, metadata }
    }
}

impl ZimReader for MockZimReader {
    fn get_entry_by_path(&self, path: &str) -> Option<ZimEntry> {
        self.entries.get(path).cloned()
    }

    fn get_entry_by_id(&self, id: u64) -> Option<ZimEntry> {
        self.order.get(id as usize).and_then(|p| self.entries.get(p)).cloned()
    }

    fn entry_count(&self) -> u64 {
        self.order.len() as u64
    }

    fn metadata(&self) -> &ZimMetadata {
        &self.metadata
    }

    fn fts_search(&self, query: &str, limit: usize) -> Vec<FtsHit> {
        let q = query.to_lowercase();
        let terms: Vec<&str> = q.split_whitespace().collect();
        let mut hits: Vec<FtsHit> = self
            .order
            .iter()
            .filter_map(|p| self.entries.get(p))
            .filter(|e| !e.is_redirect())
            .filter(|e| {
                let body = String::from_utf8_lossy(&e.content).to_lowercase();
                let title = e.title.to_lowercase();
                terms.iter().any(|t| body.contains(t) || title.contains(t))
            })
            .enumerate()
            .map(|(rank, e)| FtsHit { path: e.path.clone(), title: e.title.clone(), rank })
            .collect();
        hits.truncate(limit);
        hits
    }

    fn suggest(&self, query: &str, limit: usize) -> Vec<SuggestHit> {
        let q = query.to_lowercase();
        self.order
            .iter()
            .filter_map(|p| self.entries.get(p))
            .filter(|e| !e.is_redirect() && e.title.to_lowercase().starts_with(&q))
            .take(limit)
            .map(|e| SuggestHit { path: e.path.clone(), title: e.title.clone() })
            .collect()
    }

    fn random_path(&self, seed: u64) -> Option<String> {
        if self.order.is_empty() {
            return None;
        }
        let idx = (seed as usize) % self.order.len();
        self.order.get(idx).cloned()
    }
}

/// The `OpenFn` every front end wires in until a real `libzim` binding is
/// gated behind a `zim` feature: every archive opens as an empty
/// `MockZimReader` named after its filename. Enough to drive registry,
/// pool, and cache plumbing end-to-end without a parseable container
/// format.
pub fn placeholder_open() -> crate::pool::OpenFn {
    std::sync::Arc::new(|path: &std::path::Path| {
        let title = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        Ok(Box::new(MockZimReader::new(vec![], ZimMetadata { title, ..Default::default() })) as Box<dyn ZimReader>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> MockZimReader {
        MockZimReader::new(
            vec![
                ZimEntry {
                    path: "A/Python".into(),
                    title: "Python".into(),
                    mimetype: "".into(),
                    content: vec![],
                    redirect_target: Some("A/Python_(programming_language)".into()),
                },
                ZimEntry {
                    path: "A/Python_(programming_language)".into(),
                    title: "Python (programming language)".into(),
                    mimetype: "text/html".into(),
                    content: b"Python is an interpreted high-level language.".to_vec(),
                    redirect_target: None,
                },
            ],
            ZimMetadata::default(),
        )
    }

    #[test]
    fn redirect_entries_are_flagged() {
        let r = fixture();
        let e = r.get_entry_by_path("A/Python").unwrap();
        assert!(e.is_redirect());
        assert_eq!(e.redirect_target.as_deref(), Some("A/Python_(programming_language)"));
    }

    #[test]
    fn fts_search_skips_redirects() {
        let r = fixture();
        let hits = r.fts_search("interpreted", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "A/Python_(programming_language)");
    }
}
