//! Favorites and named collections. Grounded in
//! `_collections_file_path` / `_load_collections` / `_save_collections` and
//! the `/collections` and `/favorites` handlers from `zimi/server.py`: a
//! single versioned JSON document, reset to defaults on any load failure or
//! version mismatch, persisted with an atomic rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Bump to invalidate the on-disk document on incompatible schema changes.
pub const COLLECTIONS_VERSION: u32 = 1;

/// Favorites cap, matching the Python original's "Favorites list is full
/// (max 100)" error.
pub const MAX_FAVORITES: usize = 100;

/// Per-collection ZIM-list cap.
pub const MAX_COLLECTION_ZIMS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collection {
    pub label: String,
    pub zims: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionsData {
    pub version: u32,
    pub favorites: Vec<String>,
    pub collections: HashMap<String, Collection>,
}

impl Default for CollectionsData {
    fn default() -> Self {
        Self { version: COLLECTIONS_VERSION, favorites: Vec::new(), collections: HashMap::new() }
    }
}

/// Persistent favorites and named-collections store.
pub struct CollectionsStore {
    path: PathBuf,
    data: Mutex<CollectionsData>,
}

impl CollectionsStore {
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join("collections.json");
        let data = Self::read_from_disk(&path).unwrap_or_default();
        Self { path, data: Mutex::new(data) }
    }

    fn read_from_disk(path: &Path) -> Option<CollectionsData> {
        let raw = fs::read_to_string(path).ok()?;
        let parsed: CollectionsData = serde_json::from_str(&raw).ok()?;
        if parsed.version != COLLECTIONS_VERSION {
            return None;
        }
        Some(parsed)
    }

    fn persist(&self, data: &CollectionsData) {
        let mut data = data.clone();
        data.version = COLLECTIONS_VERSION;
        let Ok(json) = serde_json::to_string_pretty(&data) else { return };
        if let Some(parent) = self.path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        if fs::write(&tmp, json).is_err() {
            tracing::warn!(path = %self.path.display(), "failed to write collections store");
            return;
        }
        if fs::rename(&tmp, &self.path).is_err() {
            tracing::warn!(path = %self.path.display(), "failed to rename collections store into place");
        }
    }

    /// Snapshot of the whole document, as returned by `GET /collections`.
    pub fn snapshot(&self) -> CollectionsData {
        self.data.lock().unwrap().clone()
    }

    /// Toggle `zim_name` in the favorites list. Returns `true` if it was
    /// added, `false` if it was removed. Fails if the ZIM doesn't exist, or
    /// if adding would exceed `MAX_FAVORITES`.
    pub fn toggle_favorite(&self, zim_name: &str, known_zims: &[String]) -> Result<bool, AppError> {
        if !known_zims.iter().any(|z| z == zim_name) {
            return Err(AppError::client(format!("unknown ZIM: {zim_name}")));
        }
        let mut data = self.data.lock().unwrap();
        if let Some(pos) = data.favorites.iter().position(|f| f == zim_name) {
            data.favorites.remove(pos);
            self.persist(&data);
            Ok(false)
        } else {
            if data.favorites.len() >= MAX_FAVORITES {
                return Err(AppError::client(format!("Favorites list is full (max {MAX_FAVORITES})")));
            }
            data.favorites.push(zim_name.to_string());
            self.persist(&data);
            Ok(true)
        }
    }

    /// Create or update a named collection. `label` defaults to `name` when
    /// empty. `zims` beyond `MAX_COLLECTION_ZIMS` is rejected.
    pub fn upsert_collection(&self, name: &str, label: &str, zims: Vec<String>) -> Result<(), AppError> {
        if name.trim().is_empty() {
            return Err(AppError::client("collection name must not be empty"));
        }
        if zims.len() > MAX_COLLECTION_ZIMS {
            return Err(AppError::client(format!("collection may contain at most {MAX_COLLECTION_ZIMS} ZIMs")));
        }
        let label = if label.trim().is_empty() { name.to_string() } else { label.to_string() };
        let mut data = self.data.lock().unwrap();
        data.collections.insert(name.to_string(), Collection { label, zims });
        self.persist(&data);
        Ok(())
    }

    /// Delete a named collection. Returns `false` if it didn't exist.
    pub fn delete_collection(&self, name: &str) -> bool {
        let mut data = self.data.lock().unwrap();
        let removed = data.collections.remove(name).is_some();
        if removed {
            self.persist(&data);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn known() -> Vec<String> {
        vec!["wikipedia".to_string(), "devdocs".to_string()]
    }

    #[test]
    fn toggle_favorite_adds_then_removes() {
        let dir = tempdir().unwrap();
        let store = CollectionsStore::new(dir.path());
        assert!(store.toggle_favorite("wikipedia", &known()).unwrap());
        assert_eq!(store.snapshot().favorites, vec!["wikipedia".to_string()]);

        assert!(!store.toggle_favorite("wikipedia", &known()).unwrap());
        assert!(store.snapshot().favorites.is_empty());
    }

    #[test]
    fn toggle_favorite_rejects_unknown_zim() {
        let dir = tempdir().unwrap();
        let store = CollectionsStore::new(dir.path());
        let err = store.toggle_favorite("nope", &known()).unwrap_err();
        assert!(matches!(err, AppError::Client(_)));
    }

    #[test]
    fn toggle_favorite_rejects_past_cap() {
        let dir = tempdir().unwrap();
        let store = CollectionsStore::new(dir.path());
        let many: Vec<String> = (0..MAX_FAVORITES).map(|i| format!("zim{i}")).collect();
        {
            let mut data = store.data.lock().unwrap();
            data.favorites = many.clone();
        }
        let err = store.toggle_favorite("wikipedia", &known()).unwrap_err();
        assert!(matches!(err, AppError::Client(_)));
    }

    #[test]
    fn upsert_collection_defaults_label_to_name() {
        let dir = tempdir().unwrap();
        let store = CollectionsStore::new(dir.path());
        store.upsert_collection("science", "", vec!["wikipedia".to_string()]).unwrap();
        let data = store.snapshot();
        let collection = data.collections.get("science").unwrap();
        assert_eq!(collection.label, "science");
        assert_eq!(collection.zims, vec!["wikipedia".to_string()]);
    }

    #[test]
    fn upsert_collection_rejects_empty_name() {
        let dir = tempdir().unwrap();
        let store = CollectionsStore::new(dir.path());
        let err = store.upsert_collection("", "label", vec![]).unwrap_err();
        assert!(matches!(err, AppError::Client(_)));
    }

    #[test]
    fn upsert_collection_rejects_too_many_zims() {
        let dir = tempdir().unwrap();
        let store = CollectionsStore::new(dir.path());
        let zims: Vec<String> = (0..(MAX_COLLECTION_ZIMS + 1)).map(|i| format!("zim{i}")).collect();
        let err = store.upsert_collection("big", "Big", zims).unwrap_err();
        assert!(matches!(err, AppError::Client(_)));
    }

    #[test]
    fn delete_collection_reports_missing() {
        let dir = tempdir().unwrap();
        let store = CollectionsStore::new(dir.path());
        assert!(!store.delete_collection("nope"));
        store.upsert_collection("science", "Science", vec![]).unwrap();
        assert!(store.delete_collection("science"));
        assert!(store.snapshot().collections.is_empty());
    }

    #[test]
    fn reloads_persisted_document_from_disk() {
        let dir = tempdir().unwrap();
        {
            let store = CollectionsStore::new(dir.path());
            store.toggle_favorite("wikipedia", &known()).unwrap();
            store.upsert_collection("science", "Science", vec!["wikipedia".to_string()]).unwrap();
        }
        let store = CollectionsStore::new(dir.path());
        let data = store.snapshot();
        assert_eq!(data.favorites, vec!["wikipedia".to_string()]);
        assert!(data.collections.contains_key("science"));
    }

    #[test]
    fn version_mismatch_resets_to_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("collections.json"), r#"{"version":2,"favorites":["x"],"collections":{}}"#)
            .unwrap();
        let store = CollectionsStore::new(dir.path());
        assert!(store.snapshot().favorites.is_empty());
    }
}
