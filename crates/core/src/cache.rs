//! Metadata cache — persistent per-archive metadata so startup over slow
//! storage stays fast. Grounded in `load_cache` /
//! `_load_disk_cache` / `_save_disk_cache` in `zimi.py`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::registry::{categorize, derive_short_name, ArchiveInfo};
use crate::reader::ZimReader;

/// Bump to invalidate every cached row on incompatible schema changes.
pub const CACHE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone)]
struct CacheRow {
    mtime: f64,
    size: u64,
    title: String,
    description: String,
    date: Option<String>,
    has_icon: bool,
    main_path: Option<String>,
    entries: Option<u64>,
}

#[derive(Serialize, Deserialize, Default)]
struct CacheFile {
    version: u32,
    files: HashMap<String, CacheRow>,
}

/// Persistent per-archive metadata cache, keyed by filename.
pub struct MetadataCache {
    path: PathBuf,
    rows: HashMap<String, CacheRow>,
}

fn mtime_as_f64(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

impl MetadataCache {
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join("cache.json");
        let rows = Self::read_from_disk(&path).unwrap_or_default();
        Self { path, rows }
    }

    fn read_from_disk(path: &Path) -> Option<HashMap<String, CacheRow>> {
        let raw = fs::read_to_string(path).ok()?;
        let parsed: CacheFile = serde_json::from_str(&raw).ok()?;
        if parsed.version != CACHE_VERSION {
            return None;
        }
        Some(parsed.files)
    }

    fn persist(&self) -> std::io::Result<()> {
        let file = CacheFile { version: CACHE_VERSION, files: self.rows.clone() };
        let json = serde_json::to_string_pretty(&file).unwrap_or_default();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    /// A cached row is valid iff its (mtime, size) match the archive's
    /// current values on disk.
    fn row_is_valid(row: &CacheRow, mtime: SystemTime, size: u64) -> bool {
        row.size == size && (mtime_as_f64(mtime) - row.mtime).abs() < 0.001
    }

    /// Rescan the archive directory, reusing valid cache rows and only
    /// opening archives whose (mtime, size) changed. Opening failures emit a
    /// placeholder row and do not stop the scan.
    pub fn load(
        &mut self,
        zim_dir: &Path,
        force: bool,
        open: impl Fn(&Path) -> std::io::Result<Box<dyn ZimReader>>,
    ) -> Vec<ArchiveInfo> {
        let mut out = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(zim_dir)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "zim"))
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let filename = entry.file_name().to_string_lossy().into_owned();
            let short_name = derive_short_name(&filename);
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let size = meta.len();

            let row = if !force {
                self.rows.get(&filename).filter(|r| Self::row_is_valid(r, mtime, size)).cloned()
            } else {
                None
            };

            let row = row.unwrap_or_else(|| match open(&path) {
                Ok(reader) => {
                    let zm = reader.metadata();
                    CacheRow {
                        mtime: mtime_as_f64(mtime),
                        size,
                        title: zm.title.clone().unwrap_or_else(|| short_name.clone()),
                        description: zm.description.clone().unwrap_or_default(),
                        date: zm.date.clone(),
                        has_icon: zm.illustration_48x48.is_some(),
                        main_path: zm.main_page.clone(),
                        entries: Some(reader.entry_count()),
                    }
                }
                Err(_) => CacheRow {
                    mtime: mtime_as_f64(mtime),
                    size,
                    title: short_name.clone(),
                    description: String::new(),
                    date: None,
                    has_icon: false,
                    main_path: None,
                    entries: None,
                },
            });

            self.rows.insert(filename, row.clone());
            out.push(ArchiveInfo {
                short_name: short_name.clone(),
                path,
                file_size: row.size,
                mtime,
                title: row.title,
                description: row.description,
                publication_date: row.date,
                main_path: row.main_path,
                has_icon: row.has_icon,
                entry_count: row.entries,
                category: categorize(&short_name),
            });
        }

        // Drop rows for files no longer present.
        let present: std::collections::HashSet<_> =
            out.iter().map(|a| a.path.file_name().unwrap().to_string_lossy().into_owned()).collect();
        self.rows.retain(|k, _| present.contains(k));

        let _ = self.persist();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{MockZimReader, ZimMetadata};
    use std::io;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, bytes).unwrap();
        p
    }

    fn opener(_path: &Path) -> io::Result<Box<dyn ZimReader>> {
        Ok(Box::new(MockZimReader::new(
            vec![],
            ZimMetadata { title: Some("Title".into()), ..Default::default() },
        )))
    }

    #[test]
    fn second_load_rescans_nothing_when_unchanged() {
        let zim_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        touch(zim_dir.path(), "wikipedia_en_all_nopic_2024-07.zim", b"fakezim");

        let mut cache = MetadataCache::new(data_dir.path());
        let first = cache.load(zim_dir.path(), false, opener);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].short_name, "wikipedia");

        // Re-load without any on-disk mutation: cache row must be reused, not
        // rebuilt (opener would panic/differ if invoked with new data, but
        // since it's deterministic here, assert the row content is stable).
        let second = cache.load(zim_dir.path(), false, opener);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].title, first[0].title);
    }

    #[test]
    fn open_failure_still_emits_a_row() {
        let zim_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        touch(zim_dir.path(), "broken_2024-01.zim", b"not a zim");

        let mut cache = MetadataCache::new(data_dir.path());
        let rows = cache.load(zim_dir.path(), false, |_| {
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad archive"))
        });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry_count, None);
    }
}
