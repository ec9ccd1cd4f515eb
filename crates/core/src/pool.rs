//! Archive pools — dedicated handle pools per workload.
//!
//! The native reader is not safe for concurrent use on a single handle.
//! Three independent pools (content, fts, suggest) each hold at most one
//! open `Box<dyn ZimReader>` per archive, guarded by a per-archive async
//! mutex, so a slow FTS query on one archive never blocks a title lookup
//! or content read on another — or on the same archive in a different
//! pool. Opens are lazy, double-checked under a pool-wide mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::reader::ZimReader;
use crate::registry::ArchiveId;

/// A lazily-opened, per-archive reader slot.
type Handle = Arc<AsyncMutex<Option<Box<dyn ZimReader>>>>;

/// Factory invoked to open a fresh reader handle for an archive. Boxed so
/// the pool doesn't need to know about `libzim` vs. the mock reader.
pub type OpenFn = Arc<dyn Fn(&Path) -> std::io::Result<Box<dyn ZimReader>> + Send + Sync>;

/// One workload-scoped pool of archive handles.
pub struct ArchivePool {
    name: &'static str,
    handles: DashMap<ArchiveId, Handle>,
    /// Guards handle *insertion* (double-checked locking on open);
    /// operations on an already-open handle use only its own mutex.
    insert_lock: Mutex<()>,
}

impl ArchivePool {
    pub fn new(name: &'static str) -> Self {
        Self { name, handles: DashMap::new(), insert_lock: Mutex::new(()) }
    }

    /// Drop all handles for an archive no longer in the registry.
    pub fn evict(&self, id: ArchiveId) {
        self.handles.remove(&id);
    }

    pub fn clear(&self) {
        self.handles.clear();
    }

    fn handle_for(&self, id: ArchiveId) -> Handle {
        if let Some(h) = self.handles.get(&id) {
            return h.clone();
        }
        let _guard = self.insert_lock.lock().unwrap();
        // Double-check: another task may have inserted while we waited.
        if let Some(h) = self.handles.get(&id) {
            return h.clone();
        }
        let handle: Handle = Arc::new(AsyncMutex::new(None));
        self.handles.insert(id, handle.clone());
        handle
    }

    /// Acquire the archive's reader, opening it on first use. Returns the
    /// locked guard so the caller holds the per-archive lock for the
    /// duration of its operation.
    pub async fn get(
        &self,
        id: ArchiveId,
        path: &Path,
        open: &OpenFn,
    ) -> std::io::Result<OwnedMutexGuard<Option<Box<dyn ZimReader>>>> {
        let handle = self.handle_for(id);
        let mut guard = handle.lock_owned().await;
        if guard.is_none() {
            tracing::debug!(pool = self.name, archive = id.0, path = %path.display(), "opening archive handle");
            *guard = Some(open(path)?);
        }
        Ok(guard)
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }
}

/// The three independent workload pools, bundled for convenient construction.
pub struct ArchivePools {
    pub content: ArchivePool,
    pub fts: ArchivePool,
    pub suggest: ArchivePool,
}

impl ArchivePools {
    pub fn new() -> Self {
        Self {
            content: ArchivePool::new("content"),
            fts: ArchivePool::new("fts"),
            suggest: ArchivePool::new("suggest"),
        }
    }

    /// Evict a single archive from all three pools (used on delete/replace).
    pub fn evict_all(&self, id: ArchiveId) {
        self.content.evict(id);
        self.fts.evict(id);
        self.suggest.evict(id);
    }

    /// Drop all handles in all three pools (used on full library refresh).
    pub fn clear_all(&self) {
        self.content.clear();
        self.fts.clear();
        self.suggest.clear();
    }
}

impl Default for ArchivePools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{MockZimReader, ZimMetadata};

    fn opener() -> OpenFn {
        Arc::new(|_path: &Path| -> std::io::Result<Box<dyn ZimReader>> {
            Ok(Box::new(MockZimReader::new(vec![], ZimMetadata::default())))
        })
    }

    #[tokio::test]
    async fn lazy_open_happens_once() {
        let pool = ArchivePool::new("content");
        let id = ArchiveId(0);
        let open = opener();
        {
            let guard = pool.get(id, Path::new("/zims/a.zim"), &open).await.unwrap();
            assert!(guard.is_some());
        }
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn evict_removes_handle() {
        let pool = ArchivePool::new("content");
        let id = ArchiveId(0);
        let _ = pool.handle_for(id);
        assert_eq!(pool.open_count(), 1);
        pool.evict(id);
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn evict_all_clears_every_pool() {
        let pools = ArchivePools::new();
        let id = ArchiveId(0);
        let _ = pools.content.handle_for(id);
        let _ = pools.fts.handle_for(id);
        let _ = pools.suggest.handle_for(id);
        pools.evict_all(id);
        assert_eq!(pools.content.open_count(), 0);
        assert_eq!(pools.fts.open_count(), 0);
        assert_eq!(pools.suggest.open_count(), 0);
    }
}
