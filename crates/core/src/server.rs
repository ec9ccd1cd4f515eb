//! The unified server state: one value owning every named sub-service
//! behind its own lock, so requests reference a single `Arc<Server>` handle
//! and tests construct a fresh instance per case instead of touching
//! module-level globals the way `zimi/server.py` does.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::autoupdate::AutoUpdateConfig;
use crate::cache::MetadataCache;
use crate::collections::CollectionsStore;
use crate::config::{Config, ManagePassword};
use crate::download::DownloadManager;
use crate::history::HistoryLog;
use crate::metrics::{Metrics, UsageStats};
use crate::pool::{ArchivePools, OpenFn};
use crate::registry::ArchiveRegistry;
use crate::resolve::DomainMap;
use crate::search::SearchEngine;
use crate::title_index::TitleIndexPool;

/// Every named sub-service the HTTP/CLI/MCP front ends drive, assembled
/// once at startup and shared via `Arc`.
pub struct Server {
    pub config: Config,
    pub open: OpenFn,

    pub registry: RwLock<ArchiveRegistry>,
    pub cache: std::sync::Mutex<MetadataCache>,
    pub pools: ArchivePools,
    pub title_index: TitleIndexPool,
    pub search: SearchEngine,
    pub domain_map: RwLock<DomainMap>,

    pub downloads: Arc<DownloadManager>,
    pub history: HistoryLog,
    pub collections: CollectionsStore,

    pub rate_limiter: crate::metrics::RateLimiter,
    pub metrics: Metrics,
    pub usage: UsageStats,

    pub auto_update: AutoUpdateConfig,
    pub manage_password: ManagePassword,
}

impl Server {
    /// Construct every sub-service from `config`, then run an initial
    /// library scan. `open` is the archive-opening factory (real `libzim`
    /// reader in production, `MockZimReader` in tests).
    pub async fn new(config: Config, open: OpenFn) -> Arc<Self> {
        let data_dir = config.data_dir.clone();
        let zim_dir = config.zim_dir.clone();

        let auto_update = AutoUpdateConfig::new(
            &data_dir,
            config.auto_update_env.as_deref(),
            config.update_freq_env.as_deref(),
        );
        let manage_password = ManagePassword::new(&data_dir, config.manage_password_env.clone());
        let rate_limiter = crate::metrics::RateLimiter::new(config.rate_limit);

        let server = Arc::new(Self {
            registry: RwLock::new(ArchiveRegistry::new()),
            cache: std::sync::Mutex::new(MetadataCache::new(&data_dir)),
            pools: ArchivePools::new(),
            title_index: TitleIndexPool::new(data_dir.join("titles")),
            search: SearchEngine::with_persistence(&data_dir),
            domain_map: RwLock::new(DomainMap::build(&ArchiveRegistry::new(), &HashMap::new())),
            downloads: Arc::new(DownloadManager::new(zim_dir)),
            history: HistoryLog::new(&data_dir),
            collections: CollectionsStore::new(&data_dir),
            rate_limiter,
            metrics: Metrics::new(),
            usage: UsageStats::new(),
            auto_update,
            manage_password,
            config,
            open,
        });
        server.refresh_library(false).await;
        server
    }

    /// Full library refresh: rescan `zim_dir`, rebuild the
    /// registry and domain map, and evict pool/title-index handles for
    /// archives no longer present. `force` bypasses the metadata cache.
    /// Also kicks off background title-index builds for any archive whose
    /// on-disk index is missing or stale.
    pub async fn refresh_library(self: &Arc<Self>, force: bool) {
        let open = self.open.clone();
        let infos = {
            let mut cache = self.cache.lock().unwrap();
            cache.load(&self.config.zim_dir, force, |p| open(p))
        };

        let previous_ids: Vec<crate::registry::ArchiveId> = {
            let registry = self.registry.read().await;
            registry.iter().map(|(id, _)| id).collect()
        };

        let mut registry = self.registry.write().await;
        registry.replace(infos);
        let current_names: std::collections::HashSet<String> = registry.short_names().into_iter().collect();
        drop(registry);

        // Evict handles for archives that disappeared from the refreshed set.
        let registry = self.registry.read().await;
        for id in previous_ids {
            if let Some(info) = registry.get(id) {
                if !current_names.contains(&info.short_name) {
                    self.pools.evict_all(id);
                    self.title_index.evict(id);
                }
            }
        }

        let sources = HashMap::new(); // Source metadata is read lazily per-archive; left empty until first open.
        let new_map = DomainMap::build(&registry, &sources);
        drop(registry);
        *self.domain_map.write().await = new_map;
        self.search.clear_caches();
        self.spawn_title_index_builds().await;
    }

    /// Spawn one background build per archive whose title index is absent
    /// or stale (schema version bump, or the archive file changed under
    /// it). Each build opens its own reader handle and runs on a blocking
    /// thread, so it never touches a pooled handle or the library lock.
    async fn spawn_title_index_builds(self: &Arc<Self>) {
        let registry = self.registry.read().await;
        let stale: Vec<(String, PathBuf, std::time::SystemTime)> = registry
            .iter()
            .filter(|(_, info)| !crate::title_index::is_current(self.title_index.dir(), &info.short_name, info.mtime))
            .map(|(_, info)| (info.short_name.clone(), info.path.clone(), info.mtime))
            .collect();
        drop(registry);

        for (short_name, path, mtime) in stale {
            let open = self.open.clone();
            let dir = self.title_index.dir().to_path_buf();
            tokio::task::spawn_blocking(move || {
                let reader = match open(&path) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(archive = %short_name, error = %e, "failed to open archive for title-index build");
                        return;
                    }
                };
                if let Err(e) = crate::title_index::build(&dir, &short_name, &path, mtime, reader.as_ref(), false) {
                    tracing::warn!(archive = %short_name, error = %e, "title-index build failed");
                }
            });
        }
    }

    pub async fn known_zim_names(&self) -> Vec<String> {
        self.registry.read().await.short_names()
    }

    pub async fn archive_count(&self) -> usize {
        self.registry.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{MockZimReader, ZimMetadata};
    use std::sync::Arc as StdArc;
    use tempfile::tempdir;

    fn mock_open() -> OpenFn {
        StdArc::new(|_path: &std::path::Path| {
            Ok(Box::new(MockZimReader::new(
                vec![],
                ZimMetadata { title: Some("Title".into()), ..Default::default() },
            )) as Box<dyn crate::reader::ZimReader>)
        })
    }

    #[tokio::test]
    async fn new_server_scans_an_empty_library_without_panicking() {
        let zim_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let config = Config {
            zim_dir: zim_dir.path().to_path_buf(),
            data_dir: data_dir.path().to_path_buf(),
            manage_enabled: false,
            manage_password_env: None,
            rate_limit: 60,
            auto_update_env: None,
            update_freq_env: None,
        };
        let server = Server::new(config, mock_open()).await;
        assert_eq!(server.archive_count().await, 0);
    }

    #[tokio::test]
    async fn refresh_library_picks_up_new_archives() {
        let zim_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let config = Config {
            zim_dir: zim_dir.path().to_path_buf(),
            data_dir: data_dir.path().to_path_buf(),
            manage_enabled: false,
            manage_password_env: None,
            rate_limit: 60,
            auto_update_env: None,
            update_freq_env: None,
        };
        let server = Server::new(config, mock_open()).await;
        std::fs::write(zim_dir.path().join("wikipedia_en_all_nopic_2024-07.zim"), b"fake").unwrap();
        server.refresh_library(false).await;
        assert_eq!(server.archive_count().await, 1);
        assert_eq!(server.known_zim_names().await, vec!["wikipedia".to_string()]);
    }
}
