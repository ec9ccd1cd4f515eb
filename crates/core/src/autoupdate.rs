//! Auto-update scheduler. Grounded verbatim in
//! `_load_auto_update_config` / `_save_auto_update_config` /
//! `_auto_update_loop` from `zimi/server.py`: an env-var lock captured once
//! at startup, settings persisted to `auto_update.json` when unlocked, and a
//! background loop that sleeps in 60-second chunks so disabling it exits
//! promptly.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl UpdateFrequency {
    fn seconds(self) -> u64 {
        match self {
            UpdateFrequency::Daily => 86_400,
            UpdateFrequency::Weekly => 604_800,
            UpdateFrequency::Monthly => 2_592_000,
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "daily" => UpdateFrequency::Daily,
            "monthly" => UpdateFrequency::Monthly,
            _ => UpdateFrequency::Weekly,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateFrequency::Daily => "daily",
            UpdateFrequency::Weekly => "weekly",
            UpdateFrequency::Monthly => "monthly",
        }
    }

    /// Strict parse for the `/manage/auto-update` endpoint: unlike `parse`
    /// (used for the env var, which falls back to weekly on anything
    /// unrecognized), a bad value here is a client error.
    pub fn parse_strict(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(UpdateFrequency::Daily),
            "weekly" => Some(UpdateFrequency::Weekly),
            "monthly" => Some(UpdateFrequency::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PersistedConfig {
    enabled: bool,
    frequency: UpdateFrequency,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self { enabled: false, frequency: UpdateFrequency::Weekly }
    }
}

/// Auto-update enable flag and frequency, with the env-var-lock semantics
/// from the Python original: if `ZIMI_AUTO_UPDATE` was set at startup, the
/// UI cannot change settings for the lifetime of the process.
pub struct AutoUpdateConfig {
    path: PathBuf,
    env_locked: bool,
    enabled: AtomicBool,
    frequency: Mutex<UpdateFrequency>,
}

impl AutoUpdateConfig {
    /// Construct from environment + persisted config, exactly as
    /// `_load_auto_update_config` does. `env_auto_update`/`env_update_freq`
    /// are `ZIMI_AUTO_UPDATE`/`ZIMI_UPDATE_FREQ`, passed in rather than read
    /// directly so tests don't need process-global env mutation.
    pub fn new(data_dir: &Path, env_auto_update: Option<&str>, env_update_freq: Option<&str>) -> Self {
        let path = data_dir.join("auto_update.json");
        let env_locked = env_auto_update.is_some();
        let (enabled, frequency) = if env_locked {
            let enabled = env_auto_update == Some("1");
            let frequency = UpdateFrequency::parse(env_update_freq.unwrap_or("weekly"));
            (enabled, frequency)
        } else {
            let cfg = Self::read_from_disk(&path).unwrap_or_default();
            (cfg.enabled, cfg.frequency)
        };
        Self { path, env_locked, enabled: AtomicBool::new(enabled), frequency: Mutex::new(frequency) }
    }

    fn read_from_disk(path: &Path) -> Option<PersistedConfig> {
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn persist(&self) {
        if self.env_locked {
            return;
        }
        let cfg = PersistedConfig { enabled: self.enabled(), frequency: self.frequency() };
        let Ok(json) = serde_json::to_string(&cfg) else { return };
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&self.path, json);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn frequency(&self) -> UpdateFrequency {
        *self.frequency.lock().unwrap()
    }

    pub fn env_locked(&self) -> bool {
        self.env_locked
    }

    /// Apply new settings from the `/manage/auto-update` endpoint. Returns
    /// `false` without changing anything if the env var has locked settings.
    pub fn set(&self, enabled: bool, frequency: UpdateFrequency) -> bool {
        if self.env_locked {
            return false;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        *self.frequency.lock().unwrap() = frequency;
        self.persist();
        true
    }
}

/// Run the auto-update loop until `config.enabled()` goes false. `check` maps
/// to `_check_updates`; `start_download` maps to `_start_download` filtered
/// by the "already downloading this filename" guard, which callers implement
/// via their `DownloadManager::is_downloading`.
pub async fn run_loop(
    config: &AutoUpdateConfig,
    initial_delay: Duration,
    mut check: impl FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<PendingUpdate>> + Send + '_>>,
    mut is_downloading: impl FnMut(&str) -> bool,
    mut start_download: impl FnMut(&str) -> Result<(), String>,
) {
    if !initial_delay.is_zero() {
        tracing::info!(delay_secs = initial_delay.as_secs(), "auto-update: first check delayed");
        let mut waited = Duration::ZERO;
        while waited < initial_delay {
            if !config.enabled() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            waited += Duration::from_secs(1);
        }
    }

    tracing::info!(freq = ?config.frequency(), "auto-update enabled");
    while config.enabled() {
        let updates = check().await;
        if updates.is_empty() {
            tracing::info!("auto-update: all ZIMs up to date");
        } else {
            tracing::info!(count = updates.len(), "auto-update: updates available");
            for update in &updates {
                if update.download_url.is_empty() {
                    continue;
                }
                let filename = update.download_url.rsplit('/').next().unwrap_or(&update.download_url);
                if is_downloading(filename) {
                    tracing::info!(filename, "auto-update: skipping, already downloading");
                    continue;
                }
                match start_download(&update.download_url) {
                    Ok(()) => tracing::info!(name = %update.name, "auto-update: started download"),
                    Err(e) => tracing::warn!(name = %update.name, error = %e, "auto-update: download failed"),
                }
            }
        }

        let interval = config.frequency().seconds();
        let ticks = (interval / 60).max(1);
        for _ in 0..ticks {
            if !config.enabled() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }
}

/// The subset of `catalog::AvailableUpdate` the loop needs, kept separate so
/// this module doesn't depend on `catalog`'s HTTP client plumbing.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub name: String,
    pub download_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_lock_overrides_persisted_config() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("auto_update.json"), r#"{"enabled":true,"frequency":"daily"}"#).unwrap();
        let cfg = AutoUpdateConfig::new(dir.path(), Some("0"), Some("monthly"));
        assert!(cfg.env_locked());
        assert!(!cfg.enabled());
        assert_eq!(cfg.frequency(), UpdateFrequency::Monthly);
    }

    #[test]
    fn unlocked_config_loads_persisted_settings() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("auto_update.json"), r#"{"enabled":true,"frequency":"daily"}"#).unwrap();
        let cfg = AutoUpdateConfig::new(dir.path(), None, None);
        assert!(!cfg.env_locked());
        assert!(cfg.enabled());
        assert_eq!(cfg.frequency(), UpdateFrequency::Daily);
    }

    #[test]
    fn missing_config_defaults_to_disabled_weekly() {
        let dir = tempdir().unwrap();
        let cfg = AutoUpdateConfig::new(dir.path(), None, None);
        assert!(!cfg.enabled());
        assert_eq!(cfg.frequency(), UpdateFrequency::Weekly);
    }

    #[test]
    fn set_is_rejected_when_env_locked() {
        let dir = tempdir().unwrap();
        let cfg = AutoUpdateConfig::new(dir.path(), Some("1"), None);
        assert!(!cfg.set(false, UpdateFrequency::Daily));
        assert!(cfg.enabled());
    }

    #[test]
    fn set_persists_to_disk_when_unlocked() {
        let dir = tempdir().unwrap();
        let cfg = AutoUpdateConfig::new(dir.path(), None, None);
        assert!(cfg.set(true, UpdateFrequency::Daily));

        let reloaded = AutoUpdateConfig::new(dir.path(), None, None);
        assert!(reloaded.enabled());
        assert_eq!(reloaded.frequency(), UpdateFrequency::Daily);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_immediately_when_config_starts_disabled() {
        let dir = tempdir().unwrap();
        let cfg = AutoUpdateConfig::new(dir.path(), None, None);
        assert!(!cfg.enabled());

        run_loop(&cfg, Duration::ZERO, || Box::pin(async { unreachable!() }), |_| false, |_| Ok(())).await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_starts_downloads_for_available_updates_then_stops() {
        let dir = tempdir().unwrap();
        let cfg = AutoUpdateConfig::new(dir.path(), None, None);
        cfg.set(true, UpdateFrequency::Daily);

        let started = Mutex::new(Vec::new());
        let first_tick = AtomicBool::new(true);

        run_loop(
            &cfg,
            Duration::ZERO,
            || {
                let is_first = first_tick.swap(false, Ordering::SeqCst);
                Box::pin(async move {
                    if is_first {
                        vec![PendingUpdate {
                            name: "wikipedia".into(),
                            download_url: "https://download.kiwix.org/zim/wikipedia_en_all_2024-08.zim".into(),
                        }]
                    } else {
                        cfg.set(false, UpdateFrequency::Daily);
                        vec![]
                    }
                })
            },
            |_| false,
            |url| {
                started.lock().unwrap().push(url.to_string());
                Ok(())
            },
        )
        .await;

        assert_eq!(started.lock().unwrap().len(), 1);
        assert!(!cfg.enabled());
    }
}
