//! Event history log. Grounded in `_history_file_path` /
//! `_load_history` / `_append_history` from `zimi/server.py`: a newest-first
//! ring buffer capped at 500 entries, persisted as JSON with an atomic
//! rename and tolerant of a missing or corrupt file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of retained events; oldest entries are dropped first.
pub const HISTORY_MAX: usize = 500;

/// One logged event. `extra` carries event-specific fields (`filename`,
/// `zim_name`, `error`, ...) the way the Python original passes a loose
/// `**kwargs` dict into `_append_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event: String,
    pub ts: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Persistent, newest-first event log.
pub struct HistoryLog {
    path: PathBuf,
    events: Mutex<Vec<HistoryEvent>>,
}

impl HistoryLog {
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join("history.json");
        let events = Self::read_from_disk(&path).unwrap_or_default();
        Self { path, events: Mutex::new(events) }
    }

    fn read_from_disk(path: &Path) -> Option<Vec<HistoryEvent>> {
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn persist(&self, events: &[HistoryEvent]) {
        let Ok(json) = serde_json::to_string_pretty(events) else { return };
        if let Some(parent) = self.path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        if fs::write(&tmp, json).is_err() {
            tracing::warn!(path = %self.path.display(), "failed to write history log");
            return;
        }
        if fs::rename(&tmp, &self.path).is_err() {
            tracing::warn!(path = %self.path.display(), "failed to rename history log into place");
        }
    }

    /// Prepend `event`, truncate to `HISTORY_MAX`, and persist.
    pub fn append(&self, event: HistoryEvent) {
        let mut events = self.events.lock().unwrap();
        events.insert(0, event);
        events.truncate(HISTORY_MAX);
        self.persist(&events);
    }

    /// All logged events, newest first.
    pub fn list(&self) -> Vec<HistoryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl HistoryEvent {
    pub fn new(event: impl Into<String>, ts: f64) -> Self {
        Self { event: event.into(), ts, extra: serde_json::Map::new() }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_grows_the_log_newest_first() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::new(dir.path());
        log.append(HistoryEvent::new("download_started", 1.0).with("filename", "a.zim"));
        log.append(HistoryEvent::new("download_completed", 2.0).with("filename", "a.zim"));

        let events = log.list();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "download_completed");
        assert_eq!(events[1].event, "download_started");
    }

    #[test]
    fn truncates_at_history_max() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::new(dir.path());
        for i in 0..(HISTORY_MAX + 10) {
            log.append(HistoryEvent::new("tick", i as f64));
        }
        let events = log.list();
        assert_eq!(events.len(), HISTORY_MAX);
        // Newest first: the very last appended tick is at index 0.
        assert_eq!(events[0].ts, (HISTORY_MAX + 9) as f64);
    }

    #[test]
    fn reloads_persisted_events_from_disk() {
        let dir = tempdir().unwrap();
        {
            let log = HistoryLog::new(dir.path());
            log.append(HistoryEvent::new("download_failed", 5.0).with("error", "timeout"));
        }
        let log = HistoryLog::new(dir.path());
        let events = log.list();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "download_failed");
        assert_eq!(events[0].extra.get("error").unwrap(), "timeout");
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::new(dir.path());
        assert!(log.list().is_empty());
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("history.json"), b"not json").unwrap();
        let log = HistoryLog::new(dir.path());
        assert!(log.list().is_empty());
    }
}
