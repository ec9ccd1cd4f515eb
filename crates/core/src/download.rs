//! Resumable archive downloads. Grounded verbatim in
//! `_download_thread` / `start_download` / `DownloadManager` from `zimi.py`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::AppError;

const TRUSTED_CATALOG_HOST: &str = "download.kiwix.org";
const CHUNK_SIZE: usize = 64 * 1024;
const RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: Uuid,
    pub url: String,
    pub filename: String,
    pub is_update: bool,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,
    pub completed_at: Option<Instant>,
}

/// Strip a `.meta4` metalink suffix, `?query#fragment`, and validate the
/// trailing filename. Returns the bare `*.zim` filename on success.
fn extract_filename(url: &str, allow_any_https_host: bool) -> Result<String, AppError> {
    let parsed = url::Url::parse(url).map_err(|_| AppError::client("invalid URL"))?;
    if parsed.scheme() != "https" {
        return Err(AppError::client("only https URLs are accepted"));
    }
    let host = parsed.host_str().unwrap_or("");
    if !allow_any_https_host && host != TRUSTED_CATALOG_HOST {
        return Err(AppError::client("downloads are only accepted from the trusted catalog host"));
    }

    let last_segment = parsed
        .path_segments()
        .and_then(|mut s| s.next_back())
        .ok_or_else(|| AppError::client("URL has no path segment"))?;
    let filename = last_segment.strip_suffix(".meta4").unwrap_or(last_segment);

    if filename.contains("..") {
        return Err(AppError::client("filename must not contain '..'"));
    }
    if !filename.ends_with(".zim") {
        return Err(AppError::client("filename must end with .zim"));
    }
    if !filename.chars().all(|c| c.is_alphanumeric() || c == '.' || c == '_' || c == '-') {
        return Err(AppError::client("filename contains invalid characters"));
    }
    Ok(filename.to_string())
}

/// One in-flight or recently-finished download.
struct ManagedDownload {
    record: Mutex<DownloadRecord>,
    cancelled: Arc<AtomicBool>,
}

/// Manages concurrent resumable downloads into the archive directory.
pub struct DownloadManager {
    zim_dir: PathBuf,
    client: reqwest::Client,
    downloads: Mutex<HashMap<Uuid, Arc<ManagedDownload>>>,
}

impl DownloadManager {
    pub fn new(zim_dir: PathBuf) -> Self {
        Self { zim_dir, client: reqwest::Client::new(), downloads: Mutex::new(HashMap::new()) }
    }

    /// True if `filename` (base name, date-stripped by the caller if
    /// needed) is currently downloading.
    pub fn is_downloading(&self, filename: &str) -> bool {
        self.downloads.lock().unwrap().values().any(|d| {
            let rec = d.record.lock().unwrap();
            rec.filename == filename && rec.status == DownloadStatus::Downloading
        })
    }

    /// Validate and register a new download, spawning the transfer task.
    /// `on_complete(filename, is_update)` runs after a successful rename
    /// (library refresh hook); `on_failure(filename, error)` runs on a
    /// non-cancelled failure.
    pub fn start(
        self: &Arc<Self>,
        url: String,
        allow_any_https_host: bool,
        on_complete: impl Fn(&str, bool) + Send + Sync + 'static,
        on_failure: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> Result<Uuid, AppError> {
        let filename = extract_filename(&url, allow_any_https_host)?;
        let dest = self.zim_dir.join(&filename);
        let is_update = self
            .zim_dir
            .read_dir()
            .into_iter()
            .flatten()
            .flatten()
            .any(|e| e.file_name().to_string_lossy() == filename);

        let id = Uuid::new_v4();
        let record = DownloadRecord {
            id,
            url: url.clone(),
            filename: filename.clone(),
            is_update,
            status: DownloadStatus::Downloading,
            bytes_downloaded: 0,
            total_bytes: None,
            error: None,
            completed_at: None,
        };
        let cancelled = Arc::new(AtomicBool::new(false));
        let managed = Arc::new(ManagedDownload { record: Mutex::new(record), cancelled: cancelled.clone() });
        self.downloads.lock().unwrap().insert(id, managed.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.transfer(&managed, &url, &dest, &cancelled).await;
            let mut rec = managed.record.lock().unwrap();
            match result {
                Ok(()) => {
                    rec.status = DownloadStatus::Completed;
                    let filename = rec.filename.clone();
                    let is_update = rec.is_update;
                    drop(rec);
                    on_complete(&filename, is_update);
                }
                Err(e) => {
                    let was_cancelled = cancelled.load(Ordering::SeqCst);
                    rec.status = if was_cancelled { DownloadStatus::Cancelled } else { DownloadStatus::Failed };
                    rec.error = Some(e.to_string());
                    if !was_cancelled {
                        let filename = rec.filename.clone();
                        let error = e.to_string();
                        drop(rec);
                        on_failure(&filename, &error);
                    }
                }
            }
            managed.record.lock().unwrap().completed_at.get_or_insert(Instant::now());
        });

        Ok(id)
    }

    async fn transfer(
        &self,
        managed: &ManagedDownload,
        url: &str,
        dest: &Path,
        cancelled: &AtomicBool,
    ) -> Result<(), AppError> {
        let tmp = dest.with_extension("zim.tmp");
        let existing_size = tokio::fs::metadata(&tmp).await.map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(url);
        if existing_size > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={existing_size}-"));
        }
        let response = request.send().await.map_err(|e| AppError::Upstream(e.to_string()))?;
        let status = response.status();

        if status.as_u16() == 416 {
            // Range not satisfiable: the tmp file is already complete.
            tokio::fs::rename(&tmp, dest).await.map_err(|e| AppError::internal(e.to_string()))?;
            return Ok(());
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!("upstream returned {status}")));
        }

        let resuming = status.as_u16() == 206;
        let total = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok())
            .or_else(|| response.content_length().map(|len| if resuming { existing_size + len } else { len }));
        managed.record.lock().unwrap().total_bytes = total;

        let mut file = if resuming {
            tokio::fs::OpenOptions::new().append(true).open(&tmp).await
        } else {
            tokio::fs::File::create(&tmp).await
        }
        .map_err(|e| AppError::internal(e.to_string()))?;

        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;
        let mut downloaded = if resuming { existing_size } else { 0 };
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancelled.load(Ordering::SeqCst) {
                return Err(AppError::client("download cancelled"));
            }
            let chunk = chunk.map_err(|e| AppError::Upstream(e.to_string()))?;
            for piece in chunk.chunks(CHUNK_SIZE) {
                file.write_all(piece).await.map_err(|e| AppError::internal(e.to_string()))?;
            }
            downloaded += chunk.len() as u64;
            managed.record.lock().unwrap().bytes_downloaded = downloaded;
        }
        file.flush().await.map_err(|e| AppError::internal(e.to_string()))?;
        drop(file);

        if let Some(total) = total {
            if downloaded != total {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(AppError::client(format!("size mismatch: got {downloaded}, expected {total}")));
            }
        }

        // Remove older archives sharing the same base name before the final rename.
        let base = crate::registry::derive_short_name(&dest.file_name().unwrap().to_string_lossy());
        if let Ok(entries) = self.zim_dir.read_dir() {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name != dest.file_name().unwrap().to_string_lossy()
                    && crate::registry::derive_short_name(&name) == base
                {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        tokio::fs::rename(&tmp, dest).await.map_err(|e| AppError::internal(e.to_string()))?;
        Ok(())
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        let downloads = self.downloads.lock().unwrap();
        if let Some(d) = downloads.get(&id) {
            d.cancelled.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Snapshot of one download's status, lazily garbage-collecting
    /// completed/failed/cancelled records older than one hour.
    pub fn status(&self, id: Uuid) -> Option<DownloadRecord> {
        self.gc();
        self.downloads.lock().unwrap().get(&id).map(|d| d.record.lock().unwrap().clone())
    }

    pub fn list(&self) -> Vec<DownloadRecord> {
        self.gc();
        self.downloads.lock().unwrap().values().map(|d| d.record.lock().unwrap().clone()).collect()
    }

    fn gc(&self) {
        let mut downloads = self.downloads.lock().unwrap();
        downloads.retain(|_, d| {
            let rec = d.record.lock().unwrap();
            match rec.completed_at {
                Some(t) => t.elapsed() < RETENTION,
                None => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_untrusted_host_for_downloads() {
        let err = extract_filename("https://evil.example/wikipedia_en_all.zim", false).unwrap_err();
        assert!(matches!(err, AppError::Client(_)));
    }

    #[test]
    fn allows_any_https_host_for_imports() {
        let filename = extract_filename("https://mirror.example/devdocs_python_2024-08.zim", true).unwrap();
        assert_eq!(filename, "devdocs_python_2024-08.zim");
    }

    #[test]
    fn strips_meta4_suffix() {
        let filename =
            extract_filename("https://download.kiwix.org/zim/wikipedia_en_all.zim.meta4", false).unwrap();
        assert_eq!(filename, "wikipedia_en_all.zim");
    }

    #[test]
    fn rejects_path_traversal() {
        let err = extract_filename("https://download.kiwix.org/../../etc/passwd.zim", false).unwrap_err();
        assert!(matches!(err, AppError::Client(_)));
    }

    #[test]
    fn rejects_non_zim_suffix() {
        let err = extract_filename("https://download.kiwix.org/zim/readme.txt", false).unwrap_err();
        assert!(matches!(err, AppError::Client(_)));
    }
}
