//! Environment configuration and manage-password handling.
//! Grounded in the top-level env var reads and `_password_file` /
//! `_hash_pw` / `_get_manage_password_hash` / `_set_manage_password` /
//! `_check_manage_auth` from `zimi/server.py`.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::autoupdate::UpdateFrequency;

/// Process-wide configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub zim_dir: PathBuf,
    pub data_dir: PathBuf,
    pub manage_enabled: bool,
    pub manage_password_env: Option<String>,
    pub rate_limit: u32,
    pub auto_update_env: Option<String>,
    pub update_freq_env: Option<String>,
}

impl Config {
    /// Read configuration the way `main()` does in the Python original:
    /// `ZIM_DIR` defaults to the current directory, `ZIMI_DATA_DIR`
    /// defaults to `ZIM_DIR`, rate limit defaults to 60.
    pub fn from_env() -> Self {
        let zim_dir = std::env::var("ZIM_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
        let data_dir = std::env::var("ZIMI_DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| zim_dir.clone());
        let manage_enabled = std::env::var("ZIMI_MANAGE").map(|v| v == "1").unwrap_or(false);
        let rate_limit = std::env::var("ZIMI_RATE_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(60);
        Self {
            zim_dir,
            data_dir,
            manage_enabled,
            manage_password_env: std::env::var("ZIMI_MANAGE_PASSWORD").ok().filter(|v| !v.is_empty()),
            rate_limit,
            auto_update_env: std::env::var("ZIMI_AUTO_UPDATE").ok(),
            update_freq_env: std::env::var("ZIMI_UPDATE_FREQ").ok(),
        }
    }

    pub fn auto_update_frequency_env(&self) -> Option<UpdateFrequency> {
        self.update_freq_env.as_deref().map(|s| match s {
            "daily" => UpdateFrequency::Daily,
            "monthly" => UpdateFrequency::Monthly,
            _ => UpdateFrequency::Weekly,
        })
    }
}

fn hash_password(pw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pw.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Holds the manage-mode password (env var, or hashed-on-disk), mirroring
/// the original's "env var stores plaintext, hash on read" rule.
pub struct ManagePassword {
    path: PathBuf,
    env_password: Option<String>,
}

impl ManagePassword {
    pub fn new(data_dir: &Path, env_password: Option<String>) -> Self {
        Self { path: data_dir.join("password"), env_password }
    }

    fn stored_hash(&self) -> String {
        if let Some(pw) = &self.env_password {
            return hash_password(pw);
        }
        fs::read_to_string(&self.path).map(|s| s.trim().to_string()).unwrap_or_default()
    }

    /// `true` if a manage password is currently configured.
    pub fn is_set(&self) -> bool {
        !self.stored_hash().is_empty()
    }

    /// Validate a bearer token against the stored hash. Always allows when
    /// no password is set, matching the original's "no password set, allow
    /// access" branch.
    pub fn check(&self, bearer_token: Option<&str>) -> bool {
        let stored = self.stored_hash();
        if stored.is_empty() {
            return true;
        }
        match bearer_token {
            Some(token) => constant_time_eq(&hash_password(token), &stored),
            None => false,
        }
    }

    /// Persist a new password hash (or clear it with an empty string).
    /// Fails only if the env var has pinned the password.
    pub fn set(&self, pw: &str) -> std::io::Result<()> {
        if self.env_password.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "manage password is pinned by ZIMI_MANAGE_PASSWORD",
            ));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let hash = if pw.is_empty() { String::new() } else { hash_password(pw) };
        fs::write(&self.path, hash)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn no_password_set_allows_any_token() {
        let dir = tempdir().unwrap();
        let pw = ManagePassword::new(dir.path(), None);
        assert!(!pw.is_set());
        assert!(pw.check(None));
        assert!(pw.check(Some("anything")));
    }

    #[test]
    fn set_password_requires_matching_bearer_token() {
        let dir = tempdir().unwrap();
        let pw = ManagePassword::new(dir.path(), None);
        pw.set("hunter2").unwrap();
        assert!(pw.is_set());
        assert!(pw.check(Some("hunter2")));
        assert!(!pw.check(Some("wrong")));
        assert!(!pw.check(None));
    }

    #[test]
    fn env_password_is_hashed_on_read_and_cannot_be_changed() {
        let dir = tempdir().unwrap();
        let pw = ManagePassword::new(dir.path(), Some("envpass".to_string()));
        assert!(pw.check(Some("envpass")));
        assert!(pw.set("new").is_err());
    }

    #[test]
    fn clearing_password_with_empty_string_disables_auth() {
        let dir = tempdir().unwrap();
        let pw = ManagePassword::new(dir.path(), None);
        pw.set("hunter2").unwrap();
        pw.set("").unwrap();
        assert!(!pw.is_set());
        assert!(pw.check(None));
    }

    #[test]
    fn config_defaults_data_dir_to_zim_dir() {
        std::env::remove_var("ZIMI_DATA_DIR");
        std::env::set_var("ZIM_DIR", "/tmp/zims-for-config-test");
        let cfg = Config::from_env();
        assert_eq!(cfg.zim_dir, PathBuf::from("/tmp/zims-for-config-test"));
        assert_eq!(cfg.data_dir, cfg.zim_dir);
        std::env::remove_var("ZIM_DIR");
    }
}
