//! Operation Locks
//!
//! Cross-process serialization of the refresh cycle and of client
//! verification runs. A lock is a JSON file naming its holder; locks left by
//! dead processes or past their timeout are reclaimed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Server refresh cycle: scrape, reconcile, dispatch
    Refresh,
    /// Client verification of a downloaded artifact
    Verify,
}

impl LockType {
    pub fn filename(&self) -> &'static str {
        match self {
            LockType::Refresh => "refresh.lock",
            LockType::Verify => "verify.lock",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            LockType::Refresh => "Index refresh in progress",
            LockType::Verify => "Artifact verification in progress",
        }
    }

    /// Seconds after which a lock is considered abandoned even if its pid is alive
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            LockType::Refresh => 30 * 60,
            LockType::Verify => 2 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_type: LockType,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
    pub timeout_secs: Option<u64>,
}

impl LockInfo {
    pub fn new(lock_type: LockType) -> Self {
        Self {
            lock_type,
            pid: std::process::id(),
            started_at: Utc::now(),
            description: lock_type.description().to_string(),
            timeout_secs: Some(lock_type.default_timeout_secs()),
        }
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    pub fn is_expired(&self) -> bool {
        match self.timeout_secs {
            Some(timeout) => {
                let elapsed = Utc::now().signed_duration_since(self.started_at);
                elapsed.num_seconds() > timeout as i64
            }
            None => false,
        }
    }

    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }

        #[cfg(unix)]
        {
            std::process::Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            std::process::Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }

    fn is_live(&self) -> bool {
        self.is_process_alive() && !self.is_expired()
    }
}

#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("{lock_type:?} lock held by PID {pid}: {description}")]
    AlreadyLocked {
        lock_type: LockType,
        pid: u32,
        description: String,
    },
    #[error("Lock IO error: {0}")]
    IoError(String),
    #[error("Lock serialize error: {0}")]
    SerializeError(String),
}

/// Lock manager rooted at a directory
#[derive(Debug, Clone)]
pub struct OperationLock {
    locks_dir: PathBuf,
}

impl OperationLock {
    pub fn new(locks_dir: &Path) -> Self {
        Self {
            locks_dir: locks_dir.to_path_buf(),
        }
    }

    fn lock_path(&self, lock_type: LockType) -> PathBuf {
        self.locks_dir.join(lock_type.filename())
    }

    pub fn acquire(&self, lock_type: LockType) -> Result<LockGuard, LockError> {
        self.acquire_with(LockInfo::new(lock_type))
    }

    pub fn acquire_with(&self, info: LockInfo) -> Result<LockGuard, LockError> {
        let lock_type = info.lock_type;
        fs::create_dir_all(&self.locks_dir).map_err(|e| LockError::IoError(e.to_string()))?;
        let lock_path = self.lock_path(lock_type);

        if let Some(existing) = self.read_lock(&lock_path) {
            if existing.is_live() {
                return Err(LockError::AlreadyLocked {
                    lock_type,
                    pid: existing.pid,
                    description: existing.description,
                });
            }
            tracing::warn!(?lock_type, pid = existing.pid, "Reclaiming stale lock");
            let _ = fs::remove_file(&lock_path);
        }

        let content = serde_json::to_string_pretty(&info)
            .map_err(|e| LockError::SerializeError(e.to_string()))?;

        // create_new so two processes reclaiming the same stale lock cannot both win
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = self.read_lock(&lock_path);
                return Err(LockError::AlreadyLocked {
                    lock_type,
                    pid: holder.as_ref().map(|h| h.pid).unwrap_or_default(),
                    description: holder
                        .map(|h| h.description)
                        .unwrap_or_else(|| lock_type.description().to_string()),
                });
            }
            Err(e) => return Err(LockError::IoError(e.to_string())),
        };
        file.write_all(content.as_bytes())
            .map_err(|e| LockError::IoError(e.to_string()))?;

        Ok(LockGuard {
            lock_path,
            lock_type,
        })
    }

    fn read_lock(&self, path: &Path) -> Option<LockInfo> {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }

    /// Current live holder of `lock_type`, if any
    pub fn holder(&self, lock_type: LockType) -> Option<LockInfo> {
        self.read_lock(&self.lock_path(lock_type))
            .filter(LockInfo::is_live)
    }

    pub fn get_active_locks(&self) -> Vec<LockInfo> {
        [LockType::Refresh, LockType::Verify]
            .into_iter()
            .filter_map(|lock_type| self.holder(lock_type))
            .collect()
    }

    /// Remove every lock file regardless of holder
    pub fn force_release_all(&self) -> std::io::Result<()> {
        if self.locks_dir.exists() {
            for entry in fs::read_dir(&self.locks_dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "lock").unwrap_or(false) {
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }
}

/// Releases the lock on drop
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    lock_type: LockType,
}

impl LockGuard {
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_release() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        let guard = locks.acquire(LockType::Refresh).unwrap();
        assert_eq!(guard.lock_type(), LockType::Refresh);
        assert!(matches!(
            locks.acquire(LockType::Refresh),
            Err(LockError::AlreadyLocked { .. })
        ));

        drop(guard);
        assert!(locks.acquire(LockType::Refresh).is_ok());
    }

    #[test]
    fn test_lock_types_are_independent() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        let _refresh = locks.acquire(LockType::Refresh).unwrap();
        let _verify = locks.acquire(LockType::Verify).unwrap();
        assert_eq!(locks.get_active_locks().len(), 2);
    }

    #[test]
    fn test_expired_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        let mut stale = LockInfo::new(LockType::Verify);
        stale.started_at = Utc::now() - Duration::hours(5);
        fs::write(
            dir.path().join(LockType::Verify.filename()),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        assert!(locks.holder(LockType::Verify).is_none());
        assert!(locks.acquire(LockType::Verify).is_ok());
    }

    #[test]
    fn test_force_release_all() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());
        let guard = locks.acquire(LockType::Refresh).unwrap();
        locks.force_release_all().unwrap();
        assert!(locks.get_active_locks().is_empty());
        drop(guard);
    }
}
