//! Client Update Records
//!
//! Typed records persisted through the key/value capability: the current
//! download session, the resolved artifact path, the pending-install marker
//! and the verification state polled by presentation.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::engine::updater::capabilities::{DownloadHandle, KeyValueStore};

const KEY_SESSION: &str = "download_session";
const KEY_ARTIFACT_PATH: &str = "artifact_path";
const KEY_PENDING_INSTALL: &str = "pending_install";
const KEY_VERIFICATION: &str = "verification_state";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Failed to read state: {0}")]
    ReadError(String),
    #[error("Failed to write state: {0}")]
    WriteError(String),
    #[error("Failed to parse state: {0}")]
    ParseError(String),
    #[error("Failed to serialize state: {0}")]
    SerializeError(String),
    #[error("State store lock poisoned")]
    Poisoned,
}

/// One enqueued download, superseded by the next enqueue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSession {
    pub session_id: DownloadHandle,
    pub target_path: PathBuf,
    pub declared_url: String,
    pub version_label: String,
    pub created_at: DateTime<Utc>,
}

/// Written only after integrity and identity both passed. The sole
/// authorization for handing the artifact to the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInstall {
    pub artifact_path: PathBuf,
    pub session_id: DownloadHandle,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPhase {
    Started,
    WaitingTransport,
    Hashing,
    IdentityCheck,
    TrustedOk,
    TrustChanged,
    HashFailed,
    IdentityFailed,
    TerminalFailure,
}

impl VerifyPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerifyPhase::TrustedOk
                | VerifyPhase::TrustChanged
                | VerifyPhase::HashFailed
                | VerifyPhase::IdentityFailed
                | VerifyPhase::TerminalFailure
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationState {
    pub session_id: DownloadHandle,
    pub in_progress: bool,
    pub phase: VerifyPhase,
    pub attempt: u32,
    /// Failure code or approval summary once terminal
    pub outcome: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationState {
    pub fn idle(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            in_progress: false,
            phase: VerifyPhase::Started,
            attempt: 0,
            outcome: None,
            updated_at: Utc::now(),
        }
    }
}

/// Typed access to the client records
#[derive(Clone)]
pub struct LocalRecords {
    kv: Arc<dyn KeyValueStore>,
}

impl LocalRecords {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub(crate) fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.kv.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StateError::ParseError(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    pub(crate) fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StateError> {
        let value =
            serde_json::to_value(value).map_err(|e| StateError::SerializeError(e.to_string()))?;
        self.kv.put(key, value)
    }

    pub fn session(&self) -> Result<Option<DownloadSession>, StateError> {
        self.read(KEY_SESSION)
    }

    pub fn set_session(&self, session: &DownloadSession) -> Result<(), StateError> {
        self.write(KEY_SESSION, session)
    }

    pub fn clear_session(&self) -> Result<(), StateError> {
        self.kv.remove(KEY_SESSION)
    }

    pub fn artifact_path(&self) -> Result<Option<PathBuf>, StateError> {
        self.read(KEY_ARTIFACT_PATH)
    }

    pub fn set_artifact_path(&self, path: &Path) -> Result<(), StateError> {
        self.write(KEY_ARTIFACT_PATH, &path)
    }

    pub fn clear_artifact_path(&self) -> Result<(), StateError> {
        self.kv.remove(KEY_ARTIFACT_PATH)
    }

    pub fn pending_install(&self) -> Result<Option<PendingInstall>, StateError> {
        self.read(KEY_PENDING_INSTALL)
    }

    pub fn set_pending_install(&self, pending: &PendingInstall) -> Result<(), StateError> {
        self.write(KEY_PENDING_INSTALL, pending)
    }

    pub fn clear_pending_install(&self) -> Result<(), StateError> {
        self.kv.remove(KEY_PENDING_INSTALL)
    }

    pub fn verification(&self) -> Result<Option<VerificationState>, StateError> {
        self.read(KEY_VERIFICATION)
    }

    pub fn set_verification(&self, state: &VerificationState) -> Result<(), StateError> {
        self.write(KEY_VERIFICATION, state)
    }

    pub fn clear_verification(&self) -> Result<(), StateError> {
        self.kv.remove(KEY_VERIFICATION)
    }

    /// Apply `change` to the verification state of `session_id`. A state
    /// belonging to another session, or none at all, is left alone.
    pub fn update_verification<F>(&self, session_id: &str, change: F) -> Result<bool, StateError>
    where
        F: FnOnce(&mut VerificationState),
    {
        match self.verification()? {
            Some(mut state) if state.session_id == session_id => {
                change(&mut state);
                state.updated_at = Utc::now();
                self.set_verification(&state)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Marks a verification attempt as in progress for as long as it lives.
/// Dropping it clears the flag on every exit path.
pub struct VerificationGuard {
    records: LocalRecords,
    session_id: DownloadHandle,
}

impl VerificationGuard {
    pub fn begin(records: &LocalRecords, session_id: &str, attempt: u32) -> Result<Self, StateError> {
        let mut state = records
            .verification()?
            .filter(|s| s.session_id == session_id)
            .unwrap_or_else(|| VerificationState::idle(session_id));
        state.in_progress = true;
        state.phase = VerifyPhase::Started;
        state.attempt = attempt;
        state.outcome = None;
        state.updated_at = Utc::now();
        records.set_verification(&state)?;

        Ok(Self {
            records: records.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn phase(&self, phase: VerifyPhase) -> Result<(), StateError> {
        self.records
            .update_verification(&self.session_id, |s| s.phase = phase)
            .map(|_| ())
    }

    pub fn finish(&self, phase: VerifyPhase, outcome: &str) -> Result<(), StateError> {
        self.records
            .update_verification(&self.session_id, |s| {
                s.phase = phase;
                s.outcome = Some(outcome.to_string());
            })
            .map(|_| ())
    }
}

impl Drop for VerificationGuard {
    fn drop(&mut self) {
        if let Err(e) = self
            .records
            .update_verification(&self.session_id, |s| s.in_progress = false)
        {
            tracing::warn!(session = %self.session_id, error = %e, "Failed to clear verification flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::kv::MemoryStore;

    fn records() -> LocalRecords {
        LocalRecords::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_guard_clears_flag_on_drop() {
        let records = records();
        {
            let guard = VerificationGuard::begin(&records, "s1", 2).unwrap();
            guard.phase(VerifyPhase::Hashing).unwrap();
            let state = records.verification().unwrap().unwrap();
            assert!(state.in_progress);
            assert_eq!(state.phase, VerifyPhase::Hashing);
            assert_eq!(state.attempt, 2);
        }
        let state = records.verification().unwrap().unwrap();
        assert!(!state.in_progress);
        assert_eq!(state.phase, VerifyPhase::Hashing);
    }

    #[test]
    fn test_guard_does_not_resurrect_discarded_state() {
        let records = records();
        let guard = VerificationGuard::begin(&records, "s1", 0).unwrap();
        records.clear_verification().unwrap();
        guard.finish(VerifyPhase::TrustedOk, "approved").unwrap();
        drop(guard);
        assert!(records.verification().unwrap().is_none());
    }

    #[test]
    fn test_guard_ignores_other_session() {
        let records = records();
        let guard = VerificationGuard::begin(&records, "old", 0).unwrap();
        records.set_verification(&VerificationState::idle("new")).unwrap();
        drop(guard);
        let state = records.verification().unwrap().unwrap();
        assert_eq!(state.session_id, "new");
        assert!(!state.in_progress);
    }

    #[test]
    fn test_records_roundtrip() {
        let records = records();
        let session = DownloadSession {
            session_id: "h1".to_string(),
            target_path: PathBuf::from("/tmp/App-1.apk"),
            declared_url: "https://dl.example.com/App-1.apk".to_string(),
            version_label: "1".to_string(),
            created_at: Utc::now(),
        };
        records.set_session(&session).unwrap();
        records.set_artifact_path(Path::new("/tmp/App-1.apk")).unwrap();

        assert_eq!(records.session().unwrap(), Some(session));
        assert_eq!(
            records.artifact_path().unwrap(),
            Some(PathBuf::from("/tmp/App-1.apk"))
        );
        records.clear_session().unwrap();
        assert!(records.session().unwrap().is_none());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(VerifyPhase::TrustChanged.is_terminal());
        assert!(!VerifyPhase::WaitingTransport.is_terminal());
    }
}
