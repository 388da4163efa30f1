//! Client Capabilities
//!
//! The orchestrator reaches the platform only through these traits: the
//! download transport, user notifications, the installed-version probe,
//! signer inspection, local key/value persistence and the backend's latest
//! record. Tests substitute deterministic fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::error::{FetchError, IdentityError};
use crate::engine::metadata::ArtifactRecord;
use crate::engine::updater::state::StateError;

/// Opaque transport-assigned identifier of an enqueued download
pub type DownloadHandle = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Pending,
    Running,
    Paused,
    Successful,
    Failed,
}

impl TransportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportStatus::Successful | TransportStatus::Failed)
    }
}

/// What the transport knows about one download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportRecord {
    pub status: TransportStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub local_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
}

impl TransportRecord {
    pub fn progress_percent(&self) -> Option<f32> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.bytes_downloaded as f32 / total as f32 * 100.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub target_path: PathBuf,
    pub title: String,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Download rejected: {0}")]
    Rejected(String),
    #[error("Transport IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait DownloadTransport: Send + Sync {
    fn enqueue(&self, request: DownloadRequest) -> Result<DownloadHandle, TransportError>;
    /// `None` when the transport has no record of the handle (yet)
    fn query(&self, handle: &str) -> Option<TransportRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    UpdateAvailable,
    ReadyToInstall,
    SignerChanged,
    VerificationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
}

pub trait NotificationSink: Send + Sync {
    /// Whether the user currently allows notifications
    fn permitted(&self) -> bool;
    fn post(&self, notification: &Notification);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub installed: bool,
    pub version_name: Option<String>,
}

impl InstalledVersion {
    pub fn not_installed() -> Self {
        Self {
            installed: false,
            version_name: None,
        }
    }

    pub fn display(&self) -> String {
        match (&self.installed, &self.version_name) {
            (false, _) => "Not installed".to_string(),
            (true, Some(version)) => version.clone(),
            (true, None) => "(unknown version)".to_string(),
        }
    }
}

#[async_trait]
pub trait InstalledVersionProbe: Send + Sync {
    async fn probe(&self) -> InstalledVersion;
}

pub trait SignerInspector: Send + Sync {
    /// Lowercase hex fingerprint of the key that signed the artifact
    fn signer_fingerprint(&self, artifact: &Path) -> Result<String, IdentityError>;
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError>;
    fn put(&self, key: &str, value: Value) -> Result<(), StateError>;
    fn remove(&self, key: &str) -> Result<(), StateError>;
}

/// Fresh read of the backend's latest record
#[async_trait]
pub trait LatestSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<Option<ArtifactRecord>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let mut record = TransportRecord {
            status: TransportStatus::Running,
            bytes_downloaded: 50,
            total_bytes: Some(200),
            local_path: None,
            failure_reason: None,
        };
        assert_eq!(record.progress_percent(), Some(25.0));
        record.total_bytes = None;
        assert_eq!(record.progress_percent(), None);
    }

    #[test]
    fn test_installed_display() {
        assert_eq!(InstalledVersion::not_installed().display(), "Not installed");
        let installed = InstalledVersion {
            installed: true,
            version_name: Some("2.3.1".to_string()),
        };
        assert_eq!(installed.display(), "2.3.1");
    }
}
