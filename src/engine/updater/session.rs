//! Update Session
//!
//! Starts and discards download sessions and reports their status. Starting
//! a session invalidates everything derived from the previous one; only the
//! pinned signer survives.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::engine::metadata::ArtifactRecord;
use crate::engine::updater::capabilities::{
    DownloadRequest, DownloadTransport, Notification, NotificationKind, NotificationSink,
    TransportError, TransportRecord,
};
use crate::engine::updater::download::partial_path;
use crate::engine::updater::state::{
    DownloadSession, LocalRecords, PendingInstall, StateError, VerificationState,
};
use crate::engine::updater::trust::{TrustRecord, TrustStore};

pub const FALLBACK_FILE_NAME: &str = "artifact-latest.bin";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: Option<DownloadSession>,
    pub transport: Option<TransportRecord>,
    pub verification: Option<VerificationState>,
    /// Approved artifact belonging to the current session
    pub ready_to_install: Option<PendingInstall>,
    /// An approval marker exists but belongs to a discarded or superseded session
    pub stale_pending_install: bool,
    pub artifact_path: Option<PathBuf>,
    pub trust: TrustRecord,
}

pub struct UpdateSession {
    transport: Arc<dyn DownloadTransport>,
    notifier: Arc<dyn NotificationSink>,
    records: LocalRecords,
    trust: TrustStore,
    download_dir: PathBuf,
}

/// Last path component of the published name, or the fallback
pub fn target_file_name(file_name: &str) -> String {
    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}

impl UpdateSession {
    pub fn new(
        transport: Arc<dyn DownloadTransport>,
        notifier: Arc<dyn NotificationSink>,
        records: LocalRecords,
        download_dir: &Path,
    ) -> Self {
        Self {
            transport,
            notifier,
            trust: TrustStore::new(records.clone()),
            records,
            download_dir: download_dir.to_path_buf(),
        }
    }

    pub fn records(&self) -> &LocalRecords {
        &self.records
    }

    /// Enqueue a download of `latest`, replacing any previous session.
    pub fn begin_download(&self, latest: &ArtifactRecord) -> Result<DownloadSession, SessionError> {
        self.records.clear_pending_install()?;
        self.records.clear_artifact_path()?;
        self.records.clear_verification()?;
        self.trust.clear_observation()?;

        fs::create_dir_all(&self.download_dir)?;
        let target_path = self.download_dir.join(target_file_name(&latest.file_name));
        for stale in [target_path.clone(), partial_path(&target_path)] {
            if stale.exists() {
                tracing::warn!(path = %stale.display(), "Removing colliding file");
                fs::remove_file(&stale)?;
            }
        }

        let handle = self.transport.enqueue(DownloadRequest {
            url: latest.artifact_url.clone(),
            target_path: target_path.clone(),
            title: format!("Downloading {}", latest.version_label),
        })?;

        let session = DownloadSession {
            session_id: handle,
            target_path,
            declared_url: latest.artifact_url.clone(),
            version_label: latest.version_label.clone(),
            created_at: Utc::now(),
        };
        self.records.set_session(&session)?;
        self.records
            .set_verification(&VerificationState::idle(&session.session_id))?;

        tracing::info!(
            session = %session.session_id,
            version = %session.version_label,
            target = %session.target_path.display(),
            "Download session started"
        );
        Ok(session)
    }

    /// Forget the current session. The pinned signer is kept.
    pub fn discard(&self) -> Result<(), StateError> {
        self.records.clear_session()?;
        self.records.clear_pending_install()?;
        self.records.clear_artifact_path()?;
        self.records.clear_verification()?;
        tracing::info!("Download session discarded");
        Ok(())
    }

    pub fn status(&self) -> Result<SessionStatus, StateError> {
        let session = self.records.session()?;
        let pending = self.records.pending_install()?;

        let current = |p: &PendingInstall| {
            session
                .as_ref()
                .is_some_and(|s| s.session_id == p.session_id)
        };
        let stale_pending_install = pending.as_ref().is_some_and(|p| !current(p));
        let ready_to_install = pending.filter(|p| current(p) && p.artifact_path.is_file());

        Ok(SessionStatus {
            transport: session
                .as_ref()
                .and_then(|s| self.transport.query(&s.session_id)),
            verification: self.records.verification()?,
            artifact_path: self.records.artifact_path()?,
            trust: self.trust.get()?,
            session,
            ready_to_install,
            stale_pending_install,
        })
    }

    /// Path the installer may be handed, if any
    pub fn installable(&self) -> Result<Option<PathBuf>, StateError> {
        Ok(self.status()?.ready_to_install.map(|p| p.artifact_path))
    }

    /// Turn a push payload into an "update available" notification.
    pub fn handle_push(&self, data: &BTreeMap<String, String>) -> Option<Notification> {
        let version = data.get("versionLabel").filter(|v| !v.trim().is_empty())?;
        let notification = Notification {
            kind: NotificationKind::UpdateAvailable,
            title: "Update available".to_string(),
            body: format!("Version {version} is available"),
        };
        if self.notifier.permitted() {
            self.notifier.post(&notification);
        } else {
            tracing::info!(version = %version, "Update available; notifications suppressed");
        }
        Some(notification)
    }
}
