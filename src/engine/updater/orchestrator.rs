//! Client Update Orchestrator
//!
//! One verification attempt for a download handle:
//!
//! ```text
//! STARTED -> WAITING_TRANSPORT (retry) -> HASHING -> HASH_OK -> IDENTITY_CHECK
//!         -> TRUSTED_OK | TRUST_CHANGED
//!   failures: HASH_FAILED | IDENTITY_FAILED | TERMINAL_FAILURE
//! ```
//!
//! An attempt either asks to be retried after a delay or finishes with a
//! verdict. Only an approved verdict writes the pending-install marker.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::engine::error::{IdentityError, IntegrityError, TransportInconsistency};
use crate::engine::hasher::{digests_match, hash_file, normalize_digest};
use crate::engine::updater::backoff::BackoffPolicy;
use crate::engine::updater::capabilities::{
    DownloadTransport, LatestSource, Notification, NotificationKind, NotificationSink,
    SignerInspector, TransportRecord, TransportStatus,
};
use crate::engine::updater::state::{
    LocalRecords, PendingInstall, StateError, VerificationGuard, VerifyPhase,
};
use crate::engine::updater::trust::{TrustDecision, TrustStore};

/// Why a verification run ended without approval
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("Download failed: {0}")]
    TransportFailed(String),
    #[error(transparent)]
    #[serde(serialize_with = "serialize_display")]
    FileMissing(#[from] TransportInconsistency),
    #[error("Backend did not provide an expected digest")]
    MissingExpectedDigest,
    #[error("Could not hash downloaded artifact: {0}")]
    HashUnreadable(String),
    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("Publisher identity could not be verified: {0}")]
    IdentityUnverified(String),
    #[error("Local state error: {0}")]
    LocalState(String),
}

fn serialize_display<S: serde::Serializer>(
    value: &TransportInconsistency,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl FailureReason {
    /// Short machine-readable reason
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::TransportFailed(_) => "transport_failed",
            FailureReason::FileMissing(_) => "file_missing",
            FailureReason::MissingExpectedDigest => "missing_expected_digest",
            FailureReason::HashUnreadable(_) => "hash_unreadable",
            FailureReason::IntegrityMismatch { .. } => "integrity_mismatch",
            FailureReason::IdentityUnverified(_) => "identity_unverified",
            FailureReason::LocalState(_) => "local_state",
        }
    }

    fn phase(&self) -> VerifyPhase {
        match self {
            FailureReason::MissingExpectedDigest
            | FailureReason::HashUnreadable(_)
            | FailureReason::IntegrityMismatch { .. } => VerifyPhase::HashFailed,
            FailureReason::IdentityUnverified(_) => VerifyPhase::IdentityFailed,
            _ => VerifyPhase::TerminalFailure,
        }
    }
}

impl From<StateError> for FailureReason {
    fn from(e: StateError) -> Self {
        FailureReason::LocalState(e.to_string())
    }
}

impl From<IntegrityError> for FailureReason {
    fn from(e: IntegrityError) -> Self {
        match e {
            IntegrityError::Mismatch { expected, actual } => {
                FailureReason::IntegrityMismatch { expected, actual }
            }
            IntegrityError::MissingExpected => FailureReason::MissingExpectedDigest,
            IntegrityError::Unreadable { .. } => FailureReason::HashUnreadable(e.to_string()),
        }
    }
}

impl From<IdentityError> for FailureReason {
    fn from(e: IdentityError) -> Self {
        FailureReason::IdentityUnverified(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signer", rename_all = "snake_case")]
pub enum SignerVerdict {
    Trusted { fingerprint: String, first_use: bool },
    /// Approved, with an advisory that the publisher key changed
    Changed { trusted: String, observed: String },
}

impl From<TrustDecision> for SignerVerdict {
    fn from(decision: TrustDecision) -> Self {
        match decision {
            TrustDecision::FirstUse { fingerprint } => SignerVerdict::Trusted {
                fingerprint,
                first_use: true,
            },
            TrustDecision::Trusted { fingerprint } => SignerVerdict::Trusted {
                fingerprint,
                first_use: false,
            },
            TrustDecision::Changed { trusted, observed } => {
                SignerVerdict::Changed { trusted, observed }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Approved {
        artifact_path: PathBuf,
        signer: SignerVerdict,
    },
    Failed { reason: FailureReason },
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Transport not done yet; try again as `attempt` after `delay`
    Retry { attempt: u32, delay: Duration },
    Finished(Verdict),
}

pub struct Orchestrator {
    transport: Arc<dyn DownloadTransport>,
    latest: Arc<dyn LatestSource>,
    inspector: Arc<dyn SignerInspector>,
    notifier: Arc<dyn NotificationSink>,
    records: LocalRecords,
    trust: TrustStore,
    backoff: BackoffPolicy,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn DownloadTransport>,
        latest: Arc<dyn LatestSource>,
        inspector: Arc<dyn SignerInspector>,
        notifier: Arc<dyn NotificationSink>,
        records: LocalRecords,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            latest,
            inspector,
            notifier,
            trust: TrustStore::new(records.clone()),
            records,
            backoff,
        }
    }

    pub fn records(&self) -> &LocalRecords {
        &self.records
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    /// Run one attempt for `handle`. `attempt` counts from zero.
    pub async fn run_attempt(&self, handle: &str, attempt: u32) -> AttemptOutcome {
        tracing::debug!(handle, attempt, "Verification attempt start");

        let guard = match VerificationGuard::begin(&self.records, handle, attempt) {
            Ok(guard) => guard,
            Err(e) => return AttemptOutcome::Finished(self.fail(None, handle, e.into())),
        };

        let record = match self.transport.query(handle) {
            None => {
                tracing::warn!(handle, "Transport has no record yet; retrying");
                return self.retry(&guard, attempt);
            }
            Some(record) => record,
        };

        match record.status {
            TransportStatus::Pending | TransportStatus::Running | TransportStatus::Paused => {
                tracing::debug!(handle, status = ?record.status, bytes = record.bytes_downloaded, "Download in progress; retrying");
                self.retry(&guard, attempt)
            }
            TransportStatus::Failed => {
                let reason = record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                tracing::error!(handle, reason = %reason, "Download failed");
                AttemptOutcome::Finished(self.fail(
                    Some(&guard),
                    handle,
                    FailureReason::TransportFailed(reason),
                ))
            }
            TransportStatus::Successful => {
                let verdict = match self.verify_download(&guard, handle, &record).await {
                    Ok(verdict) => verdict,
                    Err(reason) => self.fail(Some(&guard), handle, reason),
                };
                AttemptOutcome::Finished(verdict)
            }
        }
    }

    fn retry(&self, guard: &VerificationGuard, attempt: u32) -> AttemptOutcome {
        if let Err(e) = guard.phase(VerifyPhase::WaitingTransport) {
            tracing::warn!(error = %e, "Failed to record waiting phase");
        }
        AttemptOutcome::Retry {
            attempt: attempt.saturating_add(1),
            delay: self.backoff.delay(attempt),
        }
    }

    async fn verify_download(
        &self,
        guard: &VerificationGuard,
        handle: &str,
        record: &TransportRecord,
    ) -> Result<Verdict, FailureReason> {
        let artifact_path = self.resolve_local_file(record)?;
        tracing::info!(handle, path = %artifact_path.display(), "Download complete");

        // Persisted before verification so presentation can find the file
        self.records.set_artifact_path(&artifact_path)?;

        guard.phase(VerifyPhase::Hashing)?;
        let expected = self.expected_digest().await?;
        let actual = hash_local(&artifact_path).await?;
        tracing::debug!(expected = %expected, actual = %actual, "Comparing digests");
        if !digests_match(&expected, &actual) {
            return Err(IntegrityError::Mismatch { expected, actual }.into());
        }

        guard.phase(VerifyPhase::IdentityCheck)?;
        let fingerprint = self.signer_fingerprint(&artifact_path).await?;
        let signer = SignerVerdict::from(self.trust.observe(&fingerprint)?);

        self.records.set_pending_install(&PendingInstall {
            artifact_path: artifact_path.clone(),
            session_id: handle.to_string(),
            approved_at: Utc::now(),
        })?;

        let (phase, outcome) = match &signer {
            SignerVerdict::Trusted { .. } => (VerifyPhase::TrustedOk, "approved"),
            SignerVerdict::Changed { .. } => (VerifyPhase::TrustChanged, "approved_signer_changed"),
        };
        guard.finish(phase, outcome)?;
        tracing::info!(handle, outcome, "Verification passed");

        self.notify_approved(&artifact_path, &signer);
        Ok(Verdict::Approved {
            artifact_path,
            signer,
        })
    }

    fn resolve_local_file(&self, record: &TransportRecord) -> Result<PathBuf, TransportInconsistency> {
        match &record.local_path {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(TransportInconsistency { path: path.clone() }),
            None => Err(TransportInconsistency {
                path: PathBuf::new(),
            }),
        }
    }

    async fn expected_digest(&self) -> Result<String, IntegrityError> {
        match self.latest.fetch_latest().await {
            Ok(Some(latest)) => latest
                .content_hash
                .as_deref()
                .map(normalize_digest)
                .filter(|d| !d.is_empty())
                .ok_or(IntegrityError::MissingExpected),
            Ok(None) => Err(IntegrityError::MissingExpected),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch expected digest");
                Err(IntegrityError::MissingExpected)
            }
        }
    }

    async fn signer_fingerprint(&self, path: &Path) -> Result<String, IdentityError> {
        let inspector = Arc::clone(&self.inspector);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || inspector.signer_fingerprint(&path))
            .await
            .map_err(|e| IdentityError::Malformed(format!("inspection task failed: {e}")))?
    }

    fn fail(&self, guard: Option<&VerificationGuard>, handle: &str, reason: FailureReason) -> Verdict {
        tracing::error!(handle, code = reason.code(), error = %reason, "Verification failed");
        if let Some(guard) = guard {
            if let Err(e) = guard.finish(reason.phase(), reason.code()) {
                tracing::warn!(error = %e, "Failed to record verification outcome");
            }
        }
        self.notify(Notification {
            kind: NotificationKind::VerificationFailed,
            title: "Update verification failed".to_string(),
            body: format!("The downloaded update was rejected ({})", reason.code()),
        });
        Verdict::Failed { reason }
    }

    fn notify_approved(&self, artifact_path: &Path, signer: &SignerVerdict) {
        if let SignerVerdict::Changed { observed, .. } = signer {
            self.notify(Notification {
                kind: NotificationKind::SignerChanged,
                title: "Publisher key changed".to_string(),
                body: format!("The update is signed by a new key ({observed}). Review before installing."),
            });
        }
        self.notify(Notification {
            kind: NotificationKind::ReadyToInstall,
            title: "Verified update ready".to_string(),
            body: format!("{} is ready to install", artifact_path.display()),
        });
    }

    fn notify(&self, notification: Notification) {
        if self.notifier.permitted() {
            self.notifier.post(&notification);
        } else {
            tracing::info!(kind = ?notification.kind, "Notifications not permitted; suppressed");
        }
    }
}

async fn hash_local(path: &Path) -> Result<String, IntegrityError> {
    let path = path.to_path_buf();
    let display = path.clone();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| IntegrityError::Unreadable {
            path: display,
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?
}
