//! Trust Store
//!
//! Trust-on-first-use signer pinning. The first fingerprint ever observed
//! becomes trusted; a later different fingerprint is recorded as pending and
//! flagged, but never replaces the trusted one without explicit acceptance.

use serde::{Deserialize, Serialize};

use crate::engine::updater::state::{LocalRecords, StateError};

const KEY_TRUST: &str = "trust_record";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub trusted_signer_fingerprint: Option<String>,
    /// Fingerprint seen on the most recent verification
    pub pending_signer_fingerprint: Option<String>,
    /// Trusted fingerprint at the time of that verification
    pub previous_signer_fingerprint: Option<String>,
    pub signer_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TrustDecision {
    /// Nothing was trusted yet; the observed signer is now
    FirstUse { fingerprint: String },
    Trusted { fingerprint: String },
    /// Advisory: the signer differs from the pinned one
    Changed { trusted: String, observed: String },
}

#[derive(Clone)]
pub struct TrustStore {
    records: LocalRecords,
}

impl TrustStore {
    pub fn new(records: LocalRecords) -> Self {
        Self { records }
    }

    pub fn get(&self) -> Result<TrustRecord, StateError> {
        Ok(self.records.read(KEY_TRUST)?.unwrap_or_default())
    }

    fn put(&self, record: &TrustRecord) -> Result<(), StateError> {
        self.records.write(KEY_TRUST, record)
    }

    /// Apply the TOFU rule to a freshly extracted fingerprint.
    pub fn observe(&self, fingerprint: &str) -> Result<TrustDecision, StateError> {
        let observed = fingerprint.trim().to_ascii_lowercase();
        let mut record = self.get()?;

        let decision = match record.trusted_signer_fingerprint.clone() {
            None => {
                record.trusted_signer_fingerprint = Some(observed.clone());
                tracing::warn!(fingerprint = %observed, "Trusting signer on first use");
                TrustDecision::FirstUse {
                    fingerprint: observed.clone(),
                }
            }
            Some(trusted) if trusted == observed => TrustDecision::Trusted {
                fingerprint: observed.clone(),
            },
            Some(trusted) => {
                tracing::warn!(trusted = %trusted, observed = %observed, "Signer changed");
                TrustDecision::Changed {
                    trusted,
                    observed: observed.clone(),
                }
            }
        };

        record.previous_signer_fingerprint = match &decision {
            TrustDecision::FirstUse { .. } => None,
            TrustDecision::Trusted { fingerprint } => Some(fingerprint.clone()),
            TrustDecision::Changed { trusted, .. } => Some(trusted.clone()),
        };
        record.signer_changed = matches!(decision, TrustDecision::Changed { .. });
        record.pending_signer_fingerprint = Some(observed);
        self.put(&record)?;
        Ok(decision)
    }

    /// Promote the pending fingerprint after the user accepted a signer change.
    /// Returns the newly trusted fingerprint, or `None` if no change was pending.
    pub fn accept_pending(&self) -> Result<Option<String>, StateError> {
        let mut record = self.get()?;
        if !record.signer_changed {
            return Ok(None);
        }
        let Some(pending) = record.pending_signer_fingerprint.clone() else {
            return Ok(None);
        };
        record.previous_signer_fingerprint = record.trusted_signer_fingerprint.take();
        record.trusted_signer_fingerprint = Some(pending.clone());
        record.signer_changed = false;
        self.put(&record)?;
        tracing::info!(fingerprint = %pending, "Accepted new signer");
        Ok(Some(pending))
    }

    /// Forget the per-download observation, keeping the pinned signer.
    pub fn clear_observation(&self) -> Result<(), StateError> {
        let mut record = self.get()?;
        record.pending_signer_fingerprint = None;
        record.previous_signer_fingerprint = None;
        record.signer_changed = false;
        self.put(&record)
    }

    /// Forget everything; the next observed signer is trusted on first use.
    pub fn reset(&self) -> Result<(), StateError> {
        self.records.kv().remove(KEY_TRUST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::kv::MemoryStore;
    use std::sync::Arc;

    fn store() -> TrustStore {
        TrustStore::new(LocalRecords::new(Arc::new(MemoryStore::new())))
    }

    #[test]
    fn test_first_use_then_trusted() {
        let trust = store();
        assert_eq!(
            trust.observe("AA").unwrap(),
            TrustDecision::FirstUse {
                fingerprint: "aa".to_string()
            }
        );
        assert_eq!(
            trust.observe("aa").unwrap(),
            TrustDecision::Trusted {
                fingerprint: "aa".to_string()
            }
        );
        let record = trust.get().unwrap();
        assert_eq!(record.trusted_signer_fingerprint.as_deref(), Some("aa"));
        assert!(!record.signer_changed);
    }

    #[test]
    fn test_change_never_overwrites_trusted() {
        let trust = store();
        trust.observe("aa").unwrap();
        let decision = trust.observe("bb").unwrap();
        assert_eq!(
            decision,
            TrustDecision::Changed {
                trusted: "aa".to_string(),
                observed: "bb".to_string()
            }
        );

        let record = trust.get().unwrap();
        assert_eq!(record.trusted_signer_fingerprint.as_deref(), Some("aa"));
        assert_eq!(record.pending_signer_fingerprint.as_deref(), Some("bb"));
        assert_eq!(record.previous_signer_fingerprint.as_deref(), Some("aa"));
        assert!(record.signer_changed);

        // Repeated observation of the new signer stays flagged
        assert!(matches!(
            trust.observe("bb").unwrap(),
            TrustDecision::Changed { .. }
        ));
    }

    #[test]
    fn test_accept_pending_promotes() {
        let trust = store();
        assert_eq!(trust.accept_pending().unwrap(), None);

        trust.observe("aa").unwrap();
        trust.observe("bb").unwrap();
        assert_eq!(trust.accept_pending().unwrap(), Some("bb".to_string()));

        let record = trust.get().unwrap();
        assert_eq!(record.trusted_signer_fingerprint.as_deref(), Some("bb"));
        assert_eq!(record.previous_signer_fingerprint.as_deref(), Some("aa"));
        assert!(matches!(
            trust.observe("bb").unwrap(),
            TrustDecision::Trusted { .. }
        ));
    }

    #[test]
    fn test_clear_observation_and_reset() {
        let trust = store();
        trust.observe("aa").unwrap();
        trust.observe("bb").unwrap();

        trust.clear_observation().unwrap();
        let record = trust.get().unwrap();
        assert_eq!(record.trusted_signer_fingerprint.as_deref(), Some("aa"));
        assert!(record.pending_signer_fingerprint.is_none());
        assert!(!record.signer_changed);

        trust.reset().unwrap();
        assert_eq!(trust.get().unwrap(), TrustRecord::default());
    }
}
