//! Artifact Metadata Store
//!
//! Durable record of the current latest artifact plus the change detector
//! that decides how much work a refresh has to do. Hashing is the expensive
//! step and is gated strictly on a change of artifact URL.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::engine::database::{Database, DatabaseError};
use crate::engine::error::FetchError;
use crate::engine::hasher::ContentHasher;
use crate::engine::index::Candidate;

const LATEST_SLOT: &str = "latest";

/// The current latest artifact, as served from /latest.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub version_label: String,
    pub artifact_url: String,
    pub file_name: String,
    pub published_at: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
}

struct RawRecord {
    version_label: String,
    artifact_url: String,
    file_name: String,
    published_at: String,
    size_bytes: i64,
    content_hash: Option<String>,
    updated_at: String,
    last_checked_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            version_label: row.get(0)?,
            artifact_url: row.get(1)?,
            file_name: row.get(2)?,
            published_at: row.get(3)?,
            size_bytes: row.get(4)?,
            content_hash: row.get(5)?,
            updated_at: row.get(6)?,
            last_checked_at: row.get(7)?,
        })
    }
}

impl TryFrom<RawRecord> for ArtifactRecord {
    type Error = DatabaseError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            version_label: raw.version_label,
            artifact_url: raw.artifact_url,
            file_name: raw.file_name,
            published_at: parse_ts(&raw.published_at)?,
            size_bytes: u64::try_from(raw.size_bytes).map_err(|_| DatabaseError::CorruptRow {
                table: "artifact_meta",
                reason: format!("negative size {}", raw.size_bytes),
            })?,
            content_hash: raw.content_hash,
            updated_at: parse_ts(&raw.updated_at)?,
            last_checked_at: parse_ts(&raw.last_checked_at)?,
        })
    }
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DatabaseError::CorruptRow {
            table: "artifact_meta",
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

/// SQLite-backed store for the latest artifact record
#[derive(Clone)]
pub struct MetadataStore {
    db: Database,
}

impl MetadataStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_latest(&self) -> Result<Option<ArtifactRecord>, DatabaseError> {
        let conn = self.db.get_connection()?;
        let raw = conn
            .query_row(
                "SELECT version_label, artifact_url, file_name, published_at, size_bytes,
                        content_hash, updated_at, last_checked_at
                 FROM artifact_meta WHERE slot = ?1",
                params![LATEST_SLOT],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(ArtifactRecord::try_from).transpose()
    }

    /// Replace the whole record
    pub fn put_latest(&self, record: &ArtifactRecord) -> Result<(), DatabaseError> {
        let conn = self.db.get_connection()?;
        conn.execute(
            "INSERT INTO artifact_meta (slot, version_label, artifact_url, file_name, published_at,
                                        size_bytes, content_hash, updated_at, last_checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(slot) DO UPDATE SET
                version_label = excluded.version_label,
                artifact_url = excluded.artifact_url,
                file_name = excluded.file_name,
                published_at = excluded.published_at,
                size_bytes = excluded.size_bytes,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at,
                last_checked_at = excluded.last_checked_at",
            params![
                LATEST_SLOT,
                record.version_label,
                record.artifact_url,
                record.file_name,
                format_ts(&record.published_at),
                record.size_bytes as i64,
                record.content_hash,
                format_ts(&record.updated_at),
                format_ts(&record.last_checked_at),
            ],
        )?;
        Ok(())
    }

    /// Heartbeat: only `last_checked_at` moves
    pub fn touch_checked(&self, checked_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.db.get_connection()?;
        conn.execute(
            "UPDATE artifact_meta SET last_checked_at = ?1 WHERE slot = ?2",
            params![format_ts(&checked_at), LATEST_SLOT],
        )?;
        Ok(())
    }
}

/// What a candidate means for the stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangePlan {
    pub is_new_artifact: bool,
    pub needs_metadata_refresh: bool,
    pub needs_hash: bool,
}

impl ChangePlan {
    pub fn detect(candidate: &Candidate, current: Option<&ArtifactRecord>) -> Self {
        let Some(current) = current else {
            return Self {
                is_new_artifact: true,
                needs_metadata_refresh: true,
                needs_hash: true,
            };
        };

        let is_new_artifact = current.artifact_url != candidate.artifact_url;
        let needs_metadata_refresh = is_new_artifact
            || current.file_name != candidate.file_name
            || current.version_label != candidate.version_label
            || current.published_at != candidate.published_at
            || current.size_bytes != candidate.size_bytes;

        Self {
            is_new_artifact,
            needs_metadata_refresh,
            needs_hash: is_new_artifact || current.content_hash.is_none(),
        }
    }

    pub fn is_noop(&self) -> bool {
        !self.needs_metadata_refresh && !self.needs_hash
    }
}

/// Result of a reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing changed; only the heartbeat was written
    Unchanged(ArtifactRecord),
    /// Listing metadata moved but the artifact did not; hash reused
    MetadataRefreshed(ArtifactRecord),
    /// Same artifact URL, but the stored record had no hash yet
    HashBackfilled(ArtifactRecord),
    /// A different artifact was hashed and stored
    NewArtifact(ArtifactRecord),
}

impl ReconcileOutcome {
    pub fn record(&self) -> &ArtifactRecord {
        match self {
            Self::Unchanged(r)
            | Self::MetadataRefreshed(r)
            | Self::HashBackfilled(r)
            | Self::NewArtifact(r) => r,
        }
    }

    pub fn into_record(self) -> ArtifactRecord {
        match self {
            Self::Unchanged(r)
            | Self::MetadataRefreshed(r)
            | Self::HashBackfilled(r)
            | Self::NewArtifact(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::NewArtifact(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

/// Bring the stored record in line with `candidate`.
///
/// The store is written only after hashing succeeded, so a failed fetch
/// leaves the previous record untouched.
pub async fn reconcile(
    store: &MetadataStore,
    hasher: &dyn ContentHasher,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, ReconcileError> {
    let current = store.get_latest()?;
    let plan = ChangePlan::detect(candidate, current.as_ref());

    if plan.is_noop() {
        if let Some(mut current) = current {
            store.touch_checked(now)?;
            current.last_checked_at = now;
            tracing::debug!(url = %current.artifact_url, "Latest artifact unchanged");
            return Ok(ReconcileOutcome::Unchanged(current));
        }
    }

    let content_hash = if plan.needs_hash {
        tracing::info!(url = %candidate.artifact_url, "Hashing artifact");
        Some(hasher.hash_url(&candidate.artifact_url).await?)
    } else {
        current.as_ref().and_then(|c| c.content_hash.clone())
    };

    let record = ArtifactRecord {
        version_label: candidate.version_label.clone(),
        artifact_url: candidate.artifact_url.clone(),
        file_name: candidate.file_name.clone(),
        published_at: candidate.published_at,
        size_bytes: candidate.size_bytes,
        content_hash,
        updated_at: now,
        last_checked_at: now,
    };
    store.put_latest(&record)?;

    if plan.is_new_artifact {
        tracing::info!(version = %record.version_label, url = %record.artifact_url, "New artifact recorded");
        Ok(ReconcileOutcome::NewArtifact(record))
    } else if plan.needs_hash {
        tracing::info!(url = %record.artifact_url, "Backfilled missing content hash");
        Ok(ReconcileOutcome::HashBackfilled(record))
    } else {
        tracing::info!(version = %record.version_label, "Artifact metadata refreshed");
        Ok(ReconcileOutcome::MetadataRefreshed(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHasher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingHasher {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0), fail: false }
        }

        fn failing() -> Self {
            Self { calls: AtomicUsize::new(0), fail: true }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ContentHasher for CountingHasher {
        async fn hash_url(&self, url: &str) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::Status { url: url.to_string(), status: 503 });
            }
            Ok(format!("hash-of-{url}"))
        }
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn candidate(url: &str) -> Candidate {
        Candidate {
            version_label: "2.3.1".into(),
            artifact_url: url.into(),
            file_name: "App-2.3.1.apk".into(),
            published_at: ts(10),
            size_bytes: 1000,
        }
    }

    fn store() -> MetadataStore {
        MetadataStore::new(Database::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_first_sight_hashes_once() {
        let store = store();
        let hasher = CountingHasher::new();
        let outcome = reconcile(&store, &hasher, &candidate("https://x/a.apk"), ts(11)).await.unwrap();

        assert!(outcome.is_new());
        assert_eq!(hasher.calls(), 1);
        let stored = store.get_latest().unwrap().unwrap();
        assert_eq!(stored.content_hash.as_deref(), Some("hash-of-https://x/a.apk"));
        assert_eq!(stored.published_at, ts(10));
    }

    #[tokio::test]
    async fn test_reconcile_idempotent_only_touches_checked_at() {
        let store = store();
        let hasher = CountingHasher::new();
        let c = candidate("https://x/a.apk");
        reconcile(&store, &hasher, &c, ts(11)).await.unwrap();
        let before = store.get_latest().unwrap().unwrap();

        let outcome = reconcile(&store, &hasher, &c, ts(12)).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Unchanged(_)));
        assert_eq!(hasher.calls(), 1);

        let after = store.get_latest().unwrap().unwrap();
        assert_eq!(after.last_checked_at, ts(12));
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(
            ArtifactRecord { last_checked_at: before.last_checked_at, ..after.clone() },
            before
        );
        assert_eq!(outcome.record(), &after);
    }

    #[tokio::test]
    async fn test_url_change_triggers_exactly_one_hash() {
        let store = store();
        let hasher = CountingHasher::new();
        reconcile(&store, &hasher, &candidate("https://x/a.apk"), ts(11)).await.unwrap();

        let outcome = reconcile(&store, &hasher, &candidate("https://x/b.apk"), ts(12)).await.unwrap();
        assert!(outcome.is_new());
        assert_eq!(hasher.calls(), 2);
        assert_eq!(
            store.get_latest().unwrap().unwrap().content_hash.as_deref(),
            Some("hash-of-https://x/b.apk")
        );
    }

    #[tokio::test]
    async fn test_metadata_change_reuses_hash() {
        let store = store();
        let hasher = CountingHasher::new();
        reconcile(&store, &hasher, &candidate("https://x/a.apk"), ts(11)).await.unwrap();

        let mut moved = candidate("https://x/a.apk");
        moved.size_bytes = 2000;
        moved.published_at = ts(9);
        let outcome = reconcile(&store, &hasher, &moved, ts(12)).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::MetadataRefreshed(_)));
        assert_eq!(hasher.calls(), 1);
        let stored = store.get_latest().unwrap().unwrap();
        assert_eq!(stored.size_bytes, 2000);
        assert_eq!(stored.updated_at, ts(12));
        assert_eq!(stored.content_hash.as_deref(), Some("hash-of-https://x/a.apk"));
    }

    #[tokio::test]
    async fn test_missing_hash_is_backfilled() {
        let store = store();
        let c = candidate("https://x/a.apk");
        store
            .put_latest(&ArtifactRecord {
                version_label: c.version_label.clone(),
                artifact_url: c.artifact_url.clone(),
                file_name: c.file_name.clone(),
                published_at: c.published_at,
                size_bytes: c.size_bytes,
                content_hash: None,
                updated_at: ts(1),
                last_checked_at: ts(1),
            })
            .unwrap();

        let hasher = CountingHasher::new();
        let outcome = reconcile(&store, &hasher, &c, ts(2)).await.unwrap();
        assert_eq!(hasher.calls(), 1);
        assert!(matches!(outcome, ReconcileOutcome::HashBackfilled(_)));
        assert!(!outcome.is_new());
        assert!(outcome.record().content_hash.is_some());
    }

    #[tokio::test]
    async fn test_hash_failure_leaves_store_untouched() {
        let store = store();
        reconcile(&store, &CountingHasher::new(), &candidate("https://x/a.apk"), ts(11))
            .await
            .unwrap();
        let before = store.get_latest().unwrap().unwrap();

        let failing = CountingHasher::failing();
        let result = reconcile(&store, &failing, &candidate("https://x/b.apk"), ts(12)).await;
        assert!(matches!(result, Err(ReconcileError::Fetch(_))));
        assert_eq!(store.get_latest().unwrap().unwrap(), before);
    }

    #[test]
    fn test_change_plan_without_current() {
        let plan = ChangePlan::detect(&candidate("u"), None);
        assert!(plan.is_new_artifact && plan.needs_hash && plan.needs_metadata_refresh);
    }

    #[test]
    fn test_record_json_shape() {
        let record = ArtifactRecord {
            version_label: "1.0".into(),
            artifact_url: "https://x/App-1.0.apk".into(),
            file_name: "App-1.0.apk".into(),
            published_at: ts(10),
            size_bytes: 5,
            content_hash: Some("abc".into()),
            updated_at: ts(11),
            last_checked_at: ts(11),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["versionLabel"], "1.0");
        assert_eq!(json["artifactUrl"], "https://x/App-1.0.apk");
        assert_eq!(json["contentHash"], "abc");
        assert_eq!(json["publishedAt"], "2024-01-01T10:00:00Z");
    }
}
