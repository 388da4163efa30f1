//! Refresh Cycle
//!
//! Fetch the index listing, select the newest artifact, reconcile it against
//! the stored record and, when the artifact is new, fan out a push.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;
use utoipa::ToSchema;

use crate::engine::config::{ConfigError, ListingConfig, ServerConfig};
use crate::engine::database::{Database, DatabaseError};
use crate::engine::devices::DeviceStore;
use crate::engine::error::FetchError;
use crate::engine::hasher::{ContentHasher, HttpContentHasher};
use crate::engine::index::{parse_listing, select_latest};
use crate::engine::locks::{LockError, LockType, OperationLock};
use crate::engine::metadata::{reconcile, ArtifactRecord, MetadataStore, ReconcileError};
use crate::engine::push::{dispatch, DispatchSummary, PushTransport, WebhookPushTransport};

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Index fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("No artifact candidates found at {index_url}")]
    NoCandidates { index_url: String },
}

impl From<ReconcileError> for RefreshError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Fetch(e) => RefreshError::Fetch(e),
            ReconcileError::Store(e) => RefreshError::Store(e),
        }
    }
}

impl RefreshError {
    pub fn code(&self) -> &'static str {
        match self {
            RefreshError::Config(_) => "config",
            RefreshError::Fetch(_) => "fetch_failed",
            RefreshError::Store(_) => "store_failed",
            RefreshError::Lock(_) => "refresh_in_progress",
            RefreshError::NoCandidates { .. } => "no_candidates",
        }
    }

    /// Whether a later attempt can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RefreshError::Config(_))
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub is_new: bool,
    pub latest: ArtifactRecord,
    /// Present only when the artifact was new
    pub pushed: Option<DispatchSummary>,
}

pub struct Refresher {
    client: reqwest::Client,
    index_url: Option<String>,
    listing: ListingConfig,
    hasher: Arc<dyn ContentHasher>,
    push: Option<Arc<dyn PushTransport>>,
    metadata: MetadataStore,
    devices: DeviceStore,
    locks: OperationLock,
    running: Mutex<()>,
}

impl Refresher {
    pub fn new(db: Database, config: &ServerConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("updraft/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        let push = config.push_gateway_url.as_deref().map(|gateway| {
            Arc::new(WebhookPushTransport::new(
                client.clone(),
                gateway,
                config.push_gateway_key.clone(),
            )) as Arc<dyn PushTransport>
        });

        Self {
            hasher: Arc::new(HttpContentHasher::new(client.clone())),
            client,
            index_url: config.index_url.clone(),
            listing: config.listing.clone(),
            push,
            metadata: MetadataStore::new(db.clone()),
            devices: DeviceStore::new(db),
            locks: OperationLock::new(&config.lock_dir),
            running: Mutex::new(()),
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_push(mut self, push: Option<Arc<dyn PushTransport>>) -> Self {
        self.push = push;
        self
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn devices(&self) -> &DeviceStore {
        &self.devices
    }

    pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        let index_url = self
            .index_url
            .as_deref()
            .ok_or(ConfigError::Missing("INDEX_URL"))?;

        let _running = self.running.lock().await;
        let _lock = self.locks.acquire(LockType::Refresh)?;

        let base = Url::parse(index_url).map_err(|e| FetchError::InvalidUrl {
            url: index_url.to_string(),
            reason: e.to_string(),
        })?;
        let document = fetch_index(&self.client, &base).await?;

        let rows = parse_listing(&document, &self.listing);
        tracing::debug!(rows = rows.len(), "Parsed index listing");

        let candidate = select_latest(&rows, &base, &self.listing).ok_or_else(|| {
            RefreshError::NoCandidates {
                index_url: index_url.to_string(),
            }
        })?;

        let outcome = reconcile(&self.metadata, self.hasher.as_ref(), &candidate, Utc::now()).await?;
        let is_new = outcome.is_new();
        let latest = outcome.into_record();

        let pushed = if is_new {
            Some(match &self.push {
                Some(transport) => dispatch(transport.as_ref(), &self.devices, &latest).await,
                None => {
                    tracing::info!("No push gateway configured, skipping dispatch");
                    DispatchSummary::default()
                }
            })
        } else {
            None
        };

        Ok(RefreshOutcome {
            is_new,
            latest,
            pushed,
        })
    }
}

/// GET the listing document as text.
pub async fn fetch_index(client: &reqwest::Client, url: &Url) -> Result<String, FetchError> {
    let response = client.get(url.as_str()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    response.text().await.map_err(|e| FetchError::Body {
        url: url.to_string(),
        reason: e.to_string(),
    })
}
