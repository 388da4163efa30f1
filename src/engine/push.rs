//! Push Notifier / Dispatcher
//!
//! Fans a "new version" message out to every registered endpoint. Endpoints
//! the gateway reports as permanently invalid are pruned from the registry.
//! Dispatch never fails as a whole; per-endpoint failures are counted.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use utoipa::ToSchema;

use crate::engine::devices::{DeviceStore, MAX_ENDPOINTS};
use crate::engine::metadata::ArtifactRecord;

const MAX_IN_FLIGHT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl PushMessage {
    pub fn for_artifact(record: &ArtifactRecord) -> Self {
        let mut data = BTreeMap::new();
        data.insert("versionLabel".to_string(), record.version_label.clone());
        data.insert("artifactUrl".to_string(), record.artifact_url.clone());
        Self {
            title: "Update available".to_string(),
            body: format!("Version {} is ready to download", record.version_label),
            data,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Endpoint is no longer registered")]
    Unregistered,
    #[error("Endpoint token is invalid")]
    InvalidToken,
    #[error("Gateway rejected the request arguments: {0}")]
    InvalidArgument(String),
    #[error("Push transport error: {0}")]
    Transport(String),
    #[error("Gateway responded with {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl PushError {
    /// The endpoint will never accept a message again and should be removed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PushError::Unregistered | PushError::InvalidToken | PushError::InvalidArgument(_)
        )
    }

    /// Map a gateway error code onto the taxonomy
    pub fn from_code(code: &str, detail: &str) -> Option<Self> {
        match code {
            "registration-token-not-registered" | "messaging/registration-token-not-registered" => {
                Some(PushError::Unregistered)
            }
            "invalid-registration-token" | "messaging/invalid-registration-token" => {
                Some(PushError::InvalidToken)
            }
            "invalid-argument" | "messaging/invalid-argument" => {
                Some(PushError::InvalidArgument(detail.to_string()))
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, endpoint_token: &str, message: &PushMessage) -> Result<(), PushError>;
}

/// Posts each message as JSON to an HTTP push gateway
pub struct WebhookPushTransport {
    client: reqwest::Client,
    gateway_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    token: &'a str,
    notification: GatewayNotification<'a>,
    data: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct GatewayNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize, Default)]
struct GatewayErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl WebhookPushTransport {
    pub fn new(client: reqwest::Client, gateway_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            gateway_url: gateway_url.to_string(),
            api_key,
        }
    }

    fn classify(status: u16, body: &str) -> PushError {
        if status == 404 || status == 410 {
            return PushError::Unregistered;
        }
        let parsed: GatewayErrorBody = serde_json::from_str(body).unwrap_or_default();
        let detail = parsed.error.as_deref().unwrap_or(body);
        parsed
            .code
            .as_deref()
            .and_then(|code| PushError::from_code(code, detail))
            .unwrap_or_else(|| PushError::Rejected {
                status,
                body: body.to_string(),
            })
    }
}

#[async_trait]
impl PushTransport for WebhookPushTransport {
    async fn send(&self, endpoint_token: &str, message: &PushMessage) -> Result<(), PushError> {
        let payload = GatewayRequest {
            token: endpoint_token,
            notification: GatewayNotification {
                title: &message.title,
                body: &message.body,
            },
            data: &message.data,
        };

        let mut request = self.client.post(&self.gateway_url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status.as_u16(), &body))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Send `record` to every registered endpoint.
pub async fn dispatch(
    transport: &dyn PushTransport,
    devices: &DeviceStore,
    record: &ArtifactRecord,
) -> DispatchSummary {
    let registrations = match devices.list(MAX_ENDPOINTS) {
        Ok(list) => list,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read device registrations");
            return DispatchSummary::default();
        }
    };

    let message = PushMessage::for_artifact(record);
    let message = &message;

    let results: Vec<(String, Result<(), PushError>)> = stream::iter(registrations)
        .map(|registration| async move {
            let result = transport.send(&registration.endpoint_token, message).await;
            (registration.endpoint_token, result)
        })
        .buffer_unordered(MAX_IN_FLIGHT)
        .collect()
        .await;

    let mut summary = DispatchSummary {
        attempted: results.len(),
        ..Default::default()
    };

    for (token, result) in results {
        match result {
            Ok(()) => summary.succeeded += 1,
            Err(e) if e.is_permanent() => {
                summary.failed += 1;
                match devices.delete(&token) {
                    Ok(true) => summary.pruned += 1,
                    Ok(false) => {}
                    Err(db) => tracing::warn!(error = %db, "Failed to prune endpoint"),
                }
                tracing::info!(reason = %e, "Pruned invalid push endpoint");
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!(error = %e, "Push delivery failed");
            }
        }
    }

    tracing::info!(
        version = %record.version_label,
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        failed = summary.failed,
        pruned = summary.pruned,
        "Push dispatch complete"
    );
    summary
}
