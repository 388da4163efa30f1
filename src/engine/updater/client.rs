//! Backend client: latest record and push endpoint registration

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::engine::api::RegisterTokenRequest;
use crate::engine::config::ClientConfig;
use crate::engine::error::FetchError;
use crate::engine::metadata::ArtifactRecord;
use crate::engine::updater::capabilities::LatestSource;

#[derive(Clone)]
pub struct LatestClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl LatestClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, FetchError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized).map_err(|e| FetchError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("updraft/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, FetchError> {
        Self::new(&config.backend_base_url, &config.api_key)
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url.join(path).map_err(|e| FetchError::InvalidUrl {
            url: format!("{}{path}", self.base_url),
            reason: e.to_string(),
        })
    }

    /// `None` when the backend has not recorded any artifact yet
    pub async fn latest(&self) -> Result<Option<ArtifactRecord>, FetchError> {
        let url = self.endpoint("latest.json")?;
        let response = self.client.get(url.clone()).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await.map_err(|e| {
                FetchError::Body {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?)),
            status => Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    pub async fn register_token(&self, registration: &RegisterTokenRequest) -> Result<(), FetchError> {
        let url = self.endpoint("registerToken")?;
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&self.api_key)
            .json(registration)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        tracing::info!("Push endpoint registered with backend");
        Ok(())
    }
}

#[async_trait]
impl LatestSource for LatestClient {
    async fn fetch_latest(&self) -> Result<Option<ArtifactRecord>, FetchError> {
        self.latest().await
    }
}
