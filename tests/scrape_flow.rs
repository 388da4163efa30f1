mod common;

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use common::{server_config, spawn_app, ArtifactHost, CountingHasher};
use updraft_lib::engine::api::{create_router, AppState};
use updraft_lib::engine::{Database, Refresher};

const KEY: &str = "scrape-secret";

struct Backend {
    url: String,
    hasher: Arc<CountingHasher>,
    http: reqwest::Client,
    _locks: tempfile::TempDir,
}

impl Backend {
    async fn start(host: &ArtifactHost) -> Self {
        let locks = tempfile::tempdir().unwrap();
        let config = server_config(&host.index_url(), KEY, locks.path());
        let hasher = Arc::new(CountingHasher::new());
        let refresher = Refresher::new(Database::in_memory().unwrap(), &config)
            .with_hasher(hasher.clone());
        let url = spawn_app(create_router(AppState::new(refresher, KEY))).await;
        Self {
            url,
            hasher,
            http: reqwest::Client::new(),
            _locks: locks,
        }
    }

    async fn scrape(&self) -> (u16, Value) {
        let response = self
            .http
            .post(format!("{}/scrape", self.url))
            .bearer_auth(KEY)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn latest(&self) -> reqwest::Response {
        self.http
            .get(format!("{}/latest.json", self.url))
            .send()
            .await
            .unwrap()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[tokio::test]
async fn test_scrape_twice_hashes_once() {
    let host = ArtifactHost::start().await;
    let body = b"first build".to_vec();
    host.publish("App-1.0.apk", "01-Jan-2024 10:00", body.clone());
    host.publish("App-0.9.apk", "01-Dec-2023 09:00", b"older".to_vec());
    let backend = Backend::start(&host).await;

    assert_eq!(backend.latest().await.status().as_u16(), 404);

    let (status, first) = backend.scrape().await;
    assert_eq!(status, 200);
    assert_eq!(first["ok"], true);
    assert_eq!(first["isNew"], true);
    assert_eq!(first["latest"]["versionLabel"], "1.0");
    assert_eq!(first["latest"]["contentHash"], sha256_hex(&body));
    assert_eq!(first["pushed"]["attempted"], 0);
    assert_eq!(backend.hasher.calls(), 1);

    let (status, second) = backend.scrape().await;
    assert_eq!(status, 200);
    assert_eq!(second["isNew"], false);
    assert!(second["pushed"].is_null());
    assert_eq!(backend.hasher.calls(), 1);

    let latest = backend.latest().await;
    assert_eq!(latest.status().as_u16(), 200);
    assert_eq!(
        latest.headers().get("cache-control").unwrap().to_str().unwrap(),
        "no-store"
    );
    let record: Value = latest.json().await.unwrap();
    assert_eq!(record["artifactUrl"], host.file_url("App-1.0.apk"));
    assert_eq!(record["fileName"], "App-1.0.apk");
    assert_eq!(record["sizeBytes"], body.len() as u64);
}

#[tokio::test]
async fn test_newer_artifact_replaces_latest() {
    let host = ArtifactHost::start().await;
    host.publish("App-1.0.apk", "01-Jan-2024 10:00", b"one".to_vec());
    let backend = Backend::start(&host).await;
    backend.scrape().await;

    host.publish("App-1.1.apk", "02-Jan-2024 10:00", b"one point one".to_vec());
    let (status, body) = backend.scrape().await;
    assert_eq!(status, 200);
    assert_eq!(body["isNew"], true);
    assert_eq!(body["latest"]["versionLabel"], "1.1");
    assert_eq!(body["latest"]["contentHash"], sha256_hex(b"one point one"));
    assert_eq!(backend.hasher.calls(), 2);
}

#[tokio::test]
async fn test_scrape_failures_are_reported() {
    let host = ArtifactHost::start().await;
    let backend = Backend::start(&host).await;

    let (status, body) = backend.scrape().await;
    assert_eq!(status, 500);
    assert_eq!(body["code"], "no_candidates");
    assert_eq!(backend.hasher.calls(), 0);

    let unauthorized = backend
        .http
        .post(format!("{}/scrape", backend.url))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status().as_u16(), 401);

    // The server keeps serving after failures
    let health: Value = backend
        .http
        .get(format!("{}/health", backend.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["ok"], true);
}

#[tokio::test]
async fn test_register_token_then_scrape_prunes_nothing_without_gateway() {
    let host = ArtifactHost::start().await;
    host.publish("App-2.0.apk", "03-Mar-2024 08:30", b"two".to_vec());
    let backend = Backend::start(&host).await;

    let registered: Value = backend
        .http
        .post(format!("{}/registerToken", backend.url))
        .bearer_auth(KEY)
        .json(&serde_json::json!({ "token": "tok-1", "appVersion": "1.9", "platform": "android" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(registered["ok"], true);

    let missing = backend
        .http
        .post(format!("{}/registerToken", backend.url))
        .bearer_auth(KEY)
        .json(&serde_json::json!({ "appVersion": "1.9" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 400);

    let (_, body) = backend.scrape().await;
    assert_eq!(body["isNew"], true);
    assert_eq!(body["pushed"]["attempted"], 0);
    assert_eq!(body["pushed"]["pruned"], 0);
}
