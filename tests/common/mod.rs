//! Shared fixtures for integration tests
//!
//! - `ArtifactHost`: a local autoindex-style host serving a listing page and files
//! - `CountingHasher`: wraps the HTTP hasher and counts remote hashes
//! - zip builders and a recording notification sink

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use updraft_lib::engine::config::ServerConfig;
use updraft_lib::engine::error::FetchError;
use updraft_lib::engine::hasher::{ContentHasher, HttpContentHasher};
use updraft_lib::engine::updater::capabilities::{Notification, NotificationSink};

/// Bind an ephemeral port and serve `app` in the background.
pub async fn spawn_app(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[derive(Clone)]
struct Listed {
    date: String,
    size: u64,
}

#[derive(Clone, Default)]
struct HostState {
    rows: Arc<Mutex<BTreeMap<String, Listed>>>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

/// Serves `/apks/` as a listing and `/apks/{name}` as file bodies
pub struct ArtifactHost {
    pub base_url: String,
    state: HostState,
}

impl ArtifactHost {
    pub async fn start() -> Self {
        let state = HostState::default();
        let app = Router::new()
            .route("/apks/", get(listing))
            .route("/apks/{name}", get(file))
            .with_state(state.clone());
        Self {
            base_url: spawn_app(app).await,
            state,
        }
    }

    pub fn index_url(&self) -> String {
        format!("{}/apks/", self.base_url)
    }

    pub fn file_url(&self, name: &str) -> String {
        format!("{}/apks/{}", self.base_url, name)
    }

    /// List `name` with its real size and serve `bytes` for it.
    pub fn publish(&self, name: &str, date: &str, bytes: Vec<u8>) {
        self.state.rows.lock().unwrap().insert(
            name.to_string(),
            Listed {
                date: date.to_string(),
                size: bytes.len() as u64,
            },
        );
        self.replace_bytes(name, bytes);
    }

    /// Swap the served bytes without touching the listing row.
    pub fn replace_bytes(&self, name: &str, bytes: Vec<u8>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes);
    }
}

async fn listing(State(state): State<HostState>) -> Html<String> {
    let rows = state.rows.lock().unwrap().clone();
    let mut page = String::from(
        "<html><head><title>Index of /apks</title></head><body><h1>Index of /apks</h1><pre>\n\
         <a href=\"?C=N;O=D\">Name</a>                    Last modified      Size\n\
         <a href=\"../\">Parent Directory</a>                             -\n",
    );
    for (name, row) in rows {
        page.push_str(&format!(
            "<a href=\"{name}\">{name}</a>                 {}  {}\n",
            row.date, row.size
        ));
    }
    page.push_str("</pre></body></html>\n");
    Html(page)
}

async fn file(State(state): State<HostState>, AxumPath(name): AxumPath<String>) -> impl IntoResponse {
    match state.files.lock().unwrap().get(&name) {
        Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn server_config(index_url: &str, api_key: &str, lock_dir: &Path) -> ServerConfig {
    let lock_dir = lock_dir.display().to_string();
    let pairs: HashMap<&str, String> = [
        ("INDEX_URL", index_url.to_string()),
        ("API_KEY", api_key.to_string()),
        ("LOCK_DIR", lock_dir),
    ]
    .into_iter()
    .collect();
    ServerConfig::from_lookup(|key| pairs.get(key).cloned()).unwrap()
}

/// Real HTTP hashing, with a call counter
pub struct CountingHasher {
    inner: HttpContentHasher,
    calls: AtomicUsize,
}

impl CountingHasher {
    pub fn new() -> Self {
        Self {
            inner: HttpContentHasher::default(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentHasher for CountingHasher {
    async fn hash_url(&self, url: &str) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.hash_url(url).await
    }
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    for (name, content) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

#[derive(Default)]
pub struct RecordingSink {
    pub posted: Mutex<Vec<Notification>>,
}

impl NotificationSink for RecordingSink {
    fn permitted(&self) -> bool {
        true
    }

    fn post(&self, notification: &Notification) {
        self.posted.lock().unwrap().push(notification.clone());
    }
}
