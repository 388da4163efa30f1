//! HTTP Download Transport
//!
//! Reference implementation of the download capability. Each enqueued
//! download runs on its own task, streams into `<target>.partial` (resuming
//! with `Range` when a partial file exists) and is renamed into place once
//! complete. Terminal records can be journaled so another process can query
//! them later.

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::engine::updater::capabilities::{
    DownloadHandle, DownloadRequest, DownloadTransport, KeyValueStore, TransportError,
    TransportRecord, TransportStatus,
};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Sibling path the bytes stream into before the final rename
pub fn partial_path(target: &Path) -> PathBuf {
    let mut name: OsString = target.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Stream `url` into `dest`, resuming a previous partial download.
/// Returns the total byte count of the finished file.
pub async fn fetch_to<F>(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    mut on_progress: F,
) -> Result<u64, DownloadError>
where
    F: FnMut(u64, Option<u64>),
{
    let partial = partial_path(dest);
    if let Some(parent) = partial.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut start_byte = match fs::metadata(&partial) {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut response = send(client, url, start_byte).await?;
    if start_byte > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        tracing::warn!(url, offset = start_byte, "Server rejected resume offset, restarting");
        fs::remove_file(&partial)?;
        start_byte = 0;
        response = send(client, url, 0).await?;
    }
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::InvalidResponse(format!("HTTP {}", status.as_u16())));
    }

    let mut file: File = if start_byte > 0 && status == StatusCode::PARTIAL_CONTENT {
        tracing::debug!(url, offset = start_byte, "Resuming partial download");
        OpenOptions::new().append(true).open(&partial)?
    } else {
        // Server ignored the range; start over
        start_byte = 0;
        File::create(&partial)?
    };

    let total = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|len| len + start_byte);

    let mut downloaded = start_byte;
    on_progress(downloaded, total);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::Network(e.to_string()))?;
        file.write_all(&chunk)?;
        downloaded += chunk.len() as u64;
        on_progress(downloaded, total);
    }
    file.flush()?;
    drop(file);

    if let Some(expected) = total {
        if downloaded != expected {
            return Err(DownloadError::InvalidResponse(format!(
                "short body: {downloaded} of {expected} bytes"
            )));
        }
    }

    fs::rename(&partial, dest)?;
    Ok(downloaded)
}

async fn send(
    client: &reqwest::Client,
    url: &str,
    offset: u64,
) -> Result<reqwest::Response, DownloadError> {
    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }
    Ok(request.send().await?)
}

type RecordMap = Arc<Mutex<HashMap<DownloadHandle, TransportRecord>>>;

pub struct HttpDownloadTransport {
    client: reqwest::Client,
    records: RecordMap,
    journal: Option<Arc<dyn KeyValueStore>>,
}

impl HttpDownloadTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            records: Arc::new(Mutex::new(HashMap::new())),
            journal: None,
        }
    }

    /// Persist terminal records so they outlive this process
    pub fn with_journal(mut self, journal: Arc<dyn KeyValueStore>) -> Self {
        self.journal = Some(journal);
        self
    }

    fn journal_key(handle: &str) -> String {
        format!("transport:{handle}")
    }

    fn set(records: &RecordMap, handle: &str, record: TransportRecord) {
        if let Ok(mut map) = records.lock() {
            map.insert(handle.to_string(), record);
        }
    }

    fn update<F: FnOnce(&mut TransportRecord)>(records: &RecordMap, handle: &str, change: F) {
        if let Ok(mut map) = records.lock() {
            if let Some(record) = map.get_mut(handle) {
                change(record);
            }
        }
    }
}

impl Default for HttpDownloadTransport {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("updraft/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self::new(client)
    }
}

impl DownloadTransport for HttpDownloadTransport {
    fn enqueue(&self, request: DownloadRequest) -> Result<DownloadHandle, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Rejected(format!("no async runtime: {e}")))?;

        let handle: DownloadHandle = uuid::Uuid::new_v4().to_string();
        Self::set(
            &self.records,
            &handle,
            TransportRecord {
                status: TransportStatus::Pending,
                bytes_downloaded: 0,
                total_bytes: None,
                local_path: None,
                failure_reason: None,
            },
        );

        let client = self.client.clone();
        let records = Arc::clone(&self.records);
        let journal = self.journal.clone();
        let task_handle = handle.clone();
        tracing::info!(handle = %handle, url = %request.url, target = %request.target_path.display(), title = %request.title, "Download enqueued");

        runtime.spawn(async move {
            Self::update(&records, &task_handle, |r| r.status = TransportStatus::Running);

            let progress_records = Arc::clone(&records);
            let progress_handle = task_handle.clone();
            let result = fetch_to(&client, &request.url, &request.target_path, move |done, total| {
                Self::update(&progress_records, &progress_handle, |r| {
                    r.bytes_downloaded = done;
                    r.total_bytes = total;
                });
            })
            .await;

            match &result {
                Ok(bytes) => {
                    tracing::info!(handle = %task_handle, bytes, "Download finished");
                    Self::update(&records, &task_handle, |r| {
                        r.status = TransportStatus::Successful;
                        r.bytes_downloaded = *bytes;
                        r.local_path = Some(request.target_path.clone());
                    });
                }
                Err(e) => {
                    tracing::error!(handle = %task_handle, error = %e, "Download failed");
                    Self::update(&records, &task_handle, |r| {
                        r.status = TransportStatus::Failed;
                        r.failure_reason = Some(e.to_string());
                    });
                }
            }

            if let Some(journal) = journal {
                let record = records.lock().ok().and_then(|m| m.get(&task_handle).cloned());
                if let Some(record) = record {
                    let stored = serde_json::to_value(&record)
                        .map_err(|e| e.to_string())
                        .and_then(|v| {
                            journal
                                .put(&Self::journal_key(&task_handle), v)
                                .map_err(|e| e.to_string())
                        });
                    if let Err(e) = stored {
                        tracing::warn!(handle = %task_handle, error = %e, "Failed to journal download record");
                    }
                }
            }
        });

        Ok(handle)
    }

    fn query(&self, handle: &str) -> Option<TransportRecord> {
        let live = self
            .records
            .lock()
            .ok()
            .and_then(|map| map.get(handle).cloned());
        if live.is_some() {
            return live;
        }
        let journal = self.journal.as_ref()?;
        journal
            .get(&Self::journal_key(handle))
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}
