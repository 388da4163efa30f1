//! Content Hashing
//!
//! SHA-256 digests of artifacts, computed by streaming the bytes once.
//! Neither the remote nor the local path ever holds the whole artifact in memory.

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::engine::error::{FetchError, IntegrityError};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Produces the content hash for an artifact URL
#[async_trait]
pub trait ContentHasher: Send + Sync {
    async fn hash_url(&self, url: &str) -> Result<String, FetchError>;
}

/// Streams the artifact over HTTP
#[derive(Clone)]
pub struct HttpContentHasher {
    client: reqwest::Client,
}

impl HttpContentHasher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpContentHasher {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("updraft/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl ContentHasher for HttpContentHasher {
    async fn hash_url(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Body {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            total += chunk.len() as u64;
            hasher.update(&chunk);
        }

        let digest = hex::encode(hasher.finalize());
        tracing::info!(url, bytes = total, digest = %digest, "Hashed remote artifact");
        Ok(digest)
    }
}

/// Digest everything a reader yields.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest a local file end to end.
pub fn hash_file(path: &Path) -> Result<String, IntegrityError> {
    let unreadable = |source| IntegrityError::Unreadable {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(unreadable)?;
    hash_reader(BufReader::new(file)).map_err(unreadable)
}

/// Compare digests the way the listing and the client both spell them.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    normalize_digest(expected) == normalize_digest(actual)
}

pub fn normalize_digest(digest: &str) -> String {
    digest.trim().replace(':', "").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_hash_reader_known_vector() {
        assert_eq!(hash_reader(&b"hello world"[..]).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn test_hash_file_is_deterministic() {
        let mut file = NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..3 * CHUNK_SIZE + 17).map(|i| (i % 251) as u8).collect();
        file.write_all(&payload).unwrap();
        file.flush().unwrap();

        let first = hash_file(file.path()).unwrap();
        let second = hash_file(file.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, hex::encode(Sha256::digest(&payload)));
    }

    #[test]
    fn test_hash_file_missing() {
        let result = hash_file(Path::new("/definitely/not/here.apk"));
        assert!(matches!(result, Err(IntegrityError::Unreadable { .. })));
    }

    #[test]
    fn test_digest_comparison_is_lenient_on_case() {
        assert!(digests_match(&HELLO_WORLD.to_uppercase(), HELLO_WORLD));
        assert!(digests_match(" AB:CD ", "abcd"));
        assert!(!digests_match("abcd", "abce"));
    }
}
