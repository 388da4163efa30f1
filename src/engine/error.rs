//! Updraft Error Taxonomy
//! Transport, parsing, integrity and identity failures shared by server and client

use std::path::PathBuf;
use thiserror::Error;

/// Network or transport failure while fetching a remote resource
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("Unreadable response body from {url}: {reason}")]
    Body { url: String, reason: String },
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// A single malformed listing row. Always absorbed by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid size field: {0}")]
    Size(String),
    #[error("Invalid date field: {0}")]
    Date(String),
    #[error("Unresolvable href: {0}")]
    Href(String),
}

/// Content hash verification failure
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
    #[error("Missing expected digest")]
    MissingExpected,
    #[error("Failed to hash {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Signer attribution could not be established
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Artifact is not a readable archive: {0}")]
    NotAnArchive(String),
    #[error("Artifact carries no signing metadata")]
    MissingSignature,
    #[error("Malformed signing metadata: {0}")]
    Malformed(String),
    #[error("Signature does not match artifact contents")]
    BadSignature,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The transport reported success but the file is not where it said
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transport reported success but {} is missing", path.display())]
pub struct TransportInconsistency {
    pub path: PathBuf,
}
