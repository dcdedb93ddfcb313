//! Versioned remote blob endpoint.
//!
//! Blobs are addressed by key and carry an opaque ETag that changes on every
//! write. Reads can be made conditional with `If-None-Match`, writes with
//! `If-Match`.

mod http;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpBlobStore;
pub use memory::{Fault, MemoryBlobStore};

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Conflict: remote copy was modified")]
    Conflict,

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Request rejected: {status} - {message}")]
    Payload { status: u16, message: String },

    #[error("Network unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Worth retrying: transport failures, timeouts and 5xx responses
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport(_) | RemoteError::Timeout(_) | RemoteError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Payload {
                status: e.status().map(|s| s.as_u16()).unwrap_or(200),
                message: e.to_string(),
            }
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Metadata of a stored blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetadata {
    pub name: String,
    pub etag: String,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,
}

/// Result of a conditional metadata read
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataResponse {
    Found(RemoteMetadata),
    /// The ETag sent with `If-None-Match` still matches
    NotModified,
    /// Nothing stored under the key yet
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub body: Vec<u8>,
    pub etag: String,
    pub modified: Option<DateTime<Utc>>,
}

/// Response from a write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutResponse {
    pub etag: String,
    pub modified: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Metadata for `key`; `if_none_match` turns a match into `NotModified`
    async fn get_metadata(&self, key: &str, if_none_match: Option<&str>) -> Result<MetadataResponse>;

    /// Body and ETag, or `None` when nothing is stored
    async fn get(&self, key: &str) -> Result<Option<RemoteObject>>;

    /// Write `body`; with `expected_etag` the write fails with `Conflict`
    /// unless the stored ETag still matches
    async fn put(&self, key: &str, body: Vec<u8>, expected_etag: Option<&str>) -> Result<PutResponse>;

    /// Upload a new named blob
    async fn create(&self, name: &str, body: Vec<u8>) -> Result<PutResponse>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<RemoteMetadata>>;

    /// Copy the named blob over `target`
    async fn restore_named(&self, name: &str, target: &str) -> Result<PutResponse>;
}
