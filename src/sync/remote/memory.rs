use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    BlobStore, MetadataResponse, PutResponse, RemoteError, RemoteMetadata, RemoteObject, Result,
};

/// Failure to inject into the next requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection dropped before a response
    Transport,
    /// 503 from the server
    Unavailable,
    /// Rejected API key
    Unauthorized,
}

impl Fault {
    fn to_error(self) -> RemoteError {
        match self {
            Fault::Transport => RemoteError::Transport("connection reset by peer".to_string()),
            Fault::Unavailable => RemoteError::Server {
                status: 503,
                message: "service unavailable".to_string(),
            },
            Fault::Unauthorized => RemoteError::Unauthorized,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    body: Vec<u8>,
    etag: String,
    modified: DateTime<Utc>,
}

impl StoredBlob {
    fn metadata(&self, name: &str) -> RemoteMetadata {
        RemoteMetadata {
            name: name.to_string(),
            etag: self.etag.clone(),
            modified: self.modified,
            size: self.body.len() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    blobs: BTreeMap<String, StoredBlob>,
    version: u64,
    faults: VecDeque<Fault>,
    requests: usize,
    body_reads: usize,
}

impl State {
    fn begin(&mut self) -> Result<()> {
        self.requests += 1;
        match self.faults.pop_front() {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    fn write(&mut self, key: &str, body: Vec<u8>) -> PutResponse {
        self.version += 1;
        let blob = StoredBlob {
            body,
            etag: format!("v{}", self.version),
            modified: Utc::now(),
        };
        let response = PutResponse {
            etag: blob.etag.clone(),
            modified: blob.modified,
        };
        self.blobs.insert(key.to_string(), blob);
        response
    }
}

/// In-process versioned endpoint with the same conditional semantics as the
/// HTTP service, plus fault injection
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    state: Mutex<State>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` requests with `fault`
    pub fn fail_next(&self, count: usize, fault: Fault) {
        let mut state = self.lock();
        state.faults.extend(std::iter::repeat(fault).take(count));
    }

    /// Requests received, including failed ones
    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    /// Successful body downloads
    pub fn body_reads(&self) -> usize {
        self.lock().body_reads
    }

    pub fn etag_of(&self, key: &str) -> Option<String> {
        self.lock().blobs.get(key).map(|b| b.etag.clone())
    }

    pub fn body_of(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(key).map(|b| b.body.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().blobs.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_metadata(&self, key: &str, if_none_match: Option<&str>) -> Result<MetadataResponse> {
        let mut state = self.lock();
        state.begin()?;
        Ok(match state.blobs.get(key) {
            None => MetadataResponse::NotFound,
            Some(blob) if if_none_match == Some(blob.etag.as_str()) => MetadataResponse::NotModified,
            Some(blob) => MetadataResponse::Found(blob.metadata(key)),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteObject>> {
        let mut state = self.lock();
        state.begin()?;
        let object = state.blobs.get(key).map(|blob| RemoteObject {
            body: blob.body.clone(),
            etag: blob.etag.clone(),
            modified: Some(blob.modified),
        });
        if object.is_some() {
            state.body_reads += 1;
        }
        Ok(object)
    }

    async fn put(&self, key: &str, body: Vec<u8>, expected_etag: Option<&str>) -> Result<PutResponse> {
        let mut state = self.lock();
        state.begin()?;
        if let Some(expected) = expected_etag {
            let current = state.blobs.get(key).map(|b| b.etag.as_str());
            if current != Some(expected) {
                return Err(RemoteError::Conflict);
            }
        }
        Ok(state.write(key, body))
    }

    async fn create(&self, name: &str, body: Vec<u8>) -> Result<PutResponse> {
        let mut state = self.lock();
        state.begin()?;
        if state.blobs.contains_key(name) {
            return Err(RemoteError::Conflict);
        }
        Ok(state.write(name, body))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        state.begin()?;
        state.blobs.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RemoteMetadata>> {
        let mut state = self.lock();
        state.begin()?;
        Ok(state
            .blobs
            .iter()
            .map(|(name, blob)| blob.metadata(name))
            .collect())
    }

    async fn restore_named(&self, name: &str, target: &str) -> Result<PutResponse> {
        let mut state = self.lock();
        state.begin()?;
        let body = state
            .blobs
            .get(name)
            .map(|b| b.body.clone())
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))?;
        Ok(state.write(target, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_reads_and_writes() {
        let store = MemoryBlobStore::new();
        assert_eq!(
            store.get_metadata("k", None).await.unwrap(),
            MetadataResponse::NotFound
        );

        let first = store.put("k", b"one".to_vec(), None).await.unwrap();
        assert_eq!(
            store.get_metadata("k", Some(&first.etag)).await.unwrap(),
            MetadataResponse::NotModified
        );

        let second = store.put("k", b"two".to_vec(), Some(&first.etag)).await.unwrap();
        assert_ne!(first.etag, second.etag);

        let stale = store.put("k", b"three".to_vec(), Some(&first.etag)).await;
        assert!(matches!(stale, Err(RemoteError::Conflict)));
        assert_eq!(store.body_of("k").unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let store = MemoryBlobStore::new();
        store.fail_next(1, Fault::Unavailable);
        store.fail_next(1, Fault::Unauthorized);

        assert!(store.list().await.unwrap_err().is_transient());
        assert!(matches!(store.list().await, Err(RemoteError::Unauthorized)));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.request_count(), 3);
    }

    #[tokio::test]
    async fn test_restore_named_copies_over_target() {
        let store = MemoryBlobStore::new();
        store.put("main", b"current".to_vec(), None).await.unwrap();
        store.create("backup-1", b"older".to_vec()).await.unwrap();

        store.restore_named("backup-1", "main").await.unwrap();
        assert_eq!(store.body_of("main").unwrap(), b"older");

        let missing = store.restore_named("nope", "main").await;
        assert!(matches!(missing, Err(RemoteError::NotFound(_))));
    }
}
