//! Remote sync client: retrying, ETag-tracking access to the sync blob.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::error::{Result, SyncError};
use super::remote::{BlobStore, MetadataResponse, PutResponse, RemoteMetadata, RemoteObject};
use super::retry::{with_retry, RetryPolicy};
use super::session::SyncSession;
use crate::storage::{parse_backup, FullBackupData};

/// Snapshot read from the remote together with its version
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSnapshot {
    pub data: FullBackupData,
    pub etag: String,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RemoteSyncClient {
    store: Arc<dyn BlobStore>,
    key: String,
    retry: RetryPolicy,
}

impl RemoteSyncClient {
    pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            key: key.into(),
            retry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Conditional metadata read.
    ///
    /// Unless `force` is set the ETag of the last sync point is sent as
    /// `If-None-Match`, so a remote unchanged since then costs no body
    /// transfer.
    ///
    /// A `Found` answer leaves the cached ETag alone: only a download or a
    /// write moves the version that later pushes are conditioned on.
    pub async fn metadata(&self, session: &SyncSession, force: bool) -> Result<MetadataResponse> {
        let cached = if force { None } else { session.synced_etag() };
        let response = with_retry(&self.retry, "metadata", || {
            self.store.get_metadata(&self.key, cached.as_deref())
        })
        .await?;

        match &response {
            MetadataResponse::Found(meta) => {
                log::debug!("Remote: {} is at {} ({} bytes)", self.key, meta.etag, meta.size);
            }
            MetadataResponse::NotModified => log::debug!("Remote: {} not modified", self.key),
            MetadataResponse::NotFound => {
                log::debug!("Remote: nothing stored under {}", self.key);
                session.set_etag(None);
            }
        }
        Ok(response)
    }

    /// Raw sync blob, `None` if nothing has been pushed yet
    pub async fn download(&self, session: &SyncSession) -> Result<Option<RemoteObject>> {
        let object = with_retry(&self.retry, "get", || self.store.get(&self.key)).await?;
        session.set_etag(object.as_ref().map(|o| o.etag.clone()));
        Ok(object)
    }

    /// Download and parse the sync blob
    pub async fn fetch(&self, session: &SyncSession) -> Result<Option<FetchedSnapshot>> {
        let Some(object) = self.download(session).await? else {
            return Ok(None);
        };

        let data = parse_backup(&object.body)?;
        log::info!(
            "Remote: fetched {} ({} decks, {} reviews)",
            object.etag,
            data.decks.len(),
            data.reviews.len()
        );
        Ok(Some(FetchedSnapshot {
            data,
            etag: object.etag,
            modified: object.modified,
        }))
    }

    /// Upload `data`, guarded by the cached ETag unless `force` is set
    pub async fn push(&self, session: &SyncSession, data: &FullBackupData, force: bool) -> Result<PutResponse> {
        let body = data.to_json()?;
        let expected = if force { None } else { session.etag() };
        let response = with_retry(&self.retry, "put", || {
            self.store.put(&self.key, body.clone(), expected.as_deref())
        })
        .await?;

        log::info!(
            "Remote: pushed {} bytes to {} (now {})",
            body.len(),
            self.key,
            response.etag
        );
        session.set_etag(Some(response.etag.clone()));
        Ok(response)
    }

    /// Store `body` as a new named blob next to the sync blob
    pub async fn save_named_copy(&self, name: &str, body: Vec<u8>) -> Result<PutResponse> {
        let response = with_retry(&self.retry, "create", || self.store.create(name, body.clone())).await?;
        log::info!("Remote: saved copy {}", name);
        Ok(response)
    }

    pub async fn list(&self) -> Result<Vec<RemoteMetadata>> {
        Ok(with_retry(&self.retry, "list", || self.store.list()).await?)
    }

    /// Remove a named blob; the sync blob itself is never deleted here
    pub async fn delete_named(&self, name: &str) -> Result<()> {
        if name == self.key {
            return Err(SyncError::LiveBlob(name.to_string()));
        }
        with_retry(&self.retry, "delete", || self.store.delete(name)).await?;
        log::info!("Remote: deleted {}", name);
        Ok(())
    }

    /// Copy a named backup over the sync blob
    pub async fn restore_named(&self, session: &SyncSession, name: &str) -> Result<PutResponse> {
        let response = with_retry(&self.retry, "restore", || {
            self.store.restore_named(name, &self.key)
        })
        .await?;
        session.set_etag(Some(response.etag.clone()));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::remote::{Fault, MemoryBlobStore};
    use crate::sync::remote::RemoteError;
    use std::time::Duration;

    fn client(store: Arc<MemoryBlobStore>) -> RemoteSyncClient {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(1),
        };
        RemoteSyncClient::new(store, "mnemo-sync.json", retry)
    }

    #[tokio::test]
    async fn test_not_modified_skips_body() {
        let store = Arc::new(MemoryBlobStore::new());
        let client = client(store.clone());
        let session = SyncSession::default();

        client.push(&session, &FullBackupData::default(), false).await.unwrap();
        session.mark_synced(chrono::Utc::now(), None);
        let etag = session.etag().unwrap();

        let response = client.metadata(&session, false).await.unwrap();
        assert_eq!(response, MetadataResponse::NotModified);
        assert_eq!(store.body_reads(), 0);
        assert_eq!(session.etag(), Some(etag));
    }

    #[tokio::test]
    async fn test_metadata_read_keeps_push_guard() {
        let store = Arc::new(MemoryBlobStore::new());
        let client = client(store.clone());
        let ours = SyncSession::default();
        let theirs = SyncSession::default();

        client.push(&ours, &FullBackupData::default(), false).await.unwrap();
        ours.mark_synced(chrono::Utc::now(), None);
        let ours_etag = ours.etag();
        client.fetch(&theirs).await.unwrap();
        client.push(&theirs, &FullBackupData::default(), false).await.unwrap();

        match client.metadata(&ours, false).await.unwrap() {
            MetadataResponse::Found(meta) => assert_eq!(Some(meta.etag), theirs.etag()),
            other => panic!("expected metadata, got {:?}", other),
        }
        assert_eq!(ours.etag(), ours_etag);

        let err = client
            .push(&ours, &FullBackupData::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Conflict)));
    }

    #[tokio::test]
    async fn test_missing_blob_clears_cached_etag() {
        let store = Arc::new(MemoryBlobStore::new());
        let client = client(store);
        let session = SyncSession::default();
        session.set_etag(Some("v42".to_string()));

        assert_eq!(
            client.metadata(&session, false).await.unwrap(),
            MetadataResponse::NotFound
        );
        assert!(session.etag().is_none());
        assert!(client.fetch(&session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_etag_push_conflicts() {
        let store = Arc::new(MemoryBlobStore::new());
        let client = client(store.clone());
        let ours = SyncSession::default();
        let theirs = SyncSession::default();

        client.push(&ours, &FullBackupData::default(), false).await.unwrap();
        client.fetch(&theirs).await.unwrap();
        client.push(&theirs, &FullBackupData::default(), false).await.unwrap();

        let err = client
            .push(&ours, &FullBackupData::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Conflict)));
        // The failed write must not move the cached ETag
        assert_ne!(ours.etag(), theirs.etag());

        client.push(&ours, &FullBackupData::default(), true).await.unwrap();
        assert_eq!(ours.etag(), store.etag_of("mnemo-sync.json"));
    }

    #[tokio::test]
    async fn test_transient_faults_are_retried() {
        let store = Arc::new(MemoryBlobStore::new());
        store.fail_next(2, Fault::Transport);
        let client = client(store.clone());
        let session = SyncSession::default();

        client.push(&session, &FullBackupData::default(), false).await.unwrap();
        assert_eq!(store.request_count(), 3);
    }
}
