//! Per-device sync context.
//!
//! Everything a sync reads or mutates besides the stores themselves lives
//! here: the single-flight flag, the cached ETag, the last agreed sync point,
//! the user-facing status and a merge waiting for a strategy. Sessions are
//! passed in explicitly, so independent sessions never share state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conflict::EntityComparison;
use super::error::SyncErrorKind;
use crate::storage::{FullBackupData, LocalStore, StorageError};

/// Store meta key holding the persisted `SyncMetadata`
pub const SYNC_METADATA_KEY: &str = "syncMetadata";

/// Bookkeeping that survives restarts
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Identifies this device in logs and safety copies
    #[serde(default)]
    pub client_id: String,
    /// ETag of the remote blob as of the last read or write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// ETag the remote had at `last_sync`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    /// Local `lastModified` that the data agreed at `last_sync` reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_baseline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
}

impl SyncMetadata {
    pub fn new() -> Self {
        Self {
            client_id: generate_client_id(),
            ..Default::default()
        }
    }

    pub fn load(store: &LocalStore) -> Result<Self, StorageError> {
        let mut metadata = store
            .get_meta::<SyncMetadata>(SYNC_METADATA_KEY)?
            .unwrap_or_default();
        if metadata.client_id.is_empty() {
            metadata.client_id = generate_client_id();
        }
        Ok(metadata)
    }

    pub fn save(&self, store: &LocalStore) -> Result<(), StorageError> {
        store.set_meta(SYNC_METADATA_KEY, self)
    }

    /// Local writes after this point have not reached the remote.
    /// Metadata written before baselines were tracked falls back to `last_sync`.
    pub fn baseline(&self) -> Option<DateTime<Utc>> {
        self.local_baseline.or(self.last_sync)
    }
}

fn generate_client_id() -> String {
    let random_part: u64 = rand::random();
    format!(
        "{}-{:016x}",
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        random_part
    )
}

/// Current sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Sync is turned off or not configured
    Disabled,
    /// Ready, nothing has run in this session
    #[default]
    Idle,
    /// Currently syncing
    Syncing,
    /// Last sync succeeded
    Success,
    /// Last sync failed
    Error,
    /// Both replicas changed and a merge strategy is required
    Conflict,
}

/// Status shown to the user
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<SyncErrorKind>,
}

/// A diverged sync waiting for the user to pick sides
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMerge {
    pub remote: FullBackupData,
    pub remote_etag: String,
    pub comparisons: Vec<EntityComparison>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionInner {
    metadata: SyncMetadata,
    status: SyncStatus,
    pending: Option<PendingMerge>,
}

#[derive(Debug, Default)]
pub struct SyncSession {
    in_flight: AtomicBool,
    inner: Mutex<SessionInner>,
}

/// Clears the in-flight flag when dropped
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    session: &'a SyncSession,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.session.in_flight.store(false, Ordering::Release);
    }
}

impl SyncSession {
    pub fn new(metadata: SyncMetadata) -> Self {
        let status = SyncStatus {
            last_sync: metadata.last_sync,
            message: metadata.last_status.clone().unwrap_or_default(),
            ..Default::default()
        };
        Self {
            in_flight: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                metadata,
                status,
                pending: None,
            }),
        }
    }

    /// Session seeded from the metadata persisted in `store`
    pub fn load(store: &LocalStore) -> Result<Self, StorageError> {
        Ok(Self::new(SyncMetadata::load(store)?))
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the single in-flight slot; `None` if a sync is already running
    pub fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard { session: self })
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn etag(&self) -> Option<String> {
        self.lock().metadata.etag.clone()
    }

    pub fn set_etag(&self, etag: Option<String>) {
        self.lock().metadata.etag = etag;
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.lock().metadata.last_sync
    }

    /// ETag of the remote as of the last agreed sync point
    pub fn synced_etag(&self) -> Option<String> {
        self.lock().metadata.synced_etag.clone()
    }

    pub fn local_baseline(&self) -> Option<DateTime<Utc>> {
        self.lock().metadata.baseline()
    }

    /// Record a new agreed sync point at the currently cached ETag.
    ///
    /// `local_mark` is the store's `lastModified` as of the data that was
    /// agreed on; `None` means the store had never been written.
    pub fn mark_synced(&self, at: DateTime<Utc>, local_mark: Option<DateTime<Utc>>) {
        let mut inner = self.lock();
        inner.metadata.synced_etag = inner.metadata.etag.clone();
        inner.metadata.last_sync = Some(at);
        inner.metadata.local_baseline = Some(local_mark.unwrap_or(DateTime::<Utc>::UNIX_EPOCH));
        inner.status.last_sync = Some(at);
    }

    pub fn client_id(&self) -> String {
        self.lock().metadata.client_id.clone()
    }

    pub fn metadata(&self) -> SyncMetadata {
        self.lock().metadata.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.lock().status.clone()
    }

    pub fn set_status(&self, state: SyncState, message: impl Into<String>, error_kind: Option<SyncErrorKind>) {
        let mut inner = self.lock();
        let message = message.into();
        inner.metadata.last_status = Some(message.clone());
        inner.status.state = state;
        inner.status.message = message;
        inner.status.error_kind = error_kind;
    }

    pub fn pending_merge(&self) -> Option<PendingMerge> {
        self.lock().pending.clone()
    }

    pub fn set_pending_merge(&self, pending: Option<PendingMerge>) {
        self.lock().pending = pending;
    }

    /// Forget everything except the device id
    pub fn reset(&self) {
        let mut inner = self.lock();
        let client_id = std::mem::take(&mut inner.metadata.client_id);
        *inner = SessionInner {
            metadata: SyncMetadata {
                client_id,
                ..Default::default()
            },
            ..Default::default()
        };
    }

    /// Write the durable part of the session to `store`
    pub fn persist(&self, store: &LocalStore) -> Result<(), StorageError> {
        self.metadata().save(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_single_flight() {
        let session = SyncSession::default();
        let guard = session.try_begin().unwrap();
        assert!(session.is_syncing());
        assert!(session.try_begin().is_none());

        drop(guard);
        assert!(!session.is_syncing());
        assert!(session.try_begin().is_some());
    }

    #[test]
    fn test_sessions_are_independent() {
        let a = SyncSession::default();
        let b = SyncSession::default();
        a.set_etag(Some("v1".to_string()));
        let _guard = a.try_begin().unwrap();

        assert_eq!(b.etag(), None);
        assert!(b.try_begin().is_some());
    }

    #[test]
    fn test_metadata_roundtrip_through_store() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&dir.path().join("mnemo.db")).unwrap();

        let session = SyncSession::load(&store).unwrap();
        assert!(!session.client_id().is_empty());
        session.set_etag(Some("v7".to_string()));
        let now = Utc::now();
        let mark = now - chrono::Duration::seconds(5);
        session.mark_synced(now, Some(mark));
        session.set_status(SyncState::Success, "Up to date", None);
        session.persist(&store).unwrap();

        let restored = SyncSession::load(&store).unwrap();
        assert_eq!(restored.etag().as_deref(), Some("v7"));
        assert_eq!(restored.synced_etag().as_deref(), Some("v7"));
        assert_eq!(restored.last_sync(), Some(now));
        assert_eq!(restored.local_baseline(), Some(mark));
        assert_eq!(restored.status().message, "Up to date");
        assert_eq!(restored.client_id(), session.client_id());
    }

    #[test]
    fn test_reset_keeps_client_id() {
        let session = SyncSession::new(SyncMetadata::new());
        let id = session.client_id();
        session.set_etag(Some("v1".to_string()));
        session.mark_synced(Utc::now(), None);

        session.reset();
        assert_eq!(session.client_id(), id);
        assert!(session.etag().is_none());
        assert!(session.synced_etag().is_none());
        assert!(session.last_sync().is_none());
        assert!(session.local_baseline().is_none());
    }

    #[test]
    fn test_baseline_falls_back_to_last_sync() {
        let synced = Utc::now();
        let legacy: SyncMetadata =
            serde_json::from_value(serde_json::json!({ "clientId": "a", "lastSync": synced })).unwrap();
        assert_eq!(legacy.baseline(), Some(synced));

        let session = SyncSession::new(legacy);
        session.mark_synced(synced, None);
        assert_eq!(session.local_baseline(), Some(DateTime::<Utc>::UNIX_EPOCH));
    }
}
