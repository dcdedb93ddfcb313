pub mod client;
pub mod conflict;
pub mod credentials;
pub mod error;
pub mod merge;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod session;

mod manager;

pub use client::{FetchedSnapshot, RemoteSyncClient};
pub use conflict::{
    compare_snapshots, content_hash, detect, local_has_changes, remote_has_changes, snapshot_hash, ChangeKind,
    EntityComparison, EntityKind, EntitySummary, ReplicaState,
};
pub use credentials::CredentialStore;
pub use error::{SyncError, SyncErrorKind};
pub use manager::{
    AutoConfirm, Confirmer, ConnectivityCheck, DestructiveAction, NeverConfirm, SkipReason, SyncManager,
    SyncOptions, SyncOutcome, SyncTrigger, Unmetered, PRE_FETCH_BACKUP_KEY,
};
pub use merge::{merge_data, MergeStrategy, Resolution};
pub use remote::{BlobStore, HttpBlobStore, MemoryBlobStore, RemoteError, RemoteMetadata};
pub use retry::RetryPolicy;
pub use scheduler::{start_sync_scheduler, SyncScheduler};
pub use session::{PendingMerge, SyncMetadata, SyncSession, SyncState, SyncStatus};
