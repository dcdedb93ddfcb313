use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::client::{FetchedSnapshot, RemoteSyncClient};
use super::conflict::{
    compare_snapshots, detect, local_has_changes, remote_has_changes, snapshot_hash, EntityComparison,
    ReplicaState,
};
use super::error::{Result, SyncError, SyncErrorKind};
use super::merge::{merge_data, MergeStrategy};
use super::remote::{MetadataResponse, RemoteError, RemoteMetadata};
use super::session::{PendingMerge, SyncSession, SyncState, SyncStatus};
use crate::storage::{FullBackupData, LocalStore};

/// Store meta key of the single pre-fetch backup slot
pub const PRE_FETCH_BACKUP_KEY: &str = "preFetchBackup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Started by the user
    Manual,
    /// Started by the scheduler
    Automatic,
}

/// Why a sync did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NotConfigured,
    CredentialsMissing,
    MeteredConnection,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Disabled => "Sync is disabled",
            SkipReason::NotConfigured => "Sync server is not configured",
            SkipReason::CredentialsMissing => "No API key stored for the sync server",
            SkipReason::MeteredConnection => "Waiting for an unmetered connection",
        })
    }
}

impl From<SkipReason> for SyncError {
    fn from(reason: SkipReason) -> Self {
        match reason {
            SkipReason::CredentialsMissing => SyncError::CredentialsMissing,
            _ => SyncError::NotConfigured,
        }
    }
}

/// What a sync operation ended up doing. Operations report through this
/// instead of returning errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    UpToDate,
    Pushed,
    Pulled,
    Merged,
    Reverted,
    Reset,
    /// Both sides changed; call `resolve_merge` with a strategy
    NeedsResolution(Vec<EntityComparison>),
    Skipped(SkipReason),
    AlreadySyncing,
    /// The user did not confirm a destructive step
    Declined,
    Failed {
        kind: SyncErrorKind,
        message: String,
    },
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::Failed { .. })
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::UpToDate => f.write_str("Up to date"),
            SyncOutcome::Pushed => f.write_str("Uploaded local changes"),
            SyncOutcome::Pulled => f.write_str("Downloaded remote changes"),
            SyncOutcome::Merged => f.write_str("Merged and uploaded"),
            SyncOutcome::Reverted => f.write_str("Restored the data from before the last fetch"),
            SyncOutcome::Reset => f.write_str("Local data erased"),
            SyncOutcome::NeedsResolution(comparisons) => write!(
                f,
                "Local and remote both changed; {} item(s) need a choice",
                comparisons.iter().filter(|c| c.needs_choice()).count()
            ),
            SyncOutcome::Skipped(reason) => write!(f, "{}", reason),
            SyncOutcome::AlreadySyncing => f.write_str("Already syncing"),
            SyncOutcome::Declined => f.write_str("Cancelled"),
            SyncOutcome::Failed { message, .. } => f.write_str(message),
        }
    }
}

/// Operations that overwrite one side unconditionally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructiveAction {
    Pull,
    ForcePush,
    ForceFetch,
    ResolveMerge,
    RevertFetch,
    RestoreRemoteBackup,
    DeleteRemoteBackup,
    ImportBackup,
    FactoryReset,
}

impl fmt::Display for DestructiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DestructiveAction::Pull => "Replace local data with the newer remote copy",
            DestructiveAction::ForcePush => "Overwrite the remote copy with local data",
            DestructiveAction::ForceFetch => "Overwrite local data with the remote copy",
            DestructiveAction::ResolveMerge => "Replace local and remote data with the merged result",
            DestructiveAction::RevertFetch => "Restore local data from before the last fetch",
            DestructiveAction::RestoreRemoteBackup => "Replace remote and local data with a remote backup",
            DestructiveAction::DeleteRemoteBackup => "Delete the remote backup",
            DestructiveAction::ImportBackup => "Replace local data with the backup file",
            DestructiveAction::FactoryReset => "Erase all local data",
        })
    }
}

/// Asks the user before a destructive step
pub trait Confirmer: Send + Sync {
    fn confirm(&self, action: DestructiveAction) -> bool;
}

/// Confirms everything; for `--yes` and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl Confirmer for AutoConfirm {
    fn confirm(&self, _action: DestructiveAction) -> bool {
        true
    }
}

/// Declines everything; for non-interactive contexts
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverConfirm;

impl Confirmer for NeverConfirm {
    fn confirm(&self, _action: DestructiveAction) -> bool {
        false
    }
}

pub trait ConnectivityCheck: Send + Sync {
    fn is_metered(&self) -> bool;
}

/// Assumes a wired or wifi connection
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmetered;

impl ConnectivityCheck for Unmetered {
    fn is_metered(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub enabled: bool,
    pub sync_on_cellular: bool,
    /// Ask before a manual sync replaces local data
    pub confirm_pull: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_on_cellular: false,
            confirm_pull: true,
        }
    }
}

enum Remote {
    Ready(RemoteSyncClient),
    Unavailable(SkipReason),
}

/// Orchestrates sync between a `LocalStore` and one remote blob
pub struct SyncManager {
    store: Arc<LocalStore>,
    session: Arc<SyncSession>,
    remote: Remote,
    options: SyncOptions,
    confirmer: Arc<dyn Confirmer>,
    connectivity: Arc<dyn ConnectivityCheck>,
}

impl SyncManager {
    pub fn new(
        store: Arc<LocalStore>,
        session: Arc<SyncSession>,
        client: RemoteSyncClient,
        options: SyncOptions,
    ) -> Self {
        Self::build(store, session, Remote::Ready(client), options)
    }

    /// Manager whose remote operations all report `reason`
    pub fn without_remote(
        store: Arc<LocalStore>,
        session: Arc<SyncSession>,
        reason: SkipReason,
        options: SyncOptions,
    ) -> Self {
        Self::build(store, session, Remote::Unavailable(reason), options)
    }

    fn build(store: Arc<LocalStore>, session: Arc<SyncSession>, remote: Remote, options: SyncOptions) -> Self {
        Self {
            store,
            session,
            remote,
            options,
            confirmer: Arc::new(NeverConfirm),
            connectivity: Arc::new(Unmetered),
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn ConnectivityCheck>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }

    pub fn status(&self) -> SyncStatus {
        self.session.status()
    }

    pub fn pending_merge(&self) -> Option<PendingMerge> {
        self.session.pending_merge()
    }

    fn client(&self) -> std::result::Result<&RemoteSyncClient, SkipReason> {
        if !self.options.enabled {
            return Err(SkipReason::Disabled);
        }
        match &self.remote {
            Remote::Ready(client) => Ok(client),
            Remote::Unavailable(reason) => Err(*reason),
        }
    }

    fn confirm(&self, action: DestructiveAction) -> bool {
        let confirmed = self.confirmer.confirm(action);
        if !confirmed {
            log::info!("Sync: '{}' not confirmed", action);
        }
        confirmed
    }

    fn skip(&self, reason: SkipReason) -> SyncOutcome {
        log::debug!("Sync: skipped ({})", reason);
        let state = match reason {
            SkipReason::MeteredConnection => SyncState::Idle,
            _ => SyncState::Disabled,
        };
        self.session.set_status(state, reason.to_string(), None);
        SyncOutcome::Skipped(reason)
    }

    /// Record the outcome in the session and persist it
    fn finish(&self, operation: &str, result: Result<SyncOutcome>) -> SyncOutcome {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Sync: {} failed: {}", operation, e);
                SyncOutcome::Failed {
                    kind: e.kind(),
                    message: e.status_message(),
                }
            }
        };

        let (state, error_kind) = match &outcome {
            SyncOutcome::Failed { kind, .. } => (SyncState::Error, Some(*kind)),
            SyncOutcome::NeedsResolution(_) => (SyncState::Conflict, None),
            SyncOutcome::Declined if self.session.pending_merge().is_some() => (SyncState::Conflict, None),
            SyncOutcome::Declined | SyncOutcome::Reset => (SyncState::Idle, None),
            _ => (SyncState::Success, None),
        };
        self.session.set_status(state, outcome.to_string(), error_kind);
        log::info!("Sync: {} finished: {}", operation, outcome);

        if let Err(e) = self.session.persist(&self.store) {
            log::warn!("Sync: could not persist sync metadata: {}", e);
        }
        outcome
    }

    /// New sync point: never earlier than the remote's own timestamp.
    ///
    /// `local_mark` is the local `lastModified` of the data both sides now
    /// hold, so writes that land while a transfer is in flight stay pending.
    fn mark_synced(&self, remote_modified: Option<DateTime<Utc>>, local_mark: Option<DateTime<Utc>>) {
        let now = Utc::now();
        self.session
            .mark_synced(remote_modified.map_or(now, |modified| modified.max(now)), local_mark);
    }

    fn save_pre_fetch_backup(&self, snapshot: &FullBackupData) -> Result<()> {
        self.store.set_meta(PRE_FETCH_BACKUP_KEY, snapshot)?;
        log::debug!("Sync: saved pre-fetch backup ({} decks)", snapshot.decks.len());
        Ok(())
    }

    /// Overwrite local data with a remote snapshot, keeping a pre-fetch backup
    fn apply_remote(&self, remote: &FetchedSnapshot) -> Result<()> {
        let current = self.store.export_snapshot()?;
        self.save_pre_fetch_backup(&current)?;
        let restored_at = self.store.atomic_restore(&remote.data)?;
        self.mark_synced(remote.modified, Some(restored_at));
        Ok(())
    }

    // ===== sync =====

    /// Bring local and remote in line.
    ///
    /// `force` skips the conditional metadata read and the metered connection
    /// guard. Never returns an error; failures are classified into
    /// `SyncOutcome::Failed` and the session status.
    pub async fn sync(&self, trigger: SyncTrigger, force: bool) -> SyncOutcome {
        let client = match self.client() {
            Ok(client) => client,
            Err(reason) => return self.skip(reason),
        };
        if !force && !self.options.sync_on_cellular && self.connectivity.is_metered() {
            return self.skip(SkipReason::MeteredConnection);
        }
        let Some(_guard) = self.session.try_begin() else {
            log::info!("Sync: already in progress");
            return SyncOutcome::AlreadySyncing;
        };

        log::info!("Sync: starting ({:?}, force={})", trigger, force);
        self.session.set_status(SyncState::Syncing, "Syncing", None);
        let result = self.run_sync(client, trigger, force).await;
        self.finish("sync", result)
    }

    async fn run_sync(&self, client: &RemoteSyncClient, trigger: SyncTrigger, force: bool) -> Result<SyncOutcome> {
        let last_sync = self.session.last_sync();
        let local_changed = local_has_changes(self.store.last_modified()?, self.session.local_baseline());

        let (remote_changed, remote_missing) = match client.metadata(&self.session, force).await? {
            MetadataResponse::NotModified => (false, false),
            MetadataResponse::NotFound => (false, true),
            // The version is authoritative; timestamps only when none was agreed yet
            MetadataResponse::Found(meta) => match self.session.synced_etag() {
                Some(synced) => (meta.etag != synced, false),
                None => (remote_has_changes(Some(meta.modified), last_sync), false),
            },
        };

        let state = if remote_missing && !local_changed {
            // Nothing remote yet: seed it with whatever is here
            if self.store.export_snapshot()?.is_empty() {
                ReplicaState::Clean
            } else {
                ReplicaState::LocalAhead
            }
        } else {
            detect(local_changed, remote_changed)
        };
        log::info!(
            "Sync: local_changed={} remote_changed={} remote_missing={} -> {:?}",
            local_changed,
            remote_changed,
            remote_missing,
            state
        );

        match state {
            ReplicaState::Clean => Ok(SyncOutcome::UpToDate),
            ReplicaState::LocalAhead => self.push_local(client).await,
            ReplicaState::RemoteAhead => self.pull_remote(client, trigger).await,
            ReplicaState::Diverged => self.enter_merge(client).await,
        }
    }

    async fn push_local(&self, client: &RemoteSyncClient) -> Result<SyncOutcome> {
        let (snapshot, local_mark) = self.store.export_with_high_water()?;
        match client.push(&self.session, &snapshot, false).await {
            Ok(response) => {
                self.mark_synced(Some(response.modified), local_mark);
                Ok(SyncOutcome::Pushed)
            }
            Err(SyncError::Remote(RemoteError::Conflict)) => {
                log::warn!("Sync: remote changed since it was last read, switching to merge");
                self.enter_merge(client).await
            }
            Err(e) => Err(e),
        }
    }

    async fn pull_remote(&self, client: &RemoteSyncClient, trigger: SyncTrigger) -> Result<SyncOutcome> {
        if trigger == SyncTrigger::Manual && self.options.confirm_pull && !self.confirm(DestructiveAction::Pull) {
            return Ok(SyncOutcome::Declined);
        }
        let Some(remote) = client.fetch(&self.session).await? else {
            return Ok(SyncOutcome::UpToDate);
        };
        self.apply_remote(&remote)?;
        Ok(SyncOutcome::Pulled)
    }

    /// Fetch the remote and either settle on identical content or park a
    /// pending merge. Nothing is written to either side.
    async fn enter_merge(&self, client: &RemoteSyncClient) -> Result<SyncOutcome> {
        let (local, local_mark) = self.store.export_with_high_water()?;
        let Some(remote) = client.fetch(&self.session).await? else {
            let response = client.push(&self.session, &local, false).await?;
            self.mark_synced(Some(response.modified), local_mark);
            return Ok(SyncOutcome::Pushed);
        };

        if snapshot_hash(&local) == snapshot_hash(&remote.data) {
            log::info!("Sync: both sides changed but hold identical content");
            self.mark_synced(remote.modified, local_mark);
            return Ok(SyncOutcome::UpToDate);
        }

        let now = Utc::now();
        let comparisons = compare_snapshots(&local, &remote.data, now.date_naive(), now);
        log::info!(
            "Sync: diverged, {} of {} entities need a choice",
            comparisons.iter().filter(|c| c.needs_choice()).count(),
            comparisons.len()
        );
        self.session.set_pending_merge(Some(PendingMerge {
            remote: remote.data,
            remote_etag: remote.etag,
            comparisons: comparisons.clone(),
            detected_at: now,
        }));
        Ok(SyncOutcome::NeedsResolution(comparisons))
    }

    // ===== Merge resolution =====

    /// Apply `strategy` to the pending merge, write the result locally and
    /// overwrite the remote with it
    pub async fn resolve_merge(&self, strategy: &MergeStrategy) -> SyncOutcome {
        let client = match self.client() {
            Ok(client) => client,
            Err(reason) => return self.skip(reason),
        };
        let Some(_guard) = self.session.try_begin() else {
            return SyncOutcome::AlreadySyncing;
        };
        let result = self.run_resolve(client, strategy).await;
        self.finish("merge", result)
    }

    async fn run_resolve(&self, client: &RemoteSyncClient, strategy: &MergeStrategy) -> Result<SyncOutcome> {
        let pending = self.session.pending_merge().ok_or(SyncError::NoPendingMerge)?;
        if !self.confirm(DestructiveAction::ResolveMerge) {
            return Ok(SyncOutcome::Declined);
        }

        let local = self.store.export_snapshot()?;
        let merged = merge_data(&local, &pending.remote, strategy);
        log::info!(
            "Sync: merging with {} remote choice(s) against {}",
            strategy.remote_choices(),
            pending.remote_etag
        );

        self.save_pre_fetch_backup(&local)?;
        let merged_at = self.store.atomic_restore(&merged)?;
        let response = client.push(&self.session, &merged, true).await?;

        self.session.set_pending_merge(None);
        self.mark_synced(Some(response.modified), Some(merged_at));
        Ok(SyncOutcome::Merged)
    }

    // ===== Forced transfers =====

    /// Overwrite the remote with local data after saving the current remote
    /// blob as a timestamped copy
    pub async fn force_push(&self) -> SyncOutcome {
        let client = match self.client() {
            Ok(client) => client,
            Err(reason) => return self.skip(reason),
        };
        let Some(_guard) = self.session.try_begin() else {
            return SyncOutcome::AlreadySyncing;
        };
        let result = self.run_force_push(client).await;
        self.finish("force push", result)
    }

    async fn run_force_push(&self, client: &RemoteSyncClient) -> Result<SyncOutcome> {
        if !self.confirm(DestructiveAction::ForcePush) {
            return Ok(SyncOutcome::Declined);
        }

        let (snapshot, local_mark) = self.store.export_with_high_water()?;
        if let Some(existing) = client.download(&self.session).await? {
            let name = safety_copy_name(client.key(), Utc::now());
            client.save_named_copy(&name, existing.body).await?;
        }

        let response = client.push(&self.session, &snapshot, true).await?;
        self.session.set_pending_merge(None);
        self.mark_synced(Some(response.modified), local_mark);
        Ok(SyncOutcome::Pushed)
    }

    /// Overwrite local data with the remote copy
    pub async fn force_fetch(&self) -> SyncOutcome {
        let client = match self.client() {
            Ok(client) => client,
            Err(reason) => return self.skip(reason),
        };
        let Some(_guard) = self.session.try_begin() else {
            return SyncOutcome::AlreadySyncing;
        };
        let result = self.run_force_fetch(client).await;
        self.finish("force fetch", result)
    }

    async fn run_force_fetch(&self, client: &RemoteSyncClient) -> Result<SyncOutcome> {
        if !self.confirm(DestructiveAction::ForceFetch) {
            return Ok(SyncOutcome::Declined);
        }
        let remote = client
            .fetch(&self.session)
            .await?
            .ok_or(SyncError::NothingOnRemote)?;
        self.apply_remote(&remote)?;
        self.session.set_pending_merge(None);
        Ok(SyncOutcome::Pulled)
    }

    // ===== Local safety nets =====

    /// Undo the most recent pull, fetch or merge. Works offline.
    pub async fn revert_last_fetch(&self) -> SyncOutcome {
        let Some(_guard) = self.session.try_begin() else {
            return SyncOutcome::AlreadySyncing;
        };
        let result = self.run_revert();
        self.finish("revert", result)
    }

    fn run_revert(&self) -> Result<SyncOutcome> {
        let backup: FullBackupData = self
            .store
            .get_meta(PRE_FETCH_BACKUP_KEY)?
            .ok_or(SyncError::NoPreFetchBackup)?;
        if !self.confirm(DestructiveAction::RevertFetch) {
            return Ok(SyncOutcome::Declined);
        }
        self.store.atomic_restore(&backup)?;
        self.store.remove_meta(PRE_FETCH_BACKUP_KEY)?;
        Ok(SyncOutcome::Reverted)
    }

    /// Erase all local data and sync bookkeeping. The remote is untouched.
    pub async fn factory_reset(&self) -> SyncOutcome {
        let Some(_guard) = self.session.try_begin() else {
            return SyncOutcome::AlreadySyncing;
        };
        let result = self.run_factory_reset();
        self.finish("factory reset", result)
    }

    fn run_factory_reset(&self) -> Result<SyncOutcome> {
        if !self.confirm(DestructiveAction::FactoryReset) {
            return Ok(SyncOutcome::Declined);
        }
        self.store.factory_reset()?;
        self.session.reset();
        Ok(SyncOutcome::Reset)
    }

    // ===== Remote backups =====

    pub async fn list_remote_backups(&self) -> Result<Vec<RemoteMetadata>> {
        let client = self.client()?;
        let mut backups = client.list().await?;
        backups.retain(|meta| meta.name != client.key());
        backups.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(backups)
    }

    /// Delete a named remote backup. Returns false if the user declined.
    pub async fn delete_remote_backup(&self, name: &str) -> Result<bool> {
        let client = self.client()?;
        if !self.confirm(DestructiveAction::DeleteRemoteBackup) {
            return Ok(false);
        }
        client.delete_named(name).await?;
        Ok(true)
    }

    /// Copy a named remote backup over the sync blob, then pull it
    pub async fn restore_remote_backup(&self, name: &str) -> SyncOutcome {
        let client = match self.client() {
            Ok(client) => client,
            Err(reason) => return self.skip(reason),
        };
        let Some(_guard) = self.session.try_begin() else {
            return SyncOutcome::AlreadySyncing;
        };
        let result = self.run_restore_remote(client, name).await;
        self.finish("restore", result)
    }

    async fn run_restore_remote(&self, client: &RemoteSyncClient, name: &str) -> Result<SyncOutcome> {
        if !self.confirm(DestructiveAction::RestoreRemoteBackup) {
            return Ok(SyncOutcome::Declined);
        }
        client.restore_named(&self.session, name).await?;
        let remote = client
            .fetch(&self.session)
            .await?
            .ok_or(SyncError::NothingOnRemote)?;
        self.apply_remote(&remote)?;
        self.session.set_pending_merge(None);
        Ok(SyncOutcome::Pulled)
    }
}

/// `mnemo-sync.json` -> `mnemo-sync-20260701T120000Z.json`
fn safety_copy_name(key: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%dT%H%M%SZ");
    match key.strip_suffix(".json") {
        Some(stem) => format!("{}-{}.json", stem, stamp),
        None => format!("{}-{}", key, stamp),
    }
}
