use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::manager::{SyncManager, SyncTrigger};

/// Messages to control the sync scheduler
#[derive(Debug)]
pub enum SyncSchedulerMessage {
    /// Interval changed
    Reload { interval_secs: u64 },
    /// Run a sync right away
    SyncNow,
    /// App closing
    Shutdown,
}

/// Handle for the periodic sync scheduler
pub struct SyncScheduler {
    sender: mpsc::Sender<SyncSchedulerMessage>,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    pub fn reload(&self, interval_secs: u64) {
        let _ = self.sender.try_send(SyncSchedulerMessage::Reload { interval_secs });
    }

    pub fn sync_now(&self) {
        let _ = self.sender.try_send(SyncSchedulerMessage::SyncNow);
    }

    pub fn shutdown(&self) {
        let _ = self.sender.try_send(SyncSchedulerMessage::Shutdown);
    }

    /// Wait for the loop to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::error!("Sync scheduler: task ended abnormally: {}", e);
        }
    }
}

/// Minimum sync interval in seconds (prevents runaway syncing)
pub const MIN_INTERVAL_SECS: u64 = 60;

fn effective_interval(interval_secs: u64) -> Duration {
    Duration::from_secs(interval_secs.max(MIN_INTERVAL_SECS))
}

/// Start the periodic sync scheduler.
///
/// The first automatic sync runs immediately if this device has never
/// synced, otherwise one interval after the last sync.
pub fn start_sync_scheduler(sync_manager: Arc<SyncManager>, interval_secs: u64) -> SyncScheduler {
    let (tx, rx) = mpsc::channel(32);
    let task = tokio::spawn(sync_scheduler_loop(sync_manager, interval_secs, rx));
    SyncScheduler { sender: tx, task }
}

/// Time until the next sync is due
fn next_wait(
    last_sync: Option<DateTime<Utc>>,
    last_checked: Option<DateTime<Utc>>,
    interval: Duration,
    now: DateTime<Utc>,
) -> Duration {
    // The later of the two, so a skipped or failed run still waits a full interval
    let effective_last = match (last_sync, last_checked) {
        (Some(ls), Some(lc)) => Some(ls.max(lc)),
        (ls, lc) => ls.or(lc),
    };
    let Some(last) = effective_last else {
        return Duration::ZERO;
    };

    let next = last + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(MIN_INTERVAL_SECS as i64));
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

async fn run_sync(sync_manager: &SyncManager, reason: &str) {
    log::info!("Sync scheduler: running {} sync", reason);
    let outcome = sync_manager.sync(SyncTrigger::Automatic, false).await;
    if outcome.is_failure() {
        log::error!("Sync scheduler: {} sync failed: {}", reason, outcome);
    } else {
        log::info!("Sync scheduler: {} sync complete: {}", reason, outcome);
    }
}

/// Main scheduler loop
async fn sync_scheduler_loop(
    sync_manager: Arc<SyncManager>,
    interval_secs: u64,
    mut receiver: mpsc::Receiver<SyncSchedulerMessage>,
) {
    log::info!("Sync scheduler started");

    let mut interval = effective_interval(interval_secs);
    let mut last_checked: Option<DateTime<Utc>> = None;

    loop {
        let wait = next_wait(
            sync_manager.session().last_sync(),
            last_checked,
            interval,
            Utc::now(),
        );
        log::debug!("Sync scheduler: next sync in {:.0}s", wait.as_secs_f64());

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                run_sync(&sync_manager, "periodic").await;
                last_checked = Some(Utc::now());
            }

            msg = receiver.recv() => {
                match msg {
                    Some(SyncSchedulerMessage::Reload { interval_secs }) => {
                        interval = effective_interval(interval_secs);
                        log::info!("Sync scheduler: interval set to {}s", interval.as_secs());
                    }
                    Some(SyncSchedulerMessage::SyncNow) => {
                        run_sync(&sync_manager, "requested").await;
                        last_checked = Some(Utc::now());
                    }
                    Some(SyncSchedulerMessage::Shutdown) | None => {
                        log::info!("Sync scheduler: shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flashcards::Card;
    use crate::storage::{Deck, LocalStore};
    use crate::sync::client::RemoteSyncClient;
    use crate::sync::manager::SyncOptions;
    use crate::sync::remote::MemoryBlobStore;
    use crate::sync::retry::RetryPolicy;
    use crate::sync::session::SyncSession;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    const KEY: &str = "mnemo-sync.json";

    fn manager(dir: &TempDir, remote: Arc<MemoryBlobStore>) -> Arc<SyncManager> {
        let store = Arc::new(LocalStore::open(&dir.path().join("mnemo.db")).unwrap());
        let today = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        store
            .put(&Deck::flashcards(
                "Spanish".to_string(),
                vec![Card::new("hola".to_string(), "hello".to_string(), today)],
            ))
            .unwrap();
        let client = RemoteSyncClient::new(remote, KEY, RetryPolicy::default());
        Arc::new(SyncManager::new(
            store,
            Arc::new(SyncSession::default()),
            client,
            SyncOptions::default(),
        ))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_next_wait() {
        let now = Utc::now();
        let hour = Duration::from_secs(3600);

        assert_eq!(next_wait(None, None, hour, now), Duration::ZERO);
        assert_eq!(
            next_wait(Some(now - chrono::Duration::hours(2)), None, hour, now),
            Duration::ZERO
        );

        let wait = next_wait(
            Some(now - chrono::Duration::hours(2)),
            Some(now - chrono::Duration::minutes(30)),
            hour,
            now,
        );
        assert_eq!(wait, Duration::from_secs(1800));
    }

    #[test]
    fn test_interval_floor() {
        assert_eq!(effective_interval(5), Duration::from_secs(MIN_INTERVAL_SECS));
        assert_eq!(effective_interval(600), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_first_run_is_immediate_and_sync_now_runs_again() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryBlobStore::new());
        let manager = manager(&dir, remote.clone());

        let scheduler = start_sync_scheduler(manager.clone(), 3600);
        assert!(wait_for(|| remote.etag_of(KEY).is_some()).await);
        let first = remote.etag_of(KEY);

        tokio::time::sleep(Duration::from_millis(5)).await;
        manager
            .store()
            .put(&Deck::flashcards("French".to_string(), Vec::new()))
            .unwrap();
        scheduler.sync_now();
        assert!(wait_for(|| remote.etag_of(KEY) != first).await);

        scheduler.shutdown();
        scheduler.join().await;
    }
}
