//! Cross-session change notifications for the local store.
//!
//! Every store opened on the same database file shares one broadcast channel.
//! Delivery is fire-and-forget: a lagging or absent receiver never blocks a
//! writer, and receivers should treat an event as a cue to reload, not as a
//! delta.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tokio::sync::broadcast;
use uuid::Uuid;

use super::local_store::Collection;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEventKind {
    /// Regular writes to one or more collections
    DataChanged(Vec<Collection>),
    /// Every collection was replaced from a snapshot
    Restored,
    /// The store was wiped
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    /// Session that made the change, so it can ignore its own events
    pub origin: Uuid,
    pub kind: StoreEventKind,
}

type Registry = Mutex<HashMap<PathBuf, broadcast::Sender<StoreEvent>>>;

fn registry() -> &'static Registry {
    static CHANNELS: OnceLock<Registry> = OnceLock::new();
    CHANNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get the shared sender for a database path, creating it on first use
pub fn channel_for(db_path: &Path) -> broadcast::Sender<StoreEvent> {
    let key = std::fs::canonicalize(db_path).unwrap_or_else(|_| db_path.to_path_buf());
    let mut channels = registry().lock().unwrap_or_else(|e| e.into_inner());
    channels
        .entry(key)
        .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
        .clone()
}

/// Send without caring whether anyone is listening
pub fn broadcast(sender: &broadcast::Sender<StoreEvent>, event: StoreEvent) {
    if sender.send(event).is_err() {
        log::trace!("Store: change notification dropped, no active listeners");
    }
}
