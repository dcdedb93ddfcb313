//! Decide what a sync has to do, and describe how two snapshots differ.
//!
//! Classification only looks at three timestamps: the local `lastModified`
//! high-water mark, the remote blob's modification time and the last agreed
//! sync point. Content hashes are used to describe entity-level differences
//! and to spot replicas that diverged into identical content.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::flashcards::review_stats;
use crate::storage::{Deck, DeckSeries, FullBackupData};

/// Relationship between the two replicas since the last sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicaState {
    /// Nothing changed on either side
    Clean,
    /// Only local changes: push
    LocalAhead,
    /// Only remote changes: pull
    RemoteAhead,
    /// Both sides changed: a merge strategy is needed before any write
    Diverged,
}

pub fn detect(local_has_changes: bool, remote_has_changes: bool) -> ReplicaState {
    match (local_has_changes, remote_has_changes) {
        (false, false) => ReplicaState::Clean,
        (true, false) => ReplicaState::LocalAhead,
        (false, true) => ReplicaState::RemoteAhead,
        (true, true) => ReplicaState::Diverged,
    }
}

/// A store that was never written has nothing to push
pub fn local_has_changes(last_modified: Option<DateTime<Utc>>, last_sync: Option<DateTime<Utc>>) -> bool {
    match (last_modified, last_sync) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(modified), Some(synced)) => modified > synced,
    }
}

/// `remote_modified` is `None` when the remote holds nothing
pub fn remote_has_changes(remote_modified: Option<DateTime<Utc>>, last_sync: Option<DateTime<Utc>>) -> bool {
    match (remote_modified, last_sync) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(modified), Some(synced)) => modified > synced,
    }
}

/// `sha256:<hex>` over the JSON encoding of `value`
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
}

/// Hash of everything a merge could change.
///
/// Export time and store-assigned review ids are left out, so two devices
/// holding the same data produce the same hash.
pub fn snapshot_hash(data: &FullBackupData) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |label: &str, json: Vec<u8>| {
        hasher.update(label.as_bytes());
        hasher.update((json.len() as u64).to_le_bytes());
        hasher.update(&json);
    };

    let reviews: Vec<_> = data
        .reviews
        .iter()
        .map(|r| (&r.item_id, &r.deck_id, r.timestamp, r.rating))
        .collect();

    feed("decks", serde_json::to_vec(&data.decks).unwrap_or_default());
    feed("folders", serde_json::to_vec(&data.folders).unwrap_or_default());
    feed("deckSeries", serde_json::to_vec(&data.deck_series).unwrap_or_default());
    feed("reviews", serde_json::to_vec(&reviews).unwrap_or_default());
    feed("seriesProgress", serde_json::to_vec(&data.series_progress).unwrap_or_default());
    feed("learningProgress", serde_json::to_vec(&data.learning_progress).unwrap_or_default());
    feed("chatHistory", serde_json::to_vec(&data.chat_history).unwrap_or_default());

    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Deck,
    Series,
}

/// How an entity differs, seen from the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    /// Exists only on this device
    LocalOnly,
    /// Exists only on the remote
    RemoteOnly,
    /// Exists on both with different content
    Changed,
    Unchanged,
}

/// Facts shown to the user when picking a side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub name: String,
    /// Cards/questions in a deck, decks in a series
    pub item_count: usize,
    pub due_count: usize,
    pub average_mastery: f64,
    pub last_modified: DateTime<Utc>,
    pub deleted: bool,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityComparison {
    pub id: String,
    pub kind: EntityKind,
    pub change: ChangeKind,
    pub local: Option<EntitySummary>,
    pub remote: Option<EntitySummary>,
}

impl EntityComparison {
    /// A display name, preferring the local one
    pub fn name(&self) -> &str {
        self.local
            .as_ref()
            .or(self.remote.as_ref())
            .map(|s| s.name.as_str())
            .unwrap_or(&self.id)
    }

    /// The user has to pick a side for this entity
    pub fn needs_choice(&self) -> bool {
        self.change == ChangeKind::Changed
    }
}

fn summarize_deck(deck: &Deck, today: NaiveDate, now: DateTime<Utc>) -> EntitySummary {
    let stats = review_stats(deck.review_states(), today, now);
    EntitySummary {
        name: deck.name.clone(),
        item_count: stats.total_items,
        due_count: stats.due_items,
        average_mastery: stats.average_mastery,
        last_modified: deck.last_modified,
        deleted: deck.is_deleted(),
        hash: content_hash(deck),
    }
}

fn summarize_series(
    series: &DeckSeries,
    decks: &BTreeMap<&str, &Deck>,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> EntitySummary {
    let member_states: Vec<_> = series
        .deck_ids()
        .filter_map(|id| decks.get(id))
        .flat_map(|deck| deck.review_states())
        .collect();
    let stats = review_stats(member_states, today, now);

    EntitySummary {
        name: series.name.clone(),
        item_count: series.deck_ids().count(),
        due_count: stats.due_items,
        average_mastery: stats.average_mastery,
        last_modified: series.last_modified,
        deleted: series.deleted_at.is_some(),
        hash: content_hash(series),
    }
}

fn classify(local: Option<&EntitySummary>, remote: Option<&EntitySummary>) -> ChangeKind {
    match (local, remote) {
        (Some(l), Some(r)) if l.hash == r.hash => ChangeKind::Unchanged,
        (Some(_), Some(_)) => ChangeKind::Changed,
        (Some(_), None) => ChangeKind::LocalOnly,
        _ => ChangeKind::RemoteOnly,
    }
}

/// Per-deck and per-series comparison, decks first, each group sorted by id
pub fn compare_snapshots(
    local: &FullBackupData,
    remote: &FullBackupData,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Vec<EntityComparison> {
    let local_decks: BTreeMap<&str, &Deck> = local.decks.iter().map(|d| (d.id.as_str(), d)).collect();
    let remote_decks: BTreeMap<&str, &Deck> = remote.decks.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut out = Vec::new();

    let mut deck_ids: Vec<&str> = local_decks.keys().chain(remote_decks.keys()).copied().collect();
    deck_ids.sort_unstable();
    deck_ids.dedup();
    for id in deck_ids {
        let l = local_decks.get(id).map(|d| summarize_deck(d, today, now));
        let r = remote_decks.get(id).map(|d| summarize_deck(d, today, now));
        out.push(EntityComparison {
            id: id.to_string(),
            kind: EntityKind::Deck,
            change: classify(l.as_ref(), r.as_ref()),
            local: l,
            remote: r,
        });
    }

    let local_series: BTreeMap<&str, &DeckSeries> =
        local.deck_series.iter().map(|s| (s.id.as_str(), s)).collect();
    let remote_series: BTreeMap<&str, &DeckSeries> =
        remote.deck_series.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut series_ids: Vec<&str> = local_series.keys().chain(remote_series.keys()).copied().collect();
    series_ids.sort_unstable();
    series_ids.dedup();
    for id in series_ids {
        let l = local_series
            .get(id)
            .map(|s| summarize_series(s, &local_decks, today, now));
        let r = remote_series
            .get(id)
            .map(|s| summarize_series(s, &remote_decks, today, now));
        out.push(EntityComparison {
            id: id.to_string(),
            kind: EntityKind::Series,
            change: classify(l.as_ref(), r.as_ref()),
            local: l,
            remote: r,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flashcards::Card;
    use chrono::Duration;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()
    }

    #[test]
    fn test_state_machine() {
        assert_eq!(detect(false, false), ReplicaState::Clean);
        assert_eq!(detect(true, false), ReplicaState::LocalAhead);
        assert_eq!(detect(false, true), ReplicaState::RemoteAhead);
        assert_eq!(detect(true, true), ReplicaState::Diverged);
    }

    #[test]
    fn test_change_detection_from_timestamps() {
        let sync = Utc::now();
        let before = sync - Duration::minutes(5);
        let after = sync + Duration::minutes(5);

        assert!(!local_has_changes(None, None));
        assert!(local_has_changes(Some(before), None));
        assert!(!local_has_changes(Some(before), Some(sync)));
        assert!(!local_has_changes(Some(sync), Some(sync)));
        assert!(local_has_changes(Some(after), Some(sync)));

        assert!(!remote_has_changes(None, Some(sync)));
        assert!(remote_has_changes(Some(before), None));
        assert!(!remote_has_changes(Some(before), Some(sync)));
        assert!(remote_has_changes(Some(after), Some(sync)));
    }

    #[test]
    fn test_snapshot_hash_ignores_export_time_and_review_ids() {
        let mut a = FullBackupData::default();
        a.decks.push(Deck::flashcards("A".to_string(), Vec::new()));
        a.reviews.push(crate::storage::ReviewLog::new(
            "i".to_string(),
            "d".to_string(),
            crate::flashcards::Rating::Good,
            0.3,
        ));

        let mut b = a.clone();
        b.exported_at = a.exported_at + Duration::hours(3);
        b.reviews[0].id = Some(17);
        assert_eq!(snapshot_hash(&a), snapshot_hash(&b));

        b.decks[0].name = "Renamed".to_string();
        assert_ne!(snapshot_hash(&a), snapshot_hash(&b));
    }

    #[test]
    fn test_compare_snapshots() {
        let shared = Deck::flashcards(
            "Shared".to_string(),
            vec![Card::new("a".to_string(), "b".to_string(), today())],
        );
        let mut edited = shared.clone();
        edited.name = "Shared (edited)".to_string();
        let local_only = Deck::flashcards("Mine".to_string(), Vec::new());
        let untouched = Deck::flashcards("Same".to_string(), Vec::new());

        let mut local = FullBackupData::default();
        local.decks = vec![shared.clone(), local_only.clone(), untouched.clone()];
        let mut remote = FullBackupData::default();
        remote.decks = vec![edited, untouched.clone()];

        let diff = compare_snapshots(&local, &remote, today(), Utc::now());
        let change_of = |id: &str| diff.iter().find(|c| c.id == id).unwrap().change;

        assert_eq!(diff.len(), 3);
        assert_eq!(change_of(&shared.id), ChangeKind::Changed);
        assert_eq!(change_of(&local_only.id), ChangeKind::LocalOnly);
        assert_eq!(change_of(&untouched.id), ChangeKind::Unchanged);

        let changed = diff.iter().find(|c| c.id == shared.id).unwrap();
        assert!(changed.needs_choice());
        assert_eq!(changed.name(), "Shared");
        assert_eq!(changed.remote.as_ref().unwrap().item_count, 1);
    }
}
