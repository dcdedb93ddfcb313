//! Whole-entity merge of two snapshots.
//!
//! Decks and series present on both sides are taken wholesale from the side
//! the strategy names (local when it names nothing). Edits made to the same
//! deck on two devices therefore cannot both survive.
//!
//! The remaining collections have no user choice:
//! - folders and chat history: union by id, local wins
//! - review logs: union, duplicates dropped, ordered by time
//! - series and learning progress: union of the completed/read sets
//! - sessions and settings: local only

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::storage::{
    ChatMessage, FullBackupData, LearningProgress, ReviewLog, SeriesProgress,
    CURRENT_SCHEMA_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[default]
    Local,
    Remote,
}

/// Per-entity choice of which replica to keep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStrategy {
    choices: BTreeMap<String, Resolution>,
}

impl MergeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn choose(&mut self, id: impl Into<String>, resolution: Resolution) -> &mut Self {
        self.choices.insert(id.into(), resolution);
        self
    }

    pub fn with(mut self, id: impl Into<String>, resolution: Resolution) -> Self {
        self.choose(id, resolution);
        self
    }

    /// Take the remote copy of every listed id
    pub fn prefer_remote<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            choices: ids.into_iter().map(|id| (id.into(), Resolution::Remote)).collect(),
        }
    }

    pub fn resolution_for(&self, id: &str) -> Resolution {
        self.choices.get(id).copied().unwrap_or_default()
    }

    pub fn remote_choices(&self) -> usize {
        self.choices
            .values()
            .filter(|r| **r == Resolution::Remote)
            .count()
    }
}

/// Merge two snapshots deterministically.
///
/// Order is stable: local entities in local order, then remote-only entities
/// in remote order.
pub fn merge_data(local: &FullBackupData, remote: &FullBackupData, strategy: &MergeStrategy) -> FullBackupData {
    FullBackupData {
        schema_version: CURRENT_SCHEMA_VERSION,
        exported_at: local.exported_at.max(remote.exported_at),
        decks: pick_entities(&local.decks, &remote.decks, |d| &d.id, strategy),
        folders: union_by_id(&local.folders, &remote.folders, |f| &f.id),
        deck_series: pick_entities(&local.deck_series, &remote.deck_series, |s| &s.id, strategy),
        reviews: merge_reviews(&local.reviews, &remote.reviews),
        sessions: local.sessions.clone(),
        series_progress: merge_series_progress(&local.series_progress, &remote.series_progress),
        learning_progress: merge_learning_progress(&local.learning_progress, &remote.learning_progress),
        chat_history: merge_chat(&local.chat_history, &remote.chat_history),
        settings: local.settings.clone(),
    }
}

fn pick_entities<T, F>(local: &[T], remote: &[T], id: F, strategy: &MergeStrategy) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> &String,
{
    let remote_by_id: BTreeMap<&String, &T> = remote.iter().map(|e| (id(e), e)).collect();
    let local_ids: BTreeSet<&String> = local.iter().map(&id).collect();

    let mut merged: Vec<T> = local
        .iter()
        .map(|entity| match (strategy.resolution_for(id(entity)), remote_by_id.get(id(entity))) {
            (Resolution::Remote, Some(theirs)) => (*theirs).clone(),
            _ => entity.clone(),
        })
        .collect();

    merged.extend(
        remote
            .iter()
            .filter(|e| !local_ids.contains(id(e)))
            .cloned(),
    );
    merged
}

fn union_by_id<T, F>(local: &[T], remote: &[T], id: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> &String,
{
    let local_ids: BTreeSet<&String> = local.iter().map(&id).collect();
    local
        .iter()
        .chain(remote.iter().filter(|e| !local_ids.contains(id(e))))
        .cloned()
        .collect()
}

fn merge_reviews(local: &[ReviewLog], remote: &[ReviewLog]) -> Vec<ReviewLog> {
    let mut seen = HashSet::new();
    let mut merged: Vec<ReviewLog> = local
        .iter()
        .chain(remote)
        .filter(|r| seen.insert((r.item_id.clone(), r.deck_id.clone(), r.timestamp, r.rating)))
        .map(|r| ReviewLog { id: None, ..r.clone() })
        .collect();
    merged.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.deck_id.cmp(&b.deck_id))
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    merged
}

fn merge_series_progress(local: &[SeriesProgress], remote: &[SeriesProgress]) -> Vec<SeriesProgress> {
    let mut by_id: BTreeMap<&str, SeriesProgress> = BTreeMap::new();
    for progress in local.iter().chain(remote) {
        by_id
            .entry(progress.series_id.as_str())
            .and_modify(|p| p.completed_deck_ids.extend(progress.completed_deck_ids.iter().cloned()))
            .or_insert_with(|| progress.clone());
    }
    by_id.into_values().collect()
}

fn merge_learning_progress(local: &[LearningProgress], remote: &[LearningProgress]) -> Vec<LearningProgress> {
    let mut by_id: BTreeMap<&str, LearningProgress> = BTreeMap::new();
    for progress in local.iter().chain(remote) {
        by_id
            .entry(progress.deck_id.as_str())
            .and_modify(|p| {
                p.read_info_card_ids
                    .extend(progress.read_info_card_ids.iter().cloned());
                p.unlocked_question_ids
                    .extend(progress.unlocked_question_ids.iter().cloned());
                p.last_read_at = p.last_read_at.max(progress.last_read_at);
            })
            .or_insert_with(|| progress.clone());
    }
    by_id.into_values().collect()
}

fn merge_chat(local: &[ChatMessage], remote: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut merged = union_by_id(local, remote, |m| &m.id);
    merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flashcards::{Card, Rating};
    use crate::storage::{Deck, Folder};
    use chrono::{NaiveDate, Utc};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
    }

    fn deck(name: &str) -> Deck {
        Deck::flashcards(
            name.to_string(),
            vec![Card::new(name.to_string(), "back".to_string(), today())],
        )
    }

    fn diverged() -> (FullBackupData, FullBackupData, Deck, Deck) {
        let base = deck("Shared");
        let mut ours = base.clone();
        ours.name = "Shared (local)".to_string();
        let mut theirs = base;
        theirs.name = "Shared (remote)".to_string();

        let mut local = FullBackupData::default();
        local.decks = vec![ours.clone(), deck("Local only")];
        let mut remote = FullBackupData::default();
        remote.decks = vec![deck("Remote only"), theirs.clone()];
        (local, remote, ours, theirs)
    }

    #[test]
    fn test_unlisted_ids_keep_local() {
        let (local, remote, ours, _) = diverged();
        let merged = merge_data(&local, &remote, &MergeStrategy::new());

        let names: Vec<&str> = merged.decks.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Shared (local)", "Local only", "Remote only"]);
        assert_eq!(merged.decks[0], ours);
    }

    #[test]
    fn test_remote_choice_takes_whole_entity() {
        let (local, remote, _, theirs) = diverged();
        let strategy = MergeStrategy::new().with(theirs.id.clone(), Resolution::Remote);

        let merged = merge_data(&local, &remote, &strategy);
        assert_eq!(merged.decks[0], theirs);
        assert_eq!(merged.decks.len(), 3);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let (local, remote, ours, _) = diverged();
        let strategy = MergeStrategy::prefer_remote([ours.id.clone()]);

        let first = merge_data(&local, &remote, &strategy);
        let second = merge_data(&local, &remote, &strategy);
        assert_eq!(first, second);
    }

    #[test]
    fn test_remote_choice_for_local_only_entity_keeps_it() {
        let (local, remote, _, _) = diverged();
        let local_only = local.decks[1].id.clone();
        let strategy = MergeStrategy::new().with(local_only.clone(), Resolution::Remote);

        let merged = merge_data(&local, &remote, &strategy);
        assert!(merged.decks.iter().any(|d| d.id == local_only));
    }

    #[test]
    fn test_side_collections() {
        let mut local = FullBackupData::default();
        let mut remote = FullBackupData::default();

        let folder = Folder::new("Languages".to_string());
        let mut renamed = folder.clone();
        renamed.name = "Other".to_string();
        local.folders.push(folder.clone());
        remote.folders.push(renamed);
        remote.folders.push(Folder::new("Science".to_string()));

        let review = ReviewLog::new("i".to_string(), "d".to_string(), Rating::Good, 0.4);
        local.reviews.push(ReviewLog { id: Some(1), ..review.clone() });
        remote.reviews.push(ReviewLog { id: Some(9), ..review.clone() });
        remote.reviews.push(ReviewLog {
            timestamp: review.timestamp + chrono::Duration::seconds(1),
            ..review.clone()
        });

        local.series_progress.push(SeriesProgress {
            series_id: "s".to_string(),
            completed_deck_ids: ["a".to_string()].into(),
        });
        remote.series_progress.push(SeriesProgress {
            series_id: "s".to_string(),
            completed_deck_ids: ["b".to_string()].into(),
        });
        local.settings.insert("theme".to_string(), serde_json::json!("dark"));
        remote.settings.insert("theme".to_string(), serde_json::json!("light"));

        let merged = merge_data(&local, &remote, &MergeStrategy::new());

        assert_eq!(merged.folders.len(), 2);
        assert_eq!(merged.folders[0], folder);
        assert_eq!(merged.reviews.len(), 2);
        assert!(merged.reviews.iter().all(|r| r.id.is_none()));
        assert_eq!(merged.series_progress[0].completed_deck_ids.len(), 2);
        assert_eq!(merged.settings["theme"], serde_json::json!("dark"));
        assert!(merged.exported_at <= Utc::now());
    }
}
