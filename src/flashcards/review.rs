//! Review use cases on top of the local store.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use super::algorithm::{apply_rating, review_stats, select_due_items};
use super::models::{LeechPolicy, Rating, ReviewStats, Reviewable};
use crate::storage::{Deck, LocalStore, ReviewLog, SessionKind, SessionState, StorageError};

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Item {item_id} not found in deck {deck_id}")]
    ItemNotFound { deck_id: String, item_id: String },

    #[error("Deck {0} has been deleted")]
    DeckDeleted(String),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

/// Result of answering one item
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub deck: Deck,
    /// Stored log, with its surrogate id filled in
    pub log: ReviewLog,
    /// The rating pushed the item over the leech threshold
    pub became_leech: bool,
}

/// Rate one item and persist the deck together with its review log
pub fn review_item(
    store: &LocalStore,
    deck_id: &str,
    item_id: &str,
    rating: Rating,
    leech_policy: &LeechPolicy,
    today: NaiveDate,
) -> Result<ReviewOutcome> {
    let mut deck = store.get_deck(deck_id)?;
    if deck.is_deleted() {
        return Err(ReviewError::DeckDeleted(deck_id.to_string()));
    }

    let (before, after) = if let Some(card) = deck.find_card_mut(item_id) {
        let updated = apply_rating(&*card, rating, leech_policy, today);
        let before = card.review().clone();
        *card = updated;
        (before, card.review().clone())
    } else if let Some(question) = deck.find_question_mut(item_id) {
        let updated = apply_rating(&*question, rating, leech_policy, today);
        let before = question.review().clone();
        *question = updated;
        (before, question.review().clone())
    } else {
        return Err(ReviewError::ItemNotFound {
            deck_id: deck_id.to_string(),
            item_id: item_id.to_string(),
        });
    };

    deck.touch();
    let mut log = ReviewLog::new(
        item_id.to_string(),
        deck_id.to_string(),
        rating,
        after.mastery_level,
    );
    log.id = Some(store.record_review(&deck, &log)?);

    log::debug!(
        "Reviewed {} as {}: interval {} -> {}",
        item_id,
        rating,
        before.interval,
        after.interval
    );

    Ok(ReviewOutcome {
        deck,
        log,
        became_leech: rating == Rating::Again
            && leech_policy.threshold > 0
            && before.lapses < leech_policy.threshold
            && after.lapses >= leech_policy.threshold,
    })
}

/// Items to study now: due reviews, then up to `new_limit` new items
pub fn due_items(deck: &Deck, today: NaiveDate, now: DateTime<Utc>, new_limit: usize) -> Vec<&dyn Reviewable> {
    select_due_items(deck.items(), today, now, new_limit)
}

pub fn deck_stats(deck: &Deck, today: NaiveDate, now: DateTime<Utc>) -> ReviewStats {
    review_stats(deck.review_states(), today, now)
}

/// Resume a saved session for the deck, or start one from the current due queue
pub fn start_session(
    store: &LocalStore,
    deck: &Deck,
    kind: SessionKind,
    today: NaiveDate,
    new_limit: usize,
) -> Result<SessionState> {
    if let Some(saved) = store.load_session(&deck.id, kind)? {
        if !saved.is_finished() {
            return Ok(saved);
        }
    }

    let queue = due_items(deck, today, Utc::now(), new_limit)
        .into_iter()
        .map(|item| item.id().to_string())
        .collect();
    let session = SessionState::new(&deck.id, kind, queue);
    store.save_session(&session)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flashcards::{Card, LeechAction};
    use crate::storage::DeckContent;
    use tempfile::TempDir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 4).unwrap()
    }

    fn setup() -> (LocalStore, Deck, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&dir.path().join("mnemo.db")).unwrap();
        let deck = Deck::flashcards(
            "Spanish".to_string(),
            vec![
                Card::new("perro".to_string(), "dog".to_string(), today()),
                Card::new("gato".to_string(), "cat".to_string(), today()),
            ],
        );
        store.put(&deck).unwrap();
        (store, deck, dir)
    }

    #[test]
    fn test_review_persists_deck_and_log() {
        let (store, deck, _dir) = setup();
        let item_id = deck.items()[0].id().to_string();

        let outcome = review_item(
            &store,
            &deck.id,
            &item_id,
            Rating::Good,
            &LeechPolicy::default(),
            today(),
        )
        .unwrap();

        assert!(outcome.log.id.is_some());
        assert!(outcome.deck.last_modified >= deck.last_modified);

        let stored = store.get_deck(&deck.id).unwrap();
        assert_eq!(stored.items()[0].review().interval, 1);
        assert_eq!(store.get_reviews().unwrap(), vec![outcome.log]);
    }

    #[test]
    fn test_unknown_item_is_rejected() {
        let (store, deck, _dir) = setup();
        let err = review_item(
            &store,
            &deck.id,
            "missing",
            Rating::Good,
            &LeechPolicy::default(),
            today(),
        )
        .unwrap_err();
        assert!(matches!(err, ReviewError::ItemNotFound { .. }));
        assert!(store.get_reviews().unwrap().is_empty());
    }

    #[test]
    fn test_leech_is_reported() {
        let (store, deck, _dir) = setup();
        let item_id = deck.items()[0].id().to_string();
        let policy = LeechPolicy {
            threshold: 2,
            action: LeechAction::Suspend,
        };

        let first = review_item(&store, &deck.id, &item_id, Rating::Again, &policy, today()).unwrap();
        assert!(!first.became_leech);
        let second = review_item(&store, &deck.id, &item_id, Rating::Again, &policy, today()).unwrap();
        assert!(second.became_leech);
    }

    #[test]
    fn test_tagged_leech_is_reported_once() {
        let (store, deck, _dir) = setup();
        let item_id = deck.items()[0].id().to_string();
        let policy = LeechPolicy {
            threshold: 1,
            action: LeechAction::Tag,
        };

        let first = review_item(&store, &deck.id, &item_id, Rating::Again, &policy, today()).unwrap();
        assert!(first.became_leech);
        let DeckContent::Flashcard { cards } = &first.deck.content else {
            panic!("expected a flashcard deck");
        };
        assert_eq!(cards[0].tags, vec![crate::flashcards::LEECH_TAG.to_string()]);
        assert!(!cards[0].review.suspended);

        let second = review_item(&store, &deck.id, &item_id, Rating::Again, &policy, today()).unwrap();
        assert!(!second.became_leech);
    }

    #[test]
    fn test_session_resumes_until_finished() {
        let (store, deck, _dir) = setup();

        let mut session = start_session(&store, &deck, SessionKind::Review, today(), 10).unwrap();
        assert_eq!(session.item_queue.len(), 2);

        session.advance();
        store.save_session(&session).unwrap();
        let resumed = start_session(&store, &deck, SessionKind::Review, today(), 10).unwrap();
        assert_eq!(resumed.current_index, 1);

        session.advance();
        store.save_session(&session).unwrap();
        let fresh = start_session(&store, &deck, SessionKind::Review, today(), 1).unwrap();
        assert_eq!(fresh.current_index, 0);
        assert_eq!(fresh.item_queue.len(), 1);
    }
}
