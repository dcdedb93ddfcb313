use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flashcards::{Card, InfoCard, Question, Rating, ReviewState, Reviewable};

/// What a deck holds, tagged by deck type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeckContent {
    Flashcard {
        #[serde(default)]
        cards: Vec<Card>,
    },
    Quiz {
        #[serde(default)]
        questions: Vec<Question>,
    },
    Learning {
        #[serde(default)]
        questions: Vec<Question>,
        #[serde(default, rename = "infoCards")]
        info_cards: Vec<InfoCard>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deck {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub content: DeckContent,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    /// Soft delete marker; purged after the retention window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Weak reference into the folder collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

impl Deck {
    pub fn new(name: String, content: DeckContent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description: None,
            content,
            created_at: now,
            last_modified: now,
            archived: false,
            deleted_at: None,
            folder_id: None,
        }
    }

    pub fn flashcards(name: String, cards: Vec<Card>) -> Self {
        Self::new(name, DeckContent::Flashcard { cards })
    }

    pub fn quiz(name: String, questions: Vec<Question>) -> Self {
        Self::new(name, DeckContent::Quiz { questions })
    }

    pub fn kind(&self) -> &'static str {
        match self.content {
            DeckContent::Flashcard { .. } => "flashcard",
            DeckContent::Quiz { .. } => "quiz",
            DeckContent::Learning { .. } => "learning",
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// All reviewable items in the deck
    pub fn items(&self) -> Vec<&dyn Reviewable> {
        match &self.content {
            DeckContent::Flashcard { cards } => cards.iter().map(|c| c as &dyn Reviewable).collect(),
            DeckContent::Quiz { questions } | DeckContent::Learning { questions, .. } => {
                questions.iter().map(|q| q as &dyn Reviewable).collect()
            }
        }
    }

    pub fn review_states(&self) -> Vec<&ReviewState> {
        self.items().into_iter().map(|item| item.review()).collect()
    }

    pub fn item_count(&self) -> usize {
        match &self.content {
            DeckContent::Flashcard { cards } => cards.len(),
            DeckContent::Quiz { questions } | DeckContent::Learning { questions, .. } => questions.len(),
        }
    }

    pub fn find_card_mut(&mut self, item_id: &str) -> Option<&mut Card> {
        match &mut self.content {
            DeckContent::Flashcard { cards } => cards.iter_mut().find(|c| c.id == item_id),
            _ => None,
        }
    }

    pub fn find_question_mut(&mut self, item_id: &str) -> Option<&mut Question> {
        match &mut self.content {
            DeckContent::Quiz { questions } | DeckContent::Learning { questions, .. } => {
                questions.iter_mut().find(|q| q.id == item_id)
            }
            _ => None,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

impl Folder {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            position: 0,
            created_at: Utc::now(),
        }
    }
}

/// One level of a series; decks are referenced by id, not owned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesLevel {
    pub title: String,
    #[serde(default)]
    pub deck_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckSeries {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub levels: Vec<SeriesLevel>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DeckSeries {
    pub fn new(name: String, levels: Vec<SeriesLevel>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description: None,
            levels,
            created_at: now,
            last_modified: now,
            archived: false,
            deleted_at: None,
        }
    }

    pub fn deck_ids(&self) -> impl Iterator<Item = &str> {
        self.levels
            .iter()
            .flat_map(|level| level.deck_ids.iter().map(String::as_str))
    }
}

/// Completed decks within a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesProgress {
    pub series_id: String,
    #[serde(default)]
    pub completed_deck_ids: BTreeSet<String>,
}

/// Read/unlocked state of a learning deck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningProgress {
    pub deck_id: String,
    #[serde(default)]
    pub read_info_card_ids: BTreeSet<String>,
    #[serde(default)]
    pub unlocked_question_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Append-only record of a single review action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewLog {
    /// Surrogate key assigned by the local store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub item_id: String,
    pub deck_id: String,
    pub timestamp: DateTime<Utc>,
    pub rating: Rating,
    pub mastery_level: f64,
}

impl ReviewLog {
    pub fn new(item_id: String, deck_id: String, rating: Rating, mastery_level: f64) -> Self {
        Self {
            id: None,
            item_id,
            deck_id,
            timestamp: Utc::now(),
            rating,
            mastery_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    Review,
    Quiz,
    Learning,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionKind::Review => "review",
            SessionKind::Quiz => "quiz",
            SessionKind::Learning => "learning",
        };
        f.write_str(name)
    }
}

/// Deterministic key for a resumable session
pub fn session_key(deck_id: &str, kind: SessionKind) -> String {
    format!("session_{}_{}", kind, deck_id)
}

/// Resumable snapshot of an in-progress session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub key: String,
    pub deck_id: String,
    pub kind: SessionKind,
    /// Remaining item ids, in presentation order
    #[serde(default)]
    pub item_queue: Vec<String>,
    #[serde(default)]
    pub current_index: usize,
    #[serde(default)]
    pub items_completed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_info_card_ids: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocked_question_ids: Option<BTreeSet<String>>,
    pub saved_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(deck_id: &str, kind: SessionKind, item_queue: Vec<String>) -> Self {
        let learning = kind == SessionKind::Learning;
        Self {
            key: session_key(deck_id, kind),
            deck_id: deck_id.to_string(),
            kind,
            item_queue,
            current_index: 0,
            items_completed: 0,
            read_info_card_ids: learning.then(BTreeSet::new),
            unlocked_question_ids: learning.then(BTreeSet::new),
            saved_at: Utc::now(),
        }
    }

    pub fn current_item(&self) -> Option<&str> {
        self.item_queue.get(self.current_index).map(String::as_str)
    }

    /// Move past the current item, counting it as completed
    pub fn advance(&mut self) {
        if self.current_index < self.item_queue.len() {
            self.current_index += 1;
            self.items_completed += 1;
        }
        self.saved_at = Utc::now();
    }

    pub fn is_finished(&self) -> bool {
        self.current_index >= self.item_queue.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deck_id: Option<String>,
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}
