//! Data models for reviewable study items

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Ease factor given to items that have never been reviewed
pub const DEFAULT_EASE_FACTOR: f64 = 2.5;

/// Tag attached to leeches when the policy says to flag rather than suspend
pub const LEECH_TAG: &str = "leech";

/// Spaced repetition state shared by every reviewable item.
///
/// Serialized flat into the owning card or question, so a card on disk reads
/// `{"id": .., "front": .., "dueDate": .., "interval": .., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewState {
    /// Date the item next becomes eligible for review
    pub due_date: NaiveDate,
    /// Days since last successful review (0 = never graduated)
    #[serde(default)]
    pub interval: u32,
    #[serde(default = "default_ease_factor")]
    pub ease_factor: f64,
    /// Number of "Again" ratings
    #[serde(default)]
    pub lapses: u32,
    /// Confidence snapshot in [0, 1] taken at the last review
    #[serde(default)]
    pub mastery_level: f64,
    #[serde(default)]
    pub suspended: bool,
}

fn default_ease_factor() -> f64 {
    DEFAULT_EASE_FACTOR
}

impl ReviewState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            due_date: today,
            interval: 0,
            ease_factor: DEFAULT_EASE_FACTOR,
            lapses: 0,
            mastery_level: 0.0,
            suspended: false,
        }
    }

    /// An item is new until its first successful review
    pub fn is_new(&self) -> bool {
        self.interval == 0
    }

    /// Check if the item is due for review on `today`
    pub fn is_due(&self, today: NaiveDate) -> bool {
        !self.suspended && !self.is_new() && self.due_date <= today
    }
}

/// Anything the scheduler can rate: cards and questions.
pub trait Reviewable {
    fn id(&self) -> &str;
    fn review(&self) -> &ReviewState;
    fn review_mut(&mut self) -> &mut ReviewState;
    fn tags_mut(&mut self) -> &mut Vec<String>;

    fn is_new(&self) -> bool {
        self.review().is_new()
    }
}

/// A flashcard with a prompt (front) and answer (back)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub front: String,
    pub back: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub review: ReviewState,
}

impl Card {
    pub fn new(front: String, back: String, today: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            front,
            back,
            tags: Vec::new(),
            review: ReviewState::new(today),
        }
    }
}

impl Reviewable for Card {
    fn id(&self) -> &str {
        &self.id
    }

    fn review(&self) -> &ReviewState {
        &self.review
    }

    fn review_mut(&mut self) -> &mut ReviewState {
        &mut self.review
    }

    fn tags_mut(&mut self) -> &mut Vec<String> {
        &mut self.tags
    }
}

/// A multiple-choice question used by quiz and learning decks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub review: ReviewState,
}

impl Question {
    pub fn new(prompt: String, options: Vec<String>, correct_answer: String, today: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt,
            options,
            correct_answer,
            explanation: None,
            tags: Vec::new(),
            review: ReviewState::new(today),
        }
    }
}

impl Reviewable for Question {
    fn id(&self) -> &str {
        &self.id
    }

    fn review(&self) -> &ReviewState {
        &self.review
    }

    fn review_mut(&mut self) -> &mut ReviewState {
        &mut self.review
    }

    fn tags_mut(&mut self) -> &mut Vec<String> {
        &mut self.tags
    }
}

/// Instructional block in a learning deck; reading it unlocks questions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoCard {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub unlocks_question_ids: Vec<String>,
}

/// Outcome of a single review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Again,
    Good,
    /// Good with a larger interval bonus
    Easy,
}

impl Rating {
    pub fn is_success(self) -> bool {
        !matches!(self, Rating::Again)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum RatingError {
    #[error("Invalid rating value: {0}")]
    InvalidValue(i64),
    #[error("Invalid rating name: {0}")]
    InvalidName(String),
}

/// Map UI rating buttons (1-3: Again, Good, Easy) to a rating
impl TryFrom<i64> for Rating {
    type Error = RatingError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Rating::Again),
            2 => Ok(Rating::Good),
            3 => Ok(Rating::Easy),
            other => Err(RatingError::InvalidValue(other)),
        }
    }
}

impl FromStr for Rating {
    type Err = RatingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "again" | "1" => Ok(Rating::Again),
            "good" | "2" => Ok(Rating::Good),
            "easy" | "3" => Ok(Rating::Easy),
            _ => Err(RatingError::InvalidName(s.to_string())),
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rating::Again => "again",
            Rating::Good => "good",
            Rating::Easy => "easy",
        };
        f.write_str(name)
    }
}

/// What to do with an item once it crosses the leech threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeechAction {
    #[default]
    Suspend,
    Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeechPolicy {
    pub threshold: u32,
    pub action: LeechAction,
}

impl Default for LeechPolicy {
    fn default() -> Self {
        Self {
            threshold: 8,
            action: LeechAction::Suspend,
        }
    }
}

/// Statistics for a deck
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStats {
    pub total_items: usize,
    pub new_items: usize,
    pub due_items: usize,
    pub suspended_items: usize,
    /// Average effective mastery over non-suspended items
    pub average_mastery: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_serializes_flat() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let card = Card::new("front".to_string(), "back".to_string(), today);
        let json = serde_json::to_value(&card).unwrap();

        assert_eq!(json["dueDate"], "2026-03-01");
        assert_eq!(json["interval"], 0);
        assert_eq!(json["easeFactor"], 2.5);
        assert!(json.get("review").is_none());

        let back: Card = serde_json::from_value(json).unwrap();
        assert_eq!(back, card);
    }

    #[test]
    fn test_review_state_defaults() {
        let card: Card = serde_json::from_str(
            r#"{"id":"c1","front":"a","back":"b","dueDate":"2026-01-01"}"#,
        )
        .unwrap();

        assert!(card.is_new());
        assert_eq!(card.review.ease_factor, DEFAULT_EASE_FACTOR);
        assert_eq!(card.review.mastery_level, 0.0);
    }

    #[test]
    fn test_rating_parsing() {
        assert_eq!(Rating::try_from(1), Ok(Rating::Again));
        assert_eq!(Rating::try_from(3), Ok(Rating::Easy));
        assert_eq!(Rating::try_from(7), Err(RatingError::InvalidValue(7)));
        assert_eq!("Good".parse::<Rating>(), Ok(Rating::Good));
        assert!("hard".parse::<Rating>().is_err());
    }

    #[test]
    fn test_is_due_excludes_new_and_suspended() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mut state = ReviewState::new(today);
        assert!(!state.is_due(today));

        state.interval = 3;
        assert!(state.is_due(today));

        state.suspended = true;
        assert!(!state.is_due(today));
    }
}
