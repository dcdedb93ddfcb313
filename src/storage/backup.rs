//! Full backup snapshot: the export/import document and the sync wire format.
//!
//! Documents carry a `version` number. Older documents are migrated one version
//! at a time before any typed data is produced:
//! - v1: decks + reviews + settings; decks have no `type` or `lastModified`,
//!   review logs reference `cardId`
//! - v2: adds folders, series and sessions; series progress is an object
//!   `{seriesId: [deckId]}`
//! - v3: series progress is a list of records; adds learning progress and chat
//!   history
//!
//! Arrays may contain `null` holes left by interrupted writes. Those are
//! dropped; any other invalid element rejects the whole document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::models::{
    ChatMessage, Deck, DeckSeries, Folder, LearningProgress, ReviewLog, SeriesProgress,
    SessionState,
};

/// Version written by this build
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Free-form user settings, keyed by setting name
pub type Settings = BTreeMap<String, Value>;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed backup at {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("Unsupported backup version {found} (newest supported is {newest})")]
    UnsupportedVersion { found: u64, newest: u32 },
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Every managed collection plus settings, at the current schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullBackupData {
    #[serde(rename = "version", alias = "schemaVersion")]
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub decks: Vec<Deck>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub deck_series: Vec<DeckSeries>,
    #[serde(default)]
    pub reviews: Vec<ReviewLog>,
    #[serde(default)]
    pub sessions: Vec<SessionState>,
    #[serde(default)]
    pub series_progress: Vec<SeriesProgress>,
    #[serde(default)]
    pub learning_progress: Vec<LearningProgress>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub settings: Settings,
}

impl Default for FullBackupData {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            exported_at: Utc::now(),
            decks: Vec::new(),
            folders: Vec::new(),
            deck_series: Vec::new(),
            reviews: Vec::new(),
            sessions: Vec::new(),
            series_progress: Vec::new(),
            learning_progress: Vec::new(),
            chat_history: Vec::new(),
            settings: Settings::new(),
        }
    }
}

impl FullBackupData {
    pub fn is_empty(&self) -> bool {
        self.decks.is_empty()
            && self.folders.is_empty()
            && self.deck_series.is_empty()
            && self.reviews.is_empty()
            && self.sessions.is_empty()
            && self.series_progress.is_empty()
            && self.learning_progress.is_empty()
            && self.chat_history.is_empty()
            && self.settings.is_empty()
    }

    /// Serialize to the wire/file format
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a document of any supported version
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        parse_backup(bytes)
    }
}

/// Known document versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

impl SchemaVersion {
    fn from_number(found: u64) -> Result<Self> {
        match found {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            _ => Err(BackupError::UnsupportedVersion {
                found,
                newest: CURRENT_SCHEMA_VERSION,
            }),
        }
    }
}

/// A raw document tagged with the version it was written at
#[derive(Debug, Clone, PartialEq)]
pub enum BackupDocument {
    V1(Map<String, Value>),
    V2(Map<String, Value>),
    V3(Map<String, Value>),
}

impl BackupDocument {
    /// Inspect the `version` field; documents without one predate versioning
    pub fn detect(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(malformed("$", "expected a JSON object"));
        };

        let version = match map.get("version").or_else(|| map.get("schemaVersion")) {
            None | Some(Value::Null) => SchemaVersion::V1,
            Some(Value::Number(n)) => {
                let found = n
                    .as_u64()
                    .ok_or_else(|| malformed("$.version", "expected a positive integer"))?;
                SchemaVersion::from_number(found)?
            }
            Some(_) => return Err(malformed("$.version", "expected a number")),
        };

        Ok(match version {
            SchemaVersion::V1 => Self::V1(map),
            SchemaVersion::V2 => Self::V2(map),
            SchemaVersion::V3 => Self::V3(map),
        })
    }

    pub fn version(&self) -> SchemaVersion {
        match self {
            Self::V1(_) => SchemaVersion::V1,
            Self::V2(_) => SchemaVersion::V2,
            Self::V3(_) => SchemaVersion::V3,
        }
    }

    /// Apply a single migration step; the current version is returned as-is
    pub fn migrate(self) -> Result<Self> {
        match self {
            Self::V1(map) => migrate_v1_to_v2(map).map(Self::V2),
            Self::V2(map) => migrate_v2_to_v3(map).map(Self::V3),
            current @ Self::V3(_) => Ok(current),
        }
    }

    /// Migrate to the current version and build typed data
    pub fn into_current(self) -> Result<FullBackupData> {
        let mut doc = self;
        while doc.version() != SchemaVersion::V3 {
            let from = doc.version();
            doc = doc.migrate()?;
            log::info!("Backup: migrated document from {:?} to {:?}", from, doc.version());
        }

        let Self::V3(map) = doc else {
            return Err(malformed("$", "migration did not reach the current version"));
        };
        build_current(map)
    }
}

/// Parse, migrate and validate a backup document
pub fn parse_backup(bytes: &[u8]) -> Result<FullBackupData> {
    let value: Value = serde_json::from_slice(bytes)?;
    BackupDocument::detect(value)?.into_current()
}

fn migrate_v1_to_v2(mut map: Map<String, Value>) -> Result<Map<String, Value>> {
    let exported_at = map
        .get("exportedAt")
        .cloned()
        .unwrap_or_else(|| Value::String(Utc::now().to_rfc3339()));
    map.insert("exportedAt".to_string(), exported_at.clone());

    if let Some(decks) = array_mut(&mut map, "decks")? {
        for deck in decks.iter_mut().filter_map(Value::as_object_mut) {
            deck.entry("type")
                .or_insert_with(|| Value::String("flashcard".to_string()));
            let created = deck
                .get("createdAt")
                .cloned()
                .unwrap_or_else(|| exported_at.clone());
            deck.entry("createdAt").or_insert_with(|| created.clone());
            deck.entry("lastModified").or_insert(created);
        }
    }

    if let Some(reviews) = array_mut(&mut map, "reviews")? {
        for review in reviews.iter_mut().filter_map(Value::as_object_mut) {
            if let Some(card_id) = review.remove("cardId") {
                review.entry("itemId").or_insert(card_id);
            }
        }
    }

    for key in ["folders", "deckSeries", "sessions"] {
        map.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    }
    map.entry("seriesProgress")
        .or_insert_with(|| Value::Object(Map::new()));
    map.insert("version".to_string(), Value::from(SchemaVersion::V2 as u32));
    Ok(map)
}

fn migrate_v2_to_v3(mut map: Map<String, Value>) -> Result<Map<String, Value>> {
    let progress = match map.remove("seriesProgress") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(entries)) => entries
            .into_iter()
            .map(|(series_id, completed)| {
                let completed = match completed {
                    Value::Null => Value::Array(Vec::new()),
                    other => other,
                };
                serde_json::json!({ "seriesId": series_id, "completedDeckIds": completed })
            })
            .collect(),
        Some(Value::Array(records)) => records,
        Some(_) => return Err(malformed("$.seriesProgress", "expected an object")),
    };
    map.insert("seriesProgress".to_string(), Value::Array(progress));

    for key in ["learningProgress", "chatHistory"] {
        map.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    }
    map.insert("version".to_string(), Value::from(SchemaVersion::V3 as u32));
    Ok(map)
}

fn build_current(mut map: Map<String, Value>) -> Result<FullBackupData> {
    let exported_at = match map.remove("exportedAt") {
        None | Some(Value::Null) => Utc::now(),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| malformed("$.exportedAt", &e.to_string()))?,
    };

    let settings = match map.remove("settings") {
        None | Some(Value::Null) => Settings::new(),
        Some(Value::Object(entries)) => entries.into_iter().collect(),
        Some(_) => return Err(malformed("$.settings", "expected an object")),
    };

    Ok(FullBackupData {
        schema_version: CURRENT_SCHEMA_VERSION,
        exported_at,
        decks: take_collection(&mut map, "decks")?,
        folders: take_collection(&mut map, "folders")?,
        deck_series: take_collection(&mut map, "deckSeries")?,
        reviews: take_collection(&mut map, "reviews")?,
        sessions: take_collection(&mut map, "sessions")?,
        series_progress: take_collection(&mut map, "seriesProgress")?,
        learning_progress: take_collection(&mut map, "learningProgress")?,
        chat_history: take_collection(&mut map, "chatHistory")?,
        settings,
    })
}

/// Deserialize one array, dropping null holes and rejecting broken elements
fn take_collection<T: DeserializeOwned>(map: &mut Map<String, Value>, key: &str) -> Result<Vec<T>> {
    let items = match map.remove(key) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(malformed(&format!("$.{}", key), "expected an array")),
    };

    let total = items.len();
    let mut out = Vec::with_capacity(total);
    for (i, item) in items.into_iter().enumerate() {
        if item.is_null() {
            continue;
        }
        let parsed = serde_json::from_value(strip_nested_holes(item))
            .map_err(|e| malformed(&format!("$.{}[{}]", key, i), &e.to_string()))?;
        out.push(parsed);
    }

    if out.len() < total {
        log::warn!(
            "Backup: dropped {} null entries from {}",
            total - out.len(),
            key
        );
    }
    Ok(out)
}

/// Drop null holes from the item arrays nested inside a deck object
fn strip_nested_holes(mut value: Value) -> Value {
    if let Some(object) = value.as_object_mut() {
        for key in ["cards", "questions", "infoCards"] {
            if let Some(Value::Array(items)) = object.get_mut(key) {
                items.retain(|item| !item.is_null());
            }
        }
    }
    value
}

fn array_mut<'a>(map: &'a mut Map<String, Value>, key: &str) -> Result<Option<&'a mut Vec<Value>>> {
    match map.get_mut(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(malformed(&format!("$.{}", key), "expected an array")),
    }
}

fn malformed(path: &str, reason: &str) -> BackupError {
    BackupError::Malformed {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
