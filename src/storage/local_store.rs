//! SQLite-backed local store.
//!
//! Each collection lives in its own table as `(id, data)` rows holding JSON.
//! Review logs get an autoincrement surrogate key. A small `meta` table keeps
//! the `lastModified` high-water mark and opaque sync bookkeeping.
//!
//! Every mutation that touches user data bumps `lastModified` inside the same
//! transaction and pokes other sessions on the same database file afterwards.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::backup::{FullBackupData, Settings, CURRENT_SCHEMA_VERSION};
use super::models::{
    ChatMessage, Deck, DeckSeries, Folder, LearningProgress, ReviewLog, SeriesProgress,
    SessionKind, SessionState,
};
use super::notify::{self, StoreEvent, StoreEventKind};

/// Attempts made when SQLite reports the database busy or locked
const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(50);
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const LAST_MODIFIED_KEY: &str = "lastModified";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local storage unavailable: {0}")]
    Unavailable(String),

    #[error("Local storage quota exceeded")]
    QuotaExceeded,

    #[error("Local storage recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StorageError::QuotaExceeded,
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::ReadOnly) => {
                StorageError::Unavailable(e.to_string())
            }
            _ => StorageError::Sqlite(e),
        }
    }
}

impl StorageError {
    fn is_busy(&self) -> bool {
        match self {
            StorageError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// The managed collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Decks,
    Folders,
    DeckSeries,
    Reviews,
    Sessions,
    SeriesProgress,
    LearningProgress,
    ChatHistory,
    Settings,
}

impl Collection {
    pub const ALL: [Collection; 9] = [
        Collection::Decks,
        Collection::Folders,
        Collection::DeckSeries,
        Collection::Reviews,
        Collection::Sessions,
        Collection::SeriesProgress,
        Collection::LearningProgress,
        Collection::ChatHistory,
        Collection::Settings,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Collection::Decks => "decks",
            Collection::Folders => "folders",
            Collection::DeckSeries => "deck_series",
            Collection::Reviews => "reviews",
            Collection::Sessions => "sessions",
            Collection::SeriesProgress => "series_progress",
            Collection::LearningProgress => "learning_progress",
            Collection::ChatHistory => "chat_history",
            Collection::Settings => "settings",
        }
    }
}

/// A JSON document stored under a string key in one collection
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn record_key(&self) -> &str;
}

impl Record for Deck {
    const COLLECTION: Collection = Collection::Decks;
    fn record_key(&self) -> &str {
        &self.id
    }
}

impl Record for Folder {
    const COLLECTION: Collection = Collection::Folders;
    fn record_key(&self) -> &str {
        &self.id
    }
}

impl Record for DeckSeries {
    const COLLECTION: Collection = Collection::DeckSeries;
    fn record_key(&self) -> &str {
        &self.id
    }
}

impl Record for SessionState {
    const COLLECTION: Collection = Collection::Sessions;
    fn record_key(&self) -> &str {
        &self.key
    }
}

impl Record for SeriesProgress {
    const COLLECTION: Collection = Collection::SeriesProgress;
    fn record_key(&self) -> &str {
        &self.series_id
    }
}

impl Record for LearningProgress {
    const COLLECTION: Collection = Collection::LearningProgress;
    fn record_key(&self) -> &str {
        &self.deck_id
    }
}

impl Record for ChatMessage {
    const COLLECTION: Collection = Collection::ChatHistory;
    fn record_key(&self) -> &str {
        &self.id
    }
}

/// Counts of rows removed by `purge_deleted`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub decks: usize,
    pub series: usize,
    pub reviews: usize,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.decks == 0 && self.series == 0 && self.reviews == 0
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS decks (id TEXT PRIMARY KEY, data TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS folders (id TEXT PRIMARY KEY, data TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS deck_series (id TEXT PRIMARY KEY, data TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS reviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id TEXT NOT NULL,
    deck_id TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reviews_deck ON reviews(deck_id);
CREATE TABLE IF NOT EXISTS sessions (id TEXT PRIMARY KEY, data TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS series_progress (id TEXT PRIMARY KEY, data TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS learning_progress (id TEXT PRIMARY KEY, data TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS chat_history (id TEXT PRIMARY KEY, data TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS settings (id TEXT PRIMARY KEY, data TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
"#;

/// Transactional store over every collection the app persists
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    session_id: Uuid,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Open (or create) the store at `path`.
    ///
    /// If the database cannot be opened, it is moved aside and recreated once.
    /// A persistent marker prevents a second attempt: if recovery already ran
    /// and the store still fails, `RecoveryFailed` is returned.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = match open_connection(path) {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("Store: failed to open {}: {}", path.display(), e);
                recover(path, &e)?
            }
        };

        log::debug!("Store: opened {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            session_id: Uuid::new_v4(),
            events: notify::channel_for(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifies this session in change notifications
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Receive change notifications from every session on this database
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Run `op` against the connection, retrying while SQLite reports busy
    fn with_conn<T>(&self, mut op: impl FnMut(&mut Connection) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            let result = {
                let mut conn = self.lock()?;
                op(&mut *conn)
            };
            match result {
                Err(e) if e.is_busy() && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    log::warn!(
                        "Store: database busy, retrying ({}/{})",
                        attempt,
                        BUSY_RETRIES
                    );
                    std::thread::sleep(BUSY_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }

    fn notify(&self, kind: StoreEventKind) {
        notify::broadcast(
            &self.events,
            StoreEvent {
                origin: self.session_id,
                kind,
            },
        );
    }

    // ===== Typed collections =====

    pub fn get_all<T: Record>(&self) -> Result<Vec<T>> {
        self.with_conn(|conn| load_all(conn, T::COLLECTION.table()))
    }

    pub fn get<T: Record>(&self, key: &str) -> Result<Option<T>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT data FROM {} WHERE id = ?1", T::COLLECTION.table());
            let data: Option<String> = conn
                .query_row(&sql, params![key], |row| row.get(0))
                .optional()?;
            data.map(|d| serde_json::from_str(&d).map_err(StorageError::from))
                .transpose()
        })
    }

    pub fn put<T: Record>(&self, record: &T) -> Result<()> {
        self.put_many(std::slice::from_ref(record))
    }

    /// Upsert records in one transaction
    pub fn put_many<T: Record>(&self, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for record in records {
                insert_record(&tx, record, true)?;
            }
            touch(&tx)?;
            tx.commit()?;
            Ok(())
        })?;
        self.notify(StoreEventKind::DataChanged(vec![T::COLLECTION]));
        Ok(())
    }

    /// Hard delete by key; returns whether a row was removed
    pub fn delete_by_id<T: Record>(&self, key: &str) -> Result<bool> {
        let removed = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sql = format!("DELETE FROM {} WHERE id = ?1", T::COLLECTION.table());
            let removed = tx.execute(&sql, params![key])? > 0;
            if removed {
                touch(&tx)?;
            }
            tx.commit()?;
            Ok(removed)
        })?;
        if removed {
            self.notify(StoreEventKind::DataChanged(vec![T::COLLECTION]));
        }
        Ok(removed)
    }

    pub fn get_deck(&self, id: &str) -> Result<Deck> {
        self.get::<Deck>(id)?
            .ok_or_else(|| StorageError::NotFound(format!("deck {}", id)))
    }

    /// Mark a deck deleted; it is purged after the retention window
    pub fn soft_delete_deck(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut deck = self.get_deck(id)?;
        deck.deleted_at = Some(now);
        deck.last_modified = now;
        self.put(&deck)
    }

    // ===== Review logs =====

    pub fn get_reviews(&self) -> Result<Vec<ReviewLog>> {
        self.with_conn(|conn| load_reviews(conn))
    }

    pub fn get_reviews_for_deck(&self, deck_id: &str) -> Result<Vec<ReviewLog>> {
        Ok(self
            .get_reviews()?
            .into_iter()
            .filter(|log| log.deck_id == deck_id)
            .collect())
    }

    /// Append a review log, returning its surrogate id
    pub fn add_review(&self, log: &ReviewLog) -> Result<i64> {
        let id = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = insert_review(&tx, log)?;
            touch(&tx)?;
            tx.commit()?;
            Ok(id)
        })?;
        self.notify(StoreEventKind::DataChanged(vec![Collection::Reviews]));
        Ok(id)
    }

    /// Persist a rated deck and its review log together
    pub fn record_review(&self, deck: &Deck, log: &ReviewLog) -> Result<i64> {
        let id = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            insert_record(&tx, deck, true)?;
            let id = insert_review(&tx, log)?;
            touch(&tx)?;
            tx.commit()?;
            Ok(id)
        })?;
        self.notify(StoreEventKind::DataChanged(vec![
            Collection::Decks,
            Collection::Reviews,
        ]));
        Ok(id)
    }

    // ===== Sessions =====

    pub fn load_session(&self, deck_id: &str, kind: SessionKind) -> Result<Option<SessionState>> {
        self.get(&super::models::session_key(deck_id, kind))
    }

    pub fn save_session(&self, session: &SessionState) -> Result<()> {
        self.put(session)
    }

    pub fn clear_session(&self, deck_id: &str, kind: SessionKind) -> Result<bool> {
        self.delete_by_id::<SessionState>(&super::models::session_key(deck_id, kind))
    }

    // ===== Settings =====

    pub fn settings(&self) -> Result<Settings> {
        self.with_conn(|conn| load_settings(conn))
    }

    pub fn put_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO settings (id, data) VALUES (?1, ?2)",
                params![key, serde_json::to_string(value)?],
            )?;
            touch(&tx)?;
            tx.commit()?;
            Ok(())
        })?;
        self.notify(StoreEventKind::DataChanged(vec![Collection::Settings]));
        Ok(())
    }

    // ===== Metadata =====

    /// High-water mark bumped by every data mutation; `None` for a fresh store
    pub fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_meta(LAST_MODIFIED_KEY)
    }

    /// Read opaque bookkeeping; does not count as a data change
    pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.with_conn(|conn| read_meta(conn, key))
    }

    /// Write opaque bookkeeping without bumping `lastModified`
    pub fn set_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.with_conn(|conn| write_meta(conn, key, value))
    }

    pub fn remove_meta(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    // ===== Snapshots =====

    /// Read every collection in one consistent transaction
    pub fn export_snapshot(&self) -> Result<FullBackupData> {
        Ok(self.export_with_high_water()?.0)
    }

    /// Like `export_snapshot`, also returning the `lastModified` value the
    /// snapshot reflects. Any later write moves `lastModified` past it.
    pub fn export_with_high_water(&self) -> Result<(FullBackupData, Option<DateTime<Utc>>)> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let high_water = read_meta(&tx, LAST_MODIFIED_KEY)?;
            let snapshot = FullBackupData {
                schema_version: CURRENT_SCHEMA_VERSION,
                exported_at: Utc::now(),
                decks: load_all(&tx, Collection::Decks.table())?,
                folders: load_all(&tx, Collection::Folders.table())?,
                deck_series: load_all(&tx, Collection::DeckSeries.table())?,
                reviews: load_reviews(&tx)?,
                sessions: load_all(&tx, Collection::Sessions.table())?,
                series_progress: load_all(&tx, Collection::SeriesProgress.table())?,
                learning_progress: load_all(&tx, Collection::LearningProgress.table())?,
                chat_history: load_all(&tx, Collection::ChatHistory.table())?,
                settings: load_settings(&tx)?,
            };
            tx.commit()?;
            Ok((snapshot, high_water))
        })
    }

    /// Replace every collection with `snapshot`, all or nothing.
    ///
    /// Duplicate keys inside the snapshot abort the transaction, leaving the
    /// previous contents untouched. On success `lastModified` becomes now and
    /// that timestamp is returned.
    pub fn atomic_restore(&self, snapshot: &FullBackupData) -> Result<DateTime<Utc>> {
        let restored_at = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            clear_collections(&tx)?;

            insert_all(&tx, &snapshot.decks)?;
            insert_all(&tx, &snapshot.folders)?;
            insert_all(&tx, &snapshot.deck_series)?;
            for log in &snapshot.reviews {
                insert_review(&tx, log)?;
            }
            insert_all(&tx, &snapshot.sessions)?;
            insert_all(&tx, &snapshot.series_progress)?;
            insert_all(&tx, &snapshot.learning_progress)?;
            insert_all(&tx, &snapshot.chat_history)?;
            for (key, value) in &snapshot.settings {
                tx.execute(
                    "INSERT INTO settings (id, data) VALUES (?1, ?2)",
                    params![key, serde_json::to_string(value)?],
                )?;
            }

            let restored_at = touch(&tx)?;
            tx.commit()?;
            Ok(restored_at)
        })?;

        log::info!(
            "Store: restored snapshot ({} decks, {} reviews)",
            snapshot.decks.len(),
            snapshot.reviews.len()
        );
        self.notify(StoreEventKind::Restored);
        Ok(restored_at)
    }

    /// Wipe every collection and all sync bookkeeping
    pub fn factory_reset(&self) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            clear_collections(&tx)?;
            tx.execute("DELETE FROM meta", [])?;
            tx.commit()?;
            Ok(())
        })?;
        log::warn!("Store: factory reset of {}", self.path.display());
        self.notify(StoreEventKind::Reset);
        Ok(())
    }

    /// Hard-delete decks and series soft-deleted before `now - retention`,
    /// along with the review logs, sessions and progress of purged decks
    pub fn purge_deleted(&self, retention: chrono::Duration, now: DateTime<Utc>) -> Result<PurgeReport> {
        let cutoff = now - retention;
        let expired = |deleted_at: Option<DateTime<Utc>>| deleted_at.is_some_and(|at| at < cutoff);

        let report = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let decks: Vec<Deck> = load_all(&tx, Collection::Decks.table())?;
            let series: Vec<DeckSeries> = load_all(&tx, Collection::DeckSeries.table())?;
            let mut report = PurgeReport::default();

            for deck in decks.iter().filter(|d| expired(d.deleted_at)) {
                tx.execute("DELETE FROM decks WHERE id = ?1", params![deck.id])?;
                report.reviews +=
                    tx.execute("DELETE FROM reviews WHERE deck_id = ?1", params![deck.id])?;
                tx.execute("DELETE FROM learning_progress WHERE id = ?1", params![deck.id])?;
                for kind in [SessionKind::Review, SessionKind::Quiz, SessionKind::Learning] {
                    tx.execute(
                        "DELETE FROM sessions WHERE id = ?1",
                        params![super::models::session_key(&deck.id, kind)],
                    )?;
                }
                report.decks += 1;
            }

            for s in series.iter().filter(|s| expired(s.deleted_at)) {
                tx.execute("DELETE FROM deck_series WHERE id = ?1", params![s.id])?;
                tx.execute("DELETE FROM series_progress WHERE id = ?1", params![s.id])?;
                report.series += 1;
            }

            if !report.is_empty() {
                touch(&tx)?;
            }
            tx.commit()?;
            Ok(report)
        })?;

        if !report.is_empty() {
            log::info!(
                "Store: purged {} decks, {} series, {} review logs",
                report.decks,
                report.series,
                report.reviews
            );
            self.notify(StoreEventKind::DataChanged(vec![
                Collection::Decks,
                Collection::DeckSeries,
                Collection::Reviews,
            ]));
        }
        Ok(report)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        log::warn!("Store: {} stays in {} journal mode", path.display(), journal_mode);
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn recovery_marker(path: &Path) -> PathBuf {
    sibling(path, ".recovery-attempted")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Move the broken database aside and start fresh, at most once
fn recover(path: &Path, cause: &StorageError) -> Result<Connection> {
    let marker = recovery_marker(path);
    if marker.exists() {
        return Err(StorageError::RecoveryFailed(format!(
            "recovery was already attempted for {}: {}",
            path.display(),
            cause
        )));
    }
    fs::write(&marker, Utc::now().to_rfc3339())?;

    if path.exists() {
        let quarantine = sibling(path, ".corrupt");
        fs::rename(path, &quarantine)?;
        log::warn!(
            "Store: moved unreadable database to {}",
            quarantine.display()
        );
    }

    match open_connection(path) {
        Ok(conn) => {
            fs::remove_file(&marker)?;
            log::warn!("Store: recreated empty database at {}", path.display());
            Ok(conn)
        }
        Err(e) => Err(StorageError::RecoveryFailed(e.to_string())),
    }
}

fn touch(conn: &Connection) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    write_meta(conn, LAST_MODIFIED_KEY, &now)?;
    Ok(now)
}

fn read_meta<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    value
        .map(|v| serde_json::from_str(&v).map_err(StorageError::from))
        .transpose()
}

fn write_meta<T: Serialize + ?Sized>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

fn clear_collections(conn: &Connection) -> Result<()> {
    for collection in Collection::ALL {
        conn.execute(&format!("DELETE FROM {}", collection.table()), [])?;
    }
    Ok(())
}

fn load_all<T: DeserializeOwned>(conn: &Connection, table: &str) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(&format!("SELECT data FROM {} ORDER BY rowid", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut out = Vec::new();
    for data in rows {
        out.push(serde_json::from_str(&data?)?);
    }
    Ok(out)
}

fn load_reviews(conn: &Connection) -> Result<Vec<ReviewLog>> {
    let mut stmt = conn.prepare("SELECT id, data FROM reviews ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, data) = row?;
        let mut log: ReviewLog = serde_json::from_str(&data)?;
        log.id = Some(id);
        out.push(log);
    }
    Ok(out)
}

fn load_settings(conn: &Connection) -> Result<Settings> {
    let mut stmt = conn.prepare("SELECT id, data FROM settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut settings = Settings::new();
    for row in rows {
        let (key, data) = row?;
        settings.insert(key, serde_json::from_str(&data)?);
    }
    Ok(settings)
}

fn insert_record<T: Record>(conn: &Connection, record: &T, replace: bool) -> Result<()> {
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    let sql = format!(
        "{} INTO {} (id, data) VALUES (?1, ?2)",
        verb,
        T::COLLECTION.table()
    );
    conn.execute(&sql, params![record.record_key(), serde_json::to_string(record)?])?;
    Ok(())
}

fn insert_all<T: Record>(conn: &Connection, records: &[T]) -> Result<()> {
    for record in records {
        insert_record(conn, record, false)?;
    }
    Ok(())
}

/// Insert a review log; an explicit id is kept, otherwise one is assigned
fn insert_review(conn: &Connection, log: &ReviewLog) -> Result<i64> {
    let body = ReviewLog {
        id: None,
        ..log.clone()
    };
    let data = serde_json::to_string(&body)?;

    match log.id {
        Some(id) => {
            conn.execute(
                "INSERT INTO reviews (id, item_id, deck_id, data) VALUES (?1, ?2, ?3, ?4)",
                params![id, log.item_id, log.deck_id, data],
            )?;
            Ok(id)
        }
        None => {
            conn.execute(
                "INSERT INTO reviews (item_id, deck_id, data) VALUES (?1, ?2, ?3)",
                params![log.item_id, log.deck_id, data],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flashcards::{Card, Rating, Reviewable};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::open(&temp_dir.path().join("mnemo.db")).unwrap();
        (store, temp_dir)
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    fn deck(name: &str) -> Deck {
        Deck::flashcards(
            name.to_string(),
            vec![Card::new("q".to_string(), "a".to_string(), today())],
        )
    }

    #[test]
    fn test_put_get_delete() {
        let (store, _dir) = create_test_store();
        assert!(store.last_modified().unwrap().is_none());

        let a = deck("A");
        let b = deck("B");
        store.put_many(&[a.clone(), b.clone()]).unwrap();

        let all: Vec<Deck> = store.get_all().unwrap();
        assert_eq!(all, vec![a.clone(), b.clone()]);
        assert_eq!(store.get_deck(&a.id).unwrap(), a);
        assert!(store.last_modified().unwrap().is_some());

        assert!(store.delete_by_id::<Deck>(&a.id).unwrap());
        assert!(!store.delete_by_id::<Deck>(&a.id).unwrap());
        assert!(matches!(store.get_deck(&a.id), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_connection_uses_wal() {
        let (store, _dir) = create_test_store();
        let (journal_mode, synchronous) = store
            .with_conn(|conn| {
                let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                let synchronous: i64 = conn.query_row("PRAGMA synchronous", [], |row| row.get(0))?;
                Ok((journal_mode, synchronous))
            })
            .unwrap();
        assert_eq!(journal_mode, "wal");
        // NORMAL
        assert_eq!(synchronous, 1);
    }

    /// Second connection on the same file holding the write lock
    fn lock_database(dir: &TempDir) -> Connection {
        let holder = Connection::open(dir.path().join("mnemo.db")).unwrap();
        holder.busy_timeout(Duration::ZERO).unwrap();
        holder.execute_batch("BEGIN EXCLUSIVE").unwrap();
        holder
    }

    fn fail_fast_when_locked(store: &LocalStore) {
        store
            .with_conn(|conn| {
                conn.busy_timeout(Duration::ZERO)?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_busy_database_is_retried_then_surfaced() {
        let (store, dir) = create_test_store();
        fail_fast_when_locked(&store);
        let holder = lock_database(&dir);

        let mut attempts = 0;
        let err = store
            .with_conn(|conn| {
                attempts += 1;
                write_meta(conn, "attempt", &attempts)
            })
            .unwrap_err();
        assert!(err.is_busy());
        assert_eq!(attempts, BUSY_RETRIES + 1);

        let started = std::time::Instant::now();
        let err = store.put_many(&[deck("Blocked")]).unwrap_err();
        assert!(err.is_busy(), "got {}", err);
        let backoff: Duration = (1..=BUSY_RETRIES).map(|n| BUSY_BACKOFF * n).sum();
        assert!(started.elapsed() >= backoff);

        holder.execute_batch("ROLLBACK").unwrap();
        assert!(store.get_all::<Deck>().unwrap().is_empty());
        assert!(store.last_modified().unwrap().is_none());
    }

    #[test]
    fn test_busy_database_released_while_retrying() {
        let (store, dir) = create_test_store();
        fail_fast_when_locked(&store);
        let holder = lock_database(&dir);

        let release = std::thread::spawn(move || {
            std::thread::sleep(BUSY_BACKOFF + BUSY_BACKOFF / 2);
            holder.execute_batch("COMMIT").unwrap();
        });

        let d = deck("Eventually");
        store.put_many(&[d.clone()]).unwrap();
        release.join().unwrap();

        assert_eq!(store.get_deck(&d.id).unwrap(), d);
        assert!(store.last_modified().unwrap().is_some());
    }

    #[test]
    fn test_record_review_assigns_ids() {
        let (store, _dir) = create_test_store();
        let d = deck("A");
        let log = ReviewLog::new(d.items()[0].id().to_string(), d.id.clone(), Rating::Good, 0.25);

        let first = store.record_review(&d, &log).unwrap();
        let second = store.add_review(&log).unwrap();
        assert!(second > first);

        let reviews = store.get_reviews_for_deck(&d.id).unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].id, Some(first));
        assert_eq!(store.get_all::<Deck>().unwrap().len(), 1);
    }

    #[test]
    fn test_meta_does_not_bump_last_modified() {
        let (store, _dir) = create_test_store();
        store.set_meta("etag", &"abc").unwrap();
        assert!(store.last_modified().unwrap().is_none());
        assert_eq!(store.get_meta::<String>("etag").unwrap().as_deref(), Some("abc"));

        store.remove_meta("etag").unwrap();
        assert!(store.get_meta::<String>("etag").unwrap().is_none());
    }

    #[test]
    fn test_atomic_restore_replaces_everything() {
        let (store, _dir) = create_test_store();
        store.put(&deck("Old")).unwrap();
        store.put(&Folder::new("Old folder".to_string())).unwrap();

        let mut snapshot = FullBackupData::default();
        snapshot.decks.push(deck("New"));
        snapshot.settings.insert("goal".to_string(), serde_json::json!(15));

        let mut rx = store.subscribe();
        store.atomic_restore(&snapshot).unwrap();

        let decks: Vec<Deck> = store.get_all().unwrap();
        assert_eq!(decks.len(), 1);
        assert_eq!(decks[0].name, "New");
        assert!(store.get_all::<Folder>().unwrap().is_empty());
        assert_eq!(store.settings().unwrap()["goal"], serde_json::json!(15));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, StoreEventKind::Restored);
        assert_eq!(event.origin, store.session_id());
    }

    #[test]
    fn test_atomic_restore_failure_keeps_prior_state() {
        let (store, _dir) = create_test_store();
        let original = deck("Original");
        store.put(&original).unwrap();
        store.put(&Folder::new("Folder".to_string())).unwrap();
        store
            .add_review(&ReviewLog::new("i".to_string(), original.id.clone(), Rating::Again, 0.0))
            .unwrap();
        store.put_setting("theme", &serde_json::json!("dark")).unwrap();
        let before = store.export_snapshot().unwrap();
        let modified_before = store.last_modified().unwrap();

        // Second deck reuses the first id, so the insert fails after the
        // tables were already cleared inside the transaction
        let duplicate = deck("Dup");
        let mut broken = FullBackupData::default();
        broken.folders.push(Folder::new("Replacement".to_string()));
        broken.decks.push(duplicate.clone());
        broken.decks.push(duplicate);

        assert!(store.atomic_restore(&broken).is_err());

        let after = store.export_snapshot().unwrap();
        assert_eq!(after.decks, before.decks);
        assert_eq!(after.folders, before.folders);
        assert_eq!(after.reviews, before.reviews);
        assert_eq!(after.settings, before.settings);
        assert_eq!(store.last_modified().unwrap(), modified_before);
    }

    #[test]
    fn test_factory_reset() {
        let (store, _dir) = create_test_store();
        store.put(&deck("A")).unwrap();
        store.set_meta("etag", &"x").unwrap();

        store.factory_reset().unwrap();

        assert!(store.export_snapshot().unwrap().is_empty());
        assert!(store.get_meta::<String>("etag").unwrap().is_none());
        assert!(store.last_modified().unwrap().is_none());
    }

    #[test]
    fn test_sessions_by_key() {
        let (store, _dir) = create_test_store();
        let session = SessionState::new("d1", SessionKind::Quiz, vec!["q1".to_string()]);
        store.save_session(&session).unwrap();

        assert_eq!(store.load_session("d1", SessionKind::Quiz).unwrap(), Some(session));
        assert!(store.load_session("d1", SessionKind::Review).unwrap().is_none());
        assert!(store.clear_session("d1", SessionKind::Quiz).unwrap());
    }

    #[test]
    fn test_purge_deleted_respects_window() {
        let (store, _dir) = create_test_store();
        let now = Utc::now();
        let old = deck("Old");
        let recent = deck("Recent");
        store.put_many(&[old.clone(), recent.clone()]).unwrap();
        store.soft_delete_deck(&old.id, now - chrono::Duration::days(40)).unwrap();
        store.soft_delete_deck(&recent.id, now - chrono::Duration::days(2)).unwrap();
        store
            .add_review(&ReviewLog::new("i".to_string(), old.id.clone(), Rating::Good, 0.3))
            .unwrap();

        let report = store.purge_deleted(chrono::Duration::days(30), now).unwrap();
        assert_eq!(
            report,
            PurgeReport {
                decks: 1,
                series: 0,
                reviews: 1
            }
        );

        let remaining: Vec<Deck> = store.get_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, recent.id);
    }

    #[test]
    fn test_corrupt_database_is_recovered_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mnemo.db");
        fs::write(&path, vec![0x5a; 8192]).unwrap();

        let store = LocalStore::open(&path).unwrap();
        assert!(store.export_snapshot().unwrap().is_empty());
        assert!(sibling(&path, ".corrupt").exists());
        assert!(!recovery_marker(&path).exists());
    }

    #[test]
    fn test_recovery_is_not_repeated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mnemo.db");
        fs::write(&path, vec![0x5a; 8192]).unwrap();
        fs::write(recovery_marker(&path), "earlier").unwrap();

        match LocalStore::open(&path) {
            Err(StorageError::RecoveryFailed(_)) => {}
            Err(other) => panic!("expected RecoveryFailed, got {}", other),
            Ok(_) => panic!("expected RecoveryFailed, got an open store"),
        }
    }
}
