//! Mnemo: spaced-repetition study with offline-first sync.
//!
//! - `flashcards`: scheduling, mastery decay, workload forecasts
//! - `storage`: the local SQLite store and the backup format
//! - `sync`: remote client, conflict detection, merge and orchestration

pub mod config;
pub mod flashcards;
pub mod storage;
pub mod sync;
