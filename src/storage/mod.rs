pub mod backup;
pub mod local_store;
mod models;
pub mod notify;

pub use backup::{parse_backup, BackupError, FullBackupData, Settings, CURRENT_SCHEMA_VERSION};
pub use local_store::{Collection, LocalStore, PurgeReport, Record, StorageError};
pub use models::*;
pub use notify::{StoreEvent, StoreEventKind};
