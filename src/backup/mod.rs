// Backup lifecycle - generate, locate, remove and restore server archives

mod local;
pub mod manager;
pub mod types;

pub use manager::BackupManager;
pub use types::{
    AdapterKind, ArchiveDetails, BackupError, BackupRecord, RestoreEntry, RestoreOutcome,
    RestoreSource, ARCHIVE_EXTENSION,
};
