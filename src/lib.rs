//! # server-backup
//!
//! Backup lifecycle for a single server's files: archive a directory tree,
//! mirror the archive to an object-storage bucket, find or delete it later,
//! and walk it back out entry by entry on restore.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server_backup::backup::{BackupManager, BackupRecord};
//! use server_backup::config::BackupConfig;
//! use server_backup::remote::MemoryRemoteStore;
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryRemoteStore::with_buckets(["server-backups"]));
//! let manager = BackupManager::new(store, BackupConfig::default());
//!
//! let record = BackupRecord::new("abc123", "*.log")?;
//! let details = manager
//!     .generate(&record, &CancellationToken::new(), Path::new("/srv/data"), None)
//!     .await?;
//! println!("uploaded {} ({} bytes)", details.object.name, details.size);
//!
//! let (_record, attrs) = manager.locate("abc123").await?;
//! assert_eq!(attrs.name, "abc123.tar.gz");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`backup`]: records, the manager and its error type
//! - [`archive`]: the archive codec seam and the tar.gz implementation
//! - [`remote`]: the object-storage seam, an in-memory store and (feature
//!   `s3`) an S3-compatible store
//! - [`config`]: explicit configuration handed to the manager

#![warn(rustdoc::missing_crate_level_docs)]

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

pub use backup::BackupError;

/// Archive codec
pub mod archive;

/// Backup records and lifecycle operations
pub mod backup;

/// Backup configuration
pub mod config;

/// Remote object storage
pub mod remote;
