// Backup System Types - Core data structures and enums

use crate::archive::ArchiveError;
use crate::remote::{ObjectAttrs, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info_span, Span};

/// Suffix appended to a backup identifier to form its object key
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Archive built on local disk and mirrored to a remote bucket
    Local,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Local => write!(f, "local"),
        }
    }
}

/// A single backup, addressed by its identifier.
///
/// The identifier is fixed at construction and doubles as the archive file
/// name, so it is validated up front.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    identifier: String,
    adapter: AdapterKind,
    ignore: String,
    log_context: HashMap<String, Value>,
}

impl BackupRecord {
    pub fn new(
        identifier: impl Into<String>,
        ignore: impl Into<String>,
    ) -> Result<Self, BackupError> {
        let identifier = identifier.into();
        validate_identifier(&identifier)?;
        Ok(Self {
            identifier,
            adapter: AdapterKind::Local,
            ignore: ignore.into(),
            log_context: HashMap::new(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn adapter(&self) -> AdapterKind {
        self.adapter
    }

    pub fn ignore(&self) -> &str {
        &self.ignore
    }

    pub fn log_context(&self) -> &HashMap<String, Value> {
        &self.log_context
    }

    /// Replace the log context attached to everything logged for this backup.
    pub fn set_log_context(&mut self, context: HashMap<String, Value>) {
        self.log_context = context;
    }

    pub fn with_log_context(mut self, context: HashMap<String, Value>) -> Self {
        self.set_log_context(context);
        self
    }

    /// Key of the archive in the remote bucket: `<identifier>.tar.gz`
    pub fn object_key(&self) -> String {
        format!("{}.{}", self.identifier, ARCHIVE_EXTENSION)
    }

    /// Path of the temporary archive inside `scratch_directory`
    pub fn local_path(&self, scratch_directory: &Path) -> PathBuf {
        scratch_directory.join(self.object_key())
    }

    pub(crate) fn span(&self, operation: &'static str) -> Span {
        let context = serde_json::to_string(&self.log_context).unwrap_or_default();
        info_span!(
            "backup",
            operation,
            identifier = %self.identifier,
            adapter = %self.adapter,
            context = %context,
        )
    }
}

fn validate_identifier(identifier: &str) -> Result<(), BackupError> {
    let invalid = identifier.trim().is_empty()
        || identifier == "."
        || identifier == ".."
        || identifier.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BackupError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

/// Details of a freshly generated archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDetails {
    pub checksum: String,
    pub checksum_type: String,
    pub size: u64,
    /// Attributes of the uploaded object
    pub object: ObjectAttrs,
}

/// How a restore walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Every entry was visited, or the handler asked to stop
    Completed,
    /// The cancellation token fired before the walk finished
    Cancelled,
}

impl RestoreOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestoreOutcome::Cancelled)
    }
}

/// A regular file handed to a restore callback. `reader` is only valid for
/// the duration of the call.
pub struct RestoreEntry<'a> {
    /// Path relative to the archive root, `/` separated
    pub name: String,
    pub reader: &'a mut dyn Read,
    pub mode: u32,
    pub modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
}

/// Where a restore reads the archive from
pub enum RestoreSource {
    /// The archive left in the scratch directory for this backup
    Local,
    /// An archive stream supplied by the caller
    Reader(Box<dyn Read + Send>),
    /// Download the remote object into a scratch file first
    Remote,
}

impl fmt::Debug for RestoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreSource::Local => write!(f, "Local"),
            RestoreSource::Reader(_) => write!(f, "Reader(..)"),
            RestoreSource::Remote => write!(f, "Remote"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup: invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("backup: could not list buckets: {0}")]
    ListBuckets(#[source] StoreError),

    #[error("backup: could not list buckets: no buckets available")]
    NoBuckets,

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("backup: could not upload archive to {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("backup: failed to get archive details for {key}: {source}")]
    Details {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("backup: {key} does not exist")]
    NotFound { key: String },

    #[error("backup: could not look up archive {key}: {source}")]
    Locate {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("backup: could not delete archive {key}: {source}")]
    Remove {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("backup: could not download archive {key}: {source}")]
    Download {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("backup: restore handler failed: {0}")]
    Callback(#[source] anyhow::Error),

    #[error("backup: operation cancelled")]
    Cancelled,

    #[error("backup: background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("backup: invalid configuration: {0}")]
    Config(String),
}

impl BackupError {
    /// True when the requested backup does not exist remotely
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackupError::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }
}
