//! Archive codec seam
//!
//! The backup core never touches the compression format directly. It asks an
//! [`ArchiveBuilder`] to turn a directory tree into a single compressed file
//! and to walk such a file entry by entry.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::Read;
use std::ops::ControlFlow;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod ignore;
pub mod targz;

pub use ignore::IgnoreRules;
pub use targz::TarGzArchiver;

/// Errors raised by the archive codec
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive: invalid ignore pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("archive: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive: base path {0} is not a directory")]
    NotADirectory(String),

    #[error("archive: entry {0:?} escapes the archive root")]
    UnsafeEntry(String),

    #[error("archive: creation cancelled")]
    Cancelled,

    /// The visitor passed to [`ArchiveBuilder::walk`] failed
    #[error("archive: entry visitor failed: {0}")]
    Visitor(#[source] anyhow::Error),
}

impl ArchiveError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ArchiveError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Kind of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One entry yielded while walking an archive.
///
/// The reader borrows the underlying archive stream and is only valid for the
/// duration of the visitor call that received it.
pub struct ArchiveEntry<'a> {
    pub name: String,
    pub kind: EntryKind,
    pub reader: &'a mut dyn Read,
    pub mode: u32,
    pub modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
}

impl ArchiveEntry<'_> {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Visitor invoked for each archive entry. Returning `Break` ends the walk
/// without an error.
pub type EntryVisitor<'v> = dyn FnMut(ArchiveEntry<'_>) -> anyhow::Result<ControlFlow<()>> + 'v;

/// Compression codec used to build and read backup archives
pub trait ArchiveBuilder: Send + Sync {
    /// Archive everything under `base_path` not matched by `ignore` into
    /// `destination`. Implementations check `cancel` between entries.
    fn create(
        &self,
        base_path: &Path,
        ignore: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ArchiveError>;

    /// Walk an archive stream, calling `visitor` for every entry in order.
    fn walk(
        &self,
        source: &mut dyn Read,
        visitor: &mut EntryVisitor<'_>,
    ) -> Result<(), ArchiveError>;

    /// Walk the archive stored at `path`.
    fn walk_path(&self, path: &Path, visitor: &mut EntryVisitor<'_>) -> Result<(), ArchiveError> {
        let mut file = File::open(path)
            .map_err(|e| ArchiveError::io(format!("failed to open {}", path.display()), e))?;
        self.walk(&mut file, visitor)
    }
}
