//! Gzip-compressed tar archives

use super::{
    ArchiveBuilder, ArchiveEntry, ArchiveError, EntryKind, EntryVisitor, IgnoreRules,
};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

impl From<EntryType> for EntryKind {
    fn from(entry_type: EntryType) -> Self {
        if entry_type.is_file() {
            EntryKind::File
        } else if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Other
        }
    }
}

/// Builds and reads `.tar.gz` archives
#[derive(Debug, Clone)]
pub struct TarGzArchiver {
    compression_level: u32,
}

impl TarGzArchiver {
    pub fn new() -> Self {
        Self {
            compression_level: 6, // Balanced compression (0-9)
        }
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }
}

impl Default for TarGzArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder for TarGzArchiver {
    fn create(
        &self,
        base_path: &Path,
        ignore: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ArchiveError> {
        let metadata = fs::metadata(base_path).map_err(|e| {
            ArchiveError::io(format!("failed to stat {}", base_path.display()), e)
        })?;
        if !metadata.is_dir() {
            return Err(ArchiveError::NotADirectory(base_path.display().to_string()));
        }

        let rules = IgnoreRules::parse(ignore)?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ArchiveError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }
        let file = File::create(destination).map_err(|e| {
            ArchiveError::io(format!("failed to create {}", destination.display()), e)
        })?;

        let encoder = GzEncoder::new(
            BufWriter::new(file),
            Compression::new(self.compression_level),
        );
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);

        let walker = WalkDir::new(base_path)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(base_path) {
                Ok(relative) => !rules.is_ignored(relative, entry.file_type().is_dir()),
                Err(_) => false,
            });

        let mut appended = 0usize;
        for entry in walker {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            let entry =
                entry.map_err(|e| ArchiveError::io("failed to walk base path", e.into()))?;
            let file_type = entry.file_type();
            if !(file_type.is_file() || file_type.is_dir() || file_type.is_symlink()) {
                warn!(path = %entry.path().display(), "skipping special file");
                continue;
            }

            let relative = match entry.path().strip_prefix(base_path) {
                Ok(relative) => relative,
                Err(_) => continue,
            };

            builder
                .append_path_with_name(entry.path(), relative)
                .map_err(|e| {
                    ArchiveError::io(format!("failed to add {}", relative.display()), e)
                })?;
            appended += 1;
        }

        let mut writer = builder
            .into_inner()
            .map_err(|e| ArchiveError::io("failed to finish archive", e))?
            .finish()
            .map_err(|e| ArchiveError::io("failed to finish compression", e))?;
        writer.flush().map_err(|e| {
            ArchiveError::io(format!("failed to flush {}", destination.display()), e)
        })?;

        debug!(
            base_path = %base_path.display(),
            destination = %destination.display(),
            entries = appended,
            "archive written"
        );
        Ok(())
    }

    fn walk(
        &self,
        source: &mut dyn Read,
        visitor: &mut EntryVisitor<'_>,
    ) -> Result<(), ArchiveError> {
        let mut archive = Archive::new(GzDecoder::new(source));
        let entries = archive
            .entries()
            .map_err(|e| ArchiveError::io("failed to read archive", e))?;

        for entry in entries {
            let mut entry =
                entry.map_err(|e| ArchiveError::io("failed to read archive entry", e))?;

            let raw_name = entry
                .path()
                .map_err(|e| ArchiveError::io("invalid entry path", e))?
                .into_owned();
            let name = normalize_entry_name(&raw_name)?;
            if name.is_empty() {
                continue;
            }

            let header = entry.header();
            let kind = EntryKind::from(header.entry_type());
            let mode = header
                .mode()
                .map_err(|e| ArchiveError::io(format!("invalid mode for {name}"), e))?;
            let mtime = header.mtime().unwrap_or(0);
            let atime = header
                .as_gnu()
                .and_then(|gnu| gnu.atime().ok())
                .filter(|atime| *atime > 0)
                .unwrap_or(mtime);

            let flow = visitor(ArchiveEntry {
                name,
                kind,
                reader: &mut entry,
                mode,
                modified: timestamp(mtime),
                accessed: timestamp(atime),
            })
            .map_err(ArchiveError::Visitor)?;

            if flow.is_break() {
                break;
            }
        }

        Ok(())
    }
}

/// Strip leading `/` and `./` from an entry path and refuse `..`.
fn normalize_entry_name(path: &Path) -> Result<String, ArchiveError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(ArchiveError::UnsafeEntry(path.display().to_string()));
            }
        }
    }
    Ok(parts.join("/"))
}

fn timestamp(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_default()
}
