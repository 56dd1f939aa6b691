// Backup Manager - Core backup orchestration
// Builds archives locally, mirrors them to the remote bucket, and walks them back out on restore.

use super::local::LocalArchive;
use super::types::{
    ArchiveDetails, BackupError, BackupRecord, RestoreEntry, RestoreOutcome, RestoreSource,
};
use crate::archive::{ArchiveBuilder, ArchiveEntry, ArchiveError, EntryKind, TarGzArchiver};
use crate::config::BackupConfig;
use crate::remote::{Bucket, ObjectAttrs, ObjectHandle, RemoteStore, StoreError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::future::Future;
use std::io::Read;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};

const RESTORE_SUBDIRECTORY: &str = "restore";

pub struct BackupManager {
    store: Arc<dyn RemoteStore>,
    archiver: Arc<dyn ArchiveBuilder>,
    config: BackupConfig,
}

impl BackupManager {
    /// Create a manager that archives with [`TarGzArchiver`] at the
    /// configured compression level.
    pub fn new(store: Arc<dyn RemoteStore>, config: BackupConfig) -> Self {
        let archiver = TarGzArchiver::new().with_compression_level(config.compression_level);
        Self {
            store,
            archiver: Arc::new(archiver),
            config,
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn ArchiveBuilder>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Where the temporary archive for `record` lives while it is generated
    pub fn local_path(&self, record: &BackupRecord) -> PathBuf {
        record.local_path(&self.config.scratch_directory)
    }

    /// Remote restores download under `restore/`, which no generated archive
    /// path can reach since identifiers never contain a separator.
    fn restore_scratch_path(&self, record: &BackupRecord) -> PathBuf {
        record.local_path(&self.config.scratch_directory.join(RESTORE_SUBDIRECTORY))
    }

    /// Resolve the bucket archives live in: the configured one, or else the
    /// first bucket the account lists.
    async fn bucket(&self) -> Result<Bucket, BackupError> {
        if let Some(ref name) = self.config.bucket {
            return Ok(Bucket::new(Arc::clone(&self.store), name.clone()));
        }

        let buckets = self.store.list_buckets().await.map_err(|e| {
            error!(error = %e, "could not list buckets");
            BackupError::ListBuckets(e)
        })?;

        match buckets.into_iter().next() {
            Some(name) => {
                debug!(bucket = %name, "using first listed bucket");
                Ok(Bucket::new(Arc::clone(&self.store), name))
            }
            None => {
                error!("account has no buckets");
                Err(BackupError::NoBuckets)
            }
        }
    }

    /// Archive `base_path` and upload it as `<identifier>.tar.gz`.
    ///
    /// `ignore` overrides the record's own ignore rules when given. The local
    /// archive is removed before this returns, whatever the outcome.
    pub async fn generate(
        &self,
        record: &BackupRecord,
        cancel: &CancellationToken,
        base_path: &Path,
        ignore: Option<&str>,
    ) -> Result<ArchiveDetails, BackupError> {
        let span = record.span("generate");
        self.generate_inner(record, cancel, base_path, ignore)
            .instrument(span)
            .await
    }

    async fn generate_inner(
        &self,
        record: &BackupRecord,
        cancel: &CancellationToken,
        base_path: &Path,
        ignore: Option<&str>,
    ) -> Result<ArchiveDetails, BackupError> {
        let local = LocalArchive::new(self.local_path(record));

        let bucket = cancellable(cancel, self.bucket()).await?;

        info!(
            path = %local.path().display(),
            base_path = %base_path.display(),
            "creating backup for server"
        );
        let archiver = Arc::clone(&self.archiver);
        let base = base_path.to_path_buf();
        let ignore = ignore.unwrap_or_else(|| record.ignore()).to_string();
        let destination = local.path().to_path_buf();
        let token = cancel.clone();
        let span = Span::current();

        // Awaited unconditionally so the guard never races a still-running writer.
        let created = tokio::task::spawn_blocking(move || {
            span.in_scope(|| archiver.create(&base, &ignore, &destination, &token))
        })
        .await?;

        match created {
            Ok(()) => info!("created backup successfully"),
            Err(ArchiveError::Cancelled) => {
                info!("backup cancelled while creating archive");
                return Err(BackupError::Cancelled);
            }
            Err(e) => {
                error!(path = %local.path().display(), error = %e, "failed to create archive");
                return Err(e.into());
            }
        }

        let key = record.object_key();
        let object = bucket.object(key.clone());
        info!(bucket = %bucket.name(), key = %key, "uploading archive");
        cancellable(cancel, async {
            object.upload_from(local.path()).await.map_err(|e| {
                error!(bucket = %bucket.name(), key = %key, error = %e, "could not upload archive");
                BackupError::Upload {
                    key: key.clone(),
                    source: e,
                }
            })
        })
        .await?;
        info!(key = %key, "uploaded backup successfully");

        let details = cancellable(cancel, async {
            describe_archive(local.path(), &object).await.map_err(|e| {
                error!(key = %key, error = %e, "failed to get archive details");
                BackupError::Details {
                    key: key.clone(),
                    source: e,
                }
            })
        })
        .await?;

        info!(key = %key, size = details.size, checksum = %details.checksum, "backup complete");
        Ok(details)
    }

    /// Look up the remote archive for `identifier`.
    ///
    /// A missing object yields [`BackupError::NotFound`], distinct from any
    /// failure to find out. An identifier that could never name a backup is
    /// reported the same way.
    pub async fn locate(
        &self,
        identifier: &str,
    ) -> Result<(BackupRecord, ObjectAttrs), BackupError> {
        let record = match BackupRecord::new(identifier, "") {
            Ok(record) => record,
            Err(e) => {
                info!(identifier, error = %e, "backup does not exist");
                return Err(BackupError::NotFound {
                    key: format!("{identifier}.{}", super::ARCHIVE_EXTENSION),
                });
            }
        };
        let span = record.span("locate");

        let attrs = async {
            let bucket = self.bucket().await?;
            let key = record.object_key();
            info!(bucket = %bucket.name(), key = %key, "locating backup");

            match bucket.object(key.clone()).attrs().await {
                Ok(Some(attrs)) => Ok(attrs),
                Ok(None) => {
                    info!(key = %key, "backup does not exist");
                    Err(BackupError::NotFound { key })
                }
                Err(e) if e.is_not_found() => Err(BackupError::NotFound { key }),
                Err(e) => {
                    error!(key = %key, error = %e, "could not look up archive");
                    Err(BackupError::Locate { key, source: e })
                }
            }
        }
        .instrument(span)
        .await?;

        Ok((record, attrs))
    }

    /// Delete the remote archive. Deleting an archive that is already gone
    /// succeeds.
    pub async fn remove(&self, record: &BackupRecord) -> Result<(), BackupError> {
        let span = record.span("remove");

        async {
            info!(path = %self.local_path(record).display(), "removing backup from system");
            let bucket = self.bucket().await?;
            let key = record.object_key();
            info!(bucket = %bucket.name(), key = %key, "deleting remote archive");

            match bucket.object(key.clone()).delete().await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => {
                    debug!(key = %key, "remote archive already absent");
                    Ok(())
                }
                Err(e) => {
                    error!(key = %key, error = %e, "could not delete remote archive");
                    Err(BackupError::Remove { key, source: e })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Walk the archive and hand every regular file to `callback`.
    ///
    /// The walk runs on the blocking pool. `cancel` is checked before each
    /// entry; once it fires the walk stops and `RestoreOutcome::Cancelled` is
    /// returned. A callback returning `Break` ends the walk as `Completed`; a
    /// callback error ends it with [`BackupError::Callback`].
    pub async fn restore<F>(
        &self,
        record: &BackupRecord,
        cancel: &CancellationToken,
        source: RestoreSource,
        callback: F,
    ) -> Result<RestoreOutcome, BackupError>
    where
        F: FnMut(RestoreEntry<'_>) -> anyhow::Result<ControlFlow<()>> + Send + 'static,
    {
        let span = record.span("restore");

        async move {
            let (reader, scratch) = match self.open_source(record, cancel, source).await {
                Ok(opened) => opened,
                Err(BackupError::Cancelled) => {
                    info!("restore cancelled before the archive was opened");
                    return Ok(RestoreOutcome::Cancelled);
                }
                Err(e) => return Err(e),
            };

            let archiver = Arc::clone(&self.archiver);
            let token = cancel.clone();
            let span = Span::current();

            tokio::task::spawn_blocking(move || {
                // Scratch download lives until the walk is over.
                let _scratch = scratch;
                let mut reader = reader;
                span.in_scope(|| walk_entries(archiver.as_ref(), &mut *reader, &token, callback))
            })
            .await?
        }
        .instrument(span)
        .await
    }

    /// Same walk as [`restore`](Self::restore), run on the calling thread
    /// over a caller supplied archive stream.
    pub fn restore_blocking<F>(
        &self,
        record: &BackupRecord,
        cancel: &CancellationToken,
        reader: &mut dyn Read,
        callback: F,
    ) -> Result<RestoreOutcome, BackupError>
    where
        F: FnMut(RestoreEntry<'_>) -> anyhow::Result<ControlFlow<()>>,
    {
        record
            .span("restore")
            .in_scope(|| walk_entries(self.archiver.as_ref(), reader, cancel, callback))
    }

    async fn open_source(
        &self,
        record: &BackupRecord,
        cancel: &CancellationToken,
        source: RestoreSource,
    ) -> Result<(Box<dyn Read + Send>, Option<LocalArchive>), BackupError> {
        match source {
            RestoreSource::Reader(reader) => Ok((reader, None)),
            RestoreSource::Local => {
                let path = self.local_path(record);
                let file = open_archive(&path)?;
                Ok((Box::new(file), None))
            }
            RestoreSource::Remote => {
                let scratch = LocalArchive::new(self.restore_scratch_path(record));
                let bucket = cancellable(cancel, self.bucket()).await?;
                let key = record.object_key();
                info!(
                    bucket = %bucket.name(),
                    key = %key,
                    path = %scratch.path().display(),
                    "downloading archive"
                );

                cancellable(cancel, async {
                    bucket
                        .object(key.clone())
                        .download_to(scratch.path())
                        .await
                        .map_err(|e| {
                            if e.is_not_found() {
                                BackupError::NotFound { key: key.clone() }
                            } else {
                                error!(key = %key, error = %e, "could not download archive");
                                BackupError::Download {
                                    key: key.clone(),
                                    source: e,
                                }
                            }
                        })
                })
                .await?;

                let file = open_archive(scratch.path())?;
                Ok((Box::new(file), Some(scratch)))
            }
        }
    }
}

fn open_archive(path: &Path) -> Result<File, BackupError> {
    File::open(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "failed to open archive");
        BackupError::Archive(ArchiveError::Io {
            context: format!("failed to open {}", path.display()),
            source: e,
        })
    })
}

/// Drive one walk to its single terminal outcome.
fn walk_entries<F>(
    archiver: &dyn ArchiveBuilder,
    reader: &mut dyn Read,
    cancel: &CancellationToken,
    mut callback: F,
) -> Result<RestoreOutcome, BackupError>
where
    F: FnMut(RestoreEntry<'_>) -> anyhow::Result<ControlFlow<()>>,
{
    if cancel.is_cancelled() {
        info!("restore cancelled before the first entry");
        return Ok(RestoreOutcome::Cancelled);
    }

    let mut cancelled = false;
    let mut restored = 0usize;

    let result = archiver.walk(reader, &mut |entry: ArchiveEntry<'_>| {
        if cancel.is_cancelled() {
            cancelled = true;
            return Ok(ControlFlow::Break(()));
        }
        if entry.kind != EntryKind::File {
            return Ok(ControlFlow::Continue(()));
        }

        restored += 1;
        callback(RestoreEntry {
            name: entry.name,
            reader: entry.reader,
            mode: entry.mode,
            modified: entry.modified,
            accessed: entry.accessed,
        })
    });

    match result {
        Ok(()) if cancelled => {
            info!(restored, "restore cancelled");
            Ok(RestoreOutcome::Cancelled)
        }
        Ok(()) => {
            info!(restored, "restore completed");
            Ok(RestoreOutcome::Completed)
        }
        Err(ArchiveError::Visitor(e)) => {
            error!(restored, error = %e, "restore handler failed");
            Err(BackupError::Callback(e))
        }
        Err(e) => {
            error!(restored, error = %e, "failed to walk archive");
            Err(e.into())
        }
    }
}

/// Race `future` against the token. Dropping the future aborts any request
/// it has in flight.
async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> Result<T, BackupError>
where
    F: Future<Output = Result<T, BackupError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
        result = future => result,
    }
}

async fn describe_archive(
    path: &Path,
    object: &ObjectHandle,
) -> Result<ArchiveDetails, StoreError> {
    let (checksum, size) = checksum_file(path).await?;
    let attrs = object.attrs().await?.ok_or_else(|| StoreError::NotFound {
        bucket: object.bucket().to_string(),
        key: object.key().to_string(),
    })?;

    Ok(ArchiveDetails {
        checksum,
        checksum_type: "sha256".to_string(),
        size,
        object: attrs,
    })
}

async fn checksum_file(path: &Path) -> Result<(String, u64), StoreError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), size))
}
