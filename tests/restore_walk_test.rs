// Integration tests for the cancellable restore walk

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use server_backup::backup::{
    BackupError, BackupManager, BackupRecord, RestoreEntry, RestoreOutcome, RestoreSource,
};
use server_backup::config::BackupConfig;
use server_backup::remote::{MemoryRemoteStore, ObjectAttrs, RemoteStore, StoreError};
use std::fs;
use std::io::{Cursor, Read};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const BUCKET: &str = "server-backups";

struct Fixture {
    store: MemoryRemoteStore,
    manager: BackupManager,
    scratch: TempDir,
    data: TempDir,
}

/// Tree containing `a.txt`, `dir/` and `dir/b.txt`
fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let scratch = tempdir().unwrap();
    let data = tempdir().unwrap();
    fs::write(data.path().join("a.txt"), b"alpha").unwrap();
    fs::create_dir(data.path().join("dir")).unwrap();
    fs::write(data.path().join("dir/b.txt"), b"bravo").unwrap();

    let store = MemoryRemoteStore::with_buckets([BUCKET]);
    let manager = BackupManager::new(
        Arc::new(store.clone()),
        BackupConfig::default().with_scratch_directory(scratch.path()),
    );
    Fixture {
        store,
        manager,
        scratch,
        data,
    }
}

async fn uploaded(f: &Fixture, identifier: &str) -> BackupRecord {
    let record = BackupRecord::new(identifier, "").unwrap();
    f.manager
        .generate(&record, &CancellationToken::new(), f.data.path(), None)
        .await
        .expect("generate should succeed");
    record
}

fn files_under(path: &Path) -> usize {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count()
}

type Seen = Arc<Mutex<Vec<(String, String)>>>;

fn recorder(
    seen: &Seen,
) -> impl FnMut(RestoreEntry<'_>) -> anyhow::Result<ControlFlow<()>> + Send + 'static {
    let seen = Arc::clone(seen);
    move |mut entry: RestoreEntry<'_>| {
        let mut body = String::new();
        entry.reader.read_to_string(&mut body)?;
        seen.lock().push((entry.name, body));
        Ok(ControlFlow::Continue(()))
    }
}

#[tokio::test]
async fn test_restore_from_remote_skips_directories() {
    let f = fixture();
    let record = uploaded(&f, "abc123").await;
    let seen: Seen = Arc::default();

    let outcome = f
        .manager
        .restore(&record, &CancellationToken::new(), RestoreSource::Remote, recorder(&seen))
        .await
        .unwrap();

    assert_eq!(outcome, RestoreOutcome::Completed);
    assert_eq!(
        *seen.lock(),
        vec![
            ("a.txt".to_string(), "alpha".to_string()),
            ("dir/b.txt".to_string(), "bravo".to_string()),
        ]
    );
    // Scratch download is gone once the walk ends
    assert_eq!(files_under(f.scratch.path()), 0);
}

#[tokio::test]
async fn test_remote_restore_leaves_other_archives_alone() {
    let f = fixture();
    let record = uploaded(&f, "x").await;

    // Pending archive of a generate for the identifier "x.restore"
    let neighbour = BackupRecord::new("x.restore", "").unwrap();
    let pending = f.manager.local_path(&neighbour);
    fs::write(&pending, b"pending archive").unwrap();

    let seen: Seen = Arc::default();
    let outcome = f
        .manager
        .restore(&record, &CancellationToken::new(), RestoreSource::Remote, recorder(&seen))
        .await
        .unwrap();

    assert_eq!(outcome, RestoreOutcome::Completed);
    assert_eq!(seen.lock().len(), 2);
    assert_eq!(fs::read(&pending).unwrap(), b"pending archive".to_vec());
    assert_eq!(files_under(f.scratch.path()), 1);
}

/// Download that writes part of the body, fires the token, then never finishes.
struct StalledDownload {
    inner: MemoryRemoteStore,
    cancel: CancellationToken,
}

#[async_trait]
impl RemoteStore for StalledDownload {
    async fn list_buckets(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_buckets().await
    }

    async fn object_attrs(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectAttrs>, StoreError> {
        self.inner.object_attrs(bucket, key).await
    }

    async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
    ) -> Result<(), StoreError> {
        self.inner.upload_object(bucket, key, source).await
    }

    async fn download_object(
        &self,
        _bucket: &str,
        _key: &str,
        destination: &Path,
    ) -> Result<(), StoreError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, b"partial body").await?;
        self.cancel.cancel();
        std::future::pending().await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.inner.delete_object(bucket, key).await
    }
}

#[tokio::test]
async fn test_cancel_during_download() {
    let f = fixture();
    let record = uploaded(&f, "abc123").await;
    let cancel = CancellationToken::new();
    let manager = BackupManager::new(
        Arc::new(StalledDownload {
            inner: f.store.clone(),
            cancel: cancel.clone(),
        }),
        BackupConfig::default().with_scratch_directory(f.scratch.path()),
    );
    let seen: Seen = Arc::default();

    let outcome = manager
        .restore(&record, &cancel, RestoreSource::Remote, recorder(&seen))
        .await
        .unwrap();

    assert_eq!(outcome, RestoreOutcome::Cancelled);
    assert!(seen.lock().is_empty());
    assert_eq!(files_under(f.scratch.path()), 0);
    assert_eq!(f.store.keys(BUCKET), vec!["abc123.tar.gz".to_string()]);
}

#[tokio::test]
async fn test_restore_from_reader() {
    let f = fixture();
    uploaded(&f, "abc123").await;
    let bytes = f.store.object_bytes(BUCKET, "abc123.tar.gz").unwrap();
    let record = BackupRecord::new("abc123", "").unwrap();
    let seen: Seen = Arc::default();

    let outcome = f
        .manager
        .restore(
            &record,
            &CancellationToken::new(),
            RestoreSource::Reader(Box::new(Cursor::new(bytes))),
            recorder(&seen),
        )
        .await
        .unwrap();

    assert_eq!(outcome, RestoreOutcome::Completed);
    assert_eq!(seen.lock().len(), 2);
}

#[tokio::test]
async fn test_cancelled_before_first_entry() {
    let f = fixture();
    let record = uploaded(&f, "abc123").await;
    let seen: Seen = Arc::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let bytes = f.store.object_bytes(BUCKET, "abc123.tar.gz").unwrap();
    let outcome = f
        .manager
        .restore(
            &record,
            &cancel,
            RestoreSource::Reader(Box::new(Cursor::new(bytes))),
            recorder(&seen),
        )
        .await
        .unwrap();

    assert_eq!(outcome, RestoreOutcome::Cancelled);
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_walk_stops_before_next_entry() {
    let f = fixture();
    let record = uploaded(&f, "abc123").await;
    let cancel = CancellationToken::new();
    let calls = Arc::new(Mutex::new(0usize));

    let token = cancel.clone();
    let counter = Arc::clone(&calls);
    let outcome = f
        .manager
        .restore(&record, &cancel, RestoreSource::Remote, move |_entry: RestoreEntry<'_>| {
            *counter.lock() += 1;
            token.cancel();
            Ok(ControlFlow::Continue(()))
        })
        .await
        .unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(*calls.lock(), 1);
}

#[tokio::test]
async fn test_handler_break_is_normal_completion() {
    let f = fixture();
    let record = uploaded(&f, "abc123").await;
    let calls = Arc::new(Mutex::new(0usize));

    let counter = Arc::clone(&calls);
    let handler = move |_entry: RestoreEntry<'_>| -> anyhow::Result<ControlFlow<()>> {
        *counter.lock() += 1;
        Ok(ControlFlow::Break(()))
    };
    let outcome = f
        .manager
        .restore(&record, &CancellationToken::new(), RestoreSource::Remote, handler)
        .await
        .unwrap();

    assert_eq!(outcome, RestoreOutcome::Completed);
    assert_eq!(*calls.lock(), 1);
}

#[tokio::test]
async fn test_handler_error_propagates() {
    let f = fixture();
    let record = uploaded(&f, "abc123").await;

    let handler = |entry: RestoreEntry<'_>| -> anyhow::Result<ControlFlow<()>> {
        anyhow::bail!("disk full while writing {}", entry.name)
    };
    let err = f
        .manager
        .restore(&record, &CancellationToken::new(), RestoreSource::Remote, handler)
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Callback(_)), "unexpected error: {err}");
    assert!(err.to_string().contains("disk full while writing a.txt"));
}

#[tokio::test]
async fn test_restore_missing_remote_is_not_found() {
    let f = fixture();
    let record = BackupRecord::new("missing-id", "").unwrap();
    let seen: Seen = Arc::default();

    let err = f
        .manager
        .restore(&record, &CancellationToken::new(), RestoreSource::Remote, recorder(&seen))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_restore_local_after_generate_has_no_archive() {
    // Generate never leaves the local archive behind.
    let f = fixture();
    let record = uploaded(&f, "abc123").await;
    let seen: Seen = Arc::default();

    let err = f
        .manager
        .restore(&record, &CancellationToken::new(), RestoreSource::Local, recorder(&seen))
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Archive(_)));
}

#[tokio::test]
async fn test_restore_blocking_with_borrowed_state() {
    let f = fixture();
    uploaded(&f, "abc123").await;
    let bytes = f.store.object_bytes(BUCKET, "abc123.tar.gz").unwrap();
    let record = BackupRecord::new("abc123", "").unwrap();

    let mut names = Vec::new();
    let outcome = f
        .manager
        .restore_blocking(
            &record,
            &CancellationToken::new(),
            &mut Cursor::new(bytes),
            |entry: RestoreEntry<'_>| {
                names.push(entry.name);
                Ok(ControlFlow::Continue(()))
            },
        )
        .unwrap();

    assert_eq!(outcome, RestoreOutcome::Completed);
    assert_eq!(names, vec!["a.txt".to_string(), "dir/b.txt".to_string()]);
}

#[tokio::test]
async fn test_corrupt_archive_is_an_error() {
    let f = fixture();
    let record = BackupRecord::new("abc123", "").unwrap();
    let seen: Seen = Arc::default();

    let err = f
        .manager
        .restore(
            &record,
            &CancellationToken::new(),
            RestoreSource::Reader(Box::new(Cursor::new(b"definitely not gzip".to_vec()))),
            recorder(&seen),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Archive(_)));
    assert!(seen.lock().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_entry_metadata_is_preserved() {
    use std::os::unix::fs::PermissionsExt;

    let f = fixture();
    fs::set_permissions(f.data.path().join("a.txt"), fs::Permissions::from_mode(0o640)).unwrap();
    let record = uploaded(&f, "abc123").await;
    let modes = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&modes);
    let handler = move |entry: RestoreEntry<'_>| -> anyhow::Result<ControlFlow<()>> {
        sink.lock().push((entry.name, entry.mode & 0o777, entry.modified.timestamp() > 0));
        Ok(ControlFlow::Continue(()))
    };
    f.manager
        .restore(&record, &CancellationToken::new(), RestoreSource::Remote, handler)
        .await
        .unwrap();

    let modes = modes.lock();
    assert_eq!(modes[0], ("a.txt".to_string(), 0o640, true));
}
