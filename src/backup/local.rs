use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Scratch archive on local disk, removed when the guard is dropped.
///
/// Removal is best effort: a file that was never created is fine, any other
/// failure is logged and swallowed.
#[derive(Debug)]
pub(crate) struct LocalArchive {
    path: PathBuf,
}

impl LocalArchive {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalArchive {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed local archive"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove local archive"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc123.tar.gz");
        {
            let guard = LocalArchive::new(path.clone());
            std::fs::write(guard.path(), b"archive").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_file_is_fine() {
        let dir = tempdir().unwrap();
        drop(LocalArchive::new(dir.path().join("never-created.tar.gz")));
    }

    #[test]
    fn test_removed_when_unwinding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("panic.tar.gz");
        let inner = path.clone();
        let result = std::panic::catch_unwind(move || {
            let guard = LocalArchive::new(inner);
            std::fs::write(guard.path(), b"archive").unwrap();
            panic!("archive builder blew up");
        });
        assert!(result.is_err());
        assert!(!path.exists());
    }
}
