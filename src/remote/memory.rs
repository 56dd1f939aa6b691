use super::{ObjectAttrs, RemoteStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    etag: String,
    uploaded_at: DateTime<Utc>,
}

/// In-process object store
///
/// Buckets are listed in creation order. Failure switches let tests drive the
/// error paths of the backup manager.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    buckets: Arc<RwLock<Vec<String>>>,
    objects: Arc<DashMap<(String, String), StoredObject>>,
    fail_list_buckets: Arc<AtomicBool>,
    fail_uploads: Arc<AtomicBool>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already has the given buckets
    pub fn with_buckets<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for name in names {
            store.create_bucket(name);
        }
        store
    }

    pub fn create_bucket(&self, name: impl Into<String>) {
        let name = name.into();
        let mut buckets = self.buckets.write();
        if !buckets.contains(&name) {
            buckets.push(name);
        }
    }

    pub fn set_fail_list_buckets(&self, fail: bool) {
        self.fail_list_buckets.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Store raw bytes under `key`, bypassing the upload path
    pub fn put_bytes(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let etag = etag_for(&data);
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: Arc::new(data),
                etag,
                uploaded_at: Utc::now(),
            },
        );
    }

    pub fn object_bytes(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().data.as_ref().clone())
    }

    /// Keys stored in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        if self.buckets.read().iter().any(|name| name == bucket) {
            Ok(())
        } else {
            Err(StoreError::NoSuchBucket(bucket.to_string()))
        }
    }
}

fn etag_for(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn list_buckets(&self) -> Result<Vec<String>, StoreError> {
        if self.fail_list_buckets.load(Ordering::SeqCst) {
            return Err(StoreError::request("list_buckets", "injected failure"));
        }
        Ok(self.buckets.read().clone())
    }

    async fn object_attrs(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectAttrs>, StoreError> {
        self.ensure_bucket(bucket)?;
        Ok(self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| {
                let object = entry.value();
                ObjectAttrs {
                    name: key.to_string(),
                    size: object.data.len() as u64,
                    content_type: Some("application/gzip".to_string()),
                    etag: Some(object.etag.clone()),
                    uploaded_at: Some(object.uploaded_at),
                }
            }))
    }

    async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
    ) -> Result<(), StoreError> {
        self.ensure_bucket(bucket)?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StoreError::request("upload_object", "injected failure"));
        }

        // Commit only once the whole body is in hand.
        let data = fs::read(source).await?;
        self.put_bytes(bucket, key, data);
        Ok(())
    }

    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), StoreError> {
        self.ensure_bucket(bucket)?;
        let data = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| Arc::clone(&entry.value().data))
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(destination, data.as_slice()).await?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.ensure_bucket(bucket)?;
        match self.objects.remove(&(bucket.to_string(), key.to_string())) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upload_and_download() {
        let store = MemoryRemoteStore::with_buckets(["primary"]);
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.bin");
        fs::write(&source, b"payload").await.unwrap();

        store.upload_object("primary", "a.tar.gz", &source).await.unwrap();
        let attrs = store.object_attrs("primary", "a.tar.gz").await.unwrap().unwrap();
        assert_eq!(attrs.name, "a.tar.gz");
        assert_eq!(attrs.size, 7);

        let target = dir.path().join("out/target.bin");
        store.download_object("primary", "a.tar.gz", &target).await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_buckets_listed_in_creation_order() {
        let store = MemoryRemoteStore::with_buckets(["first", "second"]);
        store.create_bucket("first");
        assert_eq!(store.list_buckets().await.unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_missing_bucket_and_key() {
        let store = MemoryRemoteStore::with_buckets(["primary"]);
        assert!(store.object_attrs("primary", "nope").await.unwrap().is_none());
        assert!(matches!(
            store.object_attrs("other", "nope").await,
            Err(StoreError::NoSuchBucket(_))
        ));
        assert!(store.delete_object("primary", "nope").await.unwrap_err().is_not_found());
    }
}
