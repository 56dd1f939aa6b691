//! Remote object storage
//!
//! [`RemoteStore`] is the flat, object-safe trait a storage backend
//! implements. [`Bucket`] and [`ObjectHandle`] are cheap handles on top of it
//! so call sites read as `bucket.object(key).attrs()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use memory::MemoryRemoteStore;
#[cfg(feature = "s3")]
pub use s3::S3RemoteStore;

/// Errors reported by a storage backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object {key} not found in bucket {bucket}")]
    NotFound { bucket: String, key: String },

    #[error("bucket {0} does not exist")]
    NoSuchBucket(String),

    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("local I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn request(operation: &'static str, err: impl std::fmt::Display) -> Self {
        StoreError::Request {
            operation,
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Attributes of a stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectAttrs {
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// Object storage backend
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Names of every bucket the account can see, in the order the backend
    /// reports them.
    async fn list_buckets(&self) -> Result<Vec<String>, StoreError>;

    /// Attributes of `key`, or `None` if there is no such object.
    async fn object_attrs(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectAttrs>, StoreError>;

    /// Stream the file at `source` into `key`. The object must only become
    /// visible once the whole body has been written.
    async fn upload_object(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError>;

    /// Stream `key` into a local file at `destination`.
    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), StoreError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}

/// A named bucket on a store
#[derive(Clone)]
pub struct Bucket {
    store: Arc<dyn RemoteStore>,
    name: String,
}

impl Bucket {
    pub fn new(store: Arc<dyn RemoteStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object(&self, key: impl Into<String>) -> ObjectHandle {
        ObjectHandle {
            bucket: self.clone(),
            key: key.into(),
        }
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name).finish()
    }
}

/// A single object key within a bucket. The object need not exist.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    bucket: Bucket,
    key: String,
}

impl ObjectHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bucket(&self) -> &str {
        self.bucket.name()
    }

    pub async fn attrs(&self) -> Result<Option<ObjectAttrs>, StoreError> {
        self.bucket.store.object_attrs(&self.bucket.name, &self.key).await
    }

    pub async fn upload_from(&self, source: &Path) -> Result<(), StoreError> {
        self.bucket
            .store
            .upload_object(&self.bucket.name, &self.key, source)
            .await
    }

    pub async fn download_to(&self, destination: &Path) -> Result<(), StoreError> {
        self.bucket
            .store
            .download_object(&self.bucket.name, &self.key, destination)
            .await
    }

    pub async fn delete(&self) -> Result<(), StoreError> {
        self.bucket.store.delete_object(&self.bucket.name, &self.key).await
    }
}
