// S3-compatible object store (AWS, Backblaze B2, MinIO, LocalStack)

use super::{ObjectAttrs, RemoteStore, StoreError};
use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use chrono::DateTime;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Remote store backed by the S3 API
#[derive(Clone)]
pub struct S3RemoteStore {
    client: Client,
}

impl S3RemoteStore {
    /// Build a client from the storage section of the backup configuration.
    /// Static credentials win over the default provider chain when present.
    pub async fn connect(config: &StorageConfig) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        // Custom endpoint for B2/MinIO/LocalStack
        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        if let Some(ref credentials) = config.credentials {
            aws_config_builder = aws_config_builder.credentials_provider(Credentials::new(
                credentials.key_id.clone(),
                credentials.application_key.clone(),
                None,
                None,
                "server-backup",
            ));
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteStore for S3RemoteStore {
    async fn list_buckets(&self) -> Result<Vec<String>, StoreError> {
        let response = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| StoreError::request("list_buckets", e.into_service_error()))?;

        Ok(response
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(|name| name.to_string()))
            .collect())
    }

    async fn object_attrs(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectAttrs>, StoreError> {
        let response = match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    return Ok(None);
                }
                return Err(StoreError::request("head_object", service_error));
            }
        };

        Ok(Some(ObjectAttrs {
            name: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            content_type: response.content_type().map(|t| t.to_string()),
            etag: response.e_tag().map(|t| t.trim_matches('"').to_string()),
            uploaded_at: response
                .last_modified()
                .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
        }))
    }

    async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
    ) -> Result<(), StoreError> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| StoreError::request("put_object", e))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("application/gzip")
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::request("put_object", e.into_service_error()))?;

        debug!(bucket = bucket, key = key, "object uploaded");
        Ok(())
    }

    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), StoreError> {
        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(StoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
                return Err(StoreError::request("get_object", service_error));
            }
        };

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(destination).await?;
        let mut body = response.body.into_async_read();
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::request("delete_object", e.into_service_error()))?;
        Ok(())
    }
}
