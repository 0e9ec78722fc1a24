use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;

use crate::error::{BackupError, Result};

use super::{object_name, trimmed_prefix, StorageBackend, StorageConfig};

pub struct S3Storage {
    bucket: String,
    prefix: String,
    client: aws_sdk_s3::Client,
}

impl S3Storage {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| BackupError::input("S3 storage requires a bucket"))?;
        let prefix = trimmed_prefix(&config.prefix);

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let aws_conf = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_conf);
        if config.endpoint.is_some() {
            builder = builder.force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        Ok(Self { bucket, prefix, client })
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn store_file(&self, local_path: &Path, filename: Option<&str>) -> Result<String> {
        if !local_path.exists() {
            return Err(BackupError::upload(format!(
                "Backup file does not exist: {}",
                local_path.display()
            )));
        }

        let name = filename
            .map(|s| s.to_string())
            .or_else(|| local_path.file_name().map(|n| n.to_string_lossy().to_string()))
            .ok_or_else(|| BackupError::input("Cannot determine destination file name"))?;
        let key = object_name(&self.prefix, &name);

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| BackupError::upload(format!("Failed to read file for S3 upload: {e}")))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| BackupError::upload(format!("Failed to upload to S3 ({key}): {e}")))?;

        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}
