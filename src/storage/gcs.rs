use std::path::Path;

use async_trait::async_trait;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};

use crate::error::{BackupError, Result};

use super::{object_name, trimmed_prefix, StorageBackend, StorageConfig};

pub struct GcsStorage {
    bucket: String,
    prefix: String,
    client: Client,
}

impl GcsStorage {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| BackupError::input("GCS storage requires a bucket"))?;
        let prefix = trimmed_prefix(&config.prefix);

        let client_config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| BackupError::upload(format!("Failed to load GCS credentials: {e}")))?;
        let client = Client::new(client_config);

        Ok(Self { bucket, prefix, client })
    }
}

#[async_trait]
impl StorageBackend for GcsStorage {
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
        let blob_name = object_name(&self.prefix, &name);

        let data = tokio::fs::read(local_path).await?;
        let upload_type = UploadType::Simple(Media::new(blob_name.clone()));

        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                data,
                &upload_type,
            )
            .await
            .map_err(|e| BackupError::upload(format!("Failed to upload to GCS ({blob_name}): {e}")))?;

        Ok(format!("gs://{}/{}", self.bucket, blob_name))
    }
}
