use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use azure_storage::prelude::*;
use azure_storage_blobs::prelude::*;

use crate::error::{BackupError, Result};

use super::{object_name, trimmed_prefix, StorageBackend, StorageConfig};

pub struct AzureStorage {
    container: String,
    prefix: String,
    client: ContainerClient,
}

impl AzureStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let container = config
            .container
            .clone()
            .ok_or_else(|| BackupError::input("Azure storage requires a container"))?;
        let connection_string = config
            .azure_connection_string
            .clone()
            .ok_or_else(|| BackupError::input("Azure connection string is required for Azure blob uploads."))?;
        let prefix = trimmed_prefix(&config.prefix);

        let storage_credentials = StorageCredentials::connection_string(&connection_string)
            .map_err(|e| BackupError::input(format!("Invalid Azure connection string: {e}")))?;
        let service_client = ClientBuilder::new("", storage_credentials).container_client(&container);

        Ok(Self {
            container,
            prefix,
            client: service_client,
        })
    }
}

#[async_trait]
impl StorageBackend for AzureStorage {
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

        self.client
            .blob_client(&blob_name)
            .put_block_blob(Arc::new(data))
            .await
            .map_err(|e| BackupError::upload(format!("Failed to upload to Azure blob ({blob_name}): {e}")))?;

        Ok(format!("azure://{}/{}", self.container, blob_name))
    }
}
