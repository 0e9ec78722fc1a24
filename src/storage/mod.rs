//! Storage backend abstraction.
//!
//! All four backends share one contract: given a local file, return the
//! canonical URI it now lives at. Dispatched on `StorageType` by the
//! factory at the bottom, in the same style as the adapter layer.

mod azure;
mod gcs;
mod local;
mod s3;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::StorageType;

pub use azure::AzureStorage;
pub use gcs::GcsStorage;
pub use local::LocalStorage;
pub use s3::S3Storage;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stores `local_path`, optionally under `filename` (defaulting to the
    /// source file's own name), and returns the destination's canonical URI.
    async fn store_file(&self, local_path: &Path, filename: Option<&str>) -> Result<String>;
}

/// Configuration needed to construct any one of the four backends. Only
/// the fields relevant to the selected `StorageType` need to be set.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub destination_dir: Option<String>,
    pub bucket: Option<String>,
    pub container: Option<String>,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub azure_connection_string: Option<String>,
}

pub async fn create_storage(storage_type: StorageType, config: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    match storage_type {
        StorageType::Local => Ok(Box::new(LocalStorage::new(config)?)),
        StorageType::S3 => Ok(Box::new(S3Storage::new(config).await?)),
        StorageType::Gcs => Ok(Box::new(GcsStorage::new(config).await?)),
        StorageType::Azure => Ok(Box::new(AzureStorage::new(config)?)),
    }
}

pub(crate) fn trimmed_prefix(prefix: &Option<String>) -> String {
    prefix
        .as_deref()
        .unwrap_or("")
        .trim_matches('/')
        .to_string()
}

pub(crate) fn object_name(prefix: &str, filename: &str) -> String {
    if prefix.is_empty() {
        filename.to_string()
    } else {
        format!("{prefix}/{filename}")
    }
}
