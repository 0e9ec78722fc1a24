//! Process-wide state, threaded explicitly rather than held in statics.

use std::path::PathBuf;

use crate::db::MetadataStore;

/// Bundles the metadata store and the handful of paths/settings every
/// subsystem needs. Constructed once in `main` and passed by reference
/// into the scheduler, adapters, and pipeline.
#[derive(Clone)]
pub struct AppContext {
    pub store: MetadataStore,
    /// Absolute path of the metadata store's own SQLite file, used to
    /// detect a restore that targets the tool's own bookkeeping database.
    pub metadata_db_path: PathBuf,
    /// Scratch directory for restore transforms (decrypt/decompress).
    pub staging_dir: PathBuf,
}

impl AppContext {
    pub async fn new(database_url: &str, metadata_db_path: PathBuf, staging_dir: PathBuf) -> crate::error::Result<Self> {
        let store = MetadataStore::connect(database_url).await?;
        Ok(Self {
            store,
            metadata_db_path,
            staging_dir,
        })
    }
}
