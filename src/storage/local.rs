use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{BackupError, Result};

use super::{StorageBackend, StorageConfig};

pub struct LocalStorage {
    destination_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let destination_dir = config
            .destination_dir
            .as_ref()
            .ok_or_else(|| BackupError::input("Local storage requires a destination directory"))?
            .clone();

        Ok(Self {
            destination_dir: PathBuf::from(destination_dir),
        })
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn store_file(&self, local_path: &Path, filename: Option<&str>) -> Result<String> {
        if !local_path.exists() {
            return Err(BackupError::upload(format!(
                "Backup file does not exist: {}",
                local_path.display()
            )));
        }

        tokio::fs::create_dir_all(&self.destination_dir).await?;

        let final_name = filename
            .map(|s| s.to_string())
            .or_else(|| local_path.file_name().map(|n| n.to_string_lossy().to_string()))
            .ok_or_else(|| BackupError::input("Cannot determine destination file name"))?;

        let target = self.destination_dir.join(&final_name);

        let same_path = match (local_path.canonicalize(), target.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => local_path == target,
        };

        if !same_path {
            tokio::fs::copy(local_path, &target).await?;
            if let Ok(metadata) = std::fs::metadata(local_path) {
                if let Ok(mtime) = metadata.modified() {
                    let _ = filetime::set_file_mtime(&target, filetime::FileTime::from_system_time(mtime));
                }
            }
        }

        Ok(target.to_string_lossy().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[tokio::test]
    async fn copies_file_to_destination() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();

        let source = src_dir.path().join("dump.sql.gz");
        std::fs::File::create(&source).unwrap().write_all(b"data").unwrap();

        let storage = LocalStorage::new(&StorageConfig {
            destination_dir: Some(dst_dir.path().to_string_lossy().to_string()),
            ..Default::default()
        })
        .unwrap();

        let result = storage.store_file(&source, None).await.unwrap();
        assert!(Path::new(&result).exists());
        assert_eq!(std::fs::read(&result).unwrap(), b"data");
    }

    #[tokio::test]
    async fn same_source_and_destination_skips_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump.sql.gz");
        std::fs::File::create(&source).unwrap().write_all(b"data").unwrap();

        let storage = LocalStorage::new(&StorageConfig {
            destination_dir: Some(dir.path().to_string_lossy().to_string()),
            ..Default::default()
        })
        .unwrap();

        let result = storage.store_file(&source, Some("dump.sql.gz")).await.unwrap();
        assert_eq!(PathBuf::from(result), source);
    }
}
