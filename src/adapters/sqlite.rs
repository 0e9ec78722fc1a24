//! SQLite adapter: the only engine handled in-process, via rusqlite's
//! online backup API instead of an external client tool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::adapters::{ConnectionParams, DatabaseAdapter};
use crate::error::{BackupError, Result};
use crate::models::{BackupType, DbType};

pub struct SqliteAdapter {
    params: ConnectionParams,
}

impl SqliteAdapter {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }

    fn database_path(&self) -> PathBuf {
        PathBuf::from(
            self.params
                .get("path")
                .cloned()
                .or_else(|| std::env::var("TARGET_SQLITE_DB_PATH").ok())
                .unwrap_or_else(|| "backup.sqlite3".to_string()),
        )
    }

    fn allow_create(&self) -> bool {
        self.params
            .get("allow_create")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn db_type(&self) -> DbType {
        DbType::Sqlite
    }

    async fn test_connection(&self) -> Result<()> {
        let db_path = self.database_path();
        let allow_create = self.allow_create();
        let is_memory = db_path.to_string_lossy() == ":memory:";

        if !is_memory && !db_path.exists() && !allow_create {
            return Err(BackupError::adapter(format!(
                "SQLite database file does not exist: {}",
                db_path.display()
            )));
        }

        tokio::task::spawn_blocking(move || -> Result<()> {
            if !is_memory && allow_create {
                if let Some(parent) = db_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| BackupError::adapter(format!("Failed to connect to SQLite database: {e}")))?;
            conn.execute_batch("SELECT 1;")
                .map_err(|e| BackupError::adapter(format!("Failed to connect to SQLite database: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| BackupError::adapter(format!("Failed to connect to SQLite database: {e}")))??;

        Ok(())
    }

    async fn backup(&self, output_path: &str, backup_type: BackupType, tables: &[String]) -> Result<String> {
        self.effective_backup_type(backup_type)?;

        if !tables.is_empty() {
            return Err(BackupError::adapter("Selective backup is not implemented for SQLite yet."));
        }

        let source_path = self.database_path();
        if !source_path.exists() {
            return Err(BackupError::adapter(format!(
                "Cannot backup. Source database not found: {}",
                source_path.display()
            )));
        }

        let output = PathBuf::from(output_path);
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let output_for_blocking = output.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let src_conn = rusqlite::Connection::open(&source_path)
                .map_err(|e| BackupError::adapter(format!("SQLite backup failed: {e}")))?;
            let mut dst_conn = rusqlite::Connection::open(&output_for_blocking)
                .map_err(|e| BackupError::adapter(format!("SQLite backup failed: {e}")))?;
            let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)
                .map_err(|e| BackupError::adapter(format!("SQLite backup failed: {e}")))?;
            backup
                .run_to_completion(5, std::time::Duration::from_millis(250), None)
                .map_err(|e| BackupError::adapter(format!("SQLite backup failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| BackupError::adapter(format!("SQLite backup failed: {e}")))??;

        Ok(output.to_string_lossy().to_string())
    }

    async fn restore(&self, backup_file: &str, tables: &[String]) -> Result<()> {
        if !tables.is_empty() {
            return Err(BackupError::adapter("Selective restore is not implemented for SQLite yet."));
        }

        let backup_path = PathBuf::from(backup_file);
        if !backup_path.exists() {
            return Err(BackupError::adapter(format!("Backup file not found: {}", backup_path.display())));
        }

        let target_path = self.database_path();
        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if paths_equal(&backup_path, &target_path) {
            return Ok(());
        }

        let tmp_path = target_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("sqlite_restore_{}.db", Uuid::new_v4()));

        let tmp_for_blocking = tmp_path.clone();
        let restore_result = tokio::task::spawn_blocking(move || -> Result<()> {
            let src_conn = rusqlite::Connection::open(&backup_path)
                .map_err(|e| BackupError::adapter(format!("SQLite restore failed: {e}")))?;
            let mut dst_conn = rusqlite::Connection::open(&tmp_for_blocking)
                .map_err(|e| BackupError::adapter(format!("SQLite restore failed: {e}")))?;
            let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)
                .map_err(|e| BackupError::adapter(format!("SQLite restore failed: {e}")))?;
            backup
                .run_to_completion(5, std::time::Duration::from_millis(250), None)
                .map_err(|e| BackupError::adapter(format!("SQLite restore failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| BackupError::adapter(format!("SQLite restore failed: {e}")))?;

        if let Err(err) = restore_result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }

        std::fs::rename(&tmp_path, &target_path)?;
        Ok(())
    }
}

fn paths_equal(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> ConnectionParams {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn missing_source_database_fails_test_connection() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.sqlite3");
        let adapter = SqliteAdapter::new(params(&[("path", missing.to_str().unwrap())]));
        let err = adapter.test_connection().await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.sqlite3");
        {
            let conn = rusqlite::Connection::open(&source).unwrap();
            conn.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1);").unwrap();
        }

        let adapter = SqliteAdapter::new(params(&[("path", source.to_str().unwrap())]));
        let output = dir.path().join("backup.sqlite3");
        let produced = adapter
            .backup(output.to_str().unwrap(), BackupType::Full, &[])
            .await
            .unwrap();
        assert_eq!(produced, output.to_string_lossy());

        let restore_target = dir.path().join("restored.sqlite3");
        let restore_adapter = SqliteAdapter::new(params(&[("path", restore_target.to_str().unwrap())]));
        restore_adapter.restore(output.to_str().unwrap(), &[]).await.unwrap();

        let conn = rusqlite::Connection::open(&restore_target).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn selective_backup_rejected() {
        let adapter = SqliteAdapter::new(params(&[("path", ":memory:")]));
        let err = adapter
            .backup("/tmp/out.sqlite3", BackupType::Full, &["users".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Selective backup"));
    }
}
