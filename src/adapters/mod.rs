//! Database adapter abstraction.
//!
//! One adapter per supported engine, dispatched on [`crate::models::DbType`]
//! rather than through dynamic class discovery — the factory below is the
//! entire extension point. Each adapter advertises which backup types it
//! natively supports; the shared default methods on the trait implement the
//! fallback-to-full policy so individual adapters only need to override the
//! capability flags.

mod mongo;
mod mysql;
mod postgres;
mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{BackupError, Result};
use crate::models::{BackupType, DbType};

pub use mongo::MongoAdapter;
pub use mysql::MysqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

/// Flattened connection parameters as passed in from the CLI or a
/// schedule's stored `connection_params`. Values are always strings; the
/// adapters themselves parse ports, booleans, etc.
pub type ConnectionParams = HashMap<String, String>;

pub fn params_from_json(value: &Value) -> ConnectionParams {
    let mut params = ConnectionParams::new();
    if let Value::Object(map) = value {
        for (key, v) in map {
            let as_string = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            params.insert(key.clone(), as_string);
        }
    }
    params
}

#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn db_type(&self) -> DbType;

    fn supports_incremental(&self) -> bool {
        false
    }

    fn supports_differential(&self) -> bool {
        false
    }

    fn fallback_incremental_to_full(&self) -> bool {
        true
    }

    fn fallback_differential_to_full(&self) -> bool {
        true
    }

    fn supports_selective_restore(&self) -> bool {
        false
    }

    async fn test_connection(&self) -> Result<()>;

    async fn backup(&self, output_path: &str, backup_type: BackupType, tables: &[String]) -> Result<String>;

    async fn restore(&self, backup_file: &str, tables: &[String]) -> Result<()>;

    /// Validates a requested backup type against this adapter's capability
    /// flags without yet resolving a fallback.
    fn validate_backup_type(&self, backup_type: BackupType) -> Result<()> {
        if backup_type == BackupType::Incremental
            && !self.supports_incremental()
            && !self.fallback_incremental_to_full()
        {
            return Err(BackupError::adapter(format!(
                "{} adapter does not support incremental backup yet.",
                self.db_type()
            )));
        }
        if backup_type == BackupType::Differential
            && !self.supports_differential()
            && !self.fallback_differential_to_full()
        {
            return Err(BackupError::adapter(format!(
                "{} adapter does not support differential backup yet.",
                self.db_type()
            )));
        }
        Ok(())
    }

    /// Resolves the backup type that will actually be executed, downgrading
    /// to full and logging a warning when the engine lacks native support
    /// but the fallback flag permits it.
    fn effective_backup_type(&self, backup_type: BackupType) -> Result<BackupType> {
        self.validate_backup_type(backup_type)?;

        if backup_type == BackupType::Incremental && !self.supports_incremental() {
            tracing::warn!(
                db_type = %self.db_type(),
                "incremental backup requested but unsupported; falling back to full"
            );
            return Ok(BackupType::Full);
        }
        if backup_type == BackupType::Differential && !self.supports_differential() {
            tracing::warn!(
                db_type = %self.db_type(),
                "differential backup requested but unsupported; falling back to full"
            );
            return Ok(BackupType::Full);
        }
        Ok(backup_type)
    }
}

pub fn get_adapter(db_type: DbType, connection_params: ConnectionParams) -> Result<Box<dyn DatabaseAdapter>> {
    match db_type {
        DbType::Sqlite => Ok(Box::new(SqliteAdapter::new(connection_params))),
        DbType::Postgres => Ok(Box::new(PostgresAdapter::new(connection_params))),
        DbType::Mysql => Ok(Box::new(MysqlAdapter::new(connection_params)?)),
        DbType::Mongo => Ok(Box::new(MongoAdapter::new(connection_params)?)),
    }
}

/// Runs an external tool, returning its trimmed stderr (falling back to
/// stdout) as the error message on non-zero exit. Shared by every adapter
/// that shells out.
pub(crate) async fn run_command(
    mut command: tokio::process::Command,
    action: &str,
) -> Result<std::process::Output> {
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let output = command
        .output()
        .await
        .map_err(|e| BackupError::adapter(format!("{action} failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let details = if !stderr.is_empty() {
            stderr
        } else if !stdout.is_empty() {
            stdout
        } else {
            "Unknown command failure.".to_string()
        };
        return Err(BackupError::adapter(format!("{action} failed: {details}")));
    }

    Ok(output)
}

pub(crate) fn require_binary(binary_name: &str) -> Result<()> {
    match which::which(binary_name) {
        Ok(_) => Ok(()),
        Err(_) => Err(BackupError::adapter(format!(
            "'{binary_name}' is required but not found in PATH."
        ))),
    }
}
