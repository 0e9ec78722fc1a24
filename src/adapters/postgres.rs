//! PostgreSQL adapter: shells out to `psql`, `pg_dump`, `pg_restore`.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::adapters::{require_binary, run_command, ConnectionParams, DatabaseAdapter};
use crate::error::{BackupError, Result};
use crate::models::{BackupType, DbType};

pub struct PostgresAdapter {
    params: ConnectionParams,
}

impl PostgresAdapter {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }

    fn password_env(&self, command: &mut Command) {
        if let Some(password) = self.params.get("password") {
            command.env("PGPASSWORD", password);
        }
    }

    fn connection_target_args(&self) -> Result<Vec<String>> {
        if let Some(uri) = self.params.get("uri") {
            return Ok(vec![uri.clone()]);
        }
        let database = self
            .params
            .get("database")
            .ok_or_else(|| BackupError::adapter("PostgreSQL requires --database or --uri."))?;

        let mut args = self.standard_connection_args();
        args.push(database.clone());
        Ok(args)
    }

    fn db_connection_command_parts(&self) -> Result<Vec<String>> {
        if let Some(uri) = self.params.get("uri") {
            return Ok(vec!["--dbname".to_string(), uri.clone()]);
        }
        let database = self
            .params
            .get("database")
            .ok_or_else(|| BackupError::adapter("PostgreSQL requires --database or --uri."))?;

        let mut args = self.standard_connection_args();
        args.push("--dbname".to_string());
        args.push(database.clone());
        Ok(args)
    }

    fn standard_connection_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(host) = self.params.get("host") {
            args.push("--host".to_string());
            args.push(host.clone());
        }
        if let Some(port) = self.params.get("port") {
            args.push("--port".to_string());
            args.push(port.clone());
        }
        if let Some(username) = self.params.get("username") {
            args.push("--username".to_string());
            args.push(username.clone());
        }
        args
    }

    fn table_args(&self, tables: &[String]) -> Vec<String> {
        let mut args = Vec::new();
        for table in tables {
            let table = table.trim();
            if !table.is_empty() {
                args.push("--table".to_string());
                args.push(table.to_string());
            }
        }
        args
    }
}

fn is_ignorable_restore_warning(details: &str) -> bool {
    let normalized: String = details.split_whitespace().collect::<Vec<_>>().join(" ");
    let has_transaction_timeout = normalized.contains("unrecognized configuration parameter \"transaction_timeout\"");
    let has_single_ignored_error = normalized.contains("errors ignored on restore: 1");
    has_transaction_timeout && has_single_ignored_error
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn db_type(&self) -> DbType {
        DbType::Postgres
    }

    fn supports_selective_restore(&self) -> bool {
        true
    }

    async fn test_connection(&self) -> Result<()> {
        require_binary("psql")?;

        let mut command = Command::new("psql");
        command
            .arg("--no-password")
            .arg("--tuples-only")
            .arg("--no-align")
            .arg("--command")
            .arg("SELECT 1;");
        for part in self.db_connection_command_parts()? {
            command.arg(part);
        }
        self.password_env(&mut command);

        run_command(command, "PostgreSQL connection test").await?;
        Ok(())
    }

    async fn backup(&self, output_path: &str, backup_type: BackupType, tables: &[String]) -> Result<String> {
        self.effective_backup_type(backup_type)?;
        require_binary("pg_dump")?;

        if let Some(parent) = Path::new(output_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut command = Command::new("pg_dump");
        command
            .arg("--no-password")
            .arg("--format=custom")
            .arg("--file")
            .arg(output_path);
        for arg in self.table_args(tables) {
            command.arg(arg);
        }
        for part in self.connection_target_args()? {
            command.arg(part);
        }
        self.password_env(&mut command);

        run_command(command, "PostgreSQL backup").await?;
        Ok(output_path.to_string())
    }

    async fn restore(&self, backup_file: &str, tables: &[String]) -> Result<()> {
        let source = Path::new(backup_file);
        if !source.exists() {
            return Err(BackupError::adapter(format!("Backup file not found: {}", source.display())));
        }

        let is_sql = source
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("sql"))
            .unwrap_or(false);

        if is_sql {
            if !tables.is_empty() {
                return Err(BackupError::adapter(
                    "Selective restore from plain SQL is not supported. Use a .dump file for table-selective restore.",
                ));
            }
            require_binary("psql")?;

            let mut command = Command::new("psql");
            command.arg("--no-password").arg("--set").arg("ON_ERROR_STOP=1");
            for part in self.db_connection_command_parts()? {
                command.arg(part);
            }
            command.arg("-f").arg(source);
            self.password_env(&mut command);

            run_command(command, "PostgreSQL restore").await?;
            return Ok(());
        }

        require_binary("pg_restore")?;

        let mut command = Command::new("pg_restore");
        command
            .arg("--no-password")
            .arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--no-privileges");
        for arg in self.table_args(tables) {
            command.arg(arg);
        }
        for part in self.db_connection_command_parts()? {
            command.arg(part);
        }
        command.arg(source);
        self.password_env(&mut command);

        match run_command(command, "PostgreSQL restore").await {
            Ok(_) => Ok(()),
            Err(err) => {
                let message = err.to_string();
                if is_ignorable_restore_warning(&message) {
                    tracing::warn!(details = %message, "ignoring known PostgreSQL restore compatibility warning");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ignorable_restore_warning() {
        let details = "pg_restore: warning: errors ignored on restore: 1\npg_restore: while PROCESSING TOC: \
                        unrecognized configuration parameter \"transaction_timeout\"";
        assert!(is_ignorable_restore_warning(details));
    }

    #[test]
    fn other_warnings_are_not_ignorable() {
        assert!(!is_ignorable_restore_warning("some other unrelated failure"));
    }

    #[tokio::test]
    async fn missing_database_and_uri_rejected() {
        let adapter = PostgresAdapter::new(ConnectionParams::new());
        let err = adapter.connection_target_args().unwrap_err();
        assert!(err.to_string().contains("requires --database or --uri"));
    }
}
