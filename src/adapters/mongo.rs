//! MongoDB adapter: shells out to `mongodump`/`mongorestore`, optionally
//! probing connectivity with `mongosh` when it's available.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use url::Url;
use uuid::Uuid;

use crate::adapters::{require_binary, run_command, ConnectionParams, DatabaseAdapter};
use crate::error::{BackupError, Result};
use crate::models::{BackupType, DbType};

pub struct MongoAdapter {
    params: ConnectionParams,
}

impl MongoAdapter {
    pub fn new(params: ConnectionParams) -> Result<Self> {
        let params = normalize_params(params)?;
        Ok(Self { params })
    }

    fn connection_target_args(&self) -> Vec<String> {
        if let Some(uri) = self.params.get("uri") {
            return vec![uri.clone()];
        }

        let host = self.params.get("host").cloned().unwrap_or_else(|| "localhost".to_string());
        let mut target = host;
        if let Some(port) = self.params.get("port") {
            target = format!("{target}:{port}");
        }
        if let Some(database) = self.params.get("database") {
            target = format!("{target}/{database}");
        }

        let mut args = vec![target];
        if let Some(username) = self.params.get("username") {
            args.push("--username".to_string());
            args.push(username.clone());
        }
        if let Some(password) = self.params.get("password") {
            args.push("--password".to_string());
            args.push(password.clone());
        }
        args
    }

    fn connection_args(&self, command: &mut Command) {
        if let Some(uri) = self.params.get("uri") {
            command.arg(format!("--uri={uri}"));
            return;
        }
        if let Some(host) = self.params.get("host") {
            command.arg("--host").arg(host);
        }
        if let Some(port) = self.params.get("port") {
            command.arg("--port").arg(port);
        }
        if let Some(username) = self.params.get("username") {
            command.arg("--username").arg(username);
        }
        if let Some(password) = self.params.get("password") {
            command.arg("--password").arg(password);
        }
    }

    fn required_database(&self) -> Result<&str> {
        self.params
            .get("database")
            .map(|s| s.as_str())
            .ok_or_else(|| BackupError::adapter("MongoDB requires --database or --uri with database name."))
    }

    fn namespace_filters(database: &str, collections: &[String]) -> Vec<String> {
        collections
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(|c| format!("--nsInclude={database}.{c}"))
            .collect()
    }
}

fn normalize_params(mut params: ConnectionParams) -> Result<ConnectionParams> {
    let Some(uri) = params.get("uri").cloned() else {
        return Ok(params);
    };

    let parsed = Url::parse(&uri).map_err(|e| BackupError::adapter(format!("Invalid MongoDB URI: {e}")))?;
    if parsed.scheme() != "mongodb" && parsed.scheme() != "mongodb+srv" {
        return Err(BackupError::adapter("MongoDB URI must start with mongodb:// or mongodb+srv://"));
    }

    if !params.contains_key("username") && !parsed.username().is_empty() {
        params.insert(
            "username".to_string(),
            percent_encoding::percent_decode_str(parsed.username())
                .decode_utf8_lossy()
                .to_string(),
        );
    }
    if !params.contains_key("password") {
        if let Some(password) = parsed.password() {
            params.insert(
                "password".to_string(),
                percent_encoding::percent_decode_str(password).decode_utf8_lossy().to_string(),
            );
        }
    }
    if !params.contains_key("host") {
        if let Some(host) = parsed.host_str() {
            params.insert("host".to_string(), host.to_string());
        }
    }
    if !params.contains_key("port") {
        if let Some(port) = parsed.port() {
            params.insert("port".to_string(), port.to_string());
        }
    }
    if !params.contains_key("database") {
        let path = parsed.path().trim_start_matches('/');
        if !path.is_empty() {
            params.insert(
                "database".to_string(),
                percent_encoding::percent_decode_str(path).decode_utf8_lossy().to_string(),
            );
        }
    }

    Ok(params)
}

#[async_trait]
impl DatabaseAdapter for MongoAdapter {
    fn db_type(&self) -> DbType {
        DbType::Mongo
    }

    fn supports_selective_restore(&self) -> bool {
        true
    }

    async fn test_connection(&self) -> Result<()> {
        if which::which("mongosh").is_ok() {
            let mut command = Command::new("mongosh");
            command.arg("--quiet").arg("--eval").arg("db.runCommand({ ping: 1 })");
            for arg in self.connection_target_args() {
                command.arg(arg);
            }
            run_command(command, "MongoDB connection test").await?;
            return Ok(());
        }

        require_binary("mongodump")?;
        let archive_path = std::env::temp_dir().join(format!("mongo_connect_{}.archive", Uuid::new_v4()));

        let mut command = Command::new("mongodump");
        command.arg(format!("--archive={}", archive_path.display())).arg("--quiet");
        self.connection_args(&mut command);
        if let Some(database) = self.params.get("database") {
            command.arg("--db").arg(database);
        }

        let result = run_command(command, "MongoDB connection test").await;
        let _ = std::fs::remove_file(&archive_path);
        result?;
        Ok(())
    }

    async fn backup(&self, output_path: &str, backup_type: BackupType, tables: &[String]) -> Result<String> {
        self.validate_backup_type(backup_type)?;
        if backup_type != BackupType::Full {
            return Err(BackupError::adapter("MongoDB adapter currently supports only full backup."));
        }

        require_binary("mongodump")?;
        let database = self.required_database()?.to_string();

        if let Some(parent) = Path::new(output_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut command = Command::new("mongodump");
        command.arg(format!("--archive={output_path}")).arg("--quiet");
        self.connection_args(&mut command);
        command.arg("--db").arg(&database);
        for arg in Self::namespace_filters(&database, tables) {
            command.arg(arg);
        }

        run_command(command, "MongoDB backup").await?;
        Ok(output_path.to_string())
    }

    async fn restore(&self, backup_file: &str, tables: &[String]) -> Result<()> {
        let source = Path::new(backup_file);
        if !source.exists() {
            return Err(BackupError::adapter(format!("Backup file not found: {}", source.display())));
        }

        require_binary("mongorestore")?;

        let mut command = Command::new("mongorestore");
        command.arg(format!("--archive={backup_file}")).arg("--drop").arg("--quiet");
        self.connection_args(&mut command);

        if !tables.is_empty() {
            let database = self.required_database()?.to_string();
            for arg in Self::namespace_filters(&database, tables) {
                command.arg(arg);
            }
        }

        run_command(command, "MongoDB restore").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_mongo_scheme() {
        let mut params = ConnectionParams::new();
        params.insert("uri".to_string(), "mysql://user:pw@host/db".to_string());
        let err = MongoAdapter::new(params).unwrap_err();
        assert!(err.to_string().contains("mongodb:// or mongodb+srv://"));
    }

    #[test]
    fn namespace_filters_skip_blank_entries() {
        let filters = MongoAdapter::namespace_filters("app", &["users".to_string(), "  ".to_string()]);
        assert_eq!(filters, vec!["--nsInclude=app.users".to_string()]);
    }
}
