//! Record types persisted in the metadata store.
//!
//! Mirrors the four record kinds the metadata store tracks: a backup job
//! and its artifacts, a restore job, and a recurring schedule. Enum fields
//! are stored as their lowercase string representation so the schema stays
//! a plain `TEXT` column and the values read back identically to what the
//! CLI accepts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::BackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Sqlite,
    Postgres,
    Mysql,
    Mongo,
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbType::Sqlite => "sqlite",
            DbType::Postgres => "postgres",
            DbType::Mysql => "mysql",
            DbType::Mongo => "mongo",
        };
        f.write_str(s)
    }
}

impl FromStr for DbType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(DbType::Sqlite),
            "postgres" => Ok(DbType::Postgres),
            "mysql" => Ok(DbType::Mysql),
            "mongo" => Ok(DbType::Mongo),
            other => Err(BackupError::input(format!("Unsupported db_type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
        };
        f.write_str(s)
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "differential" => Ok(BackupType::Differential),
            other => Err(BackupError::input(format!("Unsupported backup_type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
    Gcs,
    Azure,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageType::Local => "local",
            StorageType::S3 => "s3",
            StorageType::Gcs => "gcs",
            StorageType::Azure => "azure",
        };
        f.write_str(s)
    }
}

impl FromStr for StorageType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageType::Local),
            "s3" => Ok(StorageType::S3),
            "gcs" => Ok(StorageType::Gcs),
            "azure" => Ok(StorageType::Azure),
            other => Err(BackupError::input(format!("Unsupported storage_type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(BackupError::input(format!("Unsupported status: {other}"))),
        }
    }
}

/// A single backup run: the job's parameters plus its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: i64,
    pub name: String,
    pub db_type: DbType,
    pub backup_type: BackupType,
    /// JSON-encoded connection parameters, secrets already redacted before
    /// this value is ever persisted.
    pub connection_params: serde_json::Value,
    pub storage_type: StorageType,
    pub destination: String,
    pub status: JobStatus,
    pub is_compressed: bool,
    pub is_encrypted: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored output file produced by a successful `BackupJob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: i64,
    pub backup_job_id: i64,
    pub file_name: String,
    pub file_path: String,
    pub storage_type: StorageType,
    pub size_bytes: i64,
    pub checksum_sha256: String,
    pub is_compressed: bool,
    pub is_encrypted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestoreStatus::Pending => "pending",
            RestoreStatus::Running => "running",
            RestoreStatus::Success => "success",
            RestoreStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RestoreStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RestoreStatus::Pending),
            "running" => Ok(RestoreStatus::Running),
            "success" => Ok(RestoreStatus::Success),
            "failed" => Ok(RestoreStatus::Failed),
            other => Err(BackupError::input(format!("Unsupported status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJob {
    pub id: i64,
    pub backup_job_id: Option<i64>,
    pub backup_artifact_id: Option<i64>,
    pub target_params: serde_json::Value,
    pub selected_tables: Vec<String>,
    pub status: RestoreStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

/// A recurring backup schedule. `lease_expires_at` is the sole
/// synchronization point between concurrent scheduler workers: a worker
/// may dispatch this schedule only by winning the conditional claim update
/// in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub backup_job_id: i64,
    pub cron_expression: String,
    pub is_active: bool,
    pub max_retries: i64,
    pub retry_backoff_seconds: i64,
    pub retry_count: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}
