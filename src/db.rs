//! Metadata store.
//!
//! An embedded SQLite database, accessed exclusively through `sqlx`, that
//! tracks backup jobs, their artifacts, restore jobs, and schedules. Schema
//! creation is idempotent (`CREATE TABLE IF NOT EXISTS`) — there is no
//! external migration tool in scope, so this module is the schema's only
//! source of truth. Row types hold dates as RFC 3339 text and enums as
//! their lowercase string form, matching the rest of the corpus.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{BackupError, Result};
use crate::models::{
    BackupArtifact, BackupJob, BackupType, DbType, JobStatus, RestoreJob, RestoreStatus, Schedule,
    StorageType,
};

/// Narrow repository over the metadata store. Holds the pool, nothing else.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Closes every pooled connection. Used only when a restore is about
    /// to overwrite the metadata store's own database file out from under
    /// itself.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                db_type TEXT NOT NULL,
                backup_type TEXT NOT NULL,
                connection_params TEXT NOT NULL DEFAULT '{}',
                storage_type TEXT NOT NULL DEFAULT 'local',
                destination TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                is_compressed INTEGER NOT NULL DEFAULT 0,
                is_encrypted INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                finished_at TEXT,
                duration_seconds REAL,
                last_error TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_job_id INTEGER NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                storage_type TEXT NOT NULL DEFAULT 'local',
                size_bytes INTEGER NOT NULL DEFAULT 0,
                checksum_sha256 TEXT NOT NULL DEFAULT '',
                is_compressed INTEGER NOT NULL DEFAULT 0,
                is_encrypted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS restore_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_job_id INTEGER REFERENCES backup_jobs(id) ON DELETE SET NULL,
                backup_artifact_id INTEGER REFERENCES backup_artifacts(id) ON DELETE SET NULL,
                target_params TEXT NOT NULL DEFAULT '{}',
                selected_tables TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT,
                finished_at TEXT,
                duration_seconds REAL,
                error_message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_job_id INTEGER NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
                cron_expression TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_backoff_seconds INTEGER NOT NULL DEFAULT 60,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                next_run_at TEXT,
                lease_expires_at TEXT,
                last_error TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -- Backup jobs ---------------------------------------------------

    pub async fn create_backup_job(
        &self,
        name: &str,
        db_type: DbType,
        backup_type: BackupType,
        connection_params: &Value,
        storage_type: StorageType,
        destination: &str,
    ) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO backup_jobs (
                name, db_type, backup_type, connection_params, storage_type,
                destination, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)
            "#,
        )
        .bind(name)
        .bind(db_type.to_string())
        .bind(backup_type.to_string())
        .bind(connection_params.to_string())
        .bind(storage_type.to_string())
        .bind(destination)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn mark_backup_job_started(&self, id: i64) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE backup_jobs SET status = 'running', started_at = ?1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_backup_job_succeeded(&self, id: i64, is_compressed: bool, is_encrypted: bool) -> Result<()> {
        let job = self.get_backup_job(id).await?;
        let now = Utc::now();
        let duration = job
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);

        sqlx::query(
            r#"
            UPDATE backup_jobs
            SET status = 'success', is_compressed = ?1, is_encrypted = ?2,
                finished_at = ?3, duration_seconds = ?4, last_error = '', updated_at = ?3
            WHERE id = ?5
            "#,
        )
        .bind(is_compressed)
        .bind(is_encrypted)
        .bind(now.to_rfc3339())
        .bind(duration)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_backup_job_failed(&self, id: i64, error: &str) -> Result<()> {
        let job = self.get_backup_job(id).await?;
        let now = Utc::now();
        let duration = job
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);

        sqlx::query(
            r#"
            UPDATE backup_jobs
            SET status = 'failed', finished_at = ?1, duration_seconds = ?2, last_error = ?3, updated_at = ?1
            WHERE id = ?4
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(duration)
        .bind(truncate(error, 4000))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_backup_job(&self, id: i64) -> Result<BackupJob> {
        let row = sqlx::query("SELECT * FROM backup_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BackupError::input(format!("Backup job {id} not found")))?;

        row_to_backup_job(row)
    }

    pub async fn list_backup_jobs(&self, limit: i64) -> Result<Vec<BackupJob>> {
        let rows = sqlx::query("SELECT * FROM backup_jobs ORDER BY created_at DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_backup_job).collect()
    }

    // -- Backup artifacts ------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_backup_artifact(
        &self,
        backup_job_id: i64,
        file_name: &str,
        file_path: &str,
        storage_type: StorageType,
        size_bytes: i64,
        checksum_sha256: &str,
        is_compressed: bool,
        is_encrypted: bool,
    ) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO backup_artifacts (
                backup_job_id, file_name, file_path, storage_type, size_bytes,
                checksum_sha256, is_compressed, is_encrypted, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(backup_job_id)
        .bind(file_name)
        .bind(file_path)
        .bind(storage_type.to_string())
        .bind(size_bytes)
        .bind(checksum_sha256)
        .bind(is_compressed)
        .bind(is_encrypted)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_backup_artifact(&self, id: i64) -> Result<BackupArtifact> {
        let row = sqlx::query("SELECT * FROM backup_artifacts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BackupError::input(format!("Backup artifact {id} not found")))?;

        row_to_backup_artifact(row)
    }

    pub async fn latest_artifact_for_job(&self, backup_job_id: i64) -> Result<Option<BackupArtifact>> {
        let row = sqlx::query(
            "SELECT * FROM backup_artifacts WHERE backup_job_id = ?1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(backup_job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_backup_artifact).transpose()
    }

    // -- Restore jobs -----------------------------------------------------

    pub async fn create_restore_job(
        &self,
        backup_job_id: Option<i64>,
        backup_artifact_id: Option<i64>,
        target_params: &Value,
        selected_tables: &[String],
    ) -> Result<i64> {
        let now = Utc::now();
        let selected = serde_json::to_string(selected_tables).unwrap_or_else(|_| "[]".to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO restore_jobs (
                backup_job_id, backup_artifact_id, target_params, selected_tables,
                status, created_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
            "#,
        )
        .bind(backup_job_id)
        .bind(backup_artifact_id)
        .bind(target_params.to_string())
        .bind(selected)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn mark_restore_job_started(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE restore_jobs SET status = 'running', started_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_restore_job_succeeded(&self, id: i64) -> Result<()> {
        let job = self.get_restore_job(id).await?;
        let now = Utc::now();
        let duration = job
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);

        sqlx::query(
            r#"
            UPDATE restore_jobs
            SET status = 'success', finished_at = ?1, duration_seconds = ?2, error_message = ''
            WHERE id = ?3
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(duration)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_restore_job_failed(&self, id: i64, error: &str) -> Result<()> {
        let job = self.get_restore_job(id).await?;
        let now = Utc::now();
        let duration = job
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);

        sqlx::query(
            r#"
            UPDATE restore_jobs
            SET status = 'failed', finished_at = ?1, duration_seconds = ?2, error_message = ?3
            WHERE id = ?4
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(duration)
        .bind(truncate(error, 4000))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_restore_job(&self, id: i64) -> Result<RestoreJob> {
        let row = sqlx::query("SELECT * FROM restore_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BackupError::input(format!("Restore job {id} not found")))?;

        row_to_restore_job(row)
    }

    // -- Schedules ---------------------------------------------------------

    pub async fn create_schedule(
        &self,
        backup_job_id: i64,
        cron_expression: &str,
        is_active: bool,
        max_retries: i64,
        retry_backoff_seconds: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (
                backup_job_id, cron_expression, is_active, max_retries,
                retry_backoff_seconds, next_run_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(backup_job_id)
        .bind(cron_expression)
        .bind(is_active)
        .bind(max_retries)
        .bind(retry_backoff_seconds)
        .bind(next_run_at.map(|dt| dt.to_rfc3339()))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Schedule> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BackupError::input(format!("Schedule {id} not found")))?;

        row_to_schedule(row)
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_schedule).collect()
    }

    /// Schedules eligible for dispatch: active, due by `next_run_at`, and not
    /// presently held under an unexpired lease. Ordered by ascending
    /// `next_run_at` (nulls first) so the most overdue schedules survive
    /// a `max_jobs` truncation.
    pub async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM schedules
            WHERE is_active = 1
              AND (next_run_at IS NULL OR next_run_at <= ?1)
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
            ORDER BY (next_run_at IS NULL) DESC, next_run_at ASC
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_schedule).collect()
    }

    /// Atomic acquire: a single guarded UPDATE is the sole correctness
    /// mechanism here. Zero rows affected means someone else holds the
    /// lease (or the schedule is gone/inactive) and `None` is returned —
    /// callers must not retry in a loop, the schedule is simply not theirs
    /// this pass.
    pub async fn claim(&self, schedule_id: i64, lease_seconds: i64, now: DateTime<Utc>) -> Result<Option<Schedule>> {
        let lease_expires_at = now + chrono::Duration::seconds(lease_seconds);

        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET lease_expires_at = ?1
            WHERE id = ?2
              AND is_active = 1
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?3)
            "#,
        )
        .bind(lease_expires_at.to_rfc3339())
        .bind(schedule_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(self.get_schedule(schedule_id).await?))
    }

    /// Extends an already-held lease without touching any other field.
    /// Used to keep a long-running backup's claim alive.
    pub async fn renew_lease(&self, schedule_id: i64, lease_seconds: i64, now: DateTime<Utc>) -> Result<()> {
        let lease_expires_at = now + chrono::Duration::seconds(lease_seconds);
        sqlx::query("UPDATE schedules SET lease_expires_at = ?1 WHERE id = ?2")
            .bind(lease_expires_at.to_rfc3339())
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_ran(&self, schedule_id: i64, next_run_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = ?1, next_run_at = ?2, retry_count = 0,
                last_error = '', lease_expires_at = NULL
            WHERE id = ?3
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(next_run_at.to_rfc3339())
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Releases the lease unconditionally, without otherwise mutating the
    /// schedule. Used for dry-run passes and invalid-cron deactivation
    /// where no run is recorded.
    pub async fn release_lease(&self, schedule_id: i64) -> Result<()> {
        sqlx::query("UPDATE schedules SET lease_expires_at = NULL WHERE id = ?1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate_schedule(&self, schedule_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE schedules SET is_active = 0, last_error = ?1, lease_expires_at = NULL WHERE id = ?2",
        )
        .bind(truncate(error, 4000))
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Applies the retry ladder: advances `retry_count` and computes the
    /// next firing instant, or resets to the precomputed cron boundary once
    /// retries are exhausted. Always releases the lease and records
    /// `last_error`.
    pub async fn mark_failed(
        &self,
        schedule: &Schedule,
        error: &str,
        next_cron_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let attempt = schedule.retry_count + 1;

        let outcome = if attempt <= schedule.max_retries {
            // `attempt` comes from an operator-set `--max-retries`, which can be
            // arbitrarily large; clamp the exponent so `2^exponent` never
            // overflows i64, and saturate the multiply before the 3600s cap.
            let exponent = (attempt - 1).clamp(0, 62) as u32;
            let delay_seconds = schedule
                .retry_backoff_seconds
                .max(0)
                .saturating_mul(1i64 << exponent)
                .min(3600);
            let next_run_at = now + chrono::Duration::seconds(delay_seconds);

            sqlx::query(
                r#"
                UPDATE schedules
                SET retry_count = ?1, next_run_at = ?2, last_error = ?3, lease_expires_at = NULL
                WHERE id = ?4
                "#,
            )
            .bind(attempt)
            .bind(next_run_at.to_rfc3339())
            .bind(truncate(error, 4000))
            .bind(schedule.id)
            .execute(&self.pool)
            .await?;

            FailureOutcome {
                state: FailureState::Retrying,
                attempt,
                max_retries: schedule.max_retries,
                delay_seconds: Some(delay_seconds),
                next_run_at,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE schedules
                SET retry_count = 0, next_run_at = ?1, last_error = ?2, lease_expires_at = NULL
                WHERE id = ?3
                "#,
            )
            .bind(next_cron_run_at.to_rfc3339())
            .bind(truncate(error, 4000))
            .bind(schedule.id)
            .execute(&self.pool)
            .await?;

            FailureOutcome {
                state: FailureState::NextCron,
                attempt,
                max_retries: schedule.max_retries,
                delay_seconds: None,
                next_run_at: next_cron_run_at,
            }
        };

        Ok(outcome)
    }

    // -- Status summary ----------------------------------------------------

    pub async fn count_backup_jobs(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM backup_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }

    pub async fn count_schedules(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM schedules")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }

    pub async fn latest_artifact(&self) -> Result<Option<BackupArtifact>> {
        let row = sqlx::query("SELECT * FROM backup_artifacts ORDER BY created_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_backup_artifact).transpose()
    }

    pub async fn latest_restore_job(&self) -> Result<Option<RestoreJob>> {
        let row = sqlx::query("SELECT * FROM restore_jobs ORDER BY created_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_restore_job).transpose()
    }

    /// Active schedule with the soonest `next_run_at`, nulls (due immediately
    /// once claimed) sorted ahead of any timestamp.
    pub async fn next_schedule(&self) -> Result<Option<Schedule>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM schedules
            WHERE is_active = 1
            ORDER BY (next_run_at IS NULL) DESC, next_run_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_schedule).transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureState {
    Retrying,
    NextCron,
}

#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub state: FailureState,
    pub attempt: i64,
    pub max_retries: i64,
    pub delay_seconds: Option<i64>,
    pub next_run_at: DateTime<Utc>,
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        value.to_string()
    } else {
        value.chars().take(max_len).collect()
    }
}

fn parse_dt(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BackupError::Store(sqlx::Error::Decode(Box::new(e))))
}

fn parse_dt_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_dt(&v)).transpose()
}

fn row_to_backup_job(row: sqlx::sqlite::SqliteRow) -> Result<BackupJob> {
    let connection_params_text: String = row.try_get("connection_params")?;
    Ok(BackupJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        db_type: row.try_get::<String, _>("db_type")?.parse()?,
        backup_type: row.try_get::<String, _>("backup_type")?.parse()?,
        connection_params: serde_json::from_str(&connection_params_text).unwrap_or(Value::Null),
        storage_type: row.try_get::<String, _>("storage_type")?.parse()?,
        destination: row.try_get("destination")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        is_compressed: row.try_get::<bool, _>("is_compressed")?,
        is_encrypted: row.try_get::<bool, _>("is_encrypted")?,
        started_at: parse_dt_opt(row.try_get("started_at")?)?,
        finished_at: parse_dt_opt(row.try_get("finished_at")?)?,
        duration_seconds: row.try_get("duration_seconds")?,
        last_error: row.try_get("last_error")?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_backup_artifact(row: sqlx::sqlite::SqliteRow) -> Result<BackupArtifact> {
    Ok(BackupArtifact {
        id: row.try_get("id")?,
        backup_job_id: row.try_get("backup_job_id")?,
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        storage_type: row.try_get::<String, _>("storage_type")?.parse()?,
        size_bytes: row.try_get("size_bytes")?,
        checksum_sha256: row.try_get("checksum_sha256")?,
        is_compressed: row.try_get::<bool, _>("is_compressed")?,
        is_encrypted: row.try_get::<bool, _>("is_encrypted")?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_restore_job(row: sqlx::sqlite::SqliteRow) -> Result<RestoreJob> {
    let target_params_text: String = row.try_get("target_params")?;
    let selected_tables_text: String = row.try_get("selected_tables")?;
    Ok(RestoreJob {
        id: row.try_get("id")?,
        backup_job_id: row.try_get("backup_job_id")?,
        backup_artifact_id: row.try_get("backup_artifact_id")?,
        target_params: serde_json::from_str(&target_params_text).unwrap_or(Value::Null),
        selected_tables: serde_json::from_str(&selected_tables_text).unwrap_or_default(),
        status: row.try_get::<String, _>("status")?.parse::<RestoreStatus>()?,
        started_at: parse_dt_opt(row.try_get("started_at")?)?,
        finished_at: parse_dt_opt(row.try_get("finished_at")?)?,
        duration_seconds: row.try_get("duration_seconds")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_schedule(row: sqlx::sqlite::SqliteRow) -> Result<Schedule> {
    Ok(Schedule {
        id: row.try_get("id")?,
        backup_job_id: row.try_get("backup_job_id")?,
        cron_expression: row.try_get("cron_expression")?,
        is_active: row.try_get::<bool, _>("is_active")?,
        max_retries: row.try_get("max_retries")?,
        retry_backoff_seconds: row.try_get("retry_backoff_seconds")?,
        retry_count: row.try_get("retry_count")?,
        last_run_at: parse_dt_opt(row.try_get("last_run_at")?)?,
        next_run_at: parse_dt_opt(row.try_get("next_run_at")?)?,
        lease_expires_at: parse_dt_opt(row.try_get("lease_expires_at")?)?,
        last_error: row.try_get("last_error")?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackupType as BT;

    async fn in_memory_store() -> MetadataStore {
        MetadataStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_backup_job_round_trips() {
        let store = in_memory_store().await;
        let id = store
            .create_backup_job(
                "nightly",
                DbType::Postgres,
                BT::Full,
                &serde_json::json!({"host": "db"}),
                StorageType::Local,
                "/backups",
            )
            .await
            .unwrap();

        let job = store.get_backup_job(id).await.unwrap();
        assert_eq!(job.name, "nightly");
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_expiry() {
        let store = in_memory_store().await;
        let job_id = store
            .create_backup_job(
                "job",
                DbType::Sqlite,
                BT::Full,
                &serde_json::json!({}),
                StorageType::Local,
                "/tmp",
            )
            .await
            .unwrap();
        let schedule_id = store
            .create_schedule(job_id, "* * * * *", true, 3, 60, None)
            .await
            .unwrap();

        let now = Utc::now();
        let first = store.claim(schedule_id, 300, now).await.unwrap();
        assert!(first.is_some());

        let second = store.claim(schedule_id, 300, now).await.unwrap();
        assert!(second.is_none());

        let later = now + chrono::Duration::seconds(301);
        let third = store.claim(schedule_id, 300, later).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn mark_failed_follows_retry_ladder() {
        let store = in_memory_store().await;
        let job_id = store
            .create_backup_job(
                "job",
                DbType::Sqlite,
                BT::Full,
                &serde_json::json!({}),
                StorageType::Local,
                "/tmp",
            )
            .await
            .unwrap();
        let schedule_id = store
            .create_schedule(job_id, "0 * * * *", true, 3, 60, None)
            .await
            .unwrap();

        let now = Utc::now();
        let next_cron = now + chrono::Duration::hours(1);

        for (expected_attempt, expected_delay) in [(1, 60), (2, 120), (3, 240)] {
            let schedule = store.get_schedule(schedule_id).await.unwrap();
            let outcome = store.mark_failed(&schedule, "boom", next_cron, now).await.unwrap();
            assert_eq!(outcome.state, FailureState::Retrying);
            assert_eq!(outcome.attempt, expected_attempt);
            assert_eq!(outcome.delay_seconds, Some(expected_delay));
        }

        let schedule = store.get_schedule(schedule_id).await.unwrap();
        let outcome = store.mark_failed(&schedule, "boom", next_cron, now).await.unwrap();
        assert_eq!(outcome.state, FailureState::NextCron);
        let final_schedule = store.get_schedule(schedule_id).await.unwrap();
        assert_eq!(final_schedule.retry_count, 0);
        assert_eq!(final_schedule.next_run_at, Some(next_cron));
    }

    #[tokio::test]
    async fn due_schedules_excludes_future_and_leased() {
        let store = in_memory_store().await;
        let job_id = store
            .create_backup_job(
                "job",
                DbType::Sqlite,
                BT::Full,
                &serde_json::json!({}),
                StorageType::Local,
                "/tmp",
            )
            .await
            .unwrap();
        let now = Utc::now();
        let due_id = store
            .create_schedule(job_id, "* * * * *", true, 3, 60, None)
            .await
            .unwrap();
        let future_id = store
            .create_schedule(job_id, "* * * * *", true, 3, 60, Some(now + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let due = store.due_schedules(now).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|s| s.id).collect();
        assert!(ids.contains(&due_id));
        assert!(!ids.contains(&future_id));

        store.claim(due_id, 300, now).await.unwrap();
        let due_after_claim = store.due_schedules(now).await.unwrap();
        assert!(!due_after_claim.iter().any(|s| s.id == due_id));
    }
}
