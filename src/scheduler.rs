//! Schedule dispatch: turns due `Schedule` rows into backup pipeline runs.
//!
//! The lease held in the metadata store is the only coordination point
//! across workers; nothing here holds an in-process mutex across
//! schedules. Every code path that claims a schedule releases it again —
//! via `mark_ran`, `mark_failed`, an invalid-cron deactivation, or an
//! explicit `release_lease` for dry runs — before returning.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::context::AppContext;
use crate::cron;
use crate::db::FailureState;
use crate::error::Result;
use crate::models::{BackupType, DbType, Schedule, StorageType};
use crate::pipeline::{self, BackupOptions};
use crate::redact;
use crate::storage::StorageConfig;

const DEFAULT_LEASE_SECONDS: i64 = 300;
const DEFAULT_MAX_JOBS: i64 = 20;

pub struct PassOptions {
    pub dry_run: bool,
    pub max_jobs: i64,
    pub schedule_id: Option<i64>,
    pub lease_seconds: i64,
    pub default_output_dir: PathBuf,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_jobs: DEFAULT_MAX_JOBS,
            schedule_id: None,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            default_output_dir: PathBuf::from("backups"),
        }
    }
}

pub struct PassReport {
    pub processed: i64,
}

/// Runs a single scheduler pass: claims up to `max_jobs` due schedules and
/// drives each one's pipeline run concurrently as an independent task,
/// joining before returning.
pub async fn run_once_pass(ctx: &AppContext, opts: PassOptions) -> Result<PassReport> {
    let now = Utc::now();
    let mut due = ctx.store.due_schedules(now).await?;

    if let Some(id) = opts.schedule_id {
        due.retain(|s| s.id == id);
    }
    due.truncate(opts.max_jobs.max(1) as usize);

    if due.is_empty() {
        tracing::info!(at = %now.to_rfc3339(), "no due schedules");
        return Ok(PassReport { processed: 0 });
    }

    let lease_seconds = opts.lease_seconds.max(1);
    let dry_run = opts.dry_run;
    let default_output_dir = opts.default_output_dir.clone();

    let mut handles = Vec::with_capacity(due.len());
    for schedule in due {
        let ctx = ctx.clone();
        let output_dir = default_output_dir.clone();
        handles.push(tokio::spawn(async move {
            run_one_schedule(&ctx, schedule.id, dry_run, lease_seconds, now, output_dir).await
        }));
    }

    let mut processed = 0i64;
    for handle in handles {
        match handle.await {
            Ok(Ok(claimed)) => {
                if claimed {
                    processed += 1;
                }
            }
            Ok(Err(err)) => tracing::error!(error = %err, "scheduler pass task returned an error"),
            Err(join_err) => tracing::error!(error = %join_err, "scheduler pass task panicked"),
        }
    }

    Ok(PassReport { processed })
}

async fn run_one_schedule(
    ctx: &AppContext,
    schedule_id: i64,
    dry_run: bool,
    lease_seconds: i64,
    now: DateTime<Utc>,
    default_output_dir: PathBuf,
) -> Result<bool> {
    let Some(schedule) = ctx.store.claim(schedule_id, lease_seconds, now).await? else {
        return Ok(false);
    };

    let next_cron = match cron::next_run_at(&schedule.cron_expression, now) {
        Ok(next) => next,
        Err(err) => {
            ctx.store
                .deactivate_schedule(schedule.id, &err.to_string())
                .await?;
            tracing::error!(
                schedule_id = schedule.id,
                error = %err,
                "schedule disabled: cron expression invalid"
            );
            return Ok(true);
        }
    };

    if dry_run {
        tracing::info!(
            schedule_id = schedule.id,
            backup_job_id = schedule.backup_job_id,
            cron = %schedule.cron_expression,
            next_run = %next_cron.to_rfc3339(),
            "dry run: schedule would fire"
        );
        ctx.store.release_lease(schedule.id).await?;
        return Ok(true);
    }

    let result = dispatch_schedule(ctx, &schedule, lease_seconds, default_output_dir).await;

    match result {
        Ok(()) => {
            ctx.store.mark_ran(schedule.id, next_cron, Utc::now()).await?;
            tracing::info!(schedule_id = schedule.id, next_run = %next_cron.to_rfc3339(), "schedule ran");
        }
        Err(err) => {
            let outcome = ctx
                .store
                .mark_failed(&schedule, &err.to_string(), next_cron, Utc::now())
                .await?;
            match outcome.state {
                FailureState::Retrying => tracing::error!(
                    schedule_id = schedule.id,
                    attempt = outcome.attempt,
                    max_retries = outcome.max_retries,
                    delay_seconds = outcome.delay_seconds,
                    error = %err,
                    "schedule failed, retrying"
                ),
                FailureState::NextCron => tracing::error!(
                    schedule_id = schedule.id,
                    next_run = %outcome.next_run_at.to_rfc3339(),
                    error = %err,
                    "schedule failed after max retries, resuming at next cron boundary"
                ),
            }
        }
    }

    Ok(true)
}

/// Synthesizes backup options from the schedule's template job, spawns the
/// lease-renewal task for the duration of the run, and invokes the backup
/// pipeline.
async fn dispatch_schedule(
    ctx: &AppContext,
    schedule: &Schedule,
    lease_seconds: i64,
    default_output_dir: PathBuf,
) -> Result<()> {
    let template = ctx.store.get_backup_job(schedule.backup_job_id).await?;
    redact::ensure_not_redacted(&template.connection_params)?;

    let options = build_backup_options(&template, default_output_dir)?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let renewal_handle = spawn_lease_renewal(ctx.clone(), schedule.id, lease_seconds, stop_rx);

    tracing::info!(
        schedule_id = schedule.id,
        backup_job_id = template.id,
        db_type = %template.db_type,
        storage = %template.storage_type,
        "running schedule"
    );

    let result = pipeline::run_backup(ctx, options).await;

    let _ = stop_tx.send(());
    let _ = renewal_handle.await;

    result.map(|_| ())
}

/// Re-extends the schedule's lease at `lease_seconds / 3` intervals so a
/// long-running backup survives past the lease's original expiry, until
/// cancelled by the oneshot sent at pipeline completion.
fn spawn_lease_renewal(
    ctx: AppContext,
    schedule_id: i64,
    lease_seconds: i64,
    mut stop_rx: tokio::sync::oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs((lease_seconds / 3).max(1) as u64);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = ctx.store.renew_lease(schedule_id, lease_seconds, Utc::now()).await {
                        tracing::warn!(schedule_id, error = %err, "failed to renew schedule lease");
                    }
                }
            }
        }
    })
}

fn build_backup_options(template: &crate::models::BackupJob, default_output_dir: PathBuf) -> Result<BackupOptions> {
    let params = &template.connection_params;

    let mut name = template.name.clone();
    if !name.ends_with("-scheduled") {
        name.push_str("-scheduled");
    }

    let output_dir = string_field(params, "output_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            if template.destination.is_empty() {
                default_output_dir
            } else {
                PathBuf::from(&template.destination)
            }
        });

    let tables = extract_tables(params);
    let storage_config = build_storage_config(params, &template.storage_type);
    let slack_webhook_url = string_field(params, "slack_webhook_url");

    let encrypt_key = if template.is_encrypted {
        Some(
            std::env::var("BACKUP_ENCRYPT_KEY").map_err(|_| {
                crate::error::BackupError::input(
                    "Template requires encryption but BACKUP_ENCRYPT_KEY env var is not set.",
                )
            })?,
        )
    } else {
        None
    };

    Ok(BackupOptions {
        name,
        db_type: template.db_type,
        connection_params: params.clone(),
        backup_type: template.backup_type,
        tables,
        output_dir,
        filename: string_field(params, "filename"),
        compress: template.is_compressed,
        encrypt_key,
        storage_type: template.storage_type,
        storage_config,
        slack_webhook_url,
    })
}

fn string_field(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_tables(params: &Value) -> Vec<String> {
    match params.get("tables") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn build_storage_config(params: &Value, storage_type: &StorageType) -> StorageConfig {
    StorageConfig {
        destination_dir: matches!(storage_type, StorageType::Local)
            .then(|| string_field(params, "output_dir"))
            .flatten(),
        bucket: string_field(params, "bucket"),
        container: string_field(params, "container"),
        prefix: string_field(params, "prefix"),
        region: string_field(params, "region"),
        endpoint: string_field(params, "endpoint"),
        azure_connection_string: string_field(params, "azure_connection_string"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_tables_from_array() {
        let params = json!({"tables": ["users", " orders ", ""]});
        assert_eq!(extract_tables(&params), vec!["users", "orders"]);
    }

    #[test]
    fn extract_tables_from_comma_string() {
        let params = json!({"tables": "users, orders"});
        assert_eq!(extract_tables(&params), vec!["users", "orders"]);
    }

    #[test]
    fn build_backup_options_appends_scheduled_suffix_once() {
        let template = crate::models::BackupJob {
            id: 1,
            name: "nightly-scheduled".to_string(),
            db_type: DbType::Sqlite,
            backup_type: BackupType::Full,
            connection_params: json!({}),
            storage_type: StorageType::Local,
            destination: "/tmp/backups".to_string(),
            status: crate::models::JobStatus::Pending,
            is_compressed: false,
            is_encrypted: false,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            last_error: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let options = build_backup_options(&template, PathBuf::from("backups")).unwrap();
        assert_eq!(options.name, "nightly-scheduled");
    }
}
