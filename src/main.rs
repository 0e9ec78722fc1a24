//! CLI entry point: one subcommand per external operation.
//!
//! Every handler builds an [`AppContext`] from environment defaults layered
//! under explicit flags, drives the relevant core module, and lets
//! `anyhow::Result` carry errors up to `main` — a non-zero exit with the
//! error on stderr is `anyhow`'s default behavior, matching the contract.

mod adapters;
mod compression;
mod context;
mod cron;
mod db;
mod encryption;
mod error;
mod logging;
mod models;
mod notifications;
mod orchestrator;
mod pipeline;
mod redact;
mod scheduler;
mod storage;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{error, info};

use adapters::params_from_json;
use context::AppContext;
use models::{BackupType, DbType, StorageType};
use pipeline::{BackupOptions, RestoreOptions, RestoreSource};
use scheduler::PassOptions;
use storage::StorageConfig;

#[derive(Parser)]
#[command(name = "dbackup")]
#[command(about = "Scheduling and orchestration core for cross-engine database backup and restore", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Connection flags shared by `backup`, `restore`, and `test-db-connection`.
#[derive(Args, Clone, Default)]
struct ConnectionArgs {
    /// SQLite database file path.
    #[arg(long)]
    db_path: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    database: Option<String>,
    /// Full connection URI; explicit flags above still win over fields it carries.
    #[arg(long)]
    uri: Option<String>,
}

impl ConnectionArgs {
    fn to_params(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(v) = &self.db_path {
            map.insert("path".to_string(), json!(v));
        }
        if let Some(v) = &self.host {
            map.insert("host".to_string(), json!(v));
        }
        if let Some(v) = &self.port {
            map.insert("port".to_string(), json!(v.to_string()));
        }
        if let Some(v) = &self.username {
            map.insert("username".to_string(), json!(v));
        }
        if let Some(v) = &self.password {
            map.insert("password".to_string(), json!(v));
        }
        if let Some(v) = &self.database {
            map.insert("database".to_string(), json!(v));
        }
        if let Some(v) = &self.uri {
            map.insert("uri".to_string(), json!(v));
        }
        Value::Object(map)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backup immediately.
    Backup {
        #[arg(long)]
        name: String,
        #[arg(long, value_enum)]
        db_type: DbType,
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(long, value_enum, default_value = "full")]
        backup_type: BackupType,
        #[arg(long)]
        tables: Option<String>,
        #[arg(long, default_value = "backups")]
        output_dir: PathBuf,
        #[arg(long)]
        filename: Option<String>,
        #[arg(long)]
        compress: bool,
        #[arg(long)]
        encrypt_key: Option<String>,
        #[arg(long, value_enum, default_value = "local")]
        storage: StorageType,
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long)]
        container: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        azure_connection_string: Option<String>,
        #[arg(long)]
        slack_webhook_url: Option<String>,
    },
    /// Restore a previously created backup.
    Restore {
        #[arg(long)]
        artifact_id: Option<i64>,
        #[arg(long)]
        backup_file: Option<PathBuf>,
        #[arg(long, value_enum)]
        db_type: DbType,
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(long)]
        tables: Option<String>,
        #[arg(long)]
        decrypt_key: Option<String>,
        #[arg(long)]
        slack_webhook_url: Option<String>,
    },
    /// Attach a recurring cron schedule to an existing backup job template.
    CreateSchedule {
        #[arg(long)]
        backup_job_id: i64,
        #[arg(long)]
        cron: String,
        #[arg(long)]
        inactive: bool,
        #[arg(long, default_value_t = 3)]
        max_retries: i64,
        #[arg(long, default_value_t = 60)]
        retry_backoff_seconds: i64,
        #[arg(long)]
        due_now: bool,
    },
    /// List recent backup job records.
    ListBackups {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List schedules.
    ListSchedules {
        #[arg(long)]
        active_only: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Run the scheduler, once or continuously.
    RunScheduler {
        #[arg(long)]
        once: bool,
        #[arg(long, default_value_t = 60)]
        interval_seconds: u64,
        #[arg(long, default_value_t = 20)]
        max_jobs: i64,
        #[arg(long)]
        schedule_id: Option<i64>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        quiet: bool,
        #[arg(long, default_value_t = 300)]
        lease_seconds: i64,
    },
    /// Print a one-shot summary of the metadata store.
    SystemStatus,
    /// Check that an adapter can reach a database without doing anything else.
    TestDbConnection {
        #[arg(long, value_enum)]
        db_type: DbType,
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let cli = Cli::parse();
    let ctx = build_context().await?;

    match cli.command {
        Commands::Backup {
            name,
            db_type,
            connection,
            backup_type,
            tables,
            output_dir,
            filename,
            compress,
            encrypt_key,
            storage,
            bucket,
            container,
            prefix,
            region,
            azure_connection_string,
            slack_webhook_url,
        } => {
            let storage_config = StorageConfig {
                destination_dir: matches!(storage, StorageType::Local)
                    .then(|| output_dir.to_string_lossy().to_string()),
                bucket,
                container,
                prefix,
                region,
                endpoint: None,
                azure_connection_string,
            };
            let options = BackupOptions {
                name,
                db_type,
                connection_params: connection.to_params(),
                backup_type,
                tables: parse_tables(tables.as_deref()),
                output_dir,
                filename,
                compress,
                encrypt_key,
                storage_type: storage,
                storage_config,
                slack_webhook_url,
            };
            let outcome = pipeline::run_backup(&ctx, options)
                .await
                .context("backup failed")?;
            info!(
                job_id = outcome.job_id,
                artifact_id = outcome.artifact_id,
                destination = %outcome.destination,
                size_bytes = outcome.size_bytes,
                checksum = %outcome.checksum_sha256,
                "backup succeeded"
            );
            println!(
                "backup succeeded: job={} artifact={} destination={} size={} checksum={}",
                outcome.job_id, outcome.artifact_id, outcome.destination, outcome.size_bytes, outcome.checksum_sha256
            );
        }

        Commands::Restore {
            artifact_id,
            backup_file,
            db_type,
            connection,
            tables,
            decrypt_key,
            slack_webhook_url,
        } => {
            let source = match (artifact_id, backup_file) {
                (Some(id), None) => RestoreSource::Artifact(id),
                (None, Some(path)) => RestoreSource::File(path),
                (Some(_), Some(_)) => {
                    anyhow::bail!("Pass exactly one of --artifact-id or --backup-file, not both.")
                }
                (None, None) => {
                    anyhow::bail!("One of --artifact-id or --backup-file is required.")
                }
            };

            let target_database_path = connection.db_path.clone().map(PathBuf::from);
            let options = RestoreOptions {
                source,
                db_type,
                connection_params: connection.to_params(),
                target_database_path,
                tables: parse_tables(tables.as_deref()),
                decrypt_key,
                slack_webhook_url,
            };
            let outcome = pipeline::run_restore(&ctx, options)
                .await
                .context("restore failed")?;
            match outcome.restore_job_id {
                Some(id) => println!("restore succeeded: restore_job={id}"),
                None => println!("restore succeeded (metadata store target, no restore_job recorded)"),
            }
        }

        Commands::CreateSchedule {
            backup_job_id,
            cron,
            inactive,
            max_retries,
            retry_backoff_seconds,
            due_now,
        } => {
            cron::validate(&cron).context("invalid cron expression")?;
            let now = chrono::Utc::now();
            let next_run_at = if due_now { Some(now) } else { None };

            let schedule_id = ctx
                .store
                .create_schedule(
                    backup_job_id,
                    &cron,
                    !inactive,
                    max_retries,
                    retry_backoff_seconds,
                    next_run_at,
                )
                .await
                .context("failed to create schedule")?;

            println!("created schedule {schedule_id} (cron='{cron}', active={})", !inactive);
        }

        Commands::ListBackups { limit } => {
            let jobs = ctx.store.list_backup_jobs(limit).await?;
            if jobs.is_empty() {
                println!("no backup jobs recorded");
            }
            for job in jobs {
                println!(
                    "#{:<5} {:<24} {:<9} {:<8} {:<9} status={:<8} created={}",
                    job.id,
                    job.name,
                    job.db_type,
                    job.backup_type,
                    job.storage_type,
                    job.status,
                    job.created_at.to_rfc3339()
                );
            }
        }

        Commands::ListSchedules { active_only, limit } => {
            let mut schedules = ctx.store.list_schedules().await?;
            if active_only {
                schedules.retain(|s| s.is_active);
            }
            schedules.truncate(limit.max(0) as usize);
            if schedules.is_empty() {
                println!("no schedules recorded");
            }
            for s in schedules {
                println!(
                    "#{:<5} job={:<5} cron='{}' active={} retries={}/{} next_run={}",
                    s.id,
                    s.backup_job_id,
                    s.cron_expression,
                    s.is_active,
                    s.retry_count,
                    s.max_retries,
                    s.next_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
                );
            }
        }

        Commands::RunScheduler {
            once,
            interval_seconds,
            max_jobs,
            schedule_id,
            dry_run,
            quiet,
            lease_seconds,
        } => {
            let pass = PassOptions {
                dry_run,
                max_jobs,
                schedule_id,
                lease_seconds,
                default_output_dir: PathBuf::from("backups"),
            };

            if once {
                let report = scheduler::run_once_pass(&ctx, pass).await?;
                if !quiet {
                    println!("processed={}", report.processed);
                }
            } else {
                let runner = orchestrator::RunnerOptions {
                    once: false,
                    interval_seconds,
                    pass,
                };
                orchestrator::run(&ctx, runner).await?;
            }
        }

        Commands::SystemStatus => {
            print_system_status(&ctx).await?;
        }

        Commands::TestDbConnection { db_type, connection } => {
            let adapter = adapters::get_adapter(db_type, params_from_json(&connection.to_params()))?;
            match adapter.test_connection().await {
                Ok(()) => println!("connection OK ({db_type})"),
                Err(err) => {
                    error!(error = %err, "connection test failed");
                    anyhow::bail!(err);
                }
            }
        }
    }

    Ok(())
}

async fn build_context() -> Result<AppContext> {
    let metadata_db_path = std::env::var("DJANGO_SQLITE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("backup_metadata.db"));

    if let Some(parent) = metadata_db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).ok();
    }

    let database_url = format!("sqlite://{}?mode=rwc", metadata_db_path.display());
    let staging_dir = std::env::temp_dir().join("dbackup-staging");

    AppContext::new(&database_url, metadata_db_path, staging_dir)
        .await
        .context("failed to open metadata store")
        .map_err(Into::into)
}

fn parse_tables(tables: Option<&str>) -> Vec<String> {
    tables
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

async fn print_system_status(ctx: &AppContext) -> Result<()> {
    let job_count = ctx.store.count_backup_jobs().await?;
    let schedule_count = ctx.store.count_schedules().await?;
    let latest_artifact = ctx.store.latest_artifact().await?;
    let latest_restore = ctx.store.latest_restore_job().await?;
    let next_schedule = ctx.store.next_schedule().await?;

    println!("backup jobs recorded: {job_count}");
    println!("schedules recorded:   {schedule_count}");

    match latest_artifact {
        Some(a) => println!(
            "latest artifact:      #{} {} ({} bytes, {})",
            a.id, a.file_path, a.size_bytes, a.created_at.to_rfc3339()
        ),
        None => println!("latest artifact:      none"),
    }

    match latest_restore {
        Some(r) => println!(
            "latest restore:       #{} status={} ({})",
            r.id,
            r.status,
            r.created_at.to_rfc3339()
        ),
        None => println!("latest restore:       none"),
    }

    match next_schedule {
        Some(s) => println!(
            "next schedule:        #{} cron='{}' next_run={}",
            s.id,
            s.cron_expression,
            s.next_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "due now".to_string())
        ),
        None => println!("next schedule:        none"),
    }

    println!("broker (celery):      {}", sanitized_broker_url());

    Ok(())
}

/// Strips credentials from `CELERY_BROKER_URL`, leaving host, port, and path
/// only — this crate has no Celery integration of its own and only echoes
/// the variable for operational visibility.
fn sanitized_broker_url() -> String {
    let Ok(raw) = std::env::var("CELERY_BROKER_URL") else {
        return "not configured".to_string();
    };
    if raw.is_empty() {
        return "not configured".to_string();
    }

    match url::Url::parse(&raw) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("");
            let port = parsed
                .port()
                .map(|p| format!(":{p}"))
                .unwrap_or_default();
            format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path())
        }
        Err(_) => "configured (unparseable URL)".to_string(),
    }
}
