//! Backup and restore pipelines.
//!
//! Both pipelines thread a single file through a fixed sequence of
//! transforms (adapter dump → compress → encrypt → checksum → upload, or
//! its mirror for restore) and record the outcome in the metadata store.
//! Every step that touches the filesystem cleans up after itself on
//! failure; nothing here decides scheduling policy, that's `scheduler.rs`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::adapters::{self, params_from_json};
use crate::compression;
use crate::context::AppContext;
use crate::encryption;
use crate::error::{BackupError, Result};
use crate::models::{BackupType, DbType, StorageType};
use crate::notifications::send_slack_notification;
use crate::redact;
use crate::storage::{self, StorageConfig};

const CHECKSUM_BUFFER_BYTES: usize = 1024 * 1024;

/// Filename suffix chosen per engine, mirroring the default backup names
/// the original tool produces.
fn default_extension(db_type: DbType) -> &'static str {
    match db_type {
        DbType::Sqlite => ".sqlite3",
        DbType::Postgres => ".dump",
        DbType::Mysql => ".sql",
        DbType::Mongo => ".archive",
    }
}

fn default_filename(name: &str, db_type: DbType) -> String {
    let slug = name.trim().replace(' ', "_").to_lowercase();
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    format!("{slug}-{db_type}-{timestamp}{}", default_extension(db_type))
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHECKSUM_BUFFER_BYTES];
    loop {
        use std::io::Read;
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Everything a backup run needs, already validated by the CLI layer or
/// synthesized by the scheduler from a schedule's stored template.
pub struct BackupOptions {
    pub name: String,
    pub db_type: DbType,
    pub connection_params: Value,
    pub backup_type: BackupType,
    pub tables: Vec<String>,
    pub output_dir: PathBuf,
    pub filename: Option<String>,
    pub compress: bool,
    pub encrypt_key: Option<String>,
    pub storage_type: StorageType,
    pub storage_config: StorageConfig,
    pub slack_webhook_url: Option<String>,
}

pub struct BackupOutcome {
    pub job_id: i64,
    pub artifact_id: i64,
    pub destination: String,
    pub size_bytes: i64,
    pub checksum_sha256: String,
}

/// Runs one backup end to end. On any failure the job is marked failed
/// with the error message, a best-effort Slack notification is sent, and
/// the error is propagated to the caller.
pub async fn run_backup(ctx: &AppContext, options: BackupOptions) -> Result<BackupOutcome> {
    let redacted_params = redact::redact(&options.connection_params);
    let job_id = ctx
        .store
        .create_backup_job(
            &options.name,
            options.db_type,
            options.backup_type,
            &redacted_params,
            options.storage_type,
            &options.output_dir.to_string_lossy(),
        )
        .await?;

    match run_backup_inner(ctx, &options, job_id).await {
        Ok(outcome) => {
            send_slack_notification(
                options.slack_webhook_url.as_deref(),
                &format!(
                    "Backup '{}' succeeded: {} ({} bytes)",
                    options.name, outcome.destination, outcome.size_bytes
                ),
            )
            .await;
            Ok(outcome)
        }
        Err(err) => {
            let _ = ctx.store.mark_backup_job_failed(job_id, &err.to_string()).await;
            send_slack_notification(
                options.slack_webhook_url.as_deref(),
                &format!("Backup '{}' failed: {err}", options.name),
            )
            .await;
            Err(err)
        }
    }
}

async fn run_backup_inner(ctx: &AppContext, options: &BackupOptions, job_id: i64) -> Result<BackupOutcome> {
    ctx.store.mark_backup_job_started(job_id).await?;

    let connection_params = params_from_json(&options.connection_params);
    let adapter = adapters::get_adapter(options.db_type, connection_params)?;
    adapter.test_connection().await?;

    let effective_backup_type = adapter.effective_backup_type(options.backup_type)?;

    tokio::fs::create_dir_all(&options.output_dir).await?;
    let filename = options
        .filename
        .clone()
        .unwrap_or_else(|| default_filename(&options.name, options.db_type));
    let dump_path = options.output_dir.join(&filename);

    let produced = adapter
        .backup(&dump_path.to_string_lossy(), effective_backup_type, &options.tables)
        .await?;
    let mut current = PathBuf::from(produced);

    let mut is_compressed = false;
    if options.compress {
        let compressed = compression::compress_file(&current, None)?;
        std::fs::remove_file(&current)?;
        current = compressed;
        is_compressed = true;
    }

    let mut is_encrypted = false;
    if let Some(key) = &options.encrypt_key {
        let encrypted = encryption::encrypt_file(&current, key, None)?;
        std::fs::remove_file(&current)?;
        current = encrypted;
        is_encrypted = true;
    }

    let checksum = sha256_file(&current)?;
    let size_bytes = std::fs::metadata(&current)?.len() as i64;

    let backend = storage::create_storage(options.storage_type, &options.storage_config).await?;
    let final_name = current
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| BackupError::input("Produced backup file has no file name"))?;
    let destination = backend.store_file(&current, Some(&final_name)).await?;

    let artifact_id = ctx
        .store
        .create_backup_artifact(
            job_id,
            &final_name,
            &destination,
            options.storage_type,
            size_bytes,
            &checksum,
            is_compressed,
            is_encrypted,
        )
        .await?;

    ctx.store
        .mark_backup_job_succeeded(job_id, is_compressed, is_encrypted)
        .await?;

    Ok(BackupOutcome {
        job_id,
        artifact_id,
        destination,
        size_bytes,
        checksum_sha256: checksum,
    })
}

/// Selects the file a restore will operate on: either an existing backup
/// artifact (which must live in local storage) or an explicit file path.
pub enum RestoreSource {
    Artifact(i64),
    File(PathBuf),
}

pub struct RestoreOptions {
    pub source: RestoreSource,
    pub db_type: DbType,
    pub connection_params: Value,
    pub target_database_path: Option<PathBuf>,
    pub tables: Vec<String>,
    pub decrypt_key: Option<String>,
    pub slack_webhook_url: Option<String>,
}

pub struct RestoreOutcome {
    pub restore_job_id: Option<i64>,
}

/// Runs one restore end to end. When the resolved target is the metadata
/// store's own database file, no `RestoreJob` row is created (writing one
/// would race the restore itself) and the metadata connection pool is
/// closed before the adapter touches the file.
pub async fn run_restore(ctx: &AppContext, options: RestoreOptions) -> Result<RestoreOutcome> {
    let (source_path, backup_job_id, backup_artifact_id) = resolve_source(ctx, &options.source).await?;

    let restoring_metadata_db = options
        .db_type
        .eq(&DbType::Sqlite)
        .then(|| is_restoring_metadata_db(ctx, options.target_database_path.as_deref()))
        .unwrap_or(false);

    let restore_job_id = if restoring_metadata_db {
        tracing::warn!("restore target is the metadata store's own database; skipping restore job bookkeeping");
        None
    } else {
        Some(
            ctx.store
                .create_restore_job(
                    backup_job_id,
                    backup_artifact_id,
                    &redact::redact(&options.connection_params),
                    &options.tables,
                )
                .await?,
        )
    };

    if let Some(id) = restore_job_id {
        ctx.store.mark_restore_job_started(id).await?;
    }

    let result = run_restore_inner(ctx, &options, &source_path, restoring_metadata_db).await;

    match result {
        Ok(()) => {
            if let Some(id) = restore_job_id {
                ctx.store.mark_restore_job_succeeded(id).await?;
            }
            send_slack_notification(options.slack_webhook_url.as_deref(), "Restore succeeded").await;
            Ok(RestoreOutcome { restore_job_id })
        }
        Err(err) => {
            if let Some(id) = restore_job_id {
                let _ = ctx.store.mark_restore_job_failed(id, &err.to_string()).await;
            }
            send_slack_notification(
                options.slack_webhook_url.as_deref(),
                &format!("Restore failed: {err}"),
            )
            .await;
            Err(err)
        }
    }
}

async fn resolve_source(ctx: &AppContext, source: &RestoreSource) -> Result<(PathBuf, Option<i64>, Option<i64>)> {
    match source {
        RestoreSource::File(path) => Ok((path.clone(), None, None)),
        RestoreSource::Artifact(artifact_id) => {
            let artifact = ctx.store.get_backup_artifact(*artifact_id).await?;
            if artifact.storage_type != StorageType::Local {
                return Err(BackupError::input(
                    "Restoring directly from an artifact requires storage_type 'local'; download the file and pass --backup-file instead.",
                ));
            }
            Ok((
                PathBuf::from(&artifact.file_path),
                Some(artifact.backup_job_id),
                Some(artifact.id),
            ))
        }
    }
}

fn is_restoring_metadata_db(ctx: &AppContext, target: Option<&Path>) -> bool {
    let Some(target) = target else {
        return false;
    };
    match (target.canonicalize(), ctx.metadata_db_path.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => target == ctx.metadata_db_path,
    }
}

async fn run_restore_inner(
    ctx: &AppContext,
    options: &RestoreOptions,
    source_path: &Path,
    restoring_metadata_db: bool,
) -> Result<()> {
    if !source_path.exists() {
        return Err(BackupError::input(format!(
            "Backup file not found: {}",
            source_path.display()
        )));
    }

    tokio::fs::create_dir_all(&ctx.staging_dir).await?;
    let mut current = source_path.to_path_buf();
    let mut staged: Vec<PathBuf> = Vec::new();

    if current.extension().and_then(|e| e.to_str()) == Some("enc") {
        let key = options
            .decrypt_key
            .as_ref()
            .ok_or_else(|| BackupError::input("Backup file is encrypted; --decrypt-key is required."))?;
        // Preserve a compressed source's ".gz" so the check below still
        // recognizes it once decryption strips only the ".enc" layer.
        let inner_extension = current
            .file_stem()
            .map(Path::new)
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .filter(|ext| *ext == "gz")
            .map(str::to_string);
        let output = ctx
            .staging_dir
            .join(unique_stage_name(&current, "dec", inner_extension.as_deref()));
        let decrypted = encryption::decrypt_file(&current, key, Some(&output))?;
        staged.push(decrypted.clone());
        current = decrypted;
    }

    if current.extension().and_then(|e| e.to_str()) == Some("gz") {
        let output = ctx.staging_dir.join(unique_stage_name(&current, "dec", None));
        let decompressed = compression::decompress_file(&current, Some(&output))?;
        staged.push(decompressed.clone());
        current = decompressed;
    }

    let connection_params = params_from_json(&options.connection_params);
    let adapter = adapters::get_adapter(options.db_type, connection_params)?;

    let result = if restoring_metadata_db {
        ctx.store.close().await;
        adapter.restore(&current.to_string_lossy(), &options.tables).await
    } else {
        adapter.restore(&current.to_string_lossy(), &options.tables).await
    };

    for path in staged {
        let _ = std::fs::remove_file(path);
    }

    result
}

/// Builds a unique staging filename from `path`'s stem (the extension just
/// consumed by the current stage is dropped). When `keep_extension` is set,
/// that suffix is reattached after the tag instead of being dropped, so a
/// later stage's extension check still sees it (e.g. decrypting
/// `foo.sql.gz.enc` must still end in `.gz`, not lose it to the `.enc`
/// strip).
fn unique_stage_name(path: &Path, tag: &str, keep_extension: Option<&str>) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "staged".to_string());

    match keep_extension {
        Some(ext) => {
            let body = stem.strip_suffix(&format!(".{ext}")).unwrap_or(&stem);
            format!("{body}-{tag}-{}.{ext}", uuid::Uuid::new_v4())
        }
        None => format!("{stem}-{tag}-{}", uuid::Uuid::new_v4()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filename_uses_slug_and_extension() {
        let name = default_filename("Orders DB", DbType::Postgres);
        assert!(name.starts_with("orders_db-postgres-"));
        assert!(name.ends_with(".dump"));
    }

    #[test]
    fn default_extension_matches_engine() {
        assert_eq!(default_extension(DbType::Sqlite), ".sqlite3");
        assert_eq!(default_extension(DbType::Mysql), ".sql");
        assert_eq!(default_extension(DbType::Mongo), ".archive");
    }

    #[test]
    fn checksum_is_stable_for_same_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"same bytes").unwrap();
        let a = sha256_file(&path).unwrap();
        let b = sha256_file(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn unique_stage_name_keeps_inner_gz_extension() {
        let path = Path::new("/staging/foo.sql.gz.enc");
        let name = unique_stage_name(path, "dec", Some("gz"));
        assert!(name.starts_with("foo.sql-dec-"));
        assert!(name.ends_with(".gz"));
    }

    #[tokio::test]
    async fn restore_decrypts_then_decompresses_gz_enc_source() {
        let dir = tempfile::tempdir().unwrap();

        let source = dir.path().join("source.sqlite3");
        {
            let conn = rusqlite::Connection::open(&source).unwrap();
            conn.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (42);").unwrap();
        }

        let compressed = compression::compress_file(&source, None).unwrap();
        let encrypted = encryption::encrypt_file(&compressed, "s3cr3t", None).unwrap();
        assert!(encrypted.to_string_lossy().ends_with(".gz.enc"));

        let restore_target = dir.path().join("restored.sqlite3");
        let ctx = AppContext::new(
            "sqlite::memory:",
            dir.path().join("metadata.db"),
            dir.path().join("staging"),
        )
        .await
        .unwrap();

        let options = RestoreOptions {
            source: RestoreSource::File(encrypted.clone()),
            db_type: DbType::Sqlite,
            connection_params: serde_json::json!({ "path": restore_target.to_string_lossy() }),
            target_database_path: Some(restore_target.clone()),
            tables: Vec::new(),
            decrypt_key: Some("s3cr3t".to_string()),
            slack_webhook_url: None,
        };

        run_restore_inner(&ctx, &options, &encrypted, false).await.unwrap();

        let conn = rusqlite::Connection::open(&restore_target).unwrap();
        let value: i64 = conn.query_row("SELECT id FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(value, 42);
    }
}
