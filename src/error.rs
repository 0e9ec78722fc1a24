use thiserror::Error;

/// Unified error type for the backup/restore core.
///
/// Grouped the way the specification separates failure classes: bad input,
/// adapter/tool failures, filesystem I/O, upload failures, and transient
/// scheduler conflicts. CLI handlers convert these into `anyhow::Error` at
/// the boundary via `?`; nothing below the CLI layer panics on expected
/// failure paths.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{0}")]
    Input(String),

    #[error("{0}")]
    Adapter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    pub fn input(msg: impl Into<String>) -> Self {
        BackupError::Input(msg.into())
    }

    pub fn adapter(msg: impl Into<String>) -> Self {
        BackupError::Adapter(msg.into())
    }

    pub fn upload(msg: impl Into<String>) -> Self {
        BackupError::Upload(msg.into())
    }

    pub fn scheduler(msg: impl Into<String>) -> Self {
        BackupError::Scheduler(msg.into())
    }
}
