//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::{ErrorKind, JobId, JobStatus, TaskKind};

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("No eligible account available for platform '{platform}'")]
    AccountUnavailable { platform: String },

    #[error("The {queue} queue is full (capacity {capacity})")]
    QueueFull { queue: TaskKind, capacity: usize },

    #[error("Job {job_id} already has a task in flight")]
    AlreadyQueued { job_id: JobId },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Machine error kind reported to API callers, when one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::InvalidTransition { .. } | Self::AlreadyQueued { .. } | Self::Validation(_) => {
                Some(ErrorKind::InvalidTransition)
            }
            Self::AccountUnavailable { .. } => Some(ErrorKind::AccountUnavailable),
            Self::DatabaseSqlx(_)
            | Self::Migration(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::IoPath { .. } => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}
