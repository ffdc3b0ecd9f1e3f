//! Error types for the orchestration subsystem

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task id unknown or already evicted
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Task id already registered
    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    /// Refused status transition
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Children cannot be attached to a finished parent
    #[error("Parent task {0} has already finished")]
    ParentFinished(TaskId),

    /// Submitted source does not exist
    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Container could not be opened or enumerated
    #[error("Archive error: {0}")]
    Archive(String),

    /// Batch exceeds the configured file limit
    #[error("Batch contains {count} files, limit is {max}")]
    TooManyFiles { count: usize, max: usize },

    /// Concurrency gate closed (shutdown)
    #[error("Concurrency gate is closed")]
    GateClosed,

    /// Failure raised by the page-processing collaborator
    #[error("Processing failed: {0}")]
    Processor(#[from] anyhow::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Zip error
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// TOML error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// No async runtime available to spawn workers on
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an archive error
    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::Archive(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Task join error: {}", err))
    }
}
