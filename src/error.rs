//! Error taxonomy shared by the store, scheduler and sandbox

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by task registry and execution operations
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task (or draft) is absent
    #[error("task not found: {0}")]
    NotFound(String),

    /// Duplicate id on create
    #[error("task already exists: {0}")]
    AlreadyExists(String),

    /// Empty body, malformed schedule, bad id...
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Uncaught exception (or launch failure) inside the sandbox
    #[error("script execution failed: {0}")]
    SandboxFailure(String),

    /// Run exceeded its time budget
    #[error("script execution timed out after {}ms", .0.as_millis())]
    SandboxTimeout(Duration),

    /// Metadata header could not be decoded. Non-fatal: callers log it and
    /// substitute defaults.
    #[error("malformed metadata in {file}: {reason}")]
    MetadataParse { file: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Stable machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidInput(_) => "invalid_input",
            Self::SandboxFailure(_) => "sandbox_failure",
            Self::SandboxTimeout(_) => "sandbox_timeout",
            Self::MetadataParse { .. } => "metadata_parse_error",
            Self::Io(_) => "io",
        }
    }
}

impl From<crate::core::CronError> for TaskError {
    fn from(err: crate::core::CronError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<crate::core::TranspileError> for TaskError {
    fn from(err: crate::core::TranspileError) -> Self {
        Self::SandboxFailure(err.to_string())
    }
}
