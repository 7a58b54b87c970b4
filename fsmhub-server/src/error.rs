//! Service error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Service errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("{0}")]
    Core(#[from] fsmhub_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] fsmhub_storage::StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timer '{name}': {reason}")]
    InvalidTimer { name: String, reason: String },

    #[error("script failed: {0}")]
    Script(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("service shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns a short error code for administrative responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "INTERNAL_ERROR",
            ServerError::Config(_) => "INVALID_CONFIG",
            ServerError::Template(_) => "INVALID_RULES",
            ServerError::Core(e) => e.error_code(),
            ServerError::Storage(_) => "STORAGE_ERROR",
            ServerError::Json(_) => "BAD_REQUEST",
            ServerError::InvalidTimer { .. } => "BAD_ARGUMENTS",
            ServerError::Script(_) => "SCRIPT_FAILED",
            ServerError::InvalidRequest(_) => "BAD_REQUEST",
            ServerError::ShuttingDown => "INTERNAL_ERROR",
        }
    }

    /// Returns whether the error comes from an invalid rule document.
    pub fn is_rules_error(&self) -> bool {
        match self {
            ServerError::Template(_) => true,
            ServerError::Core(e) => e.is_compile_error(),
            _ => false,
        }
    }
}
