//! Error types for partplan

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Partitioning backend ({scheme}) rejected the operation: {message}")]
    BackendRejected { scheme: String, message: String },

    #[error("No partition with id {0}")]
    NoSuchPartition(usize),

    #[error("Partition plan invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Not enough free space for: {0}")]
    AllocationShortfall(String),

    #[error("Layout has no root (/) partition")]
    MissingRoot,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("User cancelled operation")]
    UserCancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlanError {
    /// Shorthand for a backend rejection message
    pub fn rejected(scheme: &str, message: impl Into<String>) -> Self {
        PlanError::BackendRejected {
            scheme: scheme.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlanError>;
