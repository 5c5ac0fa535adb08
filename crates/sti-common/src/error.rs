//! Error types shared across the importer workspace

use thiserror::Error;

/// Result type alias for workspace bootstrap operations
pub type Result<T> = std::result::Result<T, StiError>;

/// Errors raised while loading configuration or preparing a run
#[derive(Error, Debug)]
pub enum StiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl StiError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}
