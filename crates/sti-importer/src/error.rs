//! Error taxonomy of an import run
//!
//! [`ImportError`] is what escapes an observation source: every variant stops
//! the run. Unit and record level problems never become an `ImportError`;
//! they are logged where they happen and the unit or record is dropped.
//! [`ConvertError`] is the record level failure a converter reports.

use crate::service::ServiceError;
use thiserror::Error;

/// Result type for run-fatal operations
pub type Result<T> = std::result::Result<T, ImportError>;

/// Run-aborting failures
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to fetch {locator}: {message}")]
    Fetch { locator: String, message: String },

    #[error("Unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Path must be a directory: {0}")]
    DirectoryNotFound(String),

    #[error("Invalid file id pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Malformed input: {0}")]
    Format(String),

    #[error("Failed to communicate with SensorThings service: {0}")]
    Service(#[from] ServiceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImportError {
    pub fn fetch(locator: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Fetch {
            locator: locator.to_string(),
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<crate::xml::XmlError> for ImportError {
    fn from(err: crate::xml::XmlError) -> Self {
        ImportError::Format(err.to_string())
    }
}

/// A single record could not be turned into an observation
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Failed to parse number '{0}'")]
    Number(String),

    #[error("Failed to parse time '{value}': {message}")]
    Time { value: String, message: String },

    #[error("Missing field '{0}'")]
    MissingField(String),

    #[error("No {kind} found for '{key}'")]
    MissingEntity { kind: &'static str, key: String },
}

impl ConvertError {
    pub fn time(value: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Time {
            value: value.into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_message() {
        let err = ImportError::fetch("http://example.org/data.csv", "HTTP 503");
        assert_eq!(
            err.to_string(),
            "Failed to fetch http://example.org/data.csv: HTTP 503"
        );
    }

    #[test]
    fn test_convert_error_messages() {
        assert_eq!(
            ConvertError::Number("abc".into()).to_string(),
            "Failed to parse number 'abc'"
        );
        let err = ConvertError::MissingEntity {
            kind: "FeatureOfInterest",
            key: "SAM.09.LAA.822.7.1".into(),
        };
        assert_eq!(err.to_string(), "No FeatureOfInterest found for 'SAM.09.LAA.822.7.1'");
    }
}
