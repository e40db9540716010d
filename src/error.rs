//! Error types for the query-guard engine.
//!
//! Detection outcomes are never errors: they are reported through
//! `AnalysisResult`. These types cover construction and configuration.

use thiserror::Error;

/// Result type alias for query-guard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for engine construction and configuration
#[derive(Debug, Error)]
pub enum Error {
    /// A signature pattern failed to compile
    #[error("Invalid signature pattern '{id}': {reason}")]
    InvalidPattern { id: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(value: config::ConfigError) -> Self {
        Error::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidPattern {
            id: "union_select".to_string(),
            reason: "unclosed group".to_string(),
        };
        assert!(err.to_string().contains("union_select"));
        assert!(err.to_string().contains("unclosed group"));
    }
}
