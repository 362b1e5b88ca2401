//! # Engine Error Types
//!
//! Crate-wide error enum and result alias. Handlers and the scheduler map
//! these onto task rows (`failed` + `error_message`); the web layer maps them
//! onto HTTP status codes.

use thiserror::Error;

/// Errors produced by the execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad metadata or parameters for an operation. No retry.
    #[error("validation error: {0}")]
    Validation(String),

    /// A required precondition does not hold (missing row, disabled storage
    /// location, destination exists without overwrite, wrong task status).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Subprocess spawn failure, signal, or non-zero exit.
    #[error("command failed: {0}")]
    Command(String),

    /// Subprocess or handler exceeded its wall-clock budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_prefix() {
        let err = EngineError::Validation("missing url".to_string());
        assert_eq!(err.to_string(), "validation error: missing url");

        let err = EngineError::Timeout("pkg_update exceeded 1800s".to_string());
        assert!(err.to_string().starts_with("operation timed out"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{broken").unwrap_err();
        let err: EngineError = parse.into();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}
