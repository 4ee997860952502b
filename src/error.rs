//! Error types for the detection pipeline.
//!
//! `DaqError` follows the teacher crate's shape: a single enum, built with
//! `thiserror`, that consolidates configuration, I/O, network, and engine-internal
//! failures so the rest of the crate can use `?` freely. Nothing on the detection or
//! stacking hot path ever lets one of these unwind out of a worker thread — per the
//! publication policy, hot-path failures are converted to a logged [`crate::PublishOutcome`]
//! at the point of occurrence. Only construction-time errors propagate out of the core.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Image encode error: {0}")]
    Encode(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Engine("candidate buffer corrupt".to_string());
        assert_eq!(err.to_string(), "Engine error: candidate buffer corrupt");
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Network("connect timed out".into()),
            DaqError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }

    #[test]
    fn test_configuration_error_message() {
        let err = DaqError::Configuration("rho_max exceeds 900".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: rho_max exceeds 900"
        );
    }
}
