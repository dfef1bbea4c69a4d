//! Error types shared across Cohort crates.

use thiserror::Error;

/// Errors raised by configuration and other shared infrastructure.
#[derive(Debug, Error)]
pub enum CohortError {
    /// Config file could not be read, parsed or written.
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for shared infrastructure.
pub type Result<T> = std::result::Result<T, CohortError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: CohortError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked").into();
        assert!(matches!(err, CohortError::Io(_)));
        assert_eq!(err.to_string(), "IO error: locked");
    }
}
