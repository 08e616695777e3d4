//! Error types shared across the DMP workspace

use thiserror::Error;

/// Result type alias for DMP operations
pub type Result<T> = std::result::Result<T, DmpError>;

/// Main error type for cross-cutting DMP concerns
#[derive(Error, Debug)]
pub enum DmpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}
