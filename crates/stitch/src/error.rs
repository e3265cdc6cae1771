//! Error types for Stitch

use thiserror::Error;

/// Main error type for Stitch operations
#[derive(Error, Debug)]
pub enum StitchError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy/HTTP errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General errors
    #[error("{0}")]
    General(String),
}

/// Result type alias for Stitch operations
pub type Result<T> = std::result::Result<T, StitchError>;
