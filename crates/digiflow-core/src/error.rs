//! Error types for `digiflow` core library.

use thiserror::Error;

/// Result type alias using `digiflow` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `digiflow` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}
