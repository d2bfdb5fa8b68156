//! Registry error types.

use thiserror::Error;

/// Registry errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Malformed command payload; rejected before it reaches the log.
    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },
}

/// Registry result type.
pub type Result<T> = std::result::Result<T, RegistryError>;
