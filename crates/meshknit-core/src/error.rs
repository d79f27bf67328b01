//! Core engine errors

use thiserror::Error;

/// Errors from the overlay engine
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error; the offending setting is not applied
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (fatal only during initialization)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] meshknit_crypto::CryptoError),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] meshknit_network::NetworkError),

    /// A collaborator (interface driver, signaling client) failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
