//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid mesh address or CIDR
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed or undersized datagram
    #[error("Invalid datagram: {0}")]
    InvalidDatagram(String),

    /// Protocol error (STUN parsing, unexpected response)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error (unresolvable server, bad URI)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
