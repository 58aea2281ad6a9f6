//! StreamGate error types

use thiserror::Error;

/// StreamGate error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection registry error
    #[error("Registry error: {0}")]
    Registry(String),

    /// Per-identity connection cap exceeded
    #[error("Connection limit reached for {0}")]
    RateLimited(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Gateway error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for StreamGate operations
pub type Result<T> = std::result::Result<T, Error>;
