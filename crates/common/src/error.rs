//! Common error types for reachability components.

use std::fmt;

/// A specialized Result type for reachability operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type shared by the probing library and the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

impl Error {
    /// Create a new registry error.
    pub fn registry(msg: impl fmt::Display) -> Self {
        Error::Registry(msg.to_string())
    }

    /// Create a new probe error.
    pub fn probe(msg: impl fmt::Display) -> Self {
        Error::Probe(msg.to_string())
    }

    /// Create a new persistence error.
    pub fn persistence(msg: impl fmt::Display) -> Self {
        Error::Persistence(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new telemetry setup error.
    pub fn telemetry(msg: impl fmt::Display) -> Self {
        Error::Telemetry(msg.to_string())
    }
}
