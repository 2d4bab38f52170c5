//! Error types for the networking module.

use std::io;

/// Network-specific errors.
///
/// The services never return these across their blocking API; they are
/// rendered into the message reported by `last_error_message()`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// Incomplete or contradictory endpoint configuration.
    #[error("{0}")]
    Config(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
    /// TCP socket error.
    #[error("{0}")]
    Tcp(String),
    /// UDP socket error.
    #[error("{0}")]
    Udp(String),
    /// The shared async runtime could not be started.
    #[error("network runtime unavailable: {0}")]
    Runtime(String),
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("invalid endpoint configuration: {err}"))
    }
}

/// Result type for networking operations.
pub type Result<T> = std::result::Result<T, NetError>;
