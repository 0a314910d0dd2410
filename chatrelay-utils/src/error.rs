//! Error types for chatrelay
//!
//! Provides a unified error type used across all chatrelay crates.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Main error type for chatrelay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Failed to bind listener to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write to {peer} failed: {source}")]
    Write {
        peer: SocketAddr,
        source: std::io::Error,
    },

    #[error("Outbound queue full for {peer}")]
    QueueFull { peer: SocketAddr },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error means the peer is gone
    ///
    /// A relay never retries; these errors end the connection they came from.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Write { source, .. } | Self::Io(source) => matches!(
                source.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
