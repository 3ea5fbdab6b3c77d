//! Error types for the platform

use thiserror::Error;

/// Result type alias for platform operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the model-averaging platform
#[derive(Debug, Error)]
pub enum SyncError {
    /// A component was wired incorrectly (missing broker, synchronizer, data source).
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `Parameters` argument had the wrong variant or shape. Fatal at the call site.
    #[error("parameter type contract violated: {0}")]
    TypeContract(String),

    /// Broker connection trouble. Recoverable at the transport boundary only.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An inbound record that does not match the wire protocol. Fatal in the
    /// receiving process.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Payload encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// IO error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Check if the error is recoverable by reconnecting the transport
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}
