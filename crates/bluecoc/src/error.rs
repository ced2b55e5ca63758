//! Error types for the host-stack boundary
//!
//! The host stack reports failures as return codes. This module gives those
//! codes a type so the channel layer can tell a transient stall apart from a
//! hard failure.

use thiserror::Error;

/// Errors reported by the host stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Transmit stalled, outbound buffers full")]
    Stalled,

    #[error("Channel or link not connected")]
    NotConnected,

    #[error("Host out of memory")]
    NoMemory,

    #[error("Host busy")]
    Busy,

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Operation not supported")]
    NotSupported,

    #[error("PSM already registered")]
    AlreadyRegistered,

    #[error("Connection rejected")]
    Rejected,

    #[error("Host error code {0}")]
    Other(i32),
}

impl HostError {
    /// Whether the error is transient backpressure that should be retried
    pub fn is_backpressure(&self) -> bool {
        matches!(self, HostError::Stalled)
    }
}
