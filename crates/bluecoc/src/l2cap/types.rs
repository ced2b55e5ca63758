//! Type definitions for L2CAP connection-oriented channels
//!
//! This module contains the error type, channel state and configuration
//! shared by channels, clients and services.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::constants::*;
use crate::error::HostError;

/// Error types specific to L2CAP COC operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Connection not established")]
    NotConnected,

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("Connection rejected")]
    ConnectionRejected,

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Send failed after {sent} bytes: {source}")]
    SendFailed {
        /// Bytes accepted by the host before the failure
        sent: usize,
        #[source]
        source: HostError,
    },

    #[error("Host error: {0}")]
    Host(#[from] HostError),
}

impl L2capError {
    /// Return code handed back to the host stack for a failed event
    pub fn host_code(&self) -> HostError {
        match self {
            L2capError::Host(err) | L2capError::SendFailed { source: err, .. } => err.clone(),
            L2capError::ConnectionRejected => HostError::Rejected,
            L2capError::ResourceLimitReached => HostError::NoMemory,
            L2capError::NotConnected | L2capError::ChannelNotFound => HostError::NotConnected,
            L2capError::InvalidState => HostError::Busy,
            L2capError::InvalidParameter(_) => HostError::InvalidArgument,
        }
    }
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Connection-oriented channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CocState {
    /// Created, never connected
    Idle,
    /// Listen side: the host offered an incoming channel
    Accepting,
    /// Open request issued, waiting for the host
    Connecting,
    /// Channel is open and ready for data transfer
    Connected,
    /// Channel was closed; may be reconnected or accept again
    Disconnected,
}

impl CocState {
    /// Whether a new connect or accept may start from this state
    pub fn is_idle(&self) -> bool {
        matches!(self, CocState::Idle | CocState::Disconnected)
    }
}

impl fmt::Display for CocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Accepting => write!(f, "Accepting"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Buffer and retry configuration for a channel
#[derive(Debug, Clone, Copy)]
pub struct CocConfig {
    /// Size of one pool block in bytes
    pub block_size: usize,
    /// Number of full MTUs the pool holds
    pub mtus_per_channel: usize,
    /// Longest single wait for a stalled transmit before retrying
    pub stall_retry_interval: Duration,
}

impl CocConfig {
    /// Blocks one full-MTU SDU occupies, `None` for a zero block size
    pub fn blocks_per_mtu(&self, mtu: u16) -> Option<usize> {
        (self.block_size > 0).then(|| (mtu as usize).div_ceil(self.block_size))
    }

    /// Number of pool blocks needed for a channel with the given MTU
    ///
    /// `None` if the block size is zero or the count overflows.
    pub fn pool_blocks(&self, mtu: u16) -> Option<usize> {
        self.blocks_per_mtu(mtu)?.checked_mul(self.mtus_per_channel)
    }

    /// Check the configuration can back a channel
    ///
    /// The pool must hold a full receive SDU and a full transmit SDU at once.
    pub fn validate(&self) -> L2capResult<()> {
        if self.block_size == 0 {
            return Err(L2capError::InvalidParameter(
                "Block size must be non-zero".into(),
            ));
        }
        if self.mtus_per_channel < L2CAP_COC_MIN_MTUS_PER_CHANNEL {
            return Err(L2capError::InvalidParameter(format!(
                "Pool must hold at least {} MTUs, got {}",
                L2CAP_COC_MIN_MTUS_PER_CHANNEL, self.mtus_per_channel
            )));
        }
        Ok(())
    }
}

impl Default for CocConfig {
    fn default() -> Self {
        Self {
            block_size: L2CAP_COC_BLOCK_SIZE,
            mtus_per_channel: L2CAP_COC_MTUS_PER_CHANNEL,
            stall_retry_interval: L2CAP_COC_STALL_RETRY_INTERVAL,
        }
    }
}
