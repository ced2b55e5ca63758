//! L2CAP connection-oriented channels
//!
//! This module provides the channel layer on top of a BLE host stack:
//! - Buffer pools sized from the requested MTU
//! - Segmentation of outbound writes to the negotiated peer MTU
//! - Blocking retry under transmit backpressure
//! - Receive buffer posting and delivery to application callbacks
//! - A server registering one service per PSM

pub mod callbacks;
pub mod channel;
pub mod client;
pub mod coc;
pub mod constants;
pub mod pool;
pub mod psm;
pub mod server;
pub mod service;
pub mod types;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::callbacks::{ChannelCallbacks, ClientCallbacks, CocCallbacks, ServiceCallbacks};
pub use self::channel::{ChannelRole, L2capChannel};
pub use self::client::{ClientRole, L2capClient};
pub use self::coc::{Coc, Role};
pub use self::pool::{BufferPool, SduBuffer};
pub use self::psm::{obtain_dynamic_psm, Psm};
pub use self::server::L2capServer;
pub use self::service::{L2capService, ServiceRole};
pub use self::types::*;
