//! bluecoc - L2CAP connection-oriented channels for BLE
//!
//! This library turns the raw channel primitives of a BLE host stack into
//! byte-stream endpoints with MTU negotiation, backpressure handling and
//! pool-backed buffers. Clients and channels open a COC to a peer's PSM,
//! a server hosts one service per PSM, and application code is driven
//! through per-role callbacks.
//!
//! GAP link setup, scanning and advertising are left to the host stack; this
//! crate only needs a connection handle from an established link.

pub mod error;
pub mod host;
pub mod l2cap;

// Re-export common types for convenience
pub use error::HostError;
pub use host::sim::{SendRecord, SimConfig, SimHost, SimLink};
pub use host::{ChannelInfo, ChannelRef, CocEvent, CocEventHandler, ConnHandle, GapLink, HostStack};
pub use l2cap::{
    ChannelCallbacks, ClientCallbacks, CocCallbacks, CocConfig, CocState, L2capChannel,
    L2capClient, L2capError, L2capResult, L2capServer, L2capService, Psm, ServiceCallbacks,
};
