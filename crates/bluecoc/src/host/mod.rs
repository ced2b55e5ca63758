//! Host stack boundary
//!
//! The channel layer does not speak L2CAP itself. It drives a BLE host stack
//! through the [`HostStack`] trait: open a channel, register a listener, post
//! receive buffers, send SDUs. The host reports back through a
//! [`CocEventHandler`] registered per channel or listener.

pub mod sim;

use std::fmt;
use std::sync::Arc;

use crate::error::HostError;
use crate::l2cap::pool::SduBuffer;
use crate::l2cap::psm::Psm;

/// Handle of an established GAP link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u16);

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Opaque host reference to an L2CAP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRef(pub u16);

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Channel parameters as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub conn: ConnHandle,
    pub psm: Psm,
    /// SDU size we accept
    pub our_coc_mtu: u16,
    /// SDU size the peer accepts
    pub peer_coc_mtu: u16,
}

/// Events delivered by the host for one channel or listener
#[derive(Debug)]
pub enum CocEvent {
    /// A peer asks to open a channel on a registered PSM.
    /// Returning an error from the handler refuses it.
    Accept {
        chan: ChannelRef,
        conn: ConnHandle,
        peer_mtu: u16,
    },
    /// An open attempt completed
    Connected {
        chan: ChannelRef,
        conn: ConnHandle,
        status: Result<(), HostError>,
    },
    /// A complete SDU arrived in the posted receive buffer
    DataReceived { chan: ChannelRef, sdu: SduBuffer },
    /// A previously stalled transmit path can take data again
    TxUnstalled { chan: ChannelRef },
    /// The peer changed its MTU
    Reconfigured { chan: ChannelRef },
    /// The channel is gone
    Disconnected { chan: ChannelRef, conn: ConnHandle },
}

impl CocEvent {
    pub fn chan(&self) -> ChannelRef {
        match self {
            CocEvent::Accept { chan, .. }
            | CocEvent::Connected { chan, .. }
            | CocEvent::DataReceived { chan, .. }
            | CocEvent::TxUnstalled { chan }
            | CocEvent::Reconfigured { chan }
            | CocEvent::Disconnected { chan, .. } => *chan,
        }
    }
}

/// Per-instance event sink registered with the host
pub type CocEventHandler = Arc<dyn Fn(CocEvent) -> Result<(), HostError> + Send + Sync + 'static>;

/// Raw channel primitives of a BLE host stack
///
/// Buffers passed to the host are owned by it until it drops them, which
/// returns their blocks to the originating pool.
pub trait HostStack: Send + Sync {
    /// Open a channel to `psm` over `conn`, posting `sdu_rx` as the first receive buffer
    fn connect(
        &self,
        conn: ConnHandle,
        psm: Psm,
        mtu: u16,
        sdu_rx: SduBuffer,
        handler: CocEventHandler,
    ) -> Result<(), HostError>;

    /// Listen for incoming channels on `psm`
    fn create_server(&self, psm: Psm, mtu: u16, handler: CocEventHandler) -> Result<(), HostError>;

    /// Post the buffer the next incoming SDU is reassembled into
    fn recv_ready(&self, chan: ChannelRef, sdu_rx: SduBuffer) -> Result<(), HostError>;

    /// Queue one SDU for transmission; `Stalled` means try again later
    fn send(&self, chan: ChannelRef, sdu_tx: SduBuffer) -> Result<(), HostError>;

    fn channel_info(&self, chan: ChannelRef) -> Result<ChannelInfo, HostError>;

    fn disconnect(&self, chan: ChannelRef) -> Result<(), HostError>;
}

/// A GAP link established by the connection collaborator
pub trait GapLink {
    fn conn_handle(&self) -> ConnHandle;

    fn is_connected(&self) -> bool;
}
