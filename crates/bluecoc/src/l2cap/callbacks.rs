//! Application callbacks, one capability set per endpoint role
//!
//! Every role shares [`CocCallbacks`]. Clients additionally learn about MTU
//! changes, services decide whether to accept an incoming channel.

use super::channel::ChannelRole;
use super::client::{ClientRole, L2capClient};
use super::coc::{Coc, Role};
use super::service::{L2capService, ServiceRole};

/// Callbacks common to every connection-oriented channel
///
/// All methods default to doing nothing.
pub trait CocCallbacks<R: Role>: Send {
    /// The channel is open; `negotiated_mtu` is the largest SDU the peer accepts
    fn on_connect(&mut self, _coc: &Coc<R>, _negotiated_mtu: u16) {}

    /// One SDU arrived. `data` is only valid for the duration of the call.
    fn on_read(&mut self, _coc: &Coc<R>, _data: &[u8]) {}

    /// The channel was closed
    fn on_disconnect(&mut self, _coc: &Coc<R>) {}
}

/// Callbacks for a one-shot [`L2capChannel`](super::channel::L2capChannel)
pub trait ChannelCallbacks: CocCallbacks<ChannelRole> {}

impl<T: CocCallbacks<ChannelRole>> ChannelCallbacks for T {}

/// Callbacks for an [`L2capClient`]
pub trait ClientCallbacks: CocCallbacks<ClientRole> {
    /// The peer reconfigured the channel to a new MTU
    fn on_mtu_change(&mut self, client: &L2capClient, mtu: u16);
}

/// Callbacks for an [`L2capService`]
pub trait ServiceCallbacks: CocCallbacks<ServiceRole> {
    /// Called when a peer attempts to open a channel on the service.
    /// Returning false refuses it. Accepts by default.
    fn should_accept_connection(&mut self, _service: &L2capService) -> bool {
        true
    }
}
