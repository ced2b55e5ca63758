//! One-shot connection-oriented channel
//!
//! An [`L2capChannel`] is created and opened in a single call. It is the
//! plainest endpoint: connect, read through callbacks, write, disconnect.

use std::sync::Arc;

use log::error;

use super::callbacks::ChannelCallbacks;
use super::coc::{Coc, Role};
use super::psm::Psm;
use super::types::{CocConfig, L2capError, L2capResult};
use crate::host::{GapLink, HostStack};

/// Role marker for [`L2capChannel`]
pub enum ChannelRole {}

impl Role for ChannelRole {
    type Callbacks = dyn ChannelCallbacks;

    const NAME: &'static str = "Channel";
}

/// An L2CAP connection-oriented channel opened by this side
pub type L2capChannel = Coc<ChannelRole>;

impl Coc<ChannelRole> {
    /// Open an L2CAP channel to `psm` over `link` with the requested MTU
    ///
    /// The GAP link must already be established.
    pub fn connect(
        host: Arc<dyn HostStack>,
        link: &dyn GapLink,
        psm: Psm,
        mtu: u16,
        callbacks: Box<dyn ChannelCallbacks>,
    ) -> L2capResult<L2capChannel> {
        Self::connect_with_config(host, link, psm, mtu, callbacks, CocConfig::default())
    }

    pub fn connect_with_config(
        host: Arc<dyn HostStack>,
        link: &dyn GapLink,
        psm: Psm,
        mtu: u16,
        callbacks: Box<dyn ChannelCallbacks>,
        config: CocConfig,
    ) -> L2capResult<L2capChannel> {
        if !link.is_connected() {
            error!("Link is not connected. A GAP connection must exist before opening an L2CAP channel");
            return Err(L2capError::NotConnected);
        }

        let channel: L2capChannel = Coc::new(host, psm, mtu, callbacks, config);
        channel.open(link.conn_handle())?;
        Ok(channel)
    }
}
