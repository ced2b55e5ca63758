//! Reusable connecting endpoint
//!
//! An [`L2capClient`] is created once and may connect, disconnect and
//! connect again. Its callbacks also hear about peer MTU changes.

use std::sync::Arc;

use log::error;

use super::callbacks::ClientCallbacks;
use super::coc::{Coc, Role};
use super::psm::Psm;
use super::types::{CocConfig, L2capError, L2capResult};
use crate::host::{GapLink, HostStack};

/// Role marker for [`L2capClient`]
pub enum ClientRole {}

impl Role for ClientRole {
    type Callbacks = dyn ClientCallbacks;

    const NAME: &'static str = "Client";

    fn mtu_changed(callbacks: &mut Self::Callbacks, coc: &L2capClient, mtu: u16) {
        callbacks.on_mtu_change(coc, mtu);
    }
}

/// A connect-side L2CAP endpoint that can reconnect
pub type L2capClient = Coc<ClientRole>;

impl Coc<ClientRole> {
    pub fn create_client(
        host: Arc<dyn HostStack>,
        psm: Psm,
        mtu: u16,
        callbacks: Box<dyn ClientCallbacks>,
    ) -> L2capClient {
        Self::create_client_with_config(host, psm, mtu, callbacks, CocConfig::default())
    }

    pub fn create_client_with_config(
        host: Arc<dyn HostStack>,
        psm: Psm,
        mtu: u16,
        callbacks: Box<dyn ClientCallbacks>,
        config: CocConfig,
    ) -> L2capClient {
        Coc::new(host, psm, mtu, callbacks, config)
    }

    /// Open the channel over an established GAP link
    ///
    /// Allowed while idle or after a previous disconnect.
    pub fn connect(&self, link: &dyn GapLink) -> L2capResult<()> {
        if !link.is_connected() {
            error!("Link is not connected. A GAP connection must exist before opening an L2CAP channel");
            return Err(L2capError::NotConnected);
        }
        self.open(link.conn_handle())
    }
}
