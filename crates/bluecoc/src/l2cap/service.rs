//! Listen-side endpoint
//!
//! An [`L2capService`] waits for a peer to open a channel on its PSM. It is
//! only created through [`L2capServer::create_service`](super::server::L2capServer::create_service),
//! which keeps it alive until the server goes away.

use super::callbacks::ServiceCallbacks;
use super::coc::{Coc, Role};

/// Role marker for [`L2capService`]
pub enum ServiceRole {}

impl Role for ServiceRole {
    type Callbacks = dyn ServiceCallbacks;

    const NAME: &'static str = "Service";

    fn should_accept(callbacks: &mut Self::Callbacks, coc: &L2capService) -> bool {
        callbacks.should_accept_connection(coc)
    }
}

/// A listen-side L2CAP endpoint for one PSM
pub type L2capService = Coc<ServiceRole>;
