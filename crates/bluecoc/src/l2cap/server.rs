//! Multi-PSM server
//!
//! The server owns every service it creates. There is no way to remove a
//! single service; dropping the server tears all of them down, each exactly
//! once. Host listeners for a torn-down service refuse further connections.

use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use super::callbacks::ServiceCallbacks;
use super::coc::Coc;
use super::psm::Psm;
use super::service::L2capService;
use super::types::{CocConfig, L2capError, L2capResult};
use crate::host::HostStack;

/// Registry of listen-side services
pub struct L2capServer {
    host: Arc<dyn HostStack>,
    config: CocConfig,
    services: Vec<L2capService>,
}

impl L2capServer {
    pub fn new(host: Arc<dyn HostStack>) -> Self {
        Self::with_config(host, CocConfig::default())
    }

    /// Create a server whose services use `config`
    pub fn with_config(host: Arc<dyn HostStack>, config: CocConfig) -> Self {
        Self {
            host,
            config,
            services: Vec::new(),
        }
    }

    /// Register a listener for `psm` and allocate its service
    pub fn create_service(
        &mut self,
        psm: Psm,
        mtu: u16,
        callbacks: Box<dyn ServiceCallbacks>,
    ) -> L2capResult<&L2capService> {
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("Invalid PSM {}", psm)));
        }
        if self.service(psm).is_some() {
            return Err(L2capError::InvalidParameter(format!(
                "PSM {} already registered",
                psm
            )));
        }

        let service: L2capService = Coc::new(self.host.clone(), psm, mtu, callbacks, self.config);
        if !service.is_valid() {
            return Err(L2capError::ResourceLimitReached);
        }
        service.listen()?;

        info!("L2CAP server now hosts {} service(s)", self.services.len() + 1);
        self.services.push(service);
        Ok(&self.services[self.services.len() - 1])
    }

    /// Look up the service registered for `psm`
    pub fn service(&self, psm: Psm) -> Option<&L2capService> {
        self.services.iter().find(|s| s.psm() == psm)
    }

    /// Services in registration order
    pub fn services(&self) -> impl Iterator<Item = &L2capService> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Drop for L2capServer {
    fn drop(&mut self) {
        debug!("L2CAP server shutting down {} service(s)", self.services.len());
    }
}

impl fmt::Debug for L2capServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capServer")
            .field("services", &self.services)
            .finish()
    }
}
