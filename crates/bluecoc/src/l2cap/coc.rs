//! Connection-oriented channel endpoint
//!
//! [`Coc`] carries everything channels, clients and services have in common:
//! the buffer pool and receive scratch buffer, the connection state machine,
//! segmented blocking writes and the receive/re-post discipline. The role
//! parameter only decides which callbacks the application provides.
//!
//! The host reaches an endpoint through a closure holding a weak reference,
//! so an endpoint that has been dropped simply refuses further events.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use super::callbacks::CocCallbacks;
use super::pool::{BufferPool, SduBuffer};
use super::psm::Psm;
use super::types::{CocConfig, CocState, L2capError, L2capResult};
use crate::error::HostError;
use crate::host::{ChannelRef, CocEvent, CocEventHandler, ConnHandle, HostStack};

/// Bytes of each SDU dumped at trace level
const TRACE_DUMP_LEN: usize = 32;

/// An endpoint role: channel, client or service
pub trait Role: Sized + Send + Sync + 'static {
    type Callbacks: ?Sized + CocCallbacks<Self> + Send;

    /// Name used in log lines
    const NAME: &'static str;

    /// Gate an incoming channel before any buffer is drawn
    fn should_accept(_callbacks: &mut Self::Callbacks, _coc: &Coc<Self>) -> bool {
        true
    }

    /// The peer changed its MTU
    fn mtu_changed(_callbacks: &mut Self::Callbacks, coc: &Coc<Self>, mtu: u16) {
        debug!("L2CAP {} {} peer MTU now {}", Self::NAME, coc.psm(), mtu);
    }
}

struct Resources {
    pool: BufferPool,
    scratch: Mutex<Vec<u8>>,
    /// Blocks left for transmit while a full receive SDU is posted
    tx_blocks: usize,
}

impl Resources {
    fn allocate(mtu: u16, config: &CocConfig) -> L2capResult<Self> {
        let pool = BufferPool::for_mtu(mtu, config)?;
        let rx_blocks = config
            .blocks_per_mtu(mtu)
            .ok_or(L2capError::ResourceLimitReached)?;
        let tx_blocks = pool.capacity().saturating_sub(rx_blocks);
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(mtu as usize)
            .map_err(|_| L2capError::ResourceLimitReached)?;
        scratch.resize(mtu as usize, 0);
        Ok(Self {
            pool,
            scratch: Mutex::new(scratch),
            tx_blocks,
        })
    }
}

#[derive(Debug)]
struct Link {
    state: CocState,
    /// Set iff `state == Connected`
    chan: Option<ChannelRef>,
    /// Channel being accepted or opened
    pending: Option<ChannelRef>,
    conn: Option<ConnHandle>,
    peer_mtu: u16,
}

impl Link {
    fn reset(&mut self, state: CocState) {
        self.state = state;
        self.chan = None;
        self.pending = None;
    }
}

/// Wakes writers blocked on a stalled transmit path
///
/// Each wake-up bumps an epoch, so a wake-up that races with the writer
/// noticing the stall is never lost.
struct TxGate {
    epoch: Mutex<u64>,
    unstalled: Condvar,
}

impl TxGate {
    fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            unstalled: Condvar::new(),
        }
    }

    fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap()
    }

    fn wake(&self) {
        *self.epoch.lock().unwrap() += 1;
        self.unstalled.notify_all();
    }

    /// Block until woken after `seen`, or at most `timeout`
    fn wait(&self, seen: u64, timeout: Duration) {
        let guard = self.epoch.lock().unwrap();
        let _ = self
            .unstalled
            .wait_timeout_while(guard, timeout, |epoch| *epoch == seen)
            .unwrap();
    }
}

struct Inner<R: Role> {
    psm: Psm,
    mtu: u16,
    config: CocConfig,
    host: Arc<dyn HostStack>,
    resources: Option<Resources>,
    link: Mutex<Link>,
    tx: TxGate,
    callbacks: Mutex<Box<R::Callbacks>>,
}

impl<R: Role> Inner<R> {
    fn resources(&self) -> L2capResult<&Resources> {
        self.resources.as_ref().ok_or(L2capError::ResourceLimitReached)
    }
}

impl<R: Role> Drop for Inner<R> {
    fn drop(&mut self) {
        let chan = self.link.get_mut().map(|link| link.chan).unwrap_or(None);
        if let Some(chan) = chan {
            if let Err(err) = self.host.disconnect(chan) {
                warn!("L2CAP {} {} disconnect on drop failed: {}", R::NAME, self.psm, err);
            }
        }
        info!("L2CAP {} {} shutdown and freed", R::NAME, self.psm);
    }
}

/// A connection-oriented channel endpoint
pub struct Coc<R: Role> {
    inner: Arc<Inner<R>>,
}

impl<R: Role> Coc<R> {
    /// Create an endpoint and allocate its buffers
    ///
    /// An invalid `config` or an allocation failure leaves the endpoint
    /// disabled; see [`Coc::is_valid`].
    /// Panics if `mtu` is zero.
    pub(crate) fn new(
        host: Arc<dyn HostStack>,
        psm: Psm,
        mtu: u16,
        callbacks: Box<R::Callbacks>,
        config: CocConfig,
    ) -> Self {
        assert!(mtu > 0, "L2CAP COC MTU must be non-zero");

        debug!(
            "L2CAP {} {} needs {:?} pool blocks",
            R::NAME,
            psm,
            config.pool_blocks(mtu)
        );
        let resources = match Resources::allocate(mtu, &config) {
            Ok(resources) => {
                info!("L2CAP {} {} registered with MTU {}", R::NAME, psm, mtu);
                Some(resources)
            }
            Err(err) => {
                error!("L2CAP {} {} can't allocate buffers: {}", R::NAME, psm, err);
                None
            }
        };

        Self {
            inner: Arc::new(Inner {
                psm,
                mtu,
                config,
                host,
                resources,
                link: Mutex::new(Link {
                    state: CocState::Idle,
                    chan: None,
                    pending: None,
                    conn: None,
                    peer_mtu: 0,
                }),
                tx: TxGate::new(),
                callbacks: Mutex::new(callbacks),
            }),
        }
    }

    pub fn psm(&self) -> Psm {
        self.inner.psm
    }

    /// Requested MTU
    pub fn mtu(&self) -> u16 {
        self.inner.mtu
    }

    /// Negotiated peer MTU, while connected
    pub fn peer_mtu(&self) -> Option<u16> {
        let link = self.inner.link.lock().unwrap();
        link.chan.map(|_| link.peer_mtu)
    }

    pub fn state(&self) -> CocState {
        self.inner.link.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().unwrap().chan.is_some()
    }

    /// Whether construction managed to allocate the pool and scratch buffer
    pub fn is_valid(&self) -> bool {
        self.inner.resources.is_some()
    }

    pub fn config(&self) -> &CocConfig {
        &self.inner.config
    }

    /// The endpoint's buffer pool, if it was allocated
    pub fn buffer_pool(&self) -> Option<&BufferPool> {
        self.inner.resources.as_ref().map(|r| &r.pool)
    }

    /// Write `data` to the peer, segmenting it to the negotiated MTU.
    ///
    /// Blocks while the host reports backpressure, retrying the same segment
    /// until it is accepted, the channel disconnects or the host fails hard.
    /// Segments are never larger than the peer MTU nor our own MTU.
    /// Callers must not write to one channel from two threads at once.
    pub fn write(&self, data: &[u8]) -> L2capResult<()> {
        let resources = self.inner.resources()?;
        if self.tx_target().is_none() {
            warn!("L2CAP {} {} not open", R::NAME, self.inner.psm);
            return Err(L2capError::NotConnected);
        }

        let retry = self.inner.config.stall_retry_interval;
        let mut sent = 0;
        while sent < data.len() {
            let Some((chan, peer_mtu)) = self.tx_target() else {
                warn!(
                    "L2CAP {} {} disconnected after {} of {} bytes",
                    R::NAME,
                    self.inner.psm,
                    sent,
                    data.len()
                );
                return Err(L2capError::SendFailed {
                    sent,
                    source: HostError::NotConnected,
                });
            };

            let limit = peer_mtu.min(self.inner.mtu) as usize;
            if limit == 0 {
                error!("L2CAP {} {} peer MTU is zero", R::NAME, self.inner.psm);
                return Err(L2capError::InvalidState);
            }
            let chunk = (data.len() - sent).min(limit);
            if chunk.div_ceil(resources.pool.block_size()) > resources.tx_blocks {
                error!(
                    "L2CAP {} {} segment of {} bytes can never fit the pool",
                    R::NAME,
                    self.inner.psm,
                    chunk
                );
                return Err(L2capError::SendFailed {
                    sent,
                    source: HostError::NoMemory,
                });
            }
            let epoch = self.inner.tx.epoch();

            let sdu = match resources.pool.acquire_with(&data[sent..sent + chunk]) {
                Ok(sdu) => sdu,
                Err(L2capError::ResourceLimitReached) => {
                    debug!("L2CAP {} {} pool exhausted, waiting", R::NAME, self.inner.psm);
                    self.inner.tx.wait(epoch, retry);
                    continue;
                }
                Err(err) => return Err(err),
            };

            match self.inner.host.send(chan, sdu) {
                Ok(()) => {
                    sent += chunk;
                    debug!("L2CAP {} {} sent {} bytes", R::NAME, self.inner.psm, chunk);
                }
                Err(err) if err.is_backpressure() => {
                    debug!(
                        "L2CAP {} {} transmit stalled at offset {}",
                        R::NAME,
                        self.inner.psm,
                        sent
                    );
                    self.inner.tx.wait(epoch, retry);
                }
                Err(err) => {
                    error!("L2CAP {} {} can't send: {}", R::NAME, self.inner.psm, err);
                    return Err(L2capError::SendFailed { sent, source: err });
                }
            }
        }
        Ok(())
    }

    /// Ask the host to close the channel
    ///
    /// The state changes once the host reports the disconnect.
    pub fn disconnect(&self) -> L2capResult<()> {
        let chan = self
            .inner
            .link
            .lock()
            .unwrap()
            .chan
            .ok_or(L2capError::NotConnected)?;
        self.inner.host.disconnect(chan)?;
        Ok(())
    }

    /// Open a channel over an established link
    pub(crate) fn open(&self, conn: ConnHandle) -> L2capResult<()> {
        let resources = self.inner.resources()?;
        let psm = self.inner.psm;
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("Invalid PSM {}", psm)));
        }

        let prev = {
            let mut link = self.inner.link.lock().unwrap();
            if !link.state.is_idle() {
                return Err(L2capError::InvalidState);
            }
            let prev = link.state;
            link.state = CocState::Connecting;
            link.conn = Some(conn);
            prev
        };

        let opened = resources.pool.acquire().and_then(|sdu_rx| {
            self.inner
                .host
                .connect(conn, psm, self.inner.mtu, sdu_rx, self.event_handler())
                .map_err(L2capError::from)
        });
        if let Err(err) = opened {
            error!("L2CAP {} {} connect failed: {}", R::NAME, psm, err);
            let mut link = self.inner.link.lock().unwrap();
            if link.state == CocState::Connecting {
                link.reset(prev);
            }
            return Err(err);
        }

        info!("L2CAP {} {} connecting over link {}", R::NAME, psm, conn);
        Ok(())
    }

    /// Register the endpoint as the listener for its PSM
    pub(crate) fn listen(&self) -> L2capResult<()> {
        self.inner.resources()?;
        let psm = self.inner.psm;
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("Invalid PSM {}", psm)));
        }
        self.inner
            .host
            .create_server(psm, self.inner.mtu, self.event_handler())
            .map_err(|err| {
                error!("L2CAP {} {} server creation failed: {}", R::NAME, psm, err);
                L2capError::from(err)
            })?;
        info!("L2CAP {} {} listening", R::NAME, psm);
        Ok(())
    }

    fn event_handler(&self) -> CocEventHandler {
        let weak: Weak<Inner<R>> = Arc::downgrade(&self.inner);
        Arc::new(move |event: CocEvent| match weak.upgrade() {
            Some(inner) => Coc { inner }.handle_event(event).map_err(|err| err.host_code()),
            None => {
                debug!("L2CAP {} event for freed endpoint: {:?}", R::NAME, event);
                Err(HostError::NotConnected)
            }
        })
    }

    fn handle_event(&self, event: CocEvent) -> L2capResult<()> {
        trace!("L2CAP {} {} handling event {:?}", R::NAME, self.inner.psm, event);
        match event {
            CocEvent::Accept {
                chan,
                conn,
                peer_mtu,
            } => self.handle_accept(chan, conn, peer_mtu),
            CocEvent::Connected { chan, conn, status } => self.handle_connected(chan, conn, status),
            CocEvent::DataReceived { chan, sdu } => self.handle_data_received(chan, sdu),
            CocEvent::TxUnstalled { chan } => {
                debug!("L2CAP {} {} transmit unstalled on {}", R::NAME, self.inner.psm, chan);
                self.inner.tx.wake();
                Ok(())
            }
            CocEvent::Reconfigured { chan } => self.handle_reconfigured(chan),
            CocEvent::Disconnected { chan, conn } => self.handle_disconnected(chan, conn),
        }
    }

    fn handle_accept(&self, chan: ChannelRef, conn: ConnHandle, peer_mtu: u16) -> L2capResult<()> {
        info!("L2CAP {} {} accept on link {}", R::NAME, self.inner.psm, conn);
        let prev = {
            let mut link = self.inner.link.lock().unwrap();
            if !link.state.is_idle() {
                warn!(
                    "L2CAP {} {} busy ({}), refusing {}",
                    R::NAME,
                    self.inner.psm,
                    link.state,
                    chan
                );
                return Err(L2capError::InvalidState);
            }
            let prev = link.state;
            link.state = CocState::Accepting;
            link.pending = Some(chan);
            prev
        };

        let accepted = {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            R::should_accept(&mut **callbacks, self)
        };
        if !accepted {
            info!("L2CAP {} {} refused by delegate", R::NAME, self.inner.psm);
            self.inner.link.lock().unwrap().reset(prev);
            return Err(L2capError::ConnectionRejected);
        }

        let posted = self.inner.resources().and_then(|resources| {
            let sdu_rx = resources.pool.acquire()?;
            self.inner.host.recv_ready(chan, sdu_rx)?;
            Ok(())
        });
        let mut link = self.inner.link.lock().unwrap();
        match posted {
            Ok(()) => {
                debug!(
                    "L2CAP {} {} accepted {}, peer MTU {}",
                    R::NAME,
                    self.inner.psm,
                    chan,
                    peer_mtu
                );
                link.state = CocState::Connecting;
                link.conn = Some(conn);
                Ok(())
            }
            Err(err) => {
                error!("L2CAP {} {} can't post receive buffer: {}", R::NAME, self.inner.psm, err);
                link.reset(prev);
                Err(err)
            }
        }
    }

    fn handle_connected(
        &self,
        chan: ChannelRef,
        conn: ConnHandle,
        status: Result<(), HostError>,
    ) -> L2capResult<()> {
        {
            let mut link = self.inner.link.lock().unwrap();
            let expected = link.pending.map_or(true, |pending| pending == chan);
            if link.state != CocState::Connecting || !expected {
                warn!(
                    "L2CAP {} {} unexpected connect of {} in state {}",
                    R::NAME,
                    self.inner.psm,
                    chan,
                    link.state
                );
                return Ok(());
            }
            if let Err(err) = status {
                error!("L2CAP {} {} open failed: {}", R::NAME, self.inner.psm, err);
                link.reset(CocState::Idle);
                return Ok(());
            }
        }

        let info = match self.inner.host.channel_info(chan) {
            Ok(info) => info,
            Err(err) => {
                error!("L2CAP {} {} can't read channel info: {}", R::NAME, self.inner.psm, err);
                self.inner.link.lock().unwrap().reset(CocState::Idle);
                return Err(err.into());
            }
        };

        {
            let mut link = self.inner.link.lock().unwrap();
            link.state = CocState::Connected;
            link.chan = Some(chan);
            link.pending = None;
            link.conn = Some(conn);
            link.peer_mtu = info.peer_coc_mtu;
        }
        info!(
            "L2CAP {} {} connected. Our MTU is {}, remote MTU is {}",
            R::NAME,
            self.inner.psm,
            info.our_coc_mtu,
            info.peer_coc_mtu
        );

        let mut callbacks = self.inner.callbacks.lock().unwrap();
        callbacks.on_connect(self, info.peer_coc_mtu);
        Ok(())
    }

    fn handle_data_received(&self, chan: ChannelRef, sdu: SduBuffer) -> L2capResult<()> {
        if self.current_chan() != Some(chan) {
            warn!("L2CAP {} {} data for stale channel {}", R::NAME, self.inner.psm, chan);
            return Err(L2capError::ChannelNotFound);
        }
        let resources = self.inner.resources()?;

        let len = sdu.len();
        assert!(
            len <= self.inner.mtu as usize,
            "L2CAP {} {}: received {} bytes, MTU is {}",
            R::NAME,
            self.inner.psm,
            len,
            self.inner.mtu
        );

        let mut scratch = resources.scratch.lock().unwrap();
        let copied = sdu.copy_to(&mut scratch[..len]);
        debug_assert_eq!(copied, len);
        drop(sdu);

        debug!("L2CAP {} {} received {} bytes", R::NAME, self.inner.psm, len);
        trace!("{}", hex::encode(&scratch[..len.min(TRACE_DUMP_LEN)]));

        {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            callbacks.on_read(self, &scratch[..len]);
        }
        drop(scratch);

        let next = resources.pool.acquire().map_err(|err| {
            error!("L2CAP {} {} no buffer to re-post: {}", R::NAME, self.inner.psm, err);
            err
        })?;
        if let Err(err) = self.inner.host.recv_ready(chan, next) {
            if self.is_connected() {
                error!("L2CAP {} {} can't re-post receive buffer: {}", R::NAME, self.inner.psm, err);
                return Err(err.into());
            }
            debug!("L2CAP {} {} closed during read", R::NAME, self.inner.psm);
        }
        Ok(())
    }

    fn handle_reconfigured(&self, chan: ChannelRef) -> L2capResult<()> {
        if self.current_chan() != Some(chan) {
            warn!("L2CAP {} {} reconfigure of stale channel {}", R::NAME, self.inner.psm, chan);
            return Err(L2capError::ChannelNotFound);
        }
        let info = self.inner.host.channel_info(chan)?;
        self.inner.link.lock().unwrap().peer_mtu = info.peer_coc_mtu;
        info!(
            "L2CAP {} {} reconfigured, remote MTU is {}",
            R::NAME,
            self.inner.psm,
            info.peer_coc_mtu
        );

        let mut callbacks = self.inner.callbacks.lock().unwrap();
        R::mtu_changed(&mut **callbacks, self, info.peer_coc_mtu);
        Ok(())
    }

    fn handle_disconnected(&self, chan: ChannelRef, conn: ConnHandle) -> L2capResult<()> {
        let was_connected = {
            let mut link = self.inner.link.lock().unwrap();
            // An outgoing open does not learn its channel until it completes
            let opening = link.state == CocState::Connecting && link.pending.is_none();
            if link.chan != Some(chan) && link.pending != Some(chan) && !opening {
                debug!("L2CAP {} {} ignoring disconnect of {}", R::NAME, self.inner.psm, chan);
                return Ok(());
            }
            let was_connected = link.chan.is_some();
            link.reset(CocState::Disconnected);
            was_connected
        };
        self.inner.tx.wake();
        info!("L2CAP {} {} disconnected from link {}", R::NAME, self.inner.psm, conn);

        if was_connected {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            callbacks.on_disconnect(self);
        }
        Ok(())
    }

    fn current_chan(&self) -> Option<ChannelRef> {
        self.inner.link.lock().unwrap().chan
    }

    fn tx_target(&self) -> Option<(ChannelRef, u16)> {
        let link = self.inner.link.lock().unwrap();
        link.chan.map(|chan| (chan, link.peer_mtu))
    }
}

impl<R: Role> fmt::Debug for Coc<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.inner.link.lock().unwrap();
        f.debug_struct(R::NAME)
            .field("psm", &self.inner.psm)
            .field("mtu", &self.inner.mtu)
            .field("state", &link.state)
            .field("chan", &link.chan)
            .field("peer_mtu", &link.peer_mtu)
            .field("valid", &self.inner.resources.is_some())
            .finish()
    }
}
