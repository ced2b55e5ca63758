//! In-memory host stack
//!
//! [`SimHost`] connects endpoints living in the same process. A connect to a
//! PSM with a registered listener creates a pair of linked channels; SDUs
//! sent on one side are reassembled into the other side's posted receive
//! buffer. Events are queued and delivered serially by
//! [`SimHost::run_until_idle`], the way a host task would.
//!
//! Each channel may have at most `tx_window` undelivered SDUs. Past that,
//! `send` reports [`HostError::Stalled`] and the channel gets a
//! `TxUnstalled` event once the queue drains.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use super::{ChannelInfo, ChannelRef, CocEvent, CocEventHandler, ConnHandle, GapLink, HostStack};
use crate::error::HostError;
use crate::l2cap::constants::L2CAP_LE_COC_MIN_MTU;
use crate::l2cap::pool::SduBuffer;
use crate::l2cap::psm::Psm;

/// Simulator tuning
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Undelivered SDUs a channel may have before sends stall
    pub tx_window: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { tx_window: 8 }
    }
}

/// A simulated GAP link
#[derive(Debug, Clone)]
pub struct SimLink {
    handle: ConnHandle,
    connected: Arc<AtomicBool>,
}

impl SimLink {
    /// A link that was never established
    pub fn down(handle: ConnHandle) -> Self {
        Self {
            handle,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl GapLink for SimLink {
    fn conn_handle(&self) -> ConnHandle {
        self.handle
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// One submission seen by [`HostStack::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub chan: ChannelRef,
    pub len: usize,
    pub accepted: bool,
}

struct SimChannel {
    conn: ConnHandle,
    psm: Psm,
    mtu: u16,
    handler: CocEventHandler,
    peer: ChannelRef,
    rx_ready: Option<SduBuffer>,
    backlog: VecDeque<Vec<u8>>,
    in_flight: usize,
    stalled: bool,
    open: bool,
    closing: bool,
}

struct SimListener {
    mtu: u16,
    handler: CocEventHandler,
}

enum Pending {
    Accept {
        server: ChannelRef,
        initiator: ChannelRef,
    },
    Refuse {
        chan: ChannelRef,
        status: HostError,
    },
    Event(ChannelRef, CocEvent),
    Data {
        from: Option<ChannelRef>,
        to: ChannelRef,
        payload: Vec<u8>,
    },
    Close(ChannelRef),
}

struct SimState {
    config: SimConfig,
    next_conn: u16,
    next_chan: u16,
    links: HashMap<ConnHandle, Arc<AtomicBool>>,
    listeners: HashMap<Psm, SimListener>,
    channels: HashMap<ChannelRef, SimChannel>,
    queue: VecDeque<Pending>,
    sends: Vec<SendRecord>,
    stall_pass: usize,
    stall_next: usize,
    fail_next: Option<HostError>,
    rx_gaps: usize,
}

impl SimState {
    fn alloc_chan(&mut self) -> ChannelRef {
        let chan = ChannelRef(self.next_chan);
        self.next_chan = self.next_chan.wrapping_add(1);
        chan
    }

    fn close(&mut self, chan: ChannelRef) -> bool {
        match self.channels.get_mut(&chan) {
            Some(channel) if !channel.closing => {
                channel.closing = true;
                self.queue.push_back(Pending::Close(chan));
                true
            }
            _ => false,
        }
    }
}

/// An in-memory [`HostStack`]
pub struct SimHost {
    state: Mutex<SimState>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimHost {
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Mutex::new(SimState {
                config,
                next_conn: 1,
                next_chan: 0x40,
                links: HashMap::new(),
                listeners: HashMap::new(),
                channels: HashMap::new(),
                queue: VecDeque::new(),
                sends: Vec::new(),
                stall_pass: 0,
                stall_next: 0,
                fail_next: None,
                rx_gaps: 0,
            }),
        }
    }

    /// Bring up a new GAP link
    pub fn establish_link(&self) -> SimLink {
        let mut state = self.state.lock().unwrap();
        let handle = ConnHandle(state.next_conn);
        state.next_conn = state.next_conn.wrapping_add(1);
        let connected = Arc::new(AtomicBool::new(true));
        state.links.insert(handle, connected.clone());
        debug!("Sim link {} established", handle);
        SimLink { handle, connected }
    }

    /// Drop a GAP link and every channel on it
    pub fn terminate_link(&self, conn: ConnHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(link) = state.links.remove(&conn) {
            link.store(false, Ordering::SeqCst);
        }
        let chans: Vec<ChannelRef> = state
            .channels
            .iter()
            .filter(|(_, channel)| channel.conn == conn)
            .map(|(chan, _)| *chan)
            .collect();
        for chan in chans {
            state.close(chan);
        }
        debug!("Sim link {} terminated", conn);
    }

    /// Have `chan` change its MTU; its peer gets a reconfigure event
    pub fn reconfigure(&self, chan: ChannelRef, mtu: u16) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        let channel = state.channels.get_mut(&chan).ok_or(HostError::NotConnected)?;
        if !channel.open {
            return Err(HostError::NotConnected);
        }
        channel.mtu = mtu;
        let peer = channel.peer;
        state
            .queue
            .push_back(Pending::Event(peer, CocEvent::Reconfigured { chan: peer }));
        Ok(())
    }

    /// Report the next `count` sends as stalled
    pub fn stall_next_sends(&self, count: usize) {
        self.stall_sends_after(0, count);
    }

    /// Let `pass` sends through, then report `count` sends as stalled
    pub fn stall_sends_after(&self, pass: usize, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.stall_pass = pass;
        state.stall_next = count;
    }

    /// Fail the next send with `err`
    pub fn fail_next_send(&self, err: HostError) {
        self.state.lock().unwrap().fail_next = Some(err);
    }

    /// Every send attempt so far, in order
    pub fn send_log(&self) -> Vec<SendRecord> {
        self.state.lock().unwrap().sends.clone()
    }

    /// SDUs that arrived while their receiver had no buffer posted
    pub fn rx_gaps(&self) -> usize {
        self.state.lock().unwrap().rx_gaps
    }

    /// Whether a receive buffer is currently posted on `chan`
    pub fn has_rx_buffer(&self, chan: ChannelRef) -> bool {
        self.state
            .lock()
            .unwrap()
            .channels
            .get(&chan)
            .is_some_and(|c| c.rx_ready.is_some())
    }

    /// Open channels, both ends counted
    pub fn open_channels(&self) -> Vec<ChannelRef> {
        let state = self.state.lock().unwrap();
        let mut chans: Vec<ChannelRef> = state
            .channels
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(chan, _)| *chan)
            .collect();
        chans.sort_by_key(|c| c.0);
        chans
    }

    /// Deliver queued events until none are left
    pub fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
        }
        delivered
    }

    /// Deliver one queued event
    pub fn step(&self) -> bool {
        let pending = match self.state.lock().unwrap().queue.pop_front() {
            Some(pending) => pending,
            None => return false,
        };

        match pending {
            Pending::Accept { server, initiator } => self.deliver_accept(server, initiator),
            Pending::Refuse { chan, status } => {
                let removed = self.state.lock().unwrap().channels.remove(&chan);
                if let Some(channel) = removed {
                    let event = CocEvent::Connected {
                        chan,
                        conn: channel.conn,
                        status: Err(status),
                    };
                    Self::dispatch(&channel.handler, event);
                }
            }
            Pending::Event(chan, event) => {
                let handler = self
                    .state
                    .lock()
                    .unwrap()
                    .channels
                    .get(&chan)
                    .map(|c| c.handler.clone());
                match handler {
                    Some(handler) => {
                        let opened = matches!(event, CocEvent::Connected { status: Ok(()), .. });
                        if !Self::dispatch(&handler, event) && opened {
                            // Nobody owns this end any more
                            debug!("Sim closing {}, its endpoint refused the open", chan);
                            let _ = HostStack::disconnect(self, chan);
                        }
                    }
                    None => trace!("Sim dropping event for closed channel {}", chan),
                }
            }
            Pending::Data { from, to, payload } => self.deliver_data(from, to, payload),
            Pending::Close(chan) => {
                let removed = self.state.lock().unwrap().channels.remove(&chan);
                if let Some(channel) = removed {
                    Self::dispatch(
                        &channel.handler,
                        CocEvent::Disconnected {
                            chan,
                            conn: channel.conn,
                        },
                    );
                }
            }
        }
        true
    }

    /// Hand `event` to `handler`, returning whether it was taken
    fn dispatch(handler: &CocEventHandler, event: CocEvent) -> bool {
        let chan = event.chan();
        match handler(event) {
            Ok(()) => true,
            Err(err) => {
                debug!("Sim handler for {} returned {}", chan, err);
                false
            }
        }
    }

    fn deliver_accept(&self, server: ChannelRef, initiator: ChannelRef) {
        let target = {
            let state = self.state.lock().unwrap();
            match (state.channels.get(&server), state.channels.get(&initiator)) {
                (Some(s), Some(i)) => Some((s.handler.clone(), s.conn, i.mtu)),
                _ => None,
            }
        };
        let Some((handler, conn, peer_mtu)) = target else {
            return;
        };

        let result = handler(CocEvent::Accept {
            chan: server,
            conn,
            peer_mtu,
        });

        let mut state = self.state.lock().unwrap();
        let posted = state
            .channels
            .get(&server)
            .is_some_and(|s| s.rx_ready.is_some());
        let status = match result {
            Ok(()) if posted => None,
            Ok(()) => Some(HostError::NoMemory),
            Err(err) => Some(err),
        };

        match status {
            None => {
                for chan in [server, initiator] {
                    if let Some(channel) = state.channels.get_mut(&chan) {
                        channel.open = true;
                    }
                }
                for chan in [server, initiator] {
                    state.queue.push_back(Pending::Event(
                        chan,
                        CocEvent::Connected {
                            chan,
                            conn,
                            status: Ok(()),
                        },
                    ));
                }
            }
            Some(err) => {
                debug!("Sim accept of {} refused: {}", server, err);
                state.channels.remove(&server);
                state.queue.push_back(Pending::Refuse {
                    chan: initiator,
                    status: HostError::Rejected,
                });
            }
        }
    }

    fn deliver_data(&self, from: Option<ChannelRef>, to: ChannelRef, payload: Vec<u8>) {
        let delivery = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;

            if let Some(chan) = from {
                if let Some(sender) = state.channels.get_mut(&chan) {
                    sender.in_flight = sender.in_flight.saturating_sub(1);
                    if sender.stalled && sender.in_flight < state.config.tx_window {
                        sender.stalled = false;
                        state
                            .queue
                            .push_back(Pending::Event(chan, CocEvent::TxUnstalled { chan }));
                    }
                }
            }

            let Some(receiver) = state.channels.get_mut(&to) else {
                trace!("Sim dropping {} bytes for closed channel {}", payload.len(), to);
                return;
            };
            match receiver.rx_ready.take() {
                None => {
                    warn!("Sim channel {} has no receive buffer posted", to);
                    receiver.backlog.push_back(payload);
                    state.rx_gaps += 1;
                    return;
                }
                Some(mut sdu) => match sdu.append(&payload) {
                    Ok(()) => (receiver.handler.clone(), sdu),
                    Err(err) => {
                        warn!("Sim channel {} can't reassemble {} bytes: {}", to, payload.len(), err);
                        return;
                    }
                },
            }
        };

        let (handler, sdu) = delivery;
        Self::dispatch(&handler, CocEvent::DataReceived { chan: to, sdu });
    }
}

impl HostStack for SimHost {
    fn connect(
        &self,
        conn: ConnHandle,
        psm: Psm,
        mtu: u16,
        sdu_rx: SduBuffer,
        handler: CocEventHandler,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        if !state
            .links
            .get(&conn)
            .is_some_and(|link| link.load(Ordering::SeqCst))
        {
            return Err(HostError::NotConnected);
        }
        if mtu < L2CAP_LE_COC_MIN_MTU {
            return Err(HostError::InvalidArgument);
        }

        let initiator = state.alloc_chan();
        let listener = state
            .listeners
            .get(&psm)
            .map(|l| (l.mtu, l.handler.clone()));
        let server = listener.as_ref().map(|_| state.alloc_chan());

        state.channels.insert(
            initiator,
            SimChannel {
                conn,
                psm,
                mtu,
                handler,
                peer: server.unwrap_or(initiator),
                rx_ready: Some(sdu_rx),
                backlog: VecDeque::new(),
                in_flight: 0,
                stalled: false,
                open: false,
                closing: false,
            },
        );

        match (server, listener) {
            (Some(server), Some((server_mtu, server_handler))) => {
                state.channels.insert(
                    server,
                    SimChannel {
                        conn,
                        psm,
                        mtu: server_mtu,
                        handler: server_handler,
                        peer: initiator,
                        rx_ready: None,
                        backlog: VecDeque::new(),
                        in_flight: 0,
                        stalled: false,
                        open: false,
                        closing: false,
                    },
                );
                state.queue.push_back(Pending::Accept { server, initiator });
            }
            _ => {
                debug!("Sim connect to unregistered PSM {}", psm);
                state.queue.push_back(Pending::Refuse {
                    chan: initiator,
                    status: HostError::NotSupported,
                });
            }
        }
        Ok(())
    }

    fn create_server(&self, psm: Psm, mtu: u16, handler: CocEventHandler) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        if state.listeners.contains_key(&psm) {
            return Err(HostError::AlreadyRegistered);
        }
        if mtu < L2CAP_LE_COC_MIN_MTU {
            return Err(HostError::InvalidArgument);
        }
        state.listeners.insert(psm, SimListener { mtu, handler });
        Ok(())
    }

    fn recv_ready(&self, chan: ChannelRef, sdu_rx: SduBuffer) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        let channel = state.channels.get_mut(&chan).ok_or(HostError::NotConnected)?;
        if channel.rx_ready.is_some() {
            return Err(HostError::Busy);
        }
        channel.rx_ready = Some(sdu_rx);
        if let Some(payload) = channel.backlog.pop_front() {
            state.queue.push_front(Pending::Data {
                from: None,
                to: chan,
                payload,
            });
        }
        Ok(())
    }

    fn send(&self, chan: ChannelRef, sdu_tx: SduBuffer) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let len = sdu_tx.len();

        if let Some(err) = state.fail_next.take() {
            state.sends.push(SendRecord { chan, len, accepted: false });
            return Err(err);
        }

        let window = state.config.tx_window;
        let (peer, in_flight) = match state.channels.get(&chan) {
            Some(c) if c.open && !c.closing => (c.peer, c.in_flight),
            _ => return Err(HostError::NotConnected),
        };
        let peer_mtu = state
            .channels
            .get(&peer)
            .map(|p| p.mtu)
            .ok_or(HostError::NotConnected)?;
        if len > peer_mtu as usize {
            return Err(HostError::InvalidArgument);
        }

        let injected = if state.stall_next == 0 {
            false
        } else if state.stall_pass > 0 {
            state.stall_pass -= 1;
            false
        } else {
            state.stall_next -= 1;
            true
        };
        if injected || in_flight >= window {
            if let Some(channel) = state.channels.get_mut(&chan) {
                channel.stalled = true;
            }
            state.sends.push(SendRecord { chan, len, accepted: false });
            return Err(HostError::Stalled);
        }

        if let Some(channel) = state.channels.get_mut(&chan) {
            channel.in_flight += 1;
        }
        state.sends.push(SendRecord { chan, len, accepted: true });
        state.queue.push_back(Pending::Data {
            from: Some(chan),
            to: peer,
            payload: sdu_tx.to_vec(),
        });
        Ok(())
    }

    fn channel_info(&self, chan: ChannelRef) -> Result<ChannelInfo, HostError> {
        let state = self.state.lock().unwrap();
        let channel = state.channels.get(&chan).ok_or(HostError::NotConnected)?;
        let peer = state
            .channels
            .get(&channel.peer)
            .filter(|_| channel.peer != chan)
            .ok_or(HostError::NotConnected)?;
        Ok(ChannelInfo {
            conn: channel.conn,
            psm: channel.psm,
            our_coc_mtu: channel.mtu,
            peer_coc_mtu: peer.mtu,
        })
    }

    fn disconnect(&self, chan: ChannelRef) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        let peer = match state.channels.get(&chan) {
            Some(c) if !c.closing => c.peer,
            _ => return Err(HostError::NotConnected),
        };
        state.close(chan);
        if peer != chan {
            state.close(peer);
        }
        Ok(())
    }
}
