//! UDP relay
//!
//! Stateless-ish forwarding of datagrams with one upstream socket per flow.
//! The send worker consumes device packets, lazily opens a protected
//! connected socket per flow and writes the payload; the receive worker
//! multiplexes all upstream sockets on one selector and synthesizes reply
//! packets onto the egress queue.
//!
//! Sockets are per-flow rather than shared so replies return on a socket
//! whose peer address is known, and so per-flow errors stay isolated.
//!
//! Newly opened sockets are handed to the receive worker through the
//! registration queue; the send worker wakes the selector after each
//! handoff so registration happens before the first reply can be missed
//! for long. Evictions travel the same queue: the send worker alone
//! decides when a flow dies (idle expiry or write error) and the receive
//! worker processes the close before any rebuilt flow's registration, so
//! one flow key never has two live entries.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::io::PacketQueue;
use crate::packet::{codec, Packet};
use crate::protect::SocketProtector;
use crate::relay::{FlowKey, RelayStats};

/// Selector token reserved for the cross-thread waker.
pub(crate) const UDP_WAKER_TOKEN: Token = Token(usize::MAX);

/// How often the send worker sweeps its flow table for idle entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Handoff from the send worker to the receive worker. Opens and closes
/// share one queue so a close is always processed before the registration
/// of a flow rebuilt under the same key.
pub(crate) enum UdpFlowEvent {
    /// Register a newly opened flow socket for read interest
    Open(UdpFlow),
    /// Deregister and drop the flow for this key
    Close(FlowKey),
}

/// One UDP flow: the upstream socket plus the addresses replies must carry.
///
/// `remote`/`local` are the addresses as the device saw them (the address
/// originally targeted, not whatever the socket binds to locally).
#[derive(Debug, Clone)]
pub(crate) struct UdpFlow {
    socket: Arc<UdpSocket>,
    key: FlowKey,
    /// Source of synthesized replies
    remote: SocketAddrV4,
    /// Destination of synthesized replies (device side)
    local: SocketAddrV4,
    /// Seconds since engine epoch of the last packet in either direction
    last_activity: Arc<AtomicU64>,
}

impl UdpFlow {
    fn touch(&self, epoch: Instant) {
        self.last_activity
            .store(epoch.elapsed().as_secs(), Ordering::Relaxed);
    }

    fn idle_secs(&self, epoch: Instant) -> u64 {
        epoch
            .elapsed()
            .as_secs()
            .saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }
}

/// Open a non-blocking datagram socket, protect it, and connect it to the
/// flow's destination.
fn open_protected_udp(
    dst: SocketAddrV4,
    protect: &dyn SocketProtector,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    protect.protect(socket.as_raw_fd())?;
    socket.connect(&SockAddr::from(SocketAddr::V4(dst)))?;
    Ok(socket.into())
}

/// Worker draining the UDP ingress queue toward upstream sockets.
pub(crate) struct UdpSendWorker {
    ingress: Arc<PacketQueue<Packet>>,
    registrations: Arc<PacketQueue<UdpFlowEvent>>,
    waker: Arc<Waker>,
    protect: Arc<dyn SocketProtector>,
    flows: HashMap<FlowKey, UdpFlow>,
    running: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
    config: EngineConfig,
    epoch: Instant,
    last_sweep: Instant,
}

impl UdpSendWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ingress: Arc<PacketQueue<Packet>>,
        registrations: Arc<PacketQueue<UdpFlowEvent>>,
        waker: Arc<Waker>,
        protect: Arc<dyn SocketProtector>,
        running: Arc<AtomicBool>,
        stats: Arc<RelayStats>,
        config: EngineConfig,
        epoch: Instant,
    ) -> Self {
        Self {
            ingress,
            registrations,
            waker,
            protect,
            flows: HashMap::new(),
            running,
            stats,
            config,
            epoch,
            last_sweep: Instant::now(),
        }
    }

    pub(crate) fn run(mut self) {
        debug!("UDP send worker started");
        while self.running.load(Ordering::Relaxed) {
            match self.ingress.take(self.config.shutdown_poll) {
                Some(packet) => self.forward(packet),
                None => {}
            }
            self.maybe_sweep();
        }
        debug!("UDP send worker stopped");
    }

    fn forward(&mut self, packet: Packet) {
        let key = FlowKey::of(&packet);

        if !self.flows.contains_key(&key) {
            let dst = packet.destination();
            let socket = match open_protected_udp(dst, self.protect.as_ref()) {
                Ok(socket) => socket,
                Err(e) => {
                    // Drop the packet; the socket is not cached
                    debug!(%key, "UDP connect failed: {e}");
                    return;
                }
            };
            let flow = UdpFlow {
                socket: Arc::new(socket),
                key,
                remote: dst,
                local: packet.source(),
                last_activity: Arc::new(AtomicU64::new(self.epoch.elapsed().as_secs())),
            };
            self.flows.insert(key, flow.clone());
            self.stats.record_udp_flow_created();
            trace!(%key, "opened UDP flow");

            if self.registrations.offer(UdpFlowEvent::Open(flow)) {
                if let Err(e) = self.waker.wake() {
                    warn!("failed to wake UDP selector: {e}");
                }
            } else {
                self.stats.record_queue_drop();
                warn!(%key, "registration queue full, replies will not be relayed");
            }
        }

        let Some(flow) = self.flows.get(&key) else {
            return;
        };
        flow.touch(self.epoch);
        match flow.socket.send(packet.payload()) {
            Ok(n) => trace!(%key, bytes = n, "forwarded datagram"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(%key, "upstream send would block, datagram dropped");
            }
            Err(e) => {
                warn!(%key, "upstream write failed, evicting flow: {e}");
                self.evict_flow(key);
            }
        }
    }

    /// Drop a flow and tell the receive worker to deregister it. The close
    /// goes through the same queue as registrations, so it lands before any
    /// rebuilt flow's registration for the same key.
    fn evict_flow(&mut self, key: FlowKey) {
        if self.flows.remove(&key).is_none() {
            return;
        }
        if self.registrations.offer(UdpFlowEvent::Close(key)) {
            if let Err(e) = self.waker.wake() {
                warn!("failed to wake UDP selector: {e}");
            }
        } else {
            self.stats.record_queue_drop();
            warn!(%key, "registration queue full, eviction not delivered");
        }
    }

    fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = Instant::now();
        let idle_limit = self.config.udp_idle_timeout.as_secs();
        let epoch = self.epoch;
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.idle_secs(epoch) >= idle_limit)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            trace!(%key, "expiring idle UDP flow");
            self.evict_flow(key);
        }
    }
}

/// Worker multiplexing upstream datagram sockets for replies.
///
/// Eviction decisions come from the send worker over the registration
/// queue; locally the worker only drops a flow whose socket errors on
/// read.
pub(crate) struct UdpRecvWorker {
    poll: Poll,
    registrations: Arc<PacketQueue<UdpFlowEvent>>,
    egress: Arc<PacketQueue<Bytes>>,
    flows: Slab<UdpFlow>,
    index: HashMap<FlowKey, usize>,
    running: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
    config: EngineConfig,
    epoch: Instant,
}

impl UdpRecvWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        poll: Poll,
        registrations: Arc<PacketQueue<UdpFlowEvent>>,
        egress: Arc<PacketQueue<Bytes>>,
        running: Arc<AtomicBool>,
        stats: Arc<RelayStats>,
        config: EngineConfig,
        epoch: Instant,
    ) -> Self {
        Self {
            poll,
            registrations,
            egress,
            flows: Slab::new(),
            index: HashMap::new(),
            running,
            stats,
            config,
            epoch,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("UDP receive worker started");
        let mut events = Events::with_capacity(256);
        let mut buf = vec![0u8; self.config.udp_buffer_size];

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.config.shutdown_poll)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("UDP selector failed: {e}");
                break;
            }

            // Opens and closes first, so a flow registered and immediately
            // readable is serviced within this pass and a closed one is
            // gone before its rebuild shows up.
            self.drain_registrations();

            let ready: Vec<Token> = events.iter().map(|event| event.token()).collect();
            for token in ready {
                if token != UDP_WAKER_TOKEN {
                    self.handle_readable(token, &mut buf);
                }
            }
        }

        let keys: Vec<usize> = self.flows.iter().map(|(idx, _)| idx).collect();
        for idx in keys {
            self.evict(idx, false);
        }
        debug!("UDP receive worker stopped");
    }

    fn drain_registrations(&mut self) {
        while let Some(event) = self.registrations.try_take() {
            match event {
                UdpFlowEvent::Open(flow) => self.register_flow(flow),
                UdpFlowEvent::Close(key) => {
                    if let Some(idx) = self.index.get(&key).copied() {
                        trace!(%key, "closing UDP flow");
                        self.evict(idx, true);
                    }
                }
            }
        }
    }

    fn register_flow(&mut self, flow: UdpFlow) {
        // One live entry per key; a stale predecessor goes first
        if let Some(idx) = self.index.get(&flow.key).copied() {
            self.evict(idx, true);
        }
        let fd = flow.socket.as_raw_fd();
        let entry = self.flows.vacant_entry();
        let token = Token(entry.key());
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            Ok(()) => {
                trace!(key = %flow.key, ?token, "registered UDP flow");
                self.index.insert(flow.key, token.0);
                entry.insert(flow);
            }
            Err(e) => warn!(key = %flow.key, "failed to register UDP flow: {e}"),
        }
    }

    fn handle_readable(&mut self, token: Token, buf: &mut [u8]) {
        loop {
            let (socket, remote, local, key) = match self.flows.get(token.0) {
                Some(flow) => {
                    flow.touch(self.epoch);
                    (Arc::clone(&flow.socket), flow.remote, flow.local, flow.key)
                }
                None => return,
            };

            match socket.recv(buf) {
                Ok(n) => {
                    let mut out = Vec::new();
                    let ip_id = self.stats.next_ip_id();
                    match codec::build_udp_packet(&mut out, remote, local, ip_id, &buf[..n]) {
                        Ok(()) => {
                            trace!(%key, bytes = n, "relaying datagram reply");
                            if !self.egress.offer(Bytes::from(out)) {
                                self.stats.record_queue_drop();
                            }
                        }
                        Err(e) => warn!(%key, "failed to build reply: {e}"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(%key, "upstream read failed, evicting flow: {e}");
                    self.evict(token.0, true);
                    return;
                }
            }
        }
    }

    fn evict(&mut self, idx: usize, count: bool) {
        if self.flows.contains(idx) {
            let flow = self.flows.remove(idx);
            self.index.remove(&flow.key);
            let fd = flow.socket.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            if count {
                self.stats.record_udp_flow_evicted();
            }
        }
    }
}
