//! TCP relay
//!
//! Terminates the device-side TCP connection, runs a parallel upstream
//! connection, and shuttles payload bytes both ways while keeping the
//! sequence/acknowledgement numbers consistent with the device's view.
//!
//! One loop alternates two phases per iteration: Phase A drains the TCP
//! ingress queue and dispatches on segment flags; Phase B services the
//! selector with a zero-timeout poll for connect/read/write readiness.
//! When both phases find nothing, the loop sleeps briefly instead of
//! spinning.
//!
//! The relay is a best-effort forwarder, not a conformant TCP: no
//! retransmission, no congestion control, and sequence arithmetic is plain
//! `u32` wrapping without modular comparison.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::io::PacketQueue;
use crate::packet::codec::{self, TcpFlags};
use crate::packet::Packet;
use crate::protect::SocketProtector;
use crate::relay::{FlowKey, RelayStats};

/// Per-pipe state machine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeStatus {
    /// Upstream connect initiated, no handshake with the device yet
    SynSent,
    /// SYN seen, SYN+ACK emitted
    SynReceived,
    /// Device handshake complete
    Established,
    /// A close is in progress on at least one half
    CloseWait,
    /// Device FIN arrived after the downstream half already closed
    LastAck,
    /// Terminal; a pipe in this state is never referenced by the flow table
    Closed,
}

/// A payload-bearing segment is accepted only if it extends past what the
/// engine has already acknowledged; anything else is a duplicate.
fn accepts_payload(seq: u32, len: usize, my_ack: u32) -> bool {
    seq.wrapping_add(len as u32) > my_ack
}

/// Per-flow state of the TCP termination machine.
pub(crate) struct TcpPipe {
    stream: TcpStream,
    key: FlowKey,
    /// Device-side endpoint; destination of synthesized segments
    device: SocketAddrV4,
    /// Upstream destination; source of synthesized segments
    remote: SocketAddrV4,
    status: PipeStatus,
    my_seq: u32,
    their_seq: u32,
    my_ack: u32,
    their_ack: u32,
    up_active: bool,
    down_active: bool,
    /// Single pending write buffer toward the upstream socket
    out_buf: Vec<u8>,
    /// Next IP identification for synthesized segments of this pipe
    pack_id: u16,
    /// SYN segments observed, to tell the handshake from retransmissions
    syn_count: u32,
    /// Process-unique id for diagnostics
    tunnel_id: u64,
    connected: bool,
    connected_at: Option<Instant>,
    registered: bool,
    read_interest: bool,
    write_interest: bool,
}

enum ConnectOutcome {
    Connected,
    Pending,
    Failed(io::Error),
}

/// Open a non-blocking stream socket, protect it, and start the connect.
fn open_protected_tcp(
    dst: SocketAddrV4,
    protect: &dyn SocketProtector,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    protect.protect(socket.as_raw_fd())?;
    match socket.connect(&SockAddr::from(SocketAddr::V4(dst))) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(TcpStream::from_std(socket.into()))
}

/// Worker owning the TCP flow table and its selector.
pub(crate) struct TcpRelayWorker {
    poll: Poll,
    ingress: Arc<PacketQueue<Packet>>,
    egress: Arc<PacketQueue<Bytes>>,
    flows: HashMap<FlowKey, usize>,
    pipes: Slab<TcpPipe>,
    protect: Arc<dyn SocketProtector>,
    running: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
    config: EngineConfig,
}

impl TcpRelayWorker {
    pub(crate) fn new(
        poll: Poll,
        ingress: Arc<PacketQueue<Packet>>,
        egress: Arc<PacketQueue<Bytes>>,
        protect: Arc<dyn SocketProtector>,
        running: Arc<AtomicBool>,
        stats: Arc<RelayStats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            poll,
            ingress,
            egress,
            flows: HashMap::new(),
            pipes: Slab::new(),
            protect,
            running,
            stats,
            config,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("TCP relay started");
        let mut events = Events::with_capacity(256);
        let mut scratch = vec![0u8; self.config.tcp_read_chunk];

        while self.running.load(Ordering::Relaxed) {
            let mut busy = false;

            // Phase A: drain device segments
            while let Some(packet) = self.ingress.try_take() {
                busy = true;
                self.handle_packet(&packet);
            }

            // Phase B: service upstream readiness
            if let Err(e) = self.poll.poll(&mut events, Some(Duration::ZERO)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("TCP selector failed: {e}");
                break;
            }
            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable() || event.is_write_closed() || event.is_error(),
                    )
                })
                .collect();
            for (token, readable, writable) in ready {
                busy = true;
                self.service(token, readable, writable, &mut scratch);
            }

            if !busy {
                thread::sleep(self.config.relay_idle_sleep);
            }
        }

        let live: Vec<usize> = self.pipes.iter().map(|(idx, _)| idx).collect();
        for idx in live {
            self.purge(idx);
        }
        debug!("TCP relay stopped");
    }

    // ------------------------------------------------------------------
    // Phase A: device segments
    // ------------------------------------------------------------------

    fn handle_packet(&mut self, packet: &Packet) {
        let Some(tcp) = packet.tcp() else { return };
        let tcp = tcp.clone();
        let key = FlowKey::of(packet);

        let idx = match self.flows.get(&key).copied() {
            Some(idx) => {
                // A pipe whose upstream connect failed sits dead in the
                // table; the next device segment purges it, and a SYN
                // rebuilds the flow from scratch.
                let dead = self
                    .pipes
                    .get(idx)
                    .is_some_and(|p| !p.up_active && !p.down_active);
                if dead {
                    self.purge(idx);
                    if tcp.syn {
                        match self.create_pipe(packet, key) {
                            Some(idx) => idx,
                            None => return,
                        }
                    } else {
                        return;
                    }
                } else {
                    idx
                }
            }
            None => match self.create_pipe(packet, key) {
                Some(idx) => idx,
                None => return,
            },
        };

        if tcp.syn {
            self.handle_syn(idx, tcp.sequence_number);
        } else if tcp.rst {
            self.handle_rst(idx);
        } else if tcp.fin {
            self.handle_fin(idx, tcp.sequence_number, tcp.acknowledgment_number);
        } else if tcp.ack {
            self.handle_ack(
                idx,
                tcp.sequence_number,
                tcp.acknowledgment_number,
                packet.payload(),
            );
        }
    }

    fn create_pipe(&mut self, packet: &Packet, key: FlowKey) -> Option<usize> {
        let dst = packet.destination();
        let stream = match open_protected_tcp(dst, self.protect.as_ref()) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%key, "upstream connect failed: {e}");
                return None;
            }
        };

        let tunnel_id = self.stats.next_tunnel_id();
        let entry = self.pipes.vacant_entry();
        let idx = entry.key();
        let mut pipe = TcpPipe {
            stream,
            key,
            device: packet.source(),
            remote: dst,
            status: PipeStatus::SynSent,
            my_seq: 0,
            their_seq: 0,
            my_ack: 0,
            their_ack: 0,
            up_active: true,
            down_active: true,
            out_buf: Vec::new(),
            pack_id: 0,
            syn_count: 0,
            tunnel_id,
            connected: false,
            connected_at: None,
            registered: false,
            read_interest: false,
            write_interest: true,
        };

        // Connect readiness surfaces as writability
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut pipe.stream, Token(idx), Interest::WRITABLE)
        {
            warn!(%key, tunnel_id, "failed to register pipe: {e}");
            return None;
        }
        pipe.registered = true;

        entry.insert(pipe);
        self.flows.insert(key, idx);
        self.stats.record_tcp_pipe_created();
        debug!(%key, tunnel_id, "opened TCP pipe");
        Some(idx)
    }

    fn handle_syn(&mut self, idx: usize, seq: u32) {
        let first = {
            let Some(pipe) = self.pipes.get_mut(idx) else { return };
            pipe.syn_count += 1;
            if pipe.syn_count == 1 {
                pipe.their_seq = seq;
                pipe.my_ack = seq.wrapping_add(1);
                pipe.my_seq = 1;
                pipe.status = PipeStatus::SynReceived;
                true
            } else {
                pipe.my_ack = seq.wrapping_add(1);
                trace!(tunnel_id = pipe.tunnel_id, count = pipe.syn_count, "SYN retransmission");
                false
            }
        };
        if first {
            self.send_segment(idx, TcpFlags::SYN | TcpFlags::ACK, &[]);
        }
    }

    fn handle_rst(&mut self, idx: usize) {
        if let Some(pipe) = self.pipes.get_mut(idx) {
            debug!(tunnel_id = pipe.tunnel_id, key = %pipe.key, "device reset");
            pipe.up_active = false;
            pipe.down_active = false;
            pipe.status = PipeStatus::CloseWait;
        }
        self.purge(idx);
    }

    fn handle_fin(&mut self, idx: usize, seq: u32, ack: u32) {
        {
            let Some(pipe) = self.pipes.get_mut(idx) else { return };
            pipe.my_ack = seq.wrapping_add(1);
            pipe.their_ack = ack.wrapping_add(1);
            pipe.up_active = false;
            pipe.status = if pipe.down_active {
                PipeStatus::CloseWait
            } else {
                PipeStatus::LastAck
            };
            debug!(tunnel_id = pipe.tunnel_id, key = %pipe.key, "device close");
            if let Err(e) = pipe.stream.shutdown(Shutdown::Write) {
                trace!(tunnel_id = pipe.tunnel_id, "upstream write shutdown: {e}");
            }
        }
        self.send_segment(idx, TcpFlags::ACK, &[]);

        let both_closed = self.pipes.get(idx).is_some_and(|p| !p.down_active);
        if both_closed {
            self.purge(idx);
        }
    }

    fn handle_ack(&mut self, idx: usize, seq: u32, ack: u32, payload: &[u8]) {
        {
            let Some(pipe) = self.pipes.get_mut(idx) else { return };
            if pipe.status == PipeStatus::SynReceived {
                pipe.status = PipeStatus::Established;
                trace!(tunnel_id = pipe.tunnel_id, "pipe established");
            }
            if payload.is_empty() {
                pipe.their_seq = seq;
                pipe.their_ack = ack;
                return;
            }
            if !accepts_payload(seq, payload.len(), pipe.my_ack) {
                self.stats.record_duplicate_segment();
                trace!(tunnel_id = pipe.tunnel_id, seq, "duplicate segment dropped");
                return;
            }
            pipe.my_ack = seq.wrapping_add(payload.len() as u32);
            pipe.their_seq = seq;
            pipe.their_ack = ack;
            // Replaces whatever was still pending toward the upstream
            pipe.out_buf.clear();
            pipe.out_buf.extend_from_slice(payload);
        }
        if self.flush_upstream(idx) {
            self.send_segment(idx, TcpFlags::ACK, &[]);
        }
    }

    // ------------------------------------------------------------------
    // Phase B: upstream readiness
    // ------------------------------------------------------------------

    fn service(&mut self, token: Token, readable: bool, writable: bool, scratch: &mut [u8]) {
        let idx = token.0;
        if !self.pipes.contains(idx) {
            return;
        }

        if writable {
            let connected = self.pipes.get(idx).is_some_and(|p| p.connected);
            if connected {
                if !self.flush_upstream(idx) {
                    return;
                }
            } else {
                match self.finalize_connect(idx) {
                    ConnectOutcome::Connected => {
                        self.update_interest(idx, true, true);
                    }
                    ConnectOutcome::Pending => {}
                    ConnectOutcome::Failed(e) => {
                        self.mark_dead(idx, &e);
                        return;
                    }
                }
            }
        }

        if readable {
            if let Err(e) = self.drain_upstream(idx, scratch) {
                let tunnel_id = self.pipes.get(idx).map(|p| p.tunnel_id);
                warn!(?tunnel_id, "upstream read failed: {e}");
                self.close_rst(idx);
            }
        }
    }

    fn finalize_connect(&mut self, idx: usize) -> ConnectOutcome {
        let Some(pipe) = self.pipes.get_mut(idx) else {
            return ConnectOutcome::Pending;
        };
        match pipe.stream.take_error() {
            Ok(Some(e)) => return ConnectOutcome::Failed(e),
            Ok(None) => {}
            Err(e) => return ConnectOutcome::Failed(e),
        }
        match pipe.stream.peer_addr() {
            Ok(_) => {
                pipe.connected = true;
                pipe.connected_at = Some(Instant::now());
                debug!(tunnel_id = pipe.tunnel_id, key = %pipe.key, "upstream connected");
                ConnectOutcome::Connected
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                ConnectOutcome::Pending
            }
            Err(e) => ConnectOutcome::Failed(e),
        }
    }

    /// Connect failures leave a dead pipe behind: both halves inactive, no
    /// selector interest. The next device segment for the key purges it.
    fn mark_dead(&mut self, idx: usize, err: &io::Error) {
        if let Some(pipe) = self.pipes.get_mut(idx) {
            debug!(tunnel_id = pipe.tunnel_id, key = %pipe.key, "upstream connect failed: {err}");
            pipe.up_active = false;
            pipe.down_active = false;
            pipe.status = PipeStatus::CloseWait;
        }
        self.update_interest(idx, false, false);
    }

    /// Flush `out_buf` toward the upstream. Returns `false` if the pipe was
    /// torn down.
    fn flush_upstream(&mut self, idx: usize) -> bool {
        enum Outcome {
            Drained,
            Partial,
            OutputGone,
            Error(io::Error),
        }

        let outcome = {
            let Some(pipe) = self.pipes.get_mut(idx) else {
                return false;
            };
            if pipe.out_buf.is_empty() {
                Outcome::Drained
            } else if !pipe.up_active {
                Outcome::OutputGone
            } else if !pipe.connected {
                // Connect still pending; WRITE interest is already armed
                Outcome::Partial
            } else {
                let mut written = 0;
                let mut result = Outcome::Drained;
                while written < pipe.out_buf.len() {
                    match pipe.stream.write(&pipe.out_buf[written..]) {
                        Ok(0) => {
                            result = Outcome::Partial;
                            break;
                        }
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            result = Outcome::Partial;
                            break;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            result = Outcome::Error(e);
                            break;
                        }
                    }
                }
                // Unwritten bytes stay at the front for the next attempt
                pipe.out_buf.drain(..written);
                result
            }
        };

        match outcome {
            Outcome::Drained => {
                let read = self
                    .pipes
                    .get(idx)
                    .is_some_and(|p| p.connected && p.down_active);
                self.update_interest(idx, read, false);
                true
            }
            Outcome::Partial => {
                let read = self
                    .pipes
                    .get(idx)
                    .is_some_and(|p| p.connected && p.down_active);
                self.update_interest(idx, read, true);
                true
            }
            Outcome::OutputGone => {
                // Output already shut down with bytes still pending: the
                // flow cannot make progress, tear it down toward the device.
                self.send_segment(idx, TcpFlags::FIN | TcpFlags::ACK, &[]);
                self.purge(idx);
                false
            }
            Outcome::Error(e) => {
                let tunnel_id = self.pipes.get(idx).map(|p| p.tunnel_id);
                warn!(?tunnel_id, "upstream write failed: {e}");
                self.close_rst(idx);
                false
            }
        }
    }

    /// Drain readable upstream bytes; each non-empty chunk becomes one
    /// data-bearing ACK toward the device. Once a close is in progress the
    /// bytes are discarded instead of emitted, but the drain keeps going so
    /// an upstream EOF is still observed and the pipe can finish tearing
    /// down.
    fn drain_upstream(&mut self, idx: usize, scratch: &mut [u8]) -> io::Result<()> {
        loop {
            let (n, emit) = {
                let Some(pipe) = self.pipes.get_mut(idx) else {
                    return Ok(());
                };
                let emit = pipe.status != PipeStatus::CloseWait;
                match pipe.stream.read(scratch) {
                    Ok(n) => (n, emit),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };

            if n == 0 {
                self.close_downstream(idx);
                return Ok(());
            }
            if emit {
                self.send_segment(idx, TcpFlags::ACK, &scratch[..n]);
            }
        }
    }

    /// Upstream EOF: half-close the read side and announce it to the device.
    fn close_downstream(&mut self, idx: usize) {
        {
            let Some(pipe) = self.pipes.get_mut(idx) else { return };
            debug!(tunnel_id = pipe.tunnel_id, key = %pipe.key, "upstream EOF");
            let _ = pipe.stream.shutdown(Shutdown::Read);
            pipe.down_active = false;
        }
        let write = self.pipes.get(idx).is_some_and(|p| p.write_interest);
        self.update_interest(idx, false, write);
        self.send_segment(idx, TcpFlags::FIN | TcpFlags::ACK, &[]);

        let both_closed = self.pipes.get(idx).is_some_and(|p| !p.up_active);
        if both_closed {
            self.purge(idx);
        }
    }

    /// Purge the pipe and announce the failure to the device.
    fn close_rst(&mut self, idx: usize) {
        self.send_segment(idx, TcpFlags::RST, &[]);
        self.stats.record_tcp_reset();
        self.purge(idx);
    }

    /// Remove the pipe from the flow table and release its resources. The
    /// removal happens before any subsequent lookup can observe the pipe.
    fn purge(&mut self, idx: usize) {
        if !self.pipes.contains(idx) {
            return;
        }
        let mut pipe = self.pipes.remove(idx);
        self.flows.remove(&pipe.key);
        if pipe.registered {
            let _ = self.poll.registry().deregister(&mut pipe.stream);
        }
        pipe.status = PipeStatus::Closed;
        debug!(
            tunnel_id = pipe.tunnel_id,
            key = %pipe.key,
            my_seq = pipe.my_seq,
            my_ack = pipe.my_ack,
            their_seq = pipe.their_seq,
            their_ack = pipe.their_ack,
            lifetime_ms = pipe.connected_at.map(|t| t.elapsed().as_millis() as u64),
            "pipe purged"
        );
    }

    fn update_interest(&mut self, idx: usize, read: bool, write: bool) {
        let registry = self.poll.registry();
        let Some(pipe) = self.pipes.get_mut(idx) else { return };
        if pipe.read_interest == read && pipe.write_interest == write {
            return;
        }
        pipe.read_interest = read;
        pipe.write_interest = write;

        let interest = match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        let result = match interest {
            Some(interest) if pipe.registered => {
                registry.reregister(&mut pipe.stream, Token(idx), interest)
            }
            Some(interest) => {
                pipe.registered = true;
                registry.register(&mut pipe.stream, Token(idx), interest)
            }
            None if pipe.registered => {
                pipe.registered = false;
                registry.deregister(&mut pipe.stream)
            }
            None => Ok(()),
        };
        if let Err(e) = result {
            trace!(tunnel_id = pipe.tunnel_id, "interest update failed: {e}");
        }
    }

    /// Build and emit one segment toward the device, then apply the
    /// post-emission sequence adjustment: SYN and FIN consume one sequence
    /// number each, a data-bearing ACK consumes its payload length.
    fn send_segment(&mut self, idx: usize, flags: u8, payload: &[u8]) {
        let (device, remote, seq, ack, ip_id, tunnel_id) = {
            let Some(pipe) = self.pipes.get_mut(idx) else { return };
            let ip_id = pipe.pack_id;
            pipe.pack_id = pipe.pack_id.wrapping_add(1);
            (
                pipe.device,
                pipe.remote,
                pipe.my_seq,
                pipe.my_ack,
                ip_id,
                pipe.tunnel_id,
            )
        };

        let mut out = Vec::new();
        if let Err(e) =
            codec::build_tcp_packet(&mut out, remote, device, flags, seq, ack, ip_id, payload)
        {
            warn!(tunnel_id, "failed to build segment: {e}");
            return;
        }
        trace!(tunnel_id, flags, seq, ack, len = payload.len(), "emitting segment");
        if !self.egress.offer(Bytes::from(out)) {
            self.stats.record_queue_drop();
        }

        if let Some(pipe) = self.pipes.get_mut(idx) {
            if flags & TcpFlags::SYN != 0 {
                pipe.my_seq = pipe.my_seq.wrapping_add(1);
            }
            if flags & TcpFlags::FIN != 0 {
                pipe.my_seq = pipe.my_seq.wrapping_add(1);
            }
            if flags & TcpFlags::ACK != 0 && !payload.is_empty() {
                pipe.my_seq = pipe.my_seq.wrapping_add(payload.len() as u32);
            }
        }
    }
}
