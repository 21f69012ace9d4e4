//! Ingress reader
//!
//! Turns the byte stream from the virtual interface into typed packets:
//! one read yields one IPv4 packet, which is classified by protocol and
//! offered to the matching ingress queue. Anything else is counted and
//! discarded.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::io::{PacketQueue, TunDevice};
use crate::packet::{Packet, Transport};
use crate::relay::RelayStats;

pub(crate) struct IngressWorker {
    tun: Arc<TunDevice>,
    udp_ingress: Arc<PacketQueue<Packet>>,
    tcp_ingress: Arc<PacketQueue<Packet>>,
    running: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
    config: EngineConfig,
}

impl IngressWorker {
    pub(crate) fn new(
        tun: Arc<TunDevice>,
        udp_ingress: Arc<PacketQueue<Packet>>,
        tcp_ingress: Arc<PacketQueue<Packet>>,
        running: Arc<AtomicBool>,
        stats: Arc<RelayStats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            tun,
            udp_ingress,
            tcp_ingress,
            running,
            stats,
            config,
        }
    }

    pub(crate) fn run(self) {
        debug!("ingress reader started");
        let mut buf = vec![0u8; self.config.ingress_buffer_size];

        while self.running.load(Ordering::Relaxed) {
            match self.tun.wait_readable(self.config.shutdown_poll) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("virtual interface poll failed: {e}");
                    break;
                }
            }

            match self.tun.read(&mut buf) {
                Ok(0) => {
                    debug!("virtual interface closed");
                    break;
                }
                Ok(n) => {
                    self.stats.add_ingress_bytes(n as u64);
                    self.dispatch(&buf[..n]);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                    debug!("virtual interface descriptor gone");
                    break;
                }
                Err(e) => {
                    // Transient; the next read may succeed
                    warn!("virtual interface read failed: {e}");
                }
            }
        }
        debug!("ingress reader stopped");
    }

    fn dispatch(&self, buf: &[u8]) {
        let packet = match Packet::parse(buf) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping unparseable packet: {e}");
                self.stats.record_malformed();
                return;
            }
        };

        match packet.transport() {
            Transport::Udp(_) => {
                if !self.udp_ingress.offer(packet) {
                    self.stats.record_queue_drop();
                }
            }
            Transport::Tcp(_) => {
                if !self.tcp_ingress.offer(packet) {
                    self.stats.record_queue_drop();
                }
            }
            Transport::Other(proto) => {
                trace!(protocol = proto, "dropping non-TCP/UDP packet");
                self.stats.record_other_protocol();
            }
        }
    }
}
