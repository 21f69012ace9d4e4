//! Egress writer
//!
//! Serializes reply packets to the virtual interface in arrival order on
//! the shared egress queue. Each buffer is written until fully drained.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::io::{PacketQueue, TunDevice};
use crate::relay::RelayStats;

pub(crate) struct EgressWorker {
    tun: Arc<TunDevice>,
    egress: Arc<PacketQueue<Bytes>>,
    running: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
    config: EngineConfig,
}

impl EgressWorker {
    pub(crate) fn new(
        tun: Arc<TunDevice>,
        egress: Arc<PacketQueue<Bytes>>,
        running: Arc<AtomicBool>,
        stats: Arc<RelayStats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            tun,
            egress,
            running,
            stats,
            config,
        }
    }

    pub(crate) fn run(self) {
        debug!("egress writer started");
        while self.running.load(Ordering::Relaxed) {
            let Some(packet) = self.egress.take(self.config.shutdown_poll) else {
                continue;
            };

            let mut offset = 0;
            while offset < packet.len() {
                match self.tun.write(&packet[offset..]) {
                    Ok(n) => offset += n,
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        if !self.running.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("virtual interface write failed: {e}");
                        break;
                    }
                }
            }
            if offset > 0 {
                self.stats.add_egress_bytes(offset as u64);
            }
        }
        debug!("egress writer stopped");
    }
}
