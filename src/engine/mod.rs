//! Engine lifecycle
//!
//! The [`Engine`] owns the whole relay: four bounded queues, two selectors,
//! and five worker threads (ingress reader, UDP send, UDP receive, TCP
//! relay, egress writer). Workers share nothing mutable; all traffic moves
//! by handoff through the queues. `stop` flips the shared running flag,
//! wakes the UDP selector, and joins every worker at its next suspension
//! point.

mod egress;
mod ingress;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use mio::{Poll, Waker};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::RelayError;
use crate::io::{PacketQueue, TunDevice};
use crate::protect::SocketProtector;
use crate::relay::tcp::TcpRelayWorker;
use crate::relay::udp::{UdpRecvWorker, UdpSendWorker, UDP_WAKER_TOKEN};
use crate::relay::{RelayStats, RelayStatsSnapshot};

use egress::EgressWorker;
use ingress::IngressWorker;

/// The relay engine.
///
/// Created by [`Engine::start`], torn down by [`Engine::stop`] or drop.
/// Holds every process-wide counter; nothing outlives the value.
pub struct Engine {
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    udp_waker: Arc<Waker>,
    stats: Arc<RelayStats>,
}

impl Engine {
    /// Start the engine on an open virtual-interface descriptor.
    ///
    /// Every upstream socket is passed to `protect` before `connect` so its
    /// traffic bypasses the interface.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if a selector cannot be opened or a worker
    /// thread cannot be spawned; no workers are left running on failure.
    pub fn start(
        tun: TunDevice,
        protect: Arc<dyn SocketProtector>,
    ) -> Result<Engine, RelayError> {
        Self::with_config(tun, protect, EngineConfig::default())
    }

    /// Start the engine with explicit tuning parameters.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Engine::start`].
    pub fn with_config(
        tun: TunDevice,
        protect: Arc<dyn SocketProtector>,
        config: EngineConfig,
    ) -> Result<Engine, RelayError> {
        let tun = Arc::new(tun);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(RelayStats::new());
        let epoch = Instant::now();

        let udp_ingress = Arc::new(PacketQueue::bounded(config.queue_capacity));
        let tcp_ingress = Arc::new(PacketQueue::bounded(config.queue_capacity));
        let egress = Arc::new(PacketQueue::bounded(config.queue_capacity));
        let registrations = Arc::new(PacketQueue::bounded(config.queue_capacity));

        let udp_poll = Poll::new().map_err(RelayError::Selector)?;
        let udp_waker = Arc::new(
            Waker::new(udp_poll.registry(), UDP_WAKER_TOKEN).map_err(RelayError::Selector)?,
        );
        let tcp_poll = Poll::new().map_err(RelayError::Selector)?;

        let mut engine = Engine {
            running: Arc::clone(&running),
            workers: Vec::with_capacity(5),
            udp_waker: Arc::clone(&udp_waker),
            stats: Arc::clone(&stats),
        };

        let ingress_worker = IngressWorker::new(
            Arc::clone(&tun),
            Arc::clone(&udp_ingress),
            Arc::clone(&tcp_ingress),
            Arc::clone(&running),
            Arc::clone(&stats),
            config.clone(),
        );
        engine.spawn("relay-ingress", move || ingress_worker.run())?;

        let udp_send = UdpSendWorker::new(
            Arc::clone(&udp_ingress),
            Arc::clone(&registrations),
            Arc::clone(&udp_waker),
            Arc::clone(&protect),
            Arc::clone(&running),
            Arc::clone(&stats),
            config.clone(),
            epoch,
        );
        engine.spawn("relay-udp-send", move || udp_send.run())?;

        let udp_recv = UdpRecvWorker::new(
            udp_poll,
            Arc::clone(&registrations),
            Arc::clone(&egress),
            Arc::clone(&running),
            Arc::clone(&stats),
            config.clone(),
            epoch,
        );
        engine.spawn("relay-udp-recv", move || udp_recv.run())?;

        let tcp_relay = TcpRelayWorker::new(
            tcp_poll,
            Arc::clone(&tcp_ingress),
            Arc::clone(&egress),
            Arc::clone(&protect),
            Arc::clone(&running),
            Arc::clone(&stats),
            config.clone(),
        );
        engine.spawn("relay-tcp", move || tcp_relay.run())?;

        let egress_worker = EgressWorker::new(
            Arc::clone(&tun),
            Arc::clone(&egress),
            Arc::clone(&running),
            Arc::clone(&stats),
            config,
        );
        engine.spawn("relay-egress", move || egress_worker.run())?;

        info!("relay engine started");
        Ok(engine)
    }

    fn spawn<F>(&mut self, name: &'static str, f: F) -> Result<(), RelayError>
    where
        F: FnOnce() + Send + 'static,
    {
        match thread::Builder::new().name(name.into()).spawn(f) {
            Ok(handle) => {
                self.workers.push(handle);
                Ok(())
            }
            Err(source) => {
                // Unwind the workers already launched
                self.shutdown();
                Err(RelayError::WorkerSpawn { name, source })
            }
        }
    }

    /// Whether the engine has not been stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Observable relay counters.
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the engine: interrupt every worker, join them, and release all
    /// sockets, selectors and the interface descriptor.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        debug!("stopping relay engine");
        if let Err(e) = self.udp_waker.wake() {
            warn!("failed to wake UDP selector for shutdown: {e}");
        }
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!("worker '{name}' panicked");
            }
        }
        info!("relay engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
