//! Engine tuning parameters
//!
//! The engine has no runtime configuration surface beyond
//! [`Engine::start`](crate::Engine::start) and
//! [`Engine::stop`](crate::Engine::stop); these values exist so the sizes
//! and timings live in one place instead of being scattered through the
//! workers.

use std::time::Duration;

/// Capacity of every shared queue (UDP ingress, TCP ingress, egress,
/// UDP registration). Overflow drops the packet.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Scratch buffer for reads from the virtual interface. One read yields one
/// IP packet, so this bounds the largest packet the engine accepts.
pub const DEFAULT_INGRESS_BUFFER_SIZE: usize = 16 * 1024;

/// Scratch buffer for reads from upstream datagram sockets.
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 16 * 1024;

/// Read chunk for upstream stream sockets. Every chunk becomes one
/// synthesized segment, so this bounds the largest reply packet and stays
/// well inside the ingress packet bound.
pub const DEFAULT_TCP_READ_CHUNK: usize = 4 * 1024;

/// Sleep between TCP relay iterations when both the ingress queue and the
/// selector are idle.
pub const DEFAULT_RELAY_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// How long blocking dequeues and selector waits may sleep before
/// re-checking the shutdown flag.
pub const DEFAULT_SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// UDP flows with no traffic for this long are evicted on the next
/// selector pass.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded capacity for each shared queue
    pub queue_capacity: usize,
    /// Per-read scratch size for the ingress reader
    pub ingress_buffer_size: usize,
    /// Per-read scratch size for upstream datagram sockets
    pub udp_buffer_size: usize,
    /// Per-read chunk size for upstream stream sockets
    pub tcp_read_chunk: usize,
    /// TCP relay idle sleep
    pub relay_idle_sleep: Duration,
    /// Shutdown-flag re-check granularity for blocking waits
    pub shutdown_poll: Duration,
    /// Idle bound for UDP flow eviction
    pub udp_idle_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ingress_buffer_size: DEFAULT_INGRESS_BUFFER_SIZE,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            tcp_read_chunk: DEFAULT_TCP_READ_CHUNK,
            relay_idle_sleep: DEFAULT_RELAY_IDLE_SLEEP,
            shutdown_poll: DEFAULT_SHUTDOWN_POLL,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
        }
    }
}
