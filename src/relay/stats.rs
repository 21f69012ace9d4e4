//! Relay statistics
//!
//! One atomic counter block shared by all workers. The byte counters are
//! the engine's two observable monotonic counters; the rest accounts for
//! best-effort drops and flow lifecycle so embedders can see where traffic
//! went. Counters may be read from any thread; only eventual consistency is
//! promised.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

/// Atomic relay statistics.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Bytes read from the virtual interface
    ingress_bytes: AtomicU64,
    /// Bytes written to the virtual interface
    egress_bytes: AtomicU64,
    /// Packets dropped because they failed to parse
    malformed_drops: AtomicU64,
    /// Packets of protocols other than TCP/UDP
    other_protocol_drops: AtomicU64,
    /// Packets dropped on a full queue
    queue_drops: AtomicU64,
    /// Payload-bearing segments suppressed as duplicates
    duplicate_segments: AtomicU64,
    /// UDP flows created
    udp_flows_created: AtomicU64,
    /// UDP flows evicted (error or idle expiry)
    udp_flows_evicted: AtomicU64,
    /// TCP pipes created
    tcp_pipes_created: AtomicU64,
    /// RST segments emitted toward the device
    tcp_resets: AtomicU64,
    /// IP identification for synthesized packets
    ip_id: AtomicU16,
    /// Tunnel id allocator for diagnostics
    tunnel_id: AtomicU64,
}

impl RelayStats {
    /// Create a zeroed counter block.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_ingress_bytes(&self, n: u64) {
        self.ingress_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_egress_bytes(&self, n: u64) {
        self.egress_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_other_protocol(&self) {
        self.other_protocol_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate_segment(&self) {
        self.duplicate_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_udp_flow_created(&self) {
        self.udp_flows_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_udp_flow_evicted(&self) {
        self.udp_flows_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tcp_pipe_created(&self) {
        self.tcp_pipes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tcp_reset(&self) {
        self.tcp_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Next IP identification for a synthesized packet. Process-wide and
    /// monotonic modulo 2^16.
    pub(crate) fn next_ip_id(&self) -> u16 {
        self.ip_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Next diagnostics tunnel id. Process-unique and monotonic.
    pub(crate) fn next_tunnel_id(&self) -> u64 {
        self.tunnel_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bytes read from the virtual interface.
    pub fn ingress_bytes(&self) -> u64 {
        self.ingress_bytes.load(Ordering::Relaxed)
    }

    /// Bytes written to the virtual interface.
    pub fn egress_bytes(&self) -> u64 {
        self.egress_bytes.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            ingress_bytes: self.ingress_bytes.load(Ordering::Relaxed),
            egress_bytes: self.egress_bytes.load(Ordering::Relaxed),
            malformed_drops: self.malformed_drops.load(Ordering::Relaxed),
            other_protocol_drops: self.other_protocol_drops.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            duplicate_segments: self.duplicate_segments.load(Ordering::Relaxed),
            udp_flows_created: self.udp_flows_created.load(Ordering::Relaxed),
            udp_flows_evicted: self.udp_flows_evicted.load(Ordering::Relaxed),
            tcp_pipes_created: self.tcp_pipes_created.load(Ordering::Relaxed),
            tcp_resets: self.tcp_resets.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the relay counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStatsSnapshot {
    /// Bytes read from the virtual interface
    pub ingress_bytes: u64,
    /// Bytes written to the virtual interface
    pub egress_bytes: u64,
    /// Packets dropped because they failed to parse
    pub malformed_drops: u64,
    /// Packets of protocols other than TCP/UDP
    pub other_protocol_drops: u64,
    /// Packets dropped on a full queue
    pub queue_drops: u64,
    /// Payload-bearing segments suppressed as duplicates
    pub duplicate_segments: u64,
    /// UDP flows created
    pub udp_flows_created: u64,
    /// UDP flows evicted
    pub udp_flows_evicted: u64,
    /// TCP pipes created
    pub tcp_pipes_created: u64,
    /// RST segments emitted
    pub tcp_resets: u64,
}
