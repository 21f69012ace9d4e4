//! tun-relay: userspace TUN-to-socket relay engine
//!
//! This crate reads raw IPv4 packets from a virtual network interface,
//! terminates TCP and UDP flows as if it were the remote peer, forwards the
//! payloads over real operating-system sockets to the true destinations,
//! and synthesizes reply packets back into the interface. It is the engine
//! behind a system-level VPN facility that intercepts all outbound traffic
//! of a device.
//!
//! # Architecture
//!
//! ```text
//! device → virtual interface → Ingress Reader ─┬→ UDP ingress → UDP Relay → upstream sockets
//!                                              └→ TCP ingress → TCP Relay → upstream sockets
//!                                                                   │              │
//! device ← virtual interface ← Egress Writer ←──── egress queue ←───┴──── replies ─┘
//! ```
//!
//! Five dedicated worker threads connected by bounded queues; each relay
//! multiplexes its upstream sockets on a private readiness selector. The
//! queues are the only cross-thread objects: enqueues are non-blocking and
//! drop on overflow (IP already assumes loss), dequeues block.
//!
//! The engine is a best-effort forwarder. It is not a conformant TCP
//! implementation, keeps no state across restarts, and guarantees delivery
//! only to the extent the upstream socket does.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tun_relay::{Engine, NoProtect, TunDevice};
//!
//! # fn example(tun_fd: std::os::unix::io::RawFd) -> Result<(), tun_relay::RelayError> {
//! // The embedder acquires the virtual-interface descriptor and the
//! // platform's socket-protect capability.
//! let tun = TunDevice::new(tun_fd);
//! let engine = Engine::start(tun, Arc::new(NoProtect))?;
//!
//! // ... traffic relays until ...
//! engine.stop();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`engine`]: engine lifecycle and worker wiring
//! - [`relay`]: UDP and TCP flow relays, flow keys, statistics
//! - [`packet`]: packet model and reply builders
//! - [`io`]: virtual-interface wrapper and bounded queues
//! - [`protect`]: the socket-protect capability seam
//! - [`config`]: engine tuning parameters
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod packet;
pub mod protect;
pub mod relay;

// Re-export commonly used types at the crate root
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{PacketError, RelayError};
pub use io::TunDevice;
pub use packet::{Packet, Transport};
pub use protect::{NoProtect, SocketProtector};
pub use relay::{FlowKey, RelayStats, RelayStatsSnapshot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
