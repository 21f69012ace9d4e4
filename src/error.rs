//! Error types for tun-relay
//!
//! Errors are split by subsystem: fatal engine-level failures that are
//! surfaced to the caller of [`Engine::start`](crate::Engine::start), and
//! packet codec failures that the workers swallow (a malformed packet is
//! dropped, never propagated).

use std::io;

use thiserror::Error;

/// Top-level error type for the relay engine.
///
/// Only startup and teardown produce these; running workers never propagate
/// errors out of their loops. They log the cause and either purge the
/// affected flow or end their own loop.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A readiness selector could not be created at engine start
    #[error("failed to open selector: {0}")]
    Selector(io::Error),

    /// The virtual interface descriptor was unusable at engine start
    #[error("virtual interface error: {0}")]
    VirtualInterface(io::Error),

    /// A worker thread could not be spawned
    #[error("failed to spawn worker '{name}': {source}")]
    WorkerSpawn {
        name: &'static str,
        source: io::Error,
    },

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Packet codec errors.
///
/// Produced when parsing device packets or building reply packets. The
/// ingress reader counts these and drops the packet; builders treat them as
/// per-flow failures.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Buffer too short to hold the claimed headers
    #[error("truncated packet: {len} bytes")]
    Truncated { len: usize },

    /// Not an IPv4 packet
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// Fragmented IPv4 packets are not reassembled
    #[error("fragmented packet")]
    Fragmented,

    /// Header decode failure from the codec
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Reply construction failure (oversized payload, bad value)
    #[error("failed to build packet: {0}")]
    Build(String),
}
