//! Flow relays
//!
//! The two relay subsystems terminate device-side flows and forward their
//! payloads over real sockets: [`udp`] keeps a per-flow datagram socket,
//! [`tcp`] runs a simplified termination state machine per pipe.

pub(crate) mod tcp;
pub(crate) mod udp;

mod stats;

pub use stats::{RelayStats, RelayStatsSnapshot};

use std::fmt;
use std::net::SocketAddrV4;

use crate::packet::Packet;

/// Identifies a logical connection within the engine.
///
/// The source address is deliberately omitted: within the interface there is
/// only one source host, so `(destination, destination port, source port)`
/// is unique per protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Destination address and port the device targeted
    pub destination: SocketAddrV4,
    /// Device-side source port
    pub source_port: u16,
}

impl FlowKey {
    /// Flow key of a parsed packet.
    pub fn of(packet: &Packet) -> FlowKey {
        FlowKey {
            destination: packet.destination(),
            source_port: packet.source().port(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.destination, self.source_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::codec;
    use std::net::Ipv4Addr;

    fn addr(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    #[test]
    fn test_flow_key_ignores_source_address() {
        let mut buf = Vec::new();
        codec::build_udp_packet(&mut buf, addr([10, 0, 0, 2], 40000), addr([8, 8, 8, 8], 53), 0, b"x")
            .unwrap();
        let key1 = FlowKey::of(&Packet::parse(&buf).unwrap());

        codec::build_udp_packet(&mut buf, addr([10, 0, 0, 9], 40000), addr([8, 8, 8, 8], 53), 0, b"x")
            .unwrap();
        let key2 = FlowKey::of(&Packet::parse(&buf).unwrap());

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_flow_key_distinguishes_ports() {
        let a = FlowKey {
            destination: addr([8, 8, 8, 8], 53),
            source_port: 40000,
        };
        let b = FlowKey {
            destination: addr([8, 8, 8, 8], 53),
            source_port: 40001,
        };
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "8.8.8.8:53:40000");
    }
}
