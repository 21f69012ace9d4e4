//! Packet model
//!
//! A [`Packet`] is an owned byte region paired with the decoded IPv4 header
//! and, for TCP/UDP, the decoded transport header. Header views are
//! read-only once parsed; reply packets are always built fresh by the
//! builders in [`codec`].

pub mod codec;

use std::net::SocketAddrV4;

use etherparse::{IpNumber, Ipv4Header, TcpHeader, UdpHeader};

use crate::error::PacketError;

/// Decoded transport header of a parsed packet.
#[derive(Debug, Clone)]
pub enum Transport {
    /// TCP segment
    Tcp(TcpHeader),
    /// UDP datagram
    Udp(UdpHeader),
    /// Any other IP protocol; carries the raw protocol number
    Other(u8),
}

/// An owned IPv4 packet with decoded header views.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Vec<u8>,
    ip: Ipv4Header,
    transport: Transport,
    payload_off: usize,
}

impl Packet {
    /// Parse one IPv4 packet from `buf`, copying it into owned storage.
    ///
    /// The slice must hold exactly one packet (the virtual interface
    /// preserves datagram boundaries, so one read yields one packet).
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] for non-IPv4 input, fragments, or headers the
    /// codec rejects. Packets of transport protocols other than TCP/UDP
    /// parse successfully with [`Transport::Other`] so the caller can count
    /// them before discarding.
    pub fn parse(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.is_empty() {
            return Err(PacketError::Truncated { len: 0 });
        }
        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let (ip, ip_rest) =
            Ipv4Header::from_slice(buf).map_err(|e| PacketError::Malformed(e.to_string()))?;

        if ip.is_fragmenting_payload() {
            return Err(PacketError::Fragmented);
        }

        let (transport, payload_len) = match ip.protocol {
            IpNumber::TCP => {
                let (tcp, payload) = TcpHeader::from_slice(ip_rest)
                    .map_err(|e| PacketError::Malformed(e.to_string()))?;
                (Transport::Tcp(tcp), payload.len())
            }
            IpNumber::UDP => {
                let (udp, payload) = UdpHeader::from_slice(ip_rest)
                    .map_err(|e| PacketError::Malformed(e.to_string()))?;
                (Transport::Udp(udp), payload.len())
            }
            other => (Transport::Other(other.0), 0),
        };

        Ok(Packet {
            data: buf.to_vec(),
            payload_off: buf.len() - payload_len,
            ip,
            transport,
        })
    }

    /// Device-side endpoint: IPv4 source address plus transport source port.
    pub fn source(&self) -> SocketAddrV4 {
        let port = match &self.transport {
            Transport::Tcp(tcp) => tcp.source_port,
            Transport::Udp(udp) => udp.source_port,
            Transport::Other(_) => 0,
        };
        SocketAddrV4::new(self.ip.source.into(), port)
    }

    /// Targeted endpoint: IPv4 destination address plus transport
    /// destination port.
    pub fn destination(&self) -> SocketAddrV4 {
        let port = match &self.transport {
            Transport::Tcp(tcp) => tcp.destination_port,
            Transport::Udp(udp) => udp.destination_port,
            Transport::Other(_) => 0,
        };
        SocketAddrV4::new(self.ip.destination.into(), port)
    }

    /// Decoded IPv4 header.
    pub fn ip(&self) -> &Ipv4Header {
        &self.ip
    }

    /// Decoded transport header.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// TCP header, if this is a TCP segment.
    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    /// UDP header, if this is a UDP datagram.
    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            Transport::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    /// Trailing payload after all headers.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_off..]
    }

    /// Total packet length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet has zero length (never true for parsed packets).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
