//! Reply packet construction
//!
//! Builders fill a caller-provided buffer with a complete IPv4+TCP or
//! IPv4+UDP packet, checksums included, so hot paths reuse their own
//! allocation. Header sizes and TCP flag bits are exported for callers that
//! size buffers or dispatch on flags.

use std::net::SocketAddrV4;

use etherparse::{IpNumber, Ipv4Header, TcpHeader, UdpHeader};

use crate::error::PacketError;

/// IPv4 header size without options.
pub const IP4_HEADER_SIZE: usize = 20;

/// UDP header size.
pub const UDP_HEADER_SIZE: usize = 8;

/// TCP header size without options.
pub const TCP_HEADER_SIZE: usize = 20;

/// Time-to-live on synthesized packets.
const REPLY_TTL: u8 = 64;

/// Advertised receive window on synthesized segments. The engine does not
/// track the device's consumption, so it advertises a full static window.
const REPLY_WINDOW: u16 = u16::MAX;

/// TCP flag bit values, as found in the low byte of the header flags field.
pub struct TcpFlags;

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// Flag bits of a decoded TCP header.
pub fn flags_of(tcp: &TcpHeader) -> u8 {
    let mut flags = 0;
    if tcp.fin {
        flags |= TcpFlags::FIN;
    }
    if tcp.syn {
        flags |= TcpFlags::SYN;
    }
    if tcp.rst {
        flags |= TcpFlags::RST;
    }
    if tcp.psh {
        flags |= TcpFlags::PSH;
    }
    if tcp.ack {
        flags |= TcpFlags::ACK;
    }
    flags
}

/// Build a complete IPv4+UDP packet into `out`.
///
/// `out` is cleared first; on return it holds exactly one packet. The IP
/// identification is taken from `ip_id` so the caller can keep the
/// process-wide monotonic counter.
///
/// # Errors
///
/// Returns [`PacketError::Build`] if the payload exceeds what the headers
/// can describe.
pub fn build_udp_packet(
    out: &mut Vec<u8>,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    ip_id: u16,
    payload: &[u8],
) -> Result<(), PacketError> {
    out.clear();
    out.reserve(IP4_HEADER_SIZE + UDP_HEADER_SIZE + payload.len());

    let payload_len = u16::try_from(UDP_HEADER_SIZE + payload.len())
        .map_err(|_| PacketError::Build("payload too large for IPv4".into()))?;
    let mut ip = Ipv4Header::new(
        payload_len,
        REPLY_TTL,
        IpNumber::UDP,
        src.ip().octets(),
        dst.ip().octets(),
    )
    .map_err(|e| PacketError::Build(e.to_string()))?;
    ip.identification = ip_id;

    let udp = UdpHeader::with_ipv4_checksum(src.port(), dst.port(), &ip, payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;

    ip.write(out)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    udp.write(out)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    out.extend_from_slice(payload);
    Ok(())
}

/// Build a complete IPv4+TCP packet into `out`.
///
/// `flags` is a combination of [`TcpFlags`] bits; PSH is set implicitly on
/// data-bearing segments. Sequence and acknowledgement numbers are written
/// verbatim.
///
/// # Errors
///
/// Returns [`PacketError::Build`] if the payload exceeds what the headers
/// can describe.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_packet(
    out: &mut Vec<u8>,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    flags: u8,
    seq: u32,
    ack: u32,
    ip_id: u16,
    payload: &[u8],
) -> Result<(), PacketError> {
    out.clear();
    out.reserve(IP4_HEADER_SIZE + TCP_HEADER_SIZE + payload.len());

    let payload_len = u16::try_from(TCP_HEADER_SIZE + payload.len())
        .map_err(|_| PacketError::Build("payload too large for IPv4".into()))?;
    let mut ip = Ipv4Header::new(
        payload_len,
        REPLY_TTL,
        IpNumber::TCP,
        src.ip().octets(),
        dst.ip().octets(),
    )
    .map_err(|e| PacketError::Build(e.to_string()))?;
    ip.identification = ip_id;

    let mut tcp = TcpHeader::new(src.port(), dst.port(), seq, REPLY_WINDOW);
    tcp.acknowledgment_number = ack;
    tcp.fin = flags & TcpFlags::FIN != 0;
    tcp.syn = flags & TcpFlags::SYN != 0;
    tcp.rst = flags & TcpFlags::RST != 0;
    tcp.ack = flags & TcpFlags::ACK != 0;
    tcp.psh = flags & TcpFlags::PSH != 0 || !payload.is_empty();
    tcp.checksum = tcp
        .calc_checksum_ipv4(&ip, payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;

    ip.write(out)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    tcp.write(out)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    out.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use std::net::Ipv4Addr;

    fn addr(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    #[test]
    fn test_udp_packet_fields() {
        let mut buf = Vec::new();
        build_udp_packet(
            &mut buf,
            addr([8, 8, 8, 8], 53),
            addr([10, 0, 0, 2], 40000),
            42,
            &[0xCC, 0xDD],
        )
        .unwrap();

        assert_eq!(buf.len(), IP4_HEADER_SIZE + UDP_HEADER_SIZE + 2);

        // Re-parse and verify the packet describes itself correctly
        let pkt = Packet::parse(&buf).unwrap();
        assert_eq!(pkt.source(), addr([8, 8, 8, 8], 53));
        assert_eq!(pkt.destination(), addr([10, 0, 0, 2], 40000));
        assert_eq!(pkt.ip().identification, 42);
        assert_eq!(pkt.payload(), &[0xCC, 0xDD]);

        let udp = pkt.udp().unwrap();
        let expected = udp
            .calc_checksum_ipv4(pkt.ip(), pkt.payload())
            .unwrap();
        assert_eq!(udp.checksum, expected);
    }

    #[test]
    fn test_tcp_packet_flags_and_numbers() {
        let mut buf = Vec::new();
        build_tcp_packet(
            &mut buf,
            addr([93, 184, 216, 34], 80),
            addr([10, 0, 0, 2], 43210),
            TcpFlags::SYN | TcpFlags::ACK,
            1,
            1001,
            3,
            &[],
        )
        .unwrap();

        let pkt = Packet::parse(&buf).unwrap();
        let tcp = pkt.tcp().unwrap();
        assert!(tcp.syn);
        assert!(tcp.ack);
        assert!(!tcp.fin);
        assert!(!tcp.rst);
        assert_eq!(tcp.sequence_number, 1);
        assert_eq!(tcp.acknowledgment_number, 1001);
        assert_eq!(flags_of(tcp), TcpFlags::SYN | TcpFlags::ACK);

        let expected = tcp
            .calc_checksum_ipv4(pkt.ip(), pkt.payload())
            .unwrap();
        assert_eq!(tcp.checksum, expected);
    }

    #[test]
    fn test_tcp_data_segment_sets_psh() {
        let mut buf = Vec::new();
        build_tcp_packet(
            &mut buf,
            addr([1, 2, 3, 4], 443),
            addr([10, 0, 0, 2], 50000),
            TcpFlags::ACK,
            7,
            99,
            0,
            b"hello",
        )
        .unwrap();

        let pkt = Packet::parse(&buf).unwrap();
        let tcp = pkt.tcp().unwrap();
        assert!(tcp.psh);
        assert_eq!(pkt.payload(), b"hello");
    }

    #[test]
    fn test_buffer_is_reused() {
        let mut buf = Vec::new();
        build_udp_packet(
            &mut buf,
            addr([1, 1, 1, 1], 53),
            addr([10, 0, 0, 2], 40000),
            0,
            &[0u8; 64],
        )
        .unwrap();
        let first_len = buf.len();

        // Second build clears the old content instead of appending
        build_udp_packet(
            &mut buf,
            addr([1, 1, 1, 1], 53),
            addr([10, 0, 0, 2], 40000),
            1,
            &[0u8; 8],
        )
        .unwrap();
        assert!(buf.len() < first_len);
        assert!(Packet::parse(&buf).is_ok());
    }
}
