//! End-to-end relay tests
//!
//! An AF_UNIX datagram socketpair stands in for the virtual interface (it
//! preserves packet boundaries exactly like TUN): the test plays the device
//! on one end, the engine owns the other. Upstreams are real loopback
//! sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tun_relay::packet::codec::{self, TcpFlags};
use tun_relay::{Engine, NoProtect, Packet, TunDevice};

const DEVICE_IP: [u8; 4] = [10, 0, 0, 2];

/// The device side of the fake virtual interface.
struct DeviceEnd {
    tun: TunDevice,
}

impl DeviceEnd {
    fn send(&self, packet: &[u8]) {
        assert_eq!(self.tun.write(packet).unwrap(), packet.len());
    }

    fn send_tcp(&self, src: SocketAddrV4, dst: SocketAddrV4, flags: u8, seq: u32, ack: u32, payload: &[u8]) {
        let mut buf = Vec::new();
        codec::build_tcp_packet(&mut buf, src, dst, flags, seq, ack, 0, payload).unwrap();
        self.send(&buf);
    }

    /// Next packet injected back into the device, within `timeout`.
    fn recv(&self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if self.tun.wait_readable(remaining).unwrap() {
                let n = self.tun.read(&mut buf).unwrap();
                return Some(Packet::parse(&buf[..n]).unwrap());
            }
        }
    }

    fn expect_none(&self, timeout: Duration) {
        if let Some(packet) = self.recv(timeout) {
            panic!("unexpected egress packet: {:?}", packet.transport());
        }
    }
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn start_engine() -> (Engine, DeviceEnd) {
    init_tracing();
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair failed");

    let engine = Engine::start(TunDevice::new(fds[1]), Arc::new(NoProtect)).unwrap();
    let device = DeviceEnd {
        tun: TunDevice::new(fds[0]),
    };
    (engine, device)
}

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected IPv4 address"),
    }
}

const LONG: Duration = Duration::from_secs(5);
const SHORT: Duration = Duration::from_millis(300);

#[test]
fn udp_echo_round_trip() {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server
        .set_read_timeout(Some(LONG))
        .unwrap();
    let server_addr = v4(server.local_addr().unwrap());

    let (engine, device) = start_engine();
    let device_addr = SocketAddrV4::new(DEVICE_IP.into(), 40000);

    let mut out = Vec::new();
    codec::build_udp_packet(&mut out, device_addr, server_addr, 0, &[0xAA, 0xBB]).unwrap();
    device.send(&out);

    // The datagram arrives upstream unchanged
    let mut buf = [0u8; 64];
    let (n, peer) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0xAA, 0xBB]);

    // Upstream echoes something different
    server.send_to(&[0xCC, 0xDD], peer).unwrap();

    let reply = device.recv(LONG).expect("expected UDP reply");
    assert_eq!(reply.source(), server_addr);
    assert_eq!(reply.destination(), device_addr);
    assert_eq!(reply.payload(), &[0xCC, 0xDD]);
    let first_id = reply.ip().identification;

    // A second exchange carries the next IP identification
    device.send(&out);
    let (_, peer) = server.recv_from(&mut buf).unwrap();
    server.send_to(&[0xEE], peer).unwrap();

    let reply = device.recv(LONG).expect("expected second UDP reply");
    assert_eq!(reply.payload(), &[0xEE]);
    assert_eq!(reply.ip().identification, first_id.wrapping_add(1));

    let snapshot = engine.stats();
    assert!(snapshot.ingress_bytes > 0);
    assert!(snapshot.egress_bytes > 0);
    assert_eq!(snapshot.udp_flows_created, 1);

    engine.stop();
}

#[test]
fn tcp_full_conversation() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = v4(listener.local_addr().unwrap());

    let (engine, device) = start_engine();
    let device_addr = SocketAddrV4::new(DEVICE_IP.into(), 43210);

    // --- handshake ---
    device.send_tcp(device_addr, server_addr, TcpFlags::SYN, 1000, 0, &[]);

    let syn_ack = device.recv(LONG).expect("expected SYN+ACK");
    let tcp = syn_ack.tcp().expect("expected TCP reply").clone();
    assert_eq!(codec::flags_of(&tcp), TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(tcp.sequence_number, 1);
    assert_eq!(tcp.acknowledgment_number, 1001);
    assert_eq!(syn_ack.source(), server_addr);
    assert_eq!(syn_ack.destination(), device_addr);

    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 1001, 2, &[]);

    let (mut upstream, _) = listener.accept().unwrap();
    upstream.set_read_timeout(Some(LONG)).unwrap();

    // --- payload toward the upstream ---
    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 1001, 2, b"GET /");

    let mut buf = [0u8; 16];
    let n = upstream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"GET /");

    let ack = device.recv(LONG).expect("expected ACK for payload");
    let tcp = ack.tcp().unwrap().clone();
    assert_eq!(codec::flags_of(&tcp), TcpFlags::ACK);
    assert!(ack.payload().is_empty());
    // The SYN consumed one sequence number
    assert_eq!(tcp.sequence_number, 2);
    assert_eq!(tcp.acknowledgment_number, 1006);

    // --- duplicate segment: no upstream write, no egress ---
    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 1001, 2, b"GET /");
    device.expect_none(SHORT);
    upstream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    assert!(upstream.read(&mut buf).is_err(), "duplicate must not reach upstream");
    upstream.set_read_timeout(Some(LONG)).unwrap();

    // --- payload toward the device ---
    upstream.write_all(b"pong").unwrap();

    let data = device.recv(LONG).expect("expected data segment");
    let tcp = data.tcp().unwrap().clone();
    assert!(tcp.ack);
    assert_eq!(data.payload(), b"pong");
    assert_eq!(tcp.sequence_number, 2);
    assert_eq!(tcp.acknowledgment_number, 1006);

    // --- upstream EOF becomes FIN+ACK ---
    drop(upstream);

    let fin = device.recv(LONG).expect("expected FIN+ACK");
    let tcp = fin.tcp().unwrap().clone();
    assert!(tcp.fin && tcp.ack);
    // The data segment consumed four sequence numbers
    assert_eq!(tcp.sequence_number, 6);
    assert_eq!(tcp.acknowledgment_number, 1006);

    // --- device FIN completes the close ---
    device.send_tcp(device_addr, server_addr, TcpFlags::FIN | TcpFlags::ACK, 1006, 7, &[]);

    let last_ack = device.recv(LONG).expect("expected final ACK");
    let tcp = last_ack.tcp().unwrap().clone();
    assert!(tcp.ack && !tcp.fin);
    assert_eq!(tcp.acknowledgment_number, 1007);

    let snapshot = engine.stats();
    assert_eq!(snapshot.tcp_pipes_created, 1);
    assert_eq!(snapshot.duplicate_segments, 1);

    engine.stop();
}

#[test]
fn tcp_upstream_reset_purges_pipe() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = v4(listener.local_addr().unwrap());

    let (engine, device) = start_engine();
    let device_addr = SocketAddrV4::new(DEVICE_IP.into(), 50100);

    device.send_tcp(device_addr, server_addr, TcpFlags::SYN, 2000, 0, &[]);
    let syn_ack = device.recv(LONG).expect("expected SYN+ACK");
    assert!(syn_ack.tcp().unwrap().syn);

    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 2001, 2, &[]);
    let (mut upstream, _) = listener.accept().unwrap();
    upstream.set_read_timeout(Some(LONG)).unwrap();

    // One exchanged byte proves the upstream connect completed before the
    // abortive close below
    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 2001, 2, b"x");
    let mut buf = [0u8; 8];
    let n = upstream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"x");
    let ack = device.recv(LONG).expect("expected ACK");
    assert_eq!(ack.tcp().unwrap().acknowledgment_number, 2002);

    // Abortive close: linger(0) turns the drop into a RST toward the engine
    socket2::SockRef::from(&upstream)
        .set_linger(Some(Duration::from_secs(0)))
        .unwrap();
    drop(upstream);

    let rst = device.recv(LONG).expect("expected RST");
    let tcp = rst.tcp().unwrap().clone();
    assert!(tcp.rst, "expected RST, got flags {:#04x}", codec::flags_of(&tcp));

    // The same key builds a fresh pipe from scratch
    device.send_tcp(device_addr, server_addr, TcpFlags::SYN, 5000, 0, &[]);
    let syn_ack = device.recv(LONG).expect("expected SYN+ACK from fresh pipe");
    let tcp = syn_ack.tcp().unwrap().clone();
    assert_eq!(tcp.sequence_number, 1);
    assert_eq!(tcp.acknowledgment_number, 5001);

    let snapshot = engine.stats();
    assert_eq!(snapshot.tcp_resets, 1);
    assert_eq!(snapshot.tcp_pipes_created, 2);

    engine.stop();
}

#[test]
fn device_fin_then_upstream_eof_tears_down() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = v4(listener.local_addr().unwrap());

    let (engine, device) = start_engine();
    let device_addr = SocketAddrV4::new(DEVICE_IP.into(), 50300);

    device.send_tcp(device_addr, server_addr, TcpFlags::SYN, 4000, 0, &[]);
    let syn_ack = device.recv(LONG).expect("expected SYN+ACK");
    assert_eq!(syn_ack.tcp().unwrap().acknowledgment_number, 4001);
    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 4001, 2, &[]);

    let (mut upstream, _) = listener.accept().unwrap();
    upstream.set_read_timeout(Some(LONG)).unwrap();

    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 4001, 2, b"hi");
    let mut buf = [0u8; 8];
    let n = upstream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi");
    let ack = device.recv(LONG).expect("expected ACK");
    assert_eq!(ack.tcp().unwrap().acknowledgment_number, 4003);

    // Device closes first: the engine acknowledges and half-closes the
    // upstream write side
    device.send_tcp(device_addr, server_addr, TcpFlags::FIN | TcpFlags::ACK, 4003, 2, &[]);
    let fin_ack = device.recv(LONG).expect("expected ACK of FIN");
    let tcp = fin_ack.tcp().unwrap().clone();
    assert!(tcp.ack && !tcp.fin);
    assert_eq!(tcp.acknowledgment_number, 4004);

    // The upstream sees EOF on its read side, then closes its own end
    let n = upstream.read(&mut buf).unwrap();
    assert_eq!(n, 0);
    drop(upstream);

    // The upstream EOF still surfaces as FIN+ACK after the device's close
    let fin = device.recv(LONG).expect("expected FIN+ACK");
    let tcp = fin.tcp().unwrap().clone();
    assert!(tcp.fin && tcp.ack);
    assert_eq!(tcp.sequence_number, 2);
    assert_eq!(tcp.acknowledgment_number, 4004);

    // A fresh SYN on the same key builds a new pipe, proving the old one
    // was purged rather than leaked
    device.send_tcp(device_addr, server_addr, TcpFlags::SYN, 6000, 0, &[]);
    let syn_ack = device.recv(LONG).expect("expected SYN+ACK from fresh pipe");
    assert_eq!(syn_ack.tcp().unwrap().acknowledgment_number, 6001);
    assert_eq!(engine.stats().tcp_pipes_created, 2);

    engine.stop();
}

#[test]
fn syn_retransmission_is_idempotent() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = v4(listener.local_addr().unwrap());

    let (engine, device) = start_engine();
    let device_addr = SocketAddrV4::new(DEVICE_IP.into(), 50200);

    device.send_tcp(device_addr, server_addr, TcpFlags::SYN, 3000, 0, &[]);
    let first = device.recv(LONG).expect("expected SYN+ACK");
    assert_eq!(first.tcp().unwrap().sequence_number, 1);

    // A replayed SYN refreshes nothing visible and emits nothing
    device.send_tcp(device_addr, server_addr, TcpFlags::SYN, 3000, 0, &[]);
    device.expect_none(SHORT);

    // The handshake still completes normally afterwards
    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 3001, 2, &[]);
    let (mut upstream, _) = listener.accept().unwrap();
    upstream.set_read_timeout(Some(LONG)).unwrap();

    device.send_tcp(device_addr, server_addr, TcpFlags::ACK, 3001, 2, b"hi");
    let mut buf = [0u8; 8];
    let n = upstream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi");

    let ack = device.recv(LONG).expect("expected ACK");
    assert_eq!(ack.tcp().unwrap().acknowledgment_number, 3003);

    assert_eq!(engine.stats().tcp_pipes_created, 1);
    engine.stop();
}

#[test]
fn non_ip_traffic_is_counted_and_dropped() {
    let (engine, device) = start_engine();

    // Garbage and an IPv6-looking packet both vanish without replies
    device.send(&[0xFF, 0x00, 0x01]);
    device.send(&[0x60; 48]);
    device.expect_none(SHORT);

    let deadline = Instant::now() + LONG;
    loop {
        let snapshot = engine.stats();
        if snapshot.malformed_drops >= 2 {
            assert!(snapshot.ingress_bytes >= 51);
            break;
        }
        assert!(Instant::now() < deadline, "drops never counted");
        std::thread::sleep(Duration::from_millis(10));
    }

    engine.stop();
}
