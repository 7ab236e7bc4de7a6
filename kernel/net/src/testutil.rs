//! Test fixtures: a capturing device, scripted resolver and clock, and a
//! harness that plays the remote peer on 10.0.0.2.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use spin::Mutex;

use crate::buffer::PacketBuffer;
use crate::config::StackConfig;
use crate::device::{AddressResolver, Clock, NetDevice, Resolution, TxError};
use crate::ethernet::{parse_ethernet, EthAddr, EthHeader, ETHERTYPE_IPV4, ETH_HEADER_LEN};
use crate::iface::{IfaceFlags, IfaceId, Interface};
use crate::ipv4::{parse_ipv4, Ipv4Addr, Ipv4Header, SocketAddrV4, IPV4_HEADER_LEN};
use crate::lockdep::LockToken;
use crate::stack::{NetStack, ProcessResult};
use crate::tcp::{
    build_tcp_segment, parse_tcp_segment, verify_tcp_checksum, TcpHeader, TcpStats,
    TCP_FLAG_ACK, TCP_FLAG_PSH, TCP_FLAG_SYN,
};
use crate::tcp_cb::TcpControlBlock;
use crate::tcp_output::TcpEnv;
use crate::tcp_socket::TcpSocket;
use crate::udp::build_udp_datagram;

pub const LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const PEER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const LOCAL_MAC: EthAddr = EthAddr([2, 0, 0, 0, 0, 1]);
pub const PEER_MAC: EthAddr = EthAddr([2, 0, 0, 0, 0, 2]);

/// Sequence number the scripted peer starts from.
pub const PEER_ISS: u32 = 0x1000_0000;
/// MSS the scripted peer announces.
pub const PEER_MSS: u16 = 100;
/// Window the scripted peer advertises.
pub const PEER_WINDOW: u16 = 8192;

// ============================================================================
// Devices and Platform Services
// ============================================================================

/// "eth0": records every transmitted frame.
pub struct Capture {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl Capture {
    pub fn new() -> Self {
        Capture {
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.frames.lock())
    }
}

impl NetDevice for Capture {
    fn name(&self) -> &str {
        "eth0"
    }

    fn mac_address(&self) -> EthAddr {
        LOCAL_MAC
    }

    fn transmit(&self, frame: PacketBuffer) -> Result<(), TxError> {
        self.frames.lock().push(frame.payload().to_vec());
        Ok(())
    }
}

/// Resolver that answers whatever the test last set.
pub struct ManualResolver {
    answer: Mutex<Resolution>,
}

impl ManualResolver {
    pub fn hit(mac: EthAddr) -> Self {
        ManualResolver {
            answer: Mutex::new(Resolution::Hit(mac)),
        }
    }

    pub fn pending() -> Self {
        ManualResolver {
            answer: Mutex::new(Resolution::Pending),
        }
    }

    pub fn set(&self, answer: Resolution) {
        *self.answer.lock() = answer;
    }
}

impl Default for ManualResolver {
    fn default() -> Self {
        Self::hit(PEER_MAC)
    }
}

impl AddressResolver for ManualResolver {
    fn resolve(&self, _iface: &Interface, _next_hop: Ipv4Addr) -> Resolution {
        *self.answer.lock()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now_us: AtomicU64::new(1_000_000),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_us.fetch_add(ms * 1000, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Segments
// ============================================================================

/// A TCP segment the stack transmitted.
#[derive(Debug, Clone)]
pub struct CapturedSegment {
    pub header: TcpHeader,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl CapturedSegment {
    /// Peer segment travelling back on the same port pair.
    pub fn reply(&self, seq: u32, ack: u32, flags: u8, window: u16, payload: &[u8]) -> PeerSegment {
        Harness::peer_segment(
            self.header.dst_port,
            self.header.src_port,
            seq,
            ack,
            flags,
            window,
            payload,
        )
    }
}

/// A TCP segment to inject as if sent by the peer.
#[derive(Debug, Clone)]
pub struct PeerSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

/// The remote end of an established connection.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub port: u16,
    pub local_port: u16,
    next_seq: u32,
    ack: u32,
}

impl Peer {
    /// Sequence number the stack expects from the peer next.
    pub fn rcv_nxt(&self) -> u32 {
        self.next_seq
    }

    /// Acknowledge `ack`, optionally carrying data at `rcv_nxt`.
    pub fn ack(&self, ack: u32, payload: &[u8]) -> PeerSegment {
        let flags = if payload.is_empty() {
            TCP_FLAG_ACK
        } else {
            TCP_FLAG_ACK | TCP_FLAG_PSH
        };
        self.build(self.next_seq, ack, flags, PEER_WINDOW, payload)
    }

    /// Data at an arbitrary sequence number.
    pub fn data_at(&self, seq: u32, payload: &[u8]) -> PeerSegment {
        self.build(seq, self.ack, TCP_FLAG_ACK | TCP_FLAG_PSH, PEER_WINDOW, payload)
    }

    pub fn segment(&self, seq: u32, flags: u8, payload: &[u8]) -> PeerSegment {
        self.build(seq, self.ack, flags, PEER_WINDOW, payload)
    }

    pub fn segment_acking(&self, seq: u32, ack: u32, flags: u8) -> PeerSegment {
        self.build(seq, ack, flags, PEER_WINDOW, &[])
    }

    /// Pure ACK advertising `window`.
    pub fn window_update(&self, window: u16) -> PeerSegment {
        self.build(self.next_seq, self.ack, TCP_FLAG_ACK, window, &[])
    }

    fn build(&self, seq: u32, ack: u32, flags: u8, window: u16, payload: &[u8]) -> PeerSegment {
        Harness::peer_segment(self.port, self.local_port, seq, ack, flags, window, payload)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A stack with "eth0" at 10.0.0.1/24 and a direct route for 10.0.0.0/24.
pub struct Harness {
    pub stack: Arc<NetStack>,
    pub capture: Arc<Capture>,
    pub clock: Arc<ManualClock>,
    ident: AtomicU16,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(ManualResolver::default()))
    }

    pub fn with_resolver(resolver: Arc<ManualResolver>) -> Self {
        let clock = Arc::new(ManualClock::new());
        let capture = Arc::new(Capture::new());
        let stack = NetStack::new(StackConfig::default(), resolver, clock.clone());
        stack
            .add_interface("eth0", capture.clone(), IfaceFlags::UP)
            .unwrap();
        stack
            .set_interface_address("eth0", LOCAL_ADDR, NETMASK)
            .unwrap();
        stack
            .add_route(LOCAL_ADDR.mask(NETMASK), NETMASK, None, "eth0")
            .unwrap();
        Harness {
            stack,
            capture,
            clock,
            ident: AtomicU16::new(1),
        }
    }

    pub fn config(&self) -> StackConfig {
        *self.stack.config()
    }

    pub(crate) fn env(&self) -> TcpEnv<'_> {
        self.stack.tcp.env(&self.stack.ip)
    }

    /// Unregistered control block for 10.0.0.1:1234 <-> 10.0.0.2:80.
    pub fn control_block(&self) -> TcpControlBlock {
        let mut tcb = TcpControlBlock::new(self.stack.config());
        tcb.local = SocketAddrV4::new(LOCAL_ADDR, 1234);
        tcb.remote = SocketAddrV4::new(PEER_ADDR, 80);
        tcb
    }

    // ------------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------------

    /// Flush the transmit queue and decode every TCP segment sent.
    /// Other frames are discarded.
    pub fn drain_tcp(&self) -> Vec<CapturedSegment> {
        self.stack.run_tx_queue();
        let mut segments = Vec::new();
        for frame in self.capture.take() {
            let (eth, packet) = parse_ethernet(&frame).unwrap();
            if eth.ethertype != ETHERTYPE_IPV4 {
                continue;
            }
            let (ip, body) = parse_ipv4(packet).unwrap();
            if ip.protocol != crate::tcp::TCP_PROTO {
                continue;
            }
            assert!(verify_tcp_checksum(ip.src, ip.dst, body), "bad TCP checksum");
            let seg = parse_tcp_segment(body).unwrap();
            segments.push(CapturedSegment {
                header: seg.header,
                mss: seg.mss,
                payload: seg.payload.to_vec(),
            });
        }
        segments
    }

    /// `drain_tcp`, asserting the number of segments.
    pub fn expect_tcp(&self, n: usize) -> Vec<CapturedSegment> {
        let segs = self.drain_tcp();
        assert_eq!(segs.len(), n, "segments: {:?}", segs);
        segs
    }

    // ------------------------------------------------------------------------
    // Injection
    // ------------------------------------------------------------------------

    pub fn peer_segment(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        payload: &[u8],
    ) -> PeerSegment {
        PeerSegment {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            mss: None,
            payload: payload.to_vec(),
        }
    }

    /// Deliver an IPv4 datagram from the peer to 10.0.0.1 on eth0.
    pub fn inject_ipv4(&self, protocol: u8, payload: &[u8]) -> ProcessResult {
        let header = Ipv4Header {
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload.len()) as u16,
            identification: self.ident.fetch_add(1, Ordering::Relaxed),
            flags_fragment: 0,
            ttl: 64,
            protocol,
            src: PEER_ADDR,
            dst: LOCAL_ADDR,
        };
        let mut frame = alloc::vec![0u8; ETH_HEADER_LEN];
        EthHeader {
            dst: LOCAL_MAC,
            src: PEER_MAC,
            ethertype: ETHERTYPE_IPV4,
        }
        .write(&mut frame);
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        self.stack.receive(IfaceId(0), &frame)
    }

    pub fn inject_tcp(&self, seg: &PeerSegment) -> ProcessResult {
        let header = TcpHeader::new(
            seg.src_port,
            seg.dst_port,
            seg.seq,
            seg.ack,
            seg.flags,
            seg.window,
        );
        let buf = build_tcp_segment(PEER_ADDR, LOCAL_ADDR, &header, seg.mss, &[&seg.payload])
            .unwrap();
        self.inject_ipv4(crate::tcp::TCP_PROTO, buf.payload())
    }

    pub fn inject_udp(&self, src_port: u16, dst_port: u16, payload: &[u8]) -> ProcessResult {
        let buf = build_udp_datagram(PEER_ADDR, LOCAL_ADDR, src_port, dst_port, payload).unwrap();
        self.inject_ipv4(crate::udp::UDP_PROTO, buf.payload())
    }

    // ------------------------------------------------------------------------
    // Sockets
    // ------------------------------------------------------------------------

    /// Start an active open; the SYN is left in the capture.
    pub fn connect_tcp(&self, ip: Ipv4Addr, port: u16) -> TcpSocket {
        let sock = self.stack.tcp_socket();
        assert!(matches!(
            sock.connect(SocketAddrV4::new(ip, port)),
            Err(crate::socket::SocketError::WouldBlock)
        ));
        sock
    }

    pub fn listen_tcp(&self, port: u16, backlog: usize) -> TcpSocket {
        let sock = self.stack.tcp_socket();
        sock.bind(SocketAddrV4::new(LOCAL_ADDR, port)).unwrap();
        sock.listen(backlog).unwrap();
        sock
    }

    /// Complete a handshake with a peer announcing MSS 100 and an 8 KiB
    /// window. The final ACK is drained.
    pub fn established_tcp(&self, peer_port: u16) -> (TcpSocket, Peer) {
        let sock = self.connect_tcp(PEER_ADDR, peer_port);
        let syn = self.expect_tcp(1).remove(0);
        let ack = syn.header.seq_num.wrapping_add(1);

        let mut synack = syn.reply(PEER_ISS, ack, TCP_FLAG_SYN | TCP_FLAG_ACK, PEER_WINDOW, &[]);
        synack.mss = Some(PEER_MSS);
        self.inject_tcp(&synack);
        self.expect_tcp(1);

        let peer = Peer {
            port: peer_port,
            local_port: syn.header.src_port,
            next_seq: PEER_ISS.wrapping_add(1),
            ack,
        };
        (sock, peer)
    }

    pub fn with_tcb<R>(&self, sock: &TcpSocket, f: impl FnOnce(&mut TcpControlBlock) -> R) -> R {
        let mut token = LockToken::root();
        let mut tcb = sock.connection().tcb.lock(&mut token);
        f(&mut *tcb)
    }

    /// Registered TCP connections, listeners included.
    pub fn registered(&self) -> usize {
        self.stack.tcp.connections()
    }

    pub fn tick_tcp(&self) {
        self.stack.tcp_tick();
    }

    pub fn tcp_stats_retransmissions(&self) -> u64 {
        TcpStats::get(&self.stack.tcp_stats().retransmissions)
    }
}
