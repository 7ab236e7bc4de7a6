//! UDP (User Datagram Protocol).
//!
//! RFC 768 header handling plus the datagram socket: a port table with
//! explicit and ephemeral binding, an optional default peer, and a bounded
//! receive queue per socket.
//!
//! # Packet Format (RFC 768)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |            Length             |           Checksum            |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                             Data                              |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! A zero checksum on receive means the sender did not compute one and the
//! datagram is accepted unchecked. A computed checksum of zero is sent as
//! 0xFFFF.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::buffer::PacketBuffer;
use crate::ipv4::{pseudo_header_checksum, Ipv4Addr, Ipv4Header, SocketAddrV4};
use crate::ip::IpTxParams;
use crate::socket::{PollMask, SocketError};
use crate::stack::NetStack;
use crate::wait::{SocketWaitHooks, WaitQueue};

// ============================================================================
// UDP Constants
// ============================================================================

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// UDP protocol number (for IPv4)
pub const UDP_PROTO: u8 = 17;

/// Maximum UDP payload size considering the IPv4 total length limit
/// (65535 - 20-byte IP header - 8-byte UDP header).
pub const UDP_MAX_PAYLOAD: usize = 65507;

/// Datagrams a socket queues before new arrivals are dropped
pub const UDP_RECV_QUEUE_LIMIT: usize = 64;

/// Maximum number of bound UDP sockets
pub const MAX_UDP_SOCKETS: usize = 256;

/// Ephemeral port range start (IANA recommendation)
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Ephemeral port range end
pub const EPHEMERAL_PORT_END: u16 = 65535;

// ============================================================================
// UDP Header
// ============================================================================

/// Parsed UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Total length (header + payload)
    pub length: u16,
    /// Checksum (0 means not computed)
    pub checksum: u16,
}

impl UdpHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }
}

// ============================================================================
// UDP Errors
// ============================================================================

/// Errors that can occur during UDP processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    /// Packet is too short (< 8 bytes)
    Truncated,
    /// Length field doesn't match actual data
    LengthMismatch,
    /// Checksum verification failed
    ChecksumInvalid,
    /// Payload larger than an IPv4 datagram can carry
    PayloadTooLarge,
    /// Source is broadcast/multicast (invalid)
    InvalidSource,
    /// Receiving socket's queue is full
    QueueFull,
}

// ============================================================================
// UDP Statistics
// ============================================================================

/// UDP protocol statistics
#[derive(Debug, Default)]
pub struct UdpStats {
    /// UDP packets received
    pub rx_packets: AtomicU64,
    /// UDP bytes received
    pub rx_bytes: AtomicU64,
    /// UDP packets sent
    pub tx_packets: AtomicU64,
    /// UDP bytes sent
    pub tx_bytes: AtomicU64,
    /// Packets dropped due to parse errors
    pub rx_errors: AtomicU64,
    /// Packets dropped - checksum invalid
    pub checksum_errors: AtomicU64,
    /// Packets dropped - no listener
    pub no_listener: AtomicU64,
    /// Packets dropped - receive queue full
    pub queue_overflows: AtomicU64,
}

impl UdpStats {
    pub const fn new() -> Self {
        UdpStats {
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            no_listener: AtomicU64::new(0),
            queue_overflows: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_rx_packets(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tx_packets(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// ============================================================================
// UDP Parsing
// ============================================================================

/// Parse a UDP header from raw bytes.
pub fn parse_udp_header(buf: &[u8]) -> Result<UdpHeader, UdpError> {
    if buf.len() < UDP_HEADER_LEN {
        return Err(UdpError::Truncated);
    }
    Ok(UdpHeader {
        src_port: u16::from_be_bytes([buf[0], buf[1]]),
        dst_port: u16::from_be_bytes([buf[2], buf[3]]),
        length: u16::from_be_bytes([buf[4], buf[5]]),
        checksum: u16::from_be_bytes([buf[6], buf[7]]),
    })
}

/// Parse and validate a complete UDP datagram.
///
/// # Arguments
///
/// * `data` - Raw UDP datagram bytes (IPv4 payload)
/// * `src_ip` - Source IPv4 address (for checksum)
/// * `dst_ip` - Destination IPv4 address (for checksum)
///
/// # Returns
///
/// `(header, payload)` on success. Bytes beyond the length field are
/// ignored.
pub fn parse_udp(
    data: &[u8],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
) -> Result<(UdpHeader, &[u8]), UdpError> {
    let header = parse_udp_header(data)?;

    let udp_len = header.length as usize;
    if udp_len < UDP_HEADER_LEN || udp_len > data.len() {
        return Err(UdpError::LengthMismatch);
    }
    if header.checksum != 0 && !verify_udp_checksum(src_ip, dst_ip, &data[..udp_len]) {
        return Err(UdpError::ChecksumInvalid);
    }
    if src_ip.is_broadcast() || src_ip.is_multicast() {
        return Err(UdpError::InvalidSource);
    }

    Ok((header, &data[UDP_HEADER_LEN..udp_len]))
}

// ============================================================================
// UDP Checksum
// ============================================================================

/// Compute the UDP checksum including the IPv4 pseudo-header.
pub fn compute_udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, udp_segment: &[u8]) -> u16 {
    pseudo_header_checksum(src_ip, dst_ip, UDP_PROTO, udp_segment)
}

/// Verify a UDP checksum; a valid segment sums to zero.
pub fn verify_udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, udp_segment: &[u8]) -> bool {
    compute_udp_checksum(src_ip, dst_ip, udp_segment) == 0
}

// ============================================================================
// UDP Serialization
// ============================================================================

/// Build a UDP datagram in a `PacketBuffer` with headroom for the IP and
/// link headers.
///
/// # Arguments
///
/// * `src_ip` / `dst_ip` - Pseudo-header addresses
/// * `src_port` / `dst_port` - Ports
/// * `payload` - Datagram payload
pub fn build_udp_datagram(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<PacketBuffer, UdpError> {
    if payload.len() > UDP_MAX_PAYLOAD {
        return Err(UdpError::PayloadTooLarge);
    }

    let udp_len = UDP_HEADER_LEN + payload.len();
    let header = UdpHeader {
        src_port,
        dst_port,
        length: udp_len as u16,
        checksum: 0,
    };
    let mut buf = PacketBuffer::for_payload(udp_len);
    buf.append_slice(&header.to_bytes())
        .map_err(|_| UdpError::PayloadTooLarge)?;
    buf.append_slice(payload)
        .map_err(|_| UdpError::PayloadTooLarge)?;

    let checksum = match compute_udp_checksum(src_ip, dst_ip, buf.payload()) {
        0 => 0xFFFF,
        c => c,
    };
    buf.payload_mut()[6..8].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

// ============================================================================
// Port Table
// ============================================================================

/// A received datagram waiting to be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub from: SocketAddrV4,
    pub data: Vec<u8>,
}

/// Receive side of one UDP socket.
pub(crate) struct UdpEndpoint {
    queue: Mutex<VecDeque<UdpDatagram>>,
    events: WaitQueue,
}

struct UdpBinding {
    local: SocketAddrV4,
    peer: Option<SocketAddrV4>,
    endpoint: Arc<UdpEndpoint>,
}

impl UdpBinding {
    /// Match strength for an arriving datagram, or `None` if it does not
    /// match at all.
    fn score(&self, dst: SocketAddrV4, src: SocketAddrV4) -> Option<u8> {
        if self.local.port != dst.port {
            return None;
        }
        let mut score = 0;
        if !self.local.ip.is_unspecified() {
            if self.local.ip != dst.ip {
                return None;
            }
            score += 1;
        }
        if let Some(peer) = self.peer {
            if peer != src {
                return None;
            }
            score += 2;
        }
        Some(score)
    }

    fn conflicts(&self, local: SocketAddrV4) -> bool {
        self.local.port == local.port
            && (self.local.ip.is_unspecified() || local.ip.is_unspecified() || self.local.ip == local.ip)
    }
}

struct TableInner {
    bindings: Vec<UdpBinding>,
    next_ephemeral: u16,
}

/// Bound UDP sockets.
pub(crate) struct UdpTable {
    inner: Mutex<TableInner>,
}

impl UdpTable {
    pub const fn new() -> Self {
        UdpTable {
            inner: Mutex::new(TableInner {
                bindings: Vec::new(),
                next_ephemeral: EPHEMERAL_PORT_START,
            }),
        }
    }

    /// Bind `endpoint` to `local`; port 0 picks an ephemeral port.
    fn bind(&self, endpoint: &Arc<UdpEndpoint>, local: SocketAddrV4) -> Result<SocketAddrV4, SocketError> {
        let mut inner = self.inner.lock();
        if inner.bindings.iter().any(|b| Arc::ptr_eq(&b.endpoint, endpoint)) {
            return Err(SocketError::InvalidArgument);
        }
        if inner.bindings.len() >= MAX_UDP_SOCKETS {
            log::warn!(target: "net::ip", "udp port table full");
            return Err(SocketError::ResourceExhausted);
        }

        let mut local = local;
        if local.port == 0 {
            let span = (EPHEMERAL_PORT_END - EPHEMERAL_PORT_START) as u32 + 1;
            let start = inner.next_ephemeral;
            let found = (0..span)
                .map(|i| {
                    EPHEMERAL_PORT_START
                        + ((start - EPHEMERAL_PORT_START) as u32 + i).rem_euclid(span) as u16
                })
                .find(|port| {
                    let probe = SocketAddrV4::new(local.ip, *port);
                    !inner.bindings.iter().any(|b| b.conflicts(probe))
                });
            let Some(port) = found else {
                return Err(SocketError::ResourceExhausted);
            };
            inner.next_ephemeral = if port == EPHEMERAL_PORT_END {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            local.port = port;
        } else if inner.bindings.iter().any(|b| b.conflicts(local)) {
            return Err(SocketError::AddressInUse);
        }

        inner.bindings.push(UdpBinding {
            local,
            peer: None,
            endpoint: endpoint.clone(),
        });
        Ok(local)
    }

    fn with_binding<R>(
        &self,
        endpoint: &Arc<UdpEndpoint>,
        f: impl FnOnce(&mut UdpBinding) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        inner
            .bindings
            .iter_mut()
            .find(|b| Arc::ptr_eq(&b.endpoint, endpoint))
            .map(f)
    }

    fn unbind(&self, endpoint: &Arc<UdpEndpoint>) {
        self.inner
            .lock()
            .bindings
            .retain(|b| !Arc::ptr_eq(&b.endpoint, endpoint));
    }

    /// Most specific socket for a datagram from `src` to `dst`.
    fn lookup(&self, dst: SocketAddrV4, src: SocketAddrV4) -> Option<Arc<UdpEndpoint>> {
        let inner = self.inner.lock();
        let mut best: Option<(u8, &UdpBinding)> = None;
        for binding in inner.bindings.iter() {
            if let Some(score) = binding.score(dst, src) {
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, binding));
                }
            }
        }
        best.map(|(_, b)| b.endpoint.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bindings.len()
    }
}

// ============================================================================
// UDP Layer
// ============================================================================

/// Result of processing a UDP datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpResult {
    /// Datagram was queued on a socket
    Delivered,
    /// No socket bound to the destination port
    NoListener,
    /// Datagram was dropped with error
    Dropped(UdpError),
}

/// Per-stack UDP state.
pub struct UdpLayer {
    pub(crate) table: UdpTable,
    pub(crate) stats: UdpStats,
    hooks: Option<Arc<dyn SocketWaitHooks>>,
}

impl UdpLayer {
    pub fn new(hooks: Option<Arc<dyn SocketWaitHooks>>) -> Self {
        UdpLayer {
            table: UdpTable::new(),
            stats: UdpStats::new(),
            hooks,
        }
    }

    pub fn stats(&self) -> &UdpStats {
        &self.stats
    }

    fn new_endpoint(&self) -> Arc<UdpEndpoint> {
        Arc::new(UdpEndpoint {
            queue: Mutex::new(VecDeque::new()),
            events: WaitQueue::new(self.hooks.clone()),
        })
    }

    /// Deliver an inbound datagram to the best matching socket.
    pub(crate) fn input(&self, ip_hdr: &Ipv4Header, data: &[u8]) -> UdpResult {
        let (hdr, payload) = match parse_udp(data, ip_hdr.src, ip_hdr.dst) {
            Ok(parsed) => parsed,
            Err(e) => {
                if e == UdpError::ChecksumInvalid {
                    UdpStats::inc(&self.stats.checksum_errors);
                } else {
                    UdpStats::inc(&self.stats.rx_errors);
                }
                return UdpResult::Dropped(e);
            }
        };

        let dst = SocketAddrV4::new(ip_hdr.dst, hdr.dst_port);
        let src = SocketAddrV4::new(ip_hdr.src, hdr.src_port);
        let Some(endpoint) = self.table.lookup(dst, src) else {
            UdpStats::inc(&self.stats.no_listener);
            return UdpResult::NoListener;
        };

        {
            let mut queue = endpoint.queue.lock();
            if queue.len() >= UDP_RECV_QUEUE_LIMIT {
                UdpStats::inc(&self.stats.queue_overflows);
                return UdpResult::Dropped(UdpError::QueueFull);
            }
            queue.push_back(UdpDatagram {
                from: src,
                data: payload.to_vec(),
            });
        }
        self.stats.inc_rx_packets(payload.len());
        endpoint.events.post();
        UdpResult::Delivered
    }
}

// ============================================================================
// Datagram Socket
// ============================================================================

/// A UDP socket handle. Dropping it unbinds the port.
pub struct UdpSocket {
    stack: Arc<NetStack>,
    endpoint: Arc<UdpEndpoint>,
}

impl UdpSocket {
    pub(crate) fn new(stack: Arc<NetStack>) -> Self {
        let endpoint = stack.udp.new_endpoint();
        UdpSocket { stack, endpoint }
    }

    /// Event queue posted when a datagram arrives.
    pub fn events(&self) -> &WaitQueue {
        &self.endpoint.events
    }

    fn binding(&self) -> Option<(SocketAddrV4, Option<SocketAddrV4>)> {
        self.stack
            .udp
            .table
            .with_binding(&self.endpoint, |b| (b.local, b.peer))
    }

    /// Bind to a local address. Port 0 picks an ephemeral port.
    pub fn bind(&self, local: SocketAddrV4) -> Result<(), SocketError> {
        if !local.ip.is_unspecified() && !self.stack.ip.ifaces.is_local(local.ip) {
            return Err(SocketError::AddressNotAvailable);
        }
        let bound = self.stack.udp.table.bind(&self.endpoint, local)?;
        log::trace!(target: "net::ip", "udp bound to {}", bound);
        Ok(())
    }

    /// Local address, binding an ephemeral port first if needed.
    fn ensure_bound(&self) -> Result<SocketAddrV4, SocketError> {
        match self.binding() {
            Some((local, _)) => Ok(local),
            None => self.stack.udp.table.bind(&self.endpoint, SocketAddrV4::UNSPECIFIED),
        }
    }

    /// Set the default peer. Only datagrams from the peer are received
    /// afterwards, and `send` goes to it.
    pub fn connect(&self, remote: SocketAddrV4) -> Result<(), SocketError> {
        if remote.port == 0 || remote.ip.is_unspecified() {
            return Err(SocketError::InvalidArgument);
        }
        self.ensure_bound()?;
        self.stack
            .udp
            .table
            .with_binding(&self.endpoint, |b| b.peer = Some(remote))
            .ok_or(SocketError::NotConnected)
    }

    /// Send one datagram to `dst`.
    pub fn send_to(&self, data: &[u8], dst: SocketAddrV4) -> Result<usize, SocketError> {
        if data.len() > UDP_MAX_PAYLOAD {
            return Err(SocketError::MessageTooLarge);
        }
        if dst.port == 0 || dst.ip.is_unspecified() {
            return Err(SocketError::InvalidArgument);
        }
        let local = self.ensure_bound()?;
        let ip = &self.stack.ip;
        let src = if local.ip.is_unspecified() {
            ip.source_for(dst.ip).ok_or(SocketError::NetworkUnreachable)?
        } else {
            local.ip
        };

        let datagram = build_udp_datagram(src, dst.ip, local.port, dst.port, data)?;
        ip.ip_tx_msg(&IpTxParams::new(Some(src), dst.ip, UDP_PROTO), datagram)?;
        self.stack.udp.stats.inc_tx_packets(data.len());
        Ok(data.len())
    }

    /// Send one datagram to the connected peer.
    pub fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        let peer = self
            .binding()
            .and_then(|(_, peer)| peer)
            .ok_or(SocketError::NotConnected)?;
        self.send_to(data, peer)
    }

    /// Take the oldest datagram. Bytes that do not fit `buf` are discarded.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), SocketError> {
        if self.endpoint.events.is_closed() {
            return Err(SocketError::Closed);
        }
        let datagram = self
            .endpoint
            .queue
            .lock()
            .pop_front()
            .ok_or(SocketError::WouldBlock)?;
        let n = datagram.data.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram.data[..n]);
        Ok((n, datagram.from))
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.recv_from(buf).map(|(n, _)| n)
    }

    /// Readiness restricted to `want`.
    pub fn select(&self, want: PollMask) -> PollMask {
        let mut mask = PollMask::WRITE;
        if !self.endpoint.queue.lock().is_empty() {
            mask |= PollMask::READ;
        }
        if self.endpoint.events.is_closed() {
            mask |= PollMask::HUP;
        }
        mask & (want | PollMask::ERROR | PollMask::HUP)
    }

    /// Local address; unspecified until bound.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.binding()
            .map(|(local, _)| local)
            .unwrap_or(SocketAddrV4::UNSPECIFIED)
    }

    pub fn peer_addr(&self) -> Result<SocketAddrV4, SocketError> {
        self.binding()
            .and_then(|(_, peer)| peer)
            .ok_or(SocketError::NotConnected)
    }

    /// Unbind and discard queued datagrams.
    pub fn close(&self) {
        self.stack.udp.table.unbind(&self.endpoint);
        self.endpoint.queue.lock().clear();
        self.endpoint.events.close();
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::ETH_HEADER_LEN;
    use crate::ipv4::parse_ipv4;
    use crate::testutil::{Harness, LOCAL_ADDR, PEER_ADDR};

    #[test]
    fn test_parse_header() {
        let data = [
            0x1F, 0x90, // src_port = 8080
            0x00, 0x50, // dst_port = 80
            0x00, 0x10, // length = 16
            0x12, 0x34, // checksum
        ];
        let header = parse_udp_header(&data).unwrap();
        assert_eq!(header.src_port, 8080);
        assert_eq!(header.dst_port, 80);
        assert_eq!(header.length, 16);
        assert_eq!(header.checksum, 0x1234);
        assert_eq!(parse_udp_header(&data[..4]), Err(UdpError::Truncated));
    }

    #[test]
    fn test_checksum_verified_unless_zero() {
        let src_ip = Ipv4Addr::new(192, 168, 1, 100);
        let dst_ip = Ipv4Addr::new(192, 168, 1, 1);
        let mut datagram = build_udp_datagram(src_ip, dst_ip, 12345, 80, b"Hello, UDP!")
            .unwrap()
            .payload()
            .to_vec();
        assert!(verify_udp_checksum(src_ip, dst_ip, &datagram));
        let (_, payload) = parse_udp(&datagram, src_ip, dst_ip).unwrap();
        assert_eq!(payload, b"Hello, UDP!");

        datagram[9] ^= 1;
        assert_eq!(parse_udp(&datagram, src_ip, dst_ip), Err(UdpError::ChecksumInvalid));

        // Zero means "not computed".
        datagram[6] = 0;
        datagram[7] = 0;
        assert!(parse_udp(&datagram, src_ip, dst_ip).is_ok());
    }

    #[test]
    fn test_length_mismatch() {
        let data = [0x1F, 0x90, 0x00, 0x50, 0x00, 0x20, 0x00, 0x00];
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(parse_udp(&data, ip, ip), Err(UdpError::LengthMismatch));
    }

    #[test]
    fn test_bind_conflicts_and_ephemeral_ports() {
        let h = Harness::new();
        let a = h.stack.udp_socket();
        a.bind(SocketAddrV4::new(LOCAL_ADDR, 53)).unwrap();
        assert_eq!(a.bind(SocketAddrV4::new(LOCAL_ADDR, 54)), Err(SocketError::InvalidArgument));

        let b = h.stack.udp_socket();
        assert_eq!(
            b.bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 53)),
            Err(SocketError::AddressInUse)
        );
        b.bind(SocketAddrV4::UNSPECIFIED).unwrap();
        assert!(b.local_addr().port >= EPHEMERAL_PORT_START);

        drop(a);
        let c = h.stack.udp_socket();
        c.bind(SocketAddrV4::new(LOCAL_ADDR, 53)).unwrap();
        assert_eq!(h.stack.udp.table.len(), 2);
    }

    #[test]
    fn test_send_to_builds_datagram() {
        let h = Harness::new();
        let sock = h.stack.udp_socket();
        assert_eq!(sock.send_to(b"query", SocketAddrV4::new(PEER_ADDR, 53)), Ok(5));
        assert_eq!(sock.send(b"x"), Err(SocketError::NotConnected));
        h.stack.run_tx_queue();

        let frames = h.capture.take();
        assert_eq!(frames.len(), 1);
        let (ip_hdr, body) = parse_ipv4(&frames[0][ETH_HEADER_LEN..]).unwrap();
        assert_eq!(ip_hdr.protocol, UDP_PROTO);
        let (hdr, payload) = parse_udp(body, ip_hdr.src, ip_hdr.dst).unwrap();
        assert_eq!(hdr.src_port, sock.local_addr().port);
        assert_eq!(hdr.dst_port, 53);
        assert_eq!(payload, b"query");
    }

    #[test]
    fn test_receive_and_peer_filter() {
        let h = Harness::new();
        let sock = h.stack.udp_socket();
        sock.bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 4000)).unwrap();
        h.inject_udp(5000, 4000, b"one");
        h.inject_udp(5001, 4000, b"two");
        assert_eq!(sock.select(PollMask::READ), PollMask::READ);

        let mut buf = [0u8; 2];
        let (n, from) = sock.recv_from(&mut buf).unwrap();
        assert_eq!((n, &buf[..n]), (2, &b"on"[..]));
        assert_eq!(from, SocketAddrV4::new(PEER_ADDR, 5000));

        sock.connect(SocketAddrV4::new(PEER_ADDR, 5001)).unwrap();
        h.inject_udp(5000, 4000, b"ignored");
        let mut buf = [0u8; 16];
        assert_eq!(sock.recv(&mut buf), Ok(3));
        assert_eq!(sock.recv(&mut buf), Err(SocketError::WouldBlock));
        assert_eq!(UdpStats::get(&h.stack.udp.stats.no_listener), 1);
    }

    #[test]
    fn test_queue_is_bounded() {
        let h = Harness::new();
        let sock = h.stack.udp_socket();
        sock.bind(SocketAddrV4::new(LOCAL_ADDR, 4001)).unwrap();
        for _ in 0..UDP_RECV_QUEUE_LIMIT + 3 {
            h.inject_udp(5000, 4001, b"x");
        }
        assert_eq!(UdpStats::get(&h.stack.udp.stats.queue_overflows), 3);
        let mut n = 0;
        while sock.recv(&mut [0u8; 1]).is_ok() {
            n += 1;
        }
        assert_eq!(n, UDP_RECV_QUEUE_LIMIT);
    }
}
