//! IPv4 transmit pipeline and receive-side validation.
//!
//! # Transmit
//!
//! `ip_tx_msg` routes the datagram, fragments it to the outgoing MTU and
//! places every resulting packet on the deferred transmit queue. Nothing is
//! handed to a driver here: `run_tx_queue` later resolves the next hop's
//! link address and transmits, requeueing packets whose resolution is still
//! pending. This keeps address-resolution waits out of the protocol engines,
//! which call `ip_tx_msg` with connection locks held.
//!
//! # Receive
//!
//! `accept_datagram` validates a datagram for the arriving interface (strong
//! host model, no forwarding) and runs reassembly. Transport dispatch lives
//! in `NetStack`.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::buffer::PacketBuffer;
use crate::config::StackConfig;
use crate::device::{AddressResolver, Clock, Resolution, TxKick};
use crate::ethernet::{build_ethernet_frame, EthAddr, EthHeader, ETHERTYPE_IPV4, ETH_HEADER_LEN};
use crate::fragment::{Datagram, Reassembler};
use crate::iface::{IfaceId, Interface, InterfaceTable};
use crate::ipv4::{
    parse_ipv4, Ipv4Addr, Ipv4Header, IPV4_HEADER_LEN, IPV4_MAX_TOTAL_LEN, IP_FLAG_DF, IP_FLAG_MF,
};
use crate::route::{NextHop, RouteTable};
use crate::stack::DropReason;

/// Packets the deferred transmit queue holds before `ip_tx_msg` refuses
/// more.
pub const TX_QUEUE_LIMIT: usize = 1024;

// ============================================================================
// Statistics
// ============================================================================

/// IP layer statistics
#[derive(Debug, Default)]
pub struct NetStats {
    /// Frames handed to the stack by drivers
    pub rx_packets: AtomicU64,
    /// Frames or datagrams rejected as malformed
    pub rx_errors: AtomicU64,
    /// IPv4 datagrams accepted for local delivery
    pub ipv4_rx: AtomicU64,
    /// Datagrams not addressed to the arriving interface
    pub not_for_us: AtomicU64,
    /// Datagrams for a protocol nobody handles
    pub unsupported_proto: AtomicU64,
    /// IP packets queued for transmission (after fragmentation)
    pub tx_packets: AtomicU64,
    /// Datagrams that had to be fragmented
    pub tx_fragmented: AtomicU64,
    /// Transmit requests without a route
    pub tx_no_route: AtomicU64,
    /// Frames the driver refused
    pub tx_errors: AtomicU64,
    /// Packets dropped because resolution failed or timed out
    pub tx_resolve_failed: AtomicU64,
    /// Transmit requests refused because the queue was full
    pub tx_queue_full: AtomicU64,
    /// ICMP messages received
    pub icmp_rx: AtomicU64,
    /// ICMP echo requests answered
    pub icmp_echo_tx: AtomicU64,
    /// ICMP destination-unreachable messages sent
    pub icmp_unreach_tx: AtomicU64,
    /// Datagram copies delivered to raw sockets
    pub raw_delivered: AtomicU64,
}

impl NetStats {
    pub const fn new() -> Self {
        NetStats {
            rx_packets: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
            ipv4_rx: AtomicU64::new(0),
            not_for_us: AtomicU64::new(0),
            unsupported_proto: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_fragmented: AtomicU64::new(0),
            tx_no_route: AtomicU64::new(0),
            tx_errors: AtomicU64::new(0),
            tx_resolve_failed: AtomicU64::new(0),
            tx_queue_full: AtomicU64::new(0),
            icmp_rx: AtomicU64::new(0),
            icmp_echo_tx: AtomicU64::new(0),
            icmp_unreach_tx: AtomicU64::new(0),
            raw_delivered: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Transmit Parameters
// ============================================================================

/// Per-datagram transmit options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpTxParams {
    /// Source address; `None` (or unspecified) uses the outgoing interface's.
    /// A local source also constrains the route to that interface.
    pub src: Option<Ipv4Addr>,
    pub dst: Ipv4Addr,
    pub proto: u8,
    /// TTL; `None` uses the configured default.
    pub ttl: Option<u8>,
    pub tos: u8,
    /// Fail with `MessageTooLarge` instead of fragmenting.
    pub dont_fragment: bool,
}

impl IpTxParams {
    pub fn new(src: Option<Ipv4Addr>, dst: Ipv4Addr, proto: u8) -> Self {
        IpTxParams {
            src,
            dst,
            proto,
            ttl: None,
            tos: 0,
            dont_fragment: false,
        }
    }
}

/// Transmit errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpTxError {
    /// No route to the destination
    NetworkUnreachable,
    /// Datagram exceeds the MTU with DF set, or the IPv4 size limit
    MessageTooLarge,
    /// Transmit queue full or buffer composition failed
    NoBufferSpace,
}

/// A packet waiting for address resolution.
struct QueuedPacket {
    iface: IfaceId,
    next_hop: Ipv4Addr,
    packet: PacketBuffer,
    queued_at_ms: u64,
}

// ============================================================================
// IP Layer
// ============================================================================

/// Routing, interfaces, reassembly and the deferred transmit queue.
pub struct IpLayer {
    pub(crate) config: StackConfig,
    pub(crate) ifaces: InterfaceTable,
    pub(crate) routes: RouteTable,
    pub(crate) reassembler: Reassembler,
    pub(crate) stats: NetStats,
    ident: Mutex<u16>,
    txq: Mutex<VecDeque<QueuedPacket>>,
    resolver: Arc<dyn AddressResolver>,
    clock: Arc<dyn Clock>,
    kick: Option<Arc<dyn TxKick>>,
}

impl IpLayer {
    pub fn new(
        config: StackConfig,
        resolver: Arc<dyn AddressResolver>,
        clock: Arc<dyn Clock>,
        kick: Option<Arc<dyn TxKick>>,
    ) -> Self {
        IpLayer {
            config,
            ifaces: InterfaceTable::new(),
            routes: RouteTable::new(),
            reassembler: Reassembler::new(config.reassembly_timeout_secs),
            stats: NetStats::new(),
            ident: Mutex::new(0),
            txq: Mutex::new(VecDeque::new()),
            resolver,
            clock,
            kick,
        }
    }

    #[inline]
    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn AddressResolver> {
        &self.resolver
    }

    /// Next datagram identification: increments, wraps, skips zero.
    fn next_ident(&self) -> u16 {
        let mut ident = self.ident.lock();
        *ident = ident.wrapping_add(1);
        if *ident == 0 {
            *ident = 1;
        }
        *ident
    }

    /// Route `dst`, constrained to the interface owning `src` if it is local.
    fn route(&self, src: Option<Ipv4Addr>, dst: Ipv4Addr) -> Option<(Arc<Interface>, NextHop)> {
        let src_iface = src
            .filter(|s| !s.is_unspecified())
            .and_then(|s| self.ifaces.by_address(s))
            .map(|i| i.id());
        let hop = self.routes.lookup(src_iface, dst)?;
        let iface = self.ifaces.get(hop.iface)?;
        Some((iface, hop))
    }

    /// MTU of the interface a datagram to `dst` would leave through.
    pub fn route_mtu(&self, src: Option<Ipv4Addr>, dst: Ipv4Addr) -> Option<usize> {
        self.route(src, dst).map(|(iface, _)| iface.mtu())
    }

    /// Source address for a datagram to `dst`: the outgoing interface's.
    pub fn source_for(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        self.route(None, dst)
            .map(|(iface, _)| iface.address())
            .filter(|a| !a.is_unspecified())
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    /// Transmit `payload` (a transport header plus data) as one IPv4
    /// datagram, fragmenting it to the outgoing interface's MTU.
    ///
    /// # Arguments
    ///
    /// * `params` - Addresses, protocol and header options
    /// * `payload` - Transport payload; ownership passes to the queue
    ///
    /// # Returns
    ///
    /// `Ok(())` once every fragment is queued. The caller keeps nothing.
    pub fn ip_tx_msg(&self, params: &IpTxParams, payload: PacketBuffer) -> Result<(), IpTxError> {
        let Some((iface, hop)) = self.route(params.src, params.dst) else {
            NetStats::inc(&self.stats.tx_no_route);
            log::debug!(target: "net::ip", "no route to {}", params.dst);
            return Err(IpTxError::NetworkUnreachable);
        };
        let src = params
            .src
            .filter(|s| !s.is_unspecified())
            .unwrap_or_else(|| iface.address());

        let mtu = iface.mtu();
        let total = payload.size() + IPV4_HEADER_LEN;
        if total > IPV4_MAX_TOTAL_LEN || (total > mtu && params.dont_fragment) {
            return Err(IpTxError::MessageTooLarge);
        }

        let mut header = Ipv4Header {
            tos: params.tos,
            total_len: total as u16,
            identification: self.next_ident(),
            flags_fragment: if params.dont_fragment { IP_FLAG_DF } else { 0 },
            ttl: params.ttl.unwrap_or(self.config.default_ttl),
            protocol: params.proto,
            src,
            dst: params.dst,
        };

        let mut packets = Vec::new();
        if total <= mtu {
            let mut packet = if payload.headroom() >= IPV4_HEADER_LEN + ETH_HEADER_LEN {
                payload
            } else {
                PacketBuffer::from_slice(payload.payload(), crate::DEFAULT_HEADROOM)
            };
            packet
                .prepend(IPV4_HEADER_LEN)
                .map_err(|_| IpTxError::NoBufferSpace)?
                .copy_from_slice(&header.to_bytes());
            packets.push(packet);
        } else {
            let chunk = (mtu.saturating_sub(IPV4_HEADER_LEN)) & !7;
            if chunk == 0 {
                return Err(IpTxError::MessageTooLarge);
            }
            let data = payload.payload();
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + chunk).min(data.len());
                let last = end == data.len();
                header.total_len = (IPV4_HEADER_LEN + end - offset) as u16;
                header.flags_fragment = (offset / 8) as u16 | if last { 0 } else { IP_FLAG_MF };

                let mut packet = PacketBuffer::for_payload(end - offset);
                packet
                    .append_slice(&data[offset..end])
                    .map_err(|_| IpTxError::NoBufferSpace)?;
                packet
                    .prepend(IPV4_HEADER_LEN)
                    .map_err(|_| IpTxError::NoBufferSpace)?
                    .copy_from_slice(&header.to_bytes());
                packets.push(packet);
                offset = end;
            }
            NetStats::inc(&self.stats.tx_fragmented);
            log::trace!(
                target: "net::ip",
                "id={:#06x} to {} split into {} fragments",
                header.identification,
                params.dst,
                packets.len()
            );
        }

        let now = self.now_ms();
        {
            let mut txq = self.txq.lock();
            if txq.len() + packets.len() > TX_QUEUE_LIMIT {
                NetStats::inc(&self.stats.tx_queue_full);
                return Err(IpTxError::NoBufferSpace);
            }
            for packet in packets {
                NetStats::inc(&self.stats.tx_packets);
                txq.push_back(QueuedPacket {
                    iface: iface.id(),
                    next_hop: hop.addr,
                    packet,
                    queued_at_ms: now,
                });
            }
        }
        if let Some(kick) = &self.kick {
            kick.kick();
        }
        Ok(())
    }

    /// Body of the deferred transmit worker: resolve and transmit every
    /// queued packet.
    ///
    /// Packets whose resolution is pending stay queued, in order, until
    /// `tx_pending_timeout_ms` has passed since they were queued.
    ///
    /// # Returns
    ///
    /// Number of frames handed to drivers.
    pub fn run_tx_queue(&self) -> usize {
        let batch = mem::take(&mut *self.txq.lock());
        if batch.is_empty() {
            return 0;
        }

        let now = self.now_ms();
        let mut sent = 0;
        let mut retry = VecDeque::new();
        for queued in batch {
            let Some(iface) = self.ifaces.get(queued.iface) else {
                continue;
            };
            let dst_mac = if iface.is_loopback() {
                EthAddr::ZERO
            } else {
                match self.resolver.resolve(&iface, queued.next_hop) {
                    Resolution::Hit(mac) => mac,
                    Resolution::Pending => {
                        if now.saturating_sub(queued.queued_at_ms) >= self.config.tx_pending_timeout_ms {
                            NetStats::inc(&self.stats.tx_resolve_failed);
                            log::debug!(target: "net::ip", "resolution of {} timed out", queued.next_hop);
                        } else {
                            retry.push_back(queued);
                        }
                        continue;
                    }
                    Resolution::Error => {
                        NetStats::inc(&self.stats.tx_resolve_failed);
                        continue;
                    }
                }
            };

            let mut frame = queued.packet;
            let eth = EthHeader {
                dst: dst_mac,
                src: iface.device().mac_address(),
                ethertype: ETHERTYPE_IPV4,
            };
            if build_ethernet_frame(&mut frame, &eth).is_err() {
                NetStats::inc(&self.stats.tx_errors);
                continue;
            }
            match iface.device().transmit(frame) {
                Ok(()) => sent += 1,
                Err(e) => {
                    NetStats::inc(&self.stats.tx_errors);
                    log::debug!(target: "net::link", "{}: transmit failed: {:?}", iface.name(), e);
                }
            }
        }

        if !retry.is_empty() {
            let mut txq = self.txq.lock();
            while let Some(queued) = retry.pop_back() {
                txq.push_front(queued);
            }
        }
        sent
    }

    /// Packets waiting in the transmit queue.
    pub fn tx_pending(&self) -> usize {
        self.txq.lock().len()
    }

    /// One-second housekeeping: reassembly timeouts, and a kick so pending
    /// resolutions are retried or expired.
    pub fn ip_do_tick(&self) {
        let expired = self.reassembler.tick();
        if expired > 0 {
            log::debug!(target: "net::frag", "{} incomplete datagrams expired", expired);
        }
        if self.tx_pending() > 0 {
            if let Some(kick) = &self.kick {
                kick.kick();
            }
        }
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Validate a datagram that arrived on `iface` and reassemble it.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(datagram))` - complete datagram for local delivery
    /// - `Ok(None)` - fragment stored, datagram still incomplete
    /// - `Err(reason)` - datagram dropped
    pub(crate) fn accept_datagram(
        &self,
        iface: &Interface,
        packet: &[u8],
    ) -> Result<Option<Datagram>, DropReason> {
        let (header, payload) = parse_ipv4(packet).map_err(|e| {
            NetStats::inc(&self.stats.rx_errors);
            DropReason::Ipv4Error(e)
        })?;

        if !self.addressed_to(iface, header.dst) {
            NetStats::inc(&self.stats.not_for_us);
            return Err(DropReason::NotForUs);
        }
        if !header.src.is_valid_source() && !iface.is_loopback() {
            NetStats::inc(&self.stats.rx_errors);
            return Err(DropReason::InvalidSource);
        }
        NetStats::inc(&self.stats.ipv4_rx);

        self.reassembler
            .reassemble(&header, payload)
            .map_err(DropReason::FragmentError)
    }

    /// Strong host model: the destination must be the arriving interface's
    /// address or a broadcast on it. Loopback delivers any local address.
    fn addressed_to(&self, iface: &Interface, dst: Ipv4Addr) -> bool {
        if iface.owns(dst) || dst.is_broadcast() {
            return true;
        }
        if iface.is_loopback() && self.ifaces.is_local(dst) {
            return true;
        }
        let addr = iface.address();
        let mask = iface.netmask();
        !addr.is_unspecified()
            && mask.prefix_len() < 31
            && dst.mask(mask) == addr.mask(mask)
            && dst.to_u32() | mask.to_u32() == u32::MAX
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Harness, ManualResolver, LOCAL_ADDR, PEER_ADDR};

    fn payload(len: usize) -> PacketBuffer {
        let mut buf = PacketBuffer::for_payload(len);
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        buf.append_slice(&data).unwrap();
        buf
    }

    #[test]
    fn test_no_route() {
        let h = Harness::new();
        let params = IpTxParams::new(None, Ipv4Addr::new(172, 16, 0, 1), 17);
        assert_eq!(
            h.stack.ip.ip_tx_msg(&params, payload(10)),
            Err(IpTxError::NetworkUnreachable)
        );
        assert_eq!(h.stack.ip.tx_pending(), 0);
    }

    #[test]
    fn test_fragmentation_on_send() {
        let h = Harness::new();
        let ip = &h.stack.ip;
        let params = IpTxParams::new(None, PEER_ADDR, 17);
        ip.ip_tx_msg(&params, payload(3000)).unwrap();
        assert_eq!(ip.tx_pending(), 3);
        assert_eq!(ip.run_tx_queue(), 3);

        let frames = h.capture.take();
        let mut reassembled = Vec::new();
        let mut ident = None;
        for (i, frame) in frames.iter().enumerate() {
            let (hdr, body) = parse_ipv4(&frame[ETH_HEADER_LEN..]).unwrap();
            assert_eq!(hdr.src, LOCAL_ADDR);
            assert!(hdr.total_len as usize <= 1500);
            assert_eq!(hdr.more_fragments(), i < 2);
            assert_eq!(hdr.fragment_offset() as usize * 8, reassembled.len());
            assert!(ident.map_or(true, |id| id == hdr.identification));
            ident = Some(hdr.identification);
            if i < 2 {
                assert_eq!(body.len() % 8, 0);
            }
            reassembled.extend_from_slice(body);
        }
        assert_ne!(ident, Some(0));
        assert_eq!(reassembled.len(), 3000);
        assert!(reassembled.iter().enumerate().all(|(i, b)| *b == i as u8));
    }

    #[test]
    fn test_dont_fragment_rejects_oversize() {
        let h = Harness::new();
        let mut params = IpTxParams::new(None, PEER_ADDR, 17);
        params.dont_fragment = true;
        assert_eq!(
            h.stack.ip.ip_tx_msg(&params, payload(1481)),
            Err(IpTxError::MessageTooLarge)
        );
        assert!(h.stack.ip.ip_tx_msg(&params, payload(1480)).is_ok());
    }

    #[test]
    fn test_identification_skips_zero() {
        let h = Harness::new();
        *h.stack.ip.ident.lock() = u16::MAX;
        assert_eq!(h.stack.ip.next_ident(), 1);
        assert_eq!(h.stack.ip.next_ident(), 2);
    }

    #[test]
    fn test_pending_resolution_requeues_then_expires() {
        let resolver = Arc::new(ManualResolver::pending());
        let h = Harness::with_resolver(resolver.clone());
        let ip = &h.stack.ip;
        ip.ip_tx_msg(&IpTxParams::new(None, PEER_ADDR, 17), payload(8)).unwrap();
        ip.ip_tx_msg(&IpTxParams::new(None, PEER_ADDR, 17), payload(9)).unwrap();

        assert_eq!(ip.run_tx_queue(), 0);
        assert_eq!(ip.tx_pending(), 2);

        resolver.set(Resolution::Hit(EthAddr([2, 0, 0, 0, 0, 2])));
        assert_eq!(ip.run_tx_queue(), 2);
        let frames = h.capture.take();
        // Order survives the requeue.
        assert_eq!(frames[0].len(), ETH_HEADER_LEN + IPV4_HEADER_LEN + 8);
        assert_eq!(frames[1].len(), ETH_HEADER_LEN + IPV4_HEADER_LEN + 9);

        resolver.set(Resolution::Pending);
        ip.ip_tx_msg(&IpTxParams::new(None, PEER_ADDR, 17), payload(8)).unwrap();
        h.clock.advance_ms(ip.config.tx_pending_timeout_ms);
        assert_eq!(ip.run_tx_queue(), 0);
        assert_eq!(ip.tx_pending(), 0);
        assert_eq!(NetStats::get(&ip.stats.tx_resolve_failed), 1);
    }

    #[test]
    fn test_strong_host_receive() {
        let h = Harness::new();
        let ip = &h.stack.ip;
        let iface = ip.ifaces.by_name("eth0").unwrap();
        let build = |dst: Ipv4Addr| {
            let hdr = Ipv4Header {
                tos: 0,
                total_len: 24,
                identification: 7,
                flags_fragment: 0,
                ttl: 64,
                protocol: 17,
                src: PEER_ADDR,
                dst,
            };
            let mut pkt = hdr.to_bytes().to_vec();
            pkt.extend_from_slice(&[1, 2, 3, 4]);
            pkt
        };

        let ok = ip.accept_datagram(&iface, &build(LOCAL_ADDR)).unwrap().unwrap();
        assert_eq!(ok.payload, alloc::vec![1, 2, 3, 4]);
        assert!(ip.accept_datagram(&iface, &build(Ipv4Addr::new(10, 0, 0, 255))).is_ok());
        assert!(matches!(
            ip.accept_datagram(&iface, &build(Ipv4Addr::new(10, 0, 0, 77))),
            Err(DropReason::NotForUs)
        ));
    }
}
