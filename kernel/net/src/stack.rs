//! Stack context and inbound dispatch.
//!
//! `NetStack` owns every layer: interfaces, routes, reassembly and the
//! deferred transmit queue (`IpLayer`), the TCP registry, the UDP and raw
//! socket tables. Drivers hand received frames to [`NetStack::receive`];
//! the platform calls [`NetStack::tcp_tick`] every `tick_ms` and
//! [`NetStack::ip_do_tick`] once a second.
//!
//! # Architecture
//!
//! ```text
//!                     +------------------+
//!                     |   NetDevice      |
//!                     | (driver / lo)    |
//!                     +--------+---------+
//!                              |
//!                     +--------v---------+
//!                     |   Ethernet       |
//!                     +--------+---------+
//!                              |
//!              +---------------+---------------+
//!              |                               |
//!     +--------v---------+           +---------v--------+
//!     |     IPv4         |           | AddressResolver  |
//!     | (validate/frag)  |           |   (ARP input)    |
//!     +--------+---------+           +------------------+
//!              |
//!              +------> raw sockets (copy)
//!              |
//!     +--------+---------+----------------+
//!     |                  |                |
//! +---v----+        +----v---+       +----v---+
//! |  ICMP  |        |  UDP   |       |  TCP   |
//! +--------+        +--------+       +--------+
//! ```
//!
//! Outbound datagrams never touch a device on the caller's context; they
//! are queued by `ip_tx_msg` and sent by `run_tx_queue`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::buffer::PacketBuffer;
use crate::config::StackConfig;
use crate::device::{AddressResolver, Clock, LoopbackDevice, NetDevice, TxKick};
use crate::ethernet::{parse_ethernet, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::fragment::{Datagram, FragmentDropReason, FragmentStats};
use crate::icmp::{
    icmp_input, send_dest_unreachable, IcmpError, ICMP_CODE_PORT_UNREACHABLE,
};
use crate::iface::{IfaceAddr, IfaceError, IfaceFlags, IfaceId, InterfaceInfo};
use crate::ip::{IpLayer, IpTxError, IpTxParams, NetStats};
use crate::ipv4::{Ipv4Addr, Ipv4Error, Ipv4Proto};
use crate::raw::{RawSocket, RawTable};
use crate::route::{Route, RouteError};
use crate::socket::{Socket, SocketError, SocketKind};
use crate::tcp::TcpStats;
use crate::tcp_socket::{TcpLayer, TcpSocket};
use crate::udp::{UdpError, UdpLayer, UdpResult, UdpSocket, UdpStats};
use crate::wait::SocketWaitHooks;

/// Upper bound on transmit/loopback rounds in one `poll` call.
const POLL_ROUND_LIMIT: usize = 64;

// ============================================================================
// Packet Processing Result
// ============================================================================

/// Result of processing an incoming packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Packet was consumed (delivered, answered, or silently ignored)
    Handled,
    /// Packet was dropped with reason
    Dropped(DropReason),
}

/// Reason for dropping a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Ethernet frame parsing failed
    EthParseError,
    /// IPv4 parsing/validation failed
    Ipv4Error(Ipv4Error),
    /// ICMP parsing failed
    IcmpError(IcmpError),
    /// UDP processing error
    UdpError(UdpError),
    /// Fragment reassembly error
    FragmentError(FragmentDropReason),
    /// Destination is not an address of the arriving interface
    NotForUs,
    /// Source address may not originate traffic
    InvalidSource,
    /// Connection-oriented segment sent to a broadcast or multicast address
    NotUnicast,
    /// Unsupported EtherType
    UnsupportedEtherType,
    /// Unsupported IP protocol
    UnsupportedProtocol,
    /// Frame arrived for an interface id that is not registered
    NoSuchInterface,
    /// Interface is administratively down
    InterfaceDown,
}

// ============================================================================
// Stack Context
// ============================================================================

/// One instance of the protocol stack.
pub struct NetStack {
    pub(crate) ip: IpLayer,
    pub(crate) tcp: TcpLayer,
    pub(crate) udp: UdpLayer,
    pub(crate) raw: RawTable,
    loopbacks: Mutex<Vec<(IfaceId, Arc<LoopbackDevice>)>>,
}

impl NetStack {
    /// Build a stack with no interfaces or routes.
    pub fn new(
        config: StackConfig,
        resolver: Arc<dyn AddressResolver>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Self::with_hooks(config, resolver, clock, None, None)
    }

    /// Build a stack wired to the platform's transmit worker and scheduler.
    ///
    /// # Arguments
    ///
    /// * `kick` - Notified whenever the transmit queue gains work
    /// * `hooks` - Blocking primitives for socket wait queues; without them
    ///   blocking socket calls spin on the event counter
    pub fn with_hooks(
        config: StackConfig,
        resolver: Arc<dyn AddressResolver>,
        clock: Arc<dyn Clock>,
        kick: Option<Arc<dyn TxKick>>,
        hooks: Option<Arc<dyn SocketWaitHooks>>,
    ) -> Arc<Self> {
        log::info!(
            target: "net::ip",
            "stack up: tick {} ms, ttl {}, rto {} ticks",
            config.tick_ms,
            config.default_ttl,
            config.rto_init_ticks
        );
        Arc::new(NetStack {
            ip: IpLayer::new(config, resolver, clock, kick),
            tcp: TcpLayer::new(config, hooks.clone()),
            udp: UdpLayer::new(hooks.clone()),
            raw: RawTable::new(hooks),
            loopbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.ip.config
    }

    // ========================================================================
    // Receive Path
    // ========================================================================

    /// Process an incoming Ethernet frame.
    ///
    /// Runs on the driver's receive context. Frames not addressed to the
    /// interface's MAC or to broadcast are ignored without counting an error.
    ///
    /// # Arguments
    /// * `iface` - Interface the frame arrived on
    /// * `frame` - Raw Ethernet frame bytes
    ///
    /// # Returns
    /// `ProcessResult` describing what happened to the frame
    pub fn receive(&self, iface: IfaceId, frame: &[u8]) -> ProcessResult {
        let stats = &self.ip.stats;
        NetStats::inc(&stats.rx_packets);

        let interface = match self.ip.ifaces.get(iface) {
            Some(i) => i,
            None => return ProcessResult::Dropped(DropReason::NoSuchInterface),
        };
        if !interface.flags().contains(IfaceFlags::UP) {
            return ProcessResult::Dropped(DropReason::InterfaceDown);
        }

        let (eth_hdr, eth_payload) = match parse_ethernet(frame) {
            Ok(result) => result,
            Err(_) => {
                NetStats::inc(&stats.rx_errors);
                return ProcessResult::Dropped(DropReason::EthParseError);
            }
        };

        if eth_hdr.dst != interface.device().mac_address() && !eth_hdr.dst.is_broadcast() {
            return ProcessResult::Handled;
        }

        match eth_hdr.ethertype {
            ETHERTYPE_IPV4 => self.ip_receive(iface, eth_payload),
            ETHERTYPE_ARP => {
                self.ip.resolver().input(&interface, eth_payload);
                ProcessResult::Handled
            }
            _ => {
                NetStats::inc(&stats.unsupported_proto);
                ProcessResult::Dropped(DropReason::UnsupportedEtherType)
            }
        }
    }

    /// Process an IPv4 datagram (Ethernet header already removed).
    ///
    /// Validates it, feeds fragments to reassembly, copies the complete
    /// datagram to matching raw sockets and dispatches it by protocol.
    pub fn ip_receive(&self, iface: IfaceId, packet: &[u8]) -> ProcessResult {
        let interface = match self.ip.ifaces.get(iface) {
            Some(i) => i,
            None => return ProcessResult::Dropped(DropReason::NoSuchInterface),
        };

        let dgram = match self.ip.accept_datagram(&interface, packet) {
            Ok(Some(dgram)) => dgram,
            Ok(None) => return ProcessResult::Handled,
            Err(reason) => {
                log::trace!(target: "net::ip", "{}: dropped datagram: {:?}", interface.name(), reason);
                return ProcessResult::Dropped(reason);
            }
        };
        self.deliver(&dgram)
    }

    fn deliver(&self, dgram: &Datagram) -> ProcessResult {
        let raw_copies = self.raw.deliver(dgram, &self.ip.stats);

        match Ipv4Proto::from_raw(dgram.header.protocol) {
            Some(Ipv4Proto::Icmp) => icmp_input(&self.ip, dgram),
            Some(Ipv4Proto::Udp) => match self.udp.input(&dgram.header, &dgram.payload) {
                UdpResult::Delivered => ProcessResult::Handled,
                UdpResult::NoListener => {
                    send_dest_unreachable(&self.ip, dgram, ICMP_CODE_PORT_UNREACHABLE);
                    ProcessResult::Handled
                }
                UdpResult::Dropped(e) => ProcessResult::Dropped(DropReason::UdpError(e)),
            },
            Some(Ipv4Proto::Tcp) => {
                let dst = dgram.header.dst;
                if !self.ip.ifaces.is_local(dst) {
                    self.tcp_drop();
                    return ProcessResult::Dropped(DropReason::NotUnicast);
                }
                self.tcp.input(&self.ip, dgram.header.src, dst, &dgram.payload);
                ProcessResult::Handled
            }
            None => {
                if raw_copies > 0 {
                    return ProcessResult::Handled;
                }
                NetStats::inc(&self.ip.stats.unsupported_proto);
                ProcessResult::Dropped(DropReason::UnsupportedProtocol)
            }
        }
    }

    fn tcp_drop(&self) {
        TcpStats::bump(&self.tcp.stats.rx_dropped);
    }

    // ========================================================================
    // Transmit Path and Timers
    // ========================================================================

    /// Queue one datagram for transmission. See [`IpLayer::ip_tx_msg`].
    pub fn ip_tx_msg(&self, params: &IpTxParams, payload: PacketBuffer) -> Result<(), IpTxError> {
        self.ip.ip_tx_msg(params, payload)
    }

    /// Resolve and transmit queued datagrams. Returns how many were sent.
    pub fn run_tx_queue(&self) -> usize {
        self.ip.run_tx_queue()
    }

    /// Datagrams waiting in the transmit queue.
    pub fn tx_pending(&self) -> usize {
        self.ip.tx_pending()
    }

    /// Fast timer: advance every TCP connection's timers by one tick.
    pub fn tcp_tick(&self) {
        self.tcp.tick(&self.ip);
    }

    /// Slow timer: expire reassembly slots and stale transmit entries.
    pub fn ip_do_tick(&self) {
        self.ip.ip_do_tick();
    }

    /// Drain the transmit queue and re-inject looped-back frames until
    /// neither produces more work.
    ///
    /// # Returns
    /// Number of frames transmitted or looped back
    pub fn poll(&self) -> usize {
        let loopbacks: Vec<(IfaceId, Arc<LoopbackDevice>)> = self.loopbacks.lock().clone();
        let mut total = 0;
        for _ in 0..POLL_ROUND_LIMIT {
            let mut progress = self.run_tx_queue();
            for (id, device) in loopbacks.iter() {
                while let Some(frame) = device.pop() {
                    self.receive(*id, frame.payload());
                    progress += 1;
                }
            }
            if progress == 0 {
                break;
            }
            total += progress;
        }
        total
    }

    // ========================================================================
    // Interface and Route Administration
    // ========================================================================

    /// Register a device under `name`.
    pub fn add_interface(
        &self,
        name: &str,
        device: Arc<dyn NetDevice>,
        flags: IfaceFlags,
    ) -> Result<IfaceId, IfaceError> {
        self.ip.ifaces.add(name, device, flags)
    }

    /// Register a software loopback interface. Its frames are re-injected by
    /// [`NetStack::poll`].
    pub fn add_loopback(&self, name: &str) -> Result<IfaceId, IfaceError> {
        let device = Arc::new(LoopbackDevice::new());
        let id = self.ip.ifaces.add(
            name,
            device.clone(),
            IfaceFlags::UP | IfaceFlags::LOOPBACK,
        )?;
        self.loopbacks.lock().push((id, device));
        Ok(id)
    }

    pub fn set_interface_address(
        &self,
        name: &str,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> Result<(), IfaceError> {
        self.ip.ifaces.set_address(name, address, netmask)
    }

    pub fn interface_address(&self, name: &str) -> Result<IfaceAddr, IfaceError> {
        self.ip.ifaces.address(name)
    }

    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.ip.ifaces.list()
    }

    /// Add a route; a route identical in all four fields is replaced.
    pub fn add_route(
        &self,
        dst: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        iface_name: &str,
    ) -> Result<(), RouteError> {
        self.ip
            .routes
            .add_route(&self.ip.ifaces, dst, netmask, gateway, iface_name)
    }

    pub fn delete_route(
        &self,
        dst: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        iface_name: &str,
    ) -> Result<(), RouteError> {
        self.ip
            .routes
            .delete_route(&self.ip.ifaces, dst, netmask, gateway, iface_name)
    }

    /// Remove every route through the named interface.
    pub fn purge_routes(&self, iface_name: &str) -> Result<usize, RouteError> {
        let iface = self
            .ip
            .ifaces
            .by_name(iface_name)
            .ok_or(RouteError::NoSuchDevice)?;
        let removed = self.ip.routes.purge(iface.id());
        log::info!(target: "net::route", "purged {} routes via {}", removed, iface_name);
        Ok(removed)
    }

    pub fn routes(&self) -> Vec<Route> {
        self.ip.routes.routes()
    }

    /// Names of all registered interfaces.
    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces().into_iter().map(|i| i.name).collect()
    }

    // ========================================================================
    // Sockets
    // ========================================================================

    pub fn tcp_socket(self: &Arc<Self>) -> TcpSocket {
        TcpSocket::new(self.clone())
    }

    pub fn udp_socket(self: &Arc<Self>) -> UdpSocket {
        UdpSocket::new(self.clone())
    }

    /// Open a raw socket for IP protocol `proto`.
    pub fn raw_socket(self: &Arc<Self>, proto: u8) -> Result<RawSocket, SocketError> {
        RawSocket::open(self.clone(), proto)
    }

    /// Create a socket of the given kind behind the uniform socket surface.
    pub fn create_socket(self: &Arc<Self>, kind: SocketKind) -> Result<Socket, SocketError> {
        let socket = match kind {
            SocketKind::Stream => Socket::from(self.tcp_socket()),
            SocketKind::Datagram => Socket::from(self.udp_socket()),
            SocketKind::Raw(proto) => Socket::from(self.raw_socket(proto)?),
        };
        Ok(socket)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn net_stats(&self) -> &NetStats {
        &self.ip.stats
    }

    pub fn tcp_stats(&self) -> &TcpStats {
        self.tcp.stats()
    }

    pub fn udp_stats(&self) -> &UdpStats {
        self.udp.stats()
    }

    pub fn fragment_stats(&self) -> &FragmentStats {
        self.ip.reassembler.stats()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::{EthAddr, EthHeader, ETH_HEADER_LEN};
    use crate::icmp::{
        parse_icmp, ICMP_TYPE_DEST_UNREACHABLE, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST,
    };
    use crate::ipv4::{compute_checksum, parse_ipv4, SocketAddrV4, IPV4_HEADER_LEN};
    use crate::tcp::TcpState;
    use crate::testutil::{Harness, ManualClock, ManualResolver, LOCAL_ADDR, PEER_ADDR};

    const LO_NET: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 0);
    const LO_MASK: Ipv4Addr = Ipv4Addr::new(255, 0, 0, 0);

    fn loopback_stack() -> Arc<NetStack> {
        let stack = NetStack::new(
            StackConfig::default(),
            Arc::new(ManualResolver::default()),
            Arc::new(ManualClock::new()),
        );
        stack.add_loopback("lo").unwrap();
        stack
            .set_interface_address("lo", Ipv4Addr::LOCALHOST, LO_MASK)
            .unwrap();
        stack.add_route(LO_NET, LO_MASK, None, "lo").unwrap();
        stack
    }

    fn echo_request(data: &[u8]) -> Vec<u8> {
        let mut msg = alloc::vec![ICMP_TYPE_ECHO_REQUEST, 0, 0, 0, 0, 1, 0, 1];
        msg.extend_from_slice(data);
        let sum = compute_checksum(&msg, msg.len());
        msg[2..4].copy_from_slice(&sum.to_be_bytes());
        msg
    }

    #[test]
    fn test_stray_and_malformed_frames() {
        let h = Harness::new();
        assert_eq!(
            h.stack.receive(IfaceId(0), &[0u8; 6]),
            ProcessResult::Dropped(DropReason::EthParseError)
        );
        assert_eq!(
            h.stack.receive(IfaceId(7), &[0u8; 64]),
            ProcessResult::Dropped(DropReason::NoSuchInterface)
        );

        let mut frame = [0u8; 64];
        EthHeader {
            dst: EthAddr([2, 0, 0, 0, 0, 0x99]),
            src: EthAddr([2, 0, 0, 0, 0, 2]),
            ethertype: ETHERTYPE_IPV4,
        }
        .write(&mut frame);
        assert_eq!(h.stack.receive(IfaceId(0), &frame), ProcessResult::Handled);
        assert_eq!(NetStats::get(&h.stack.net_stats().rx_errors), 1);

        EthHeader {
            dst: EthAddr::BROADCAST,
            src: EthAddr([2, 0, 0, 0, 0, 2]),
            ethertype: 0x86dd,
        }
        .write(&mut frame);
        assert_eq!(
            h.stack.receive(IfaceId(0), &frame),
            ProcessResult::Dropped(DropReason::UnsupportedEtherType)
        );
    }

    #[test]
    fn test_udp_without_listener_draws_port_unreachable() {
        let h = Harness::new();
        h.inject_udp(5000, 6000, b"anyone?");
        h.stack.run_tx_queue();
        let frames = h.capture.take();
        assert_eq!(frames.len(), 1);
        let (ip_hdr, body) = parse_ipv4(&frames[0][ETH_HEADER_LEN..]).unwrap();
        assert_eq!(ip_hdr.dst, PEER_ADDR);
        let (icmp, _) = parse_icmp(body).unwrap();
        assert_eq!(icmp.icmp_type, ICMP_TYPE_DEST_UNREACHABLE);
        assert_eq!(icmp.code, ICMP_CODE_PORT_UNREACHABLE);
    }

    #[test]
    fn test_unknown_protocol() {
        let h = Harness::new();
        assert_eq!(
            h.inject_ipv4(250, b"mystery"),
            ProcessResult::Dropped(DropReason::UnsupportedProtocol)
        );
        assert_eq!(NetStats::get(&h.stack.net_stats().unsupported_proto), 1);
        h.stack.run_tx_queue();
        assert!(h.capture.take().is_empty());

        // A raw socket for the protocol takes it instead.
        let raw = h.stack.raw_socket(250).unwrap();
        assert_eq!(h.inject_ipv4(250, b"mystery"), ProcessResult::Handled);
        h.stack.run_tx_queue();
        assert!(h.capture.take().is_empty());
        assert_eq!(raw.recv_from(&mut [0u8; 64]).unwrap().1, PEER_ADDR);
    }

    #[test]
    fn test_route_administration() {
        let h = Harness::new();
        let gw = Ipv4Addr::new(10, 0, 0, 254);
        let any = Ipv4Addr::UNSPECIFIED;
        h.stack.add_route(any, any, Some(gw), "eth0").unwrap();
        assert_eq!(h.stack.routes().len(), 2);
        assert_eq!(
            h.stack.add_route(any, any, Some(gw), "eth9"),
            Err(RouteError::NoSuchDevice)
        );
        h.stack.delete_route(any, any, Some(gw), "eth0").unwrap();
        assert_eq!(
            h.stack.delete_route(any, any, Some(gw), "eth0"),
            Err(RouteError::NotFound)
        );
        assert_eq!(h.stack.purge_routes("eth0"), Ok(1));
        assert!(h.stack.routes().is_empty());
        assert_eq!(h.stack.interface_names(), alloc::vec![String::from("eth0")]);
        assert_eq!(h.stack.interface_address("eth0").unwrap().address, LOCAL_ADDR);
    }

    #[test]
    fn test_loopback_ping_reaches_raw_socket() {
        let stack = loopback_stack();
        let raw = stack.raw_socket(1).unwrap();
        raw.send_to(&echo_request(b"ping"), Ipv4Addr::LOCALHOST).unwrap();
        assert!(stack.poll() >= 2);

        let mut buf = [0u8; 128];
        let (n, _) = raw.recv_from(&mut buf).unwrap();
        let (_, body) = parse_ipv4(&buf[..n]).unwrap();
        assert_eq!(parse_icmp(body).unwrap().0.icmp_type, ICMP_TYPE_ECHO_REQUEST);

        let (n, from) = raw.recv_from(&mut buf).unwrap();
        assert_eq!(from, Ipv4Addr::LOCALHOST);
        let (reply, data) = parse_icmp(&buf[IPV4_HEADER_LEN..n]).unwrap();
        assert_eq!(reply.icmp_type, ICMP_TYPE_ECHO_REPLY);
        assert_eq!(data, b"ping");
    }

    #[test]
    fn test_loopback_udp() {
        let stack = loopback_stack();
        let server = stack.udp_socket();
        server
            .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53))
            .unwrap();
        let client = stack.udp_socket();
        client
            .send_to(b"query", SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53))
            .unwrap();
        stack.poll();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(from.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(from.port, client.local_addr().port);
    }

    #[test]
    fn test_loopback_tcp_session() {
        let stack = loopback_stack();
        let listener = stack.tcp_socket();
        listener
            .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80))
            .unwrap();
        listener.listen(4).unwrap();

        let client = stack.tcp_socket();
        assert!(matches!(
            client.connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80)),
            Err(SocketError::WouldBlock)
        ));
        stack.poll();
        assert_eq!(client.state(), TcpState::Established);
        let server = listener.accept().unwrap();
        assert_eq!(server.peer_addr().unwrap(), client.local_addr());

        assert_eq!(client.send(b"hello over lo").unwrap(), 13);
        stack.poll();
        let mut buf = [0u8; 32];
        assert_eq!(server.recv(&mut buf).unwrap(), 13);
        assert_eq!(&buf[..13], b"hello over lo");

        client.close();
        stack.poll();
        assert_eq!(server.recv(&mut buf).unwrap(), 0);
        assert_eq!(server.state(), TcpState::CloseWait);
        server.close();
        stack.poll();
        assert_eq!(server.state(), TcpState::Closed);
        assert_eq!(client.state(), TcpState::TimeWait);
    }
}
