//! In-kernel IPv4 protocol stack
//!
//! This crate provides the protocol engine of the kernel network subsystem:
//! - Packet buffers with headroom for in-place header prepending
//! - Interfaces, a longest-prefix-match routing table and IP fragmentation
//!   and reassembly
//! - ICMP echo and destination-unreachable handling
//! - UDP, raw IP and TCP sockets (RFC 793 state machine with RFC 5681
//!   congestion control, delayed ACKs, zero-window probing)
//!
//! # Design
//!
//! All state hangs off one [`NetStack`] value; nothing is global. The
//! platform supplies the pieces the stack does not own:
//! - [`NetDevice`] drivers that transmit frames and feed received frames to
//!   [`NetStack::receive`]
//! - an [`AddressResolver`] (ARP) consulted by the transmit worker
//! - a [`Clock`], and optionally a [`TxKick`] and [`SocketWaitHooks`] that
//!   connect the stack to the scheduler
//!
//! Outbound datagrams are queued by `ip_tx_msg`; `run_tx_queue` resolves
//! and transmits them on the worker context. Timers are driven from outside:
//! `tcp_tick` every `tick_ms`, `ip_do_tick` once a second.
//!
//! # Example
//!
//! ```ignore
//! let stack = NetStack::new(StackConfig::default(), arp, clock);
//! stack.add_interface("eth0", nic, IfaceFlags::UP)?;
//! stack.set_interface_address("eth0", Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 0))?;
//! stack.add_route(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 255, 255, 0), None, "eth0")?;
//!
//! let sock = stack.tcp_socket();
//! sock.connect(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80))?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer;
pub mod config;
pub mod device;
pub mod ethernet;
pub mod fragment;
pub mod icmp;
pub mod iface;
pub mod ip;
pub mod ipv4;
pub mod lockdep;
pub mod raw;
pub mod ring;
pub mod route;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod tcp_cb;
mod tcp_input;
mod tcp_output;
pub mod tcp_registry;
pub mod tcp_socket;
mod tcp_timer;
pub mod udp;
pub mod wait;

#[cfg(test)]
mod testutil;

pub use buffer::{BufferError, HeaderAnchor, PacketBuffer};
pub use config::StackConfig;
pub use device::{
    AddressResolver, Clock, LoopbackDevice, NetDevice, Resolution, TxError, TxKick, DEFAULT_MTU,
};
pub use ethernet::{EthAddr, EthError, EthHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4};
pub use fragment::{FragmentDropReason, FragmentStats};
pub use icmp::{IcmpError, IcmpHeader};
pub use iface::{IfaceAddr, IfaceError, IfaceFlags, IfaceId, InterfaceInfo};
pub use ip::{IpTxError, IpTxParams, NetStats};
pub use ipv4::{Ipv4Addr, Ipv4Error, Ipv4Header, Ipv4Proto, SocketAddrV4};
pub use raw::RawSocket;
pub use route::{Route, RouteError};
pub use socket::{PollMask, Socket, SocketError, SocketKind, SocketOps};
pub use stack::{DropReason, NetStack, ProcessResult};
pub use tcp::{TcpError, TcpState, TcpStats};
pub use tcp_socket::TcpSocket;
pub use udp::{UdpError, UdpSocket, UdpStats};
pub use wait::{SocketWaitHooks, WaitOutcome, WaitQueue};

/// Default headroom reserved for protocol headers (Ethernet + IP + TCP/UDP).
/// 14 (Ethernet) + 20 (IP) + 20 (TCP) + 4 (MSS option) = 58, rounded up
/// to 64 for alignment.
pub const DEFAULT_HEADROOM: usize = 64;
