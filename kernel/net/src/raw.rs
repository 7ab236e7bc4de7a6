//! Raw IP sockets.
//!
//! A raw socket is bound to one IP protocol number and optionally a local
//! address. Every datagram delivered to this host with that protocol (and,
//! when bound, that destination) is copied to the socket, IP header
//! included, before normal transport dispatch. The table is fixed at
//! `MAX_RAW_SOCKETS` entries.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::buffer::{HeaderAnchor, PacketBuffer};
use crate::fragment::Datagram;
use crate::ip::{IpTxParams, NetStats};
use crate::ipv4::{Ipv4Addr, IPV4_HEADER_LEN};
use crate::socket::{PollMask, SocketError};
use crate::stack::NetStack;
use crate::wait::{SocketWaitHooks, WaitQueue};

/// Maximum number of raw sockets
pub const MAX_RAW_SOCKETS: usize = 32;

/// Datagrams a raw socket queues before new copies are dropped
pub const RAW_RECV_QUEUE_LIMIT: usize = 32;

/// A copy of a delivered datagram.
#[derive(Debug, Clone)]
pub struct RawDatagram {
    pub from: Ipv4Addr,
    /// IP header followed by the payload, with the `Network` and
    /// `Transport` anchors set.
    pub packet: PacketBuffer,
}

pub(crate) struct RawEndpoint {
    proto: u8,
    bound: Mutex<Ipv4Addr>,
    queue: Mutex<VecDeque<RawDatagram>>,
    events: WaitQueue,
}

impl RawEndpoint {
    fn matches(&self, proto: u8, dst: Ipv4Addr) -> bool {
        if self.proto != proto {
            return false;
        }
        let bound = *self.bound.lock();
        bound.is_unspecified() || bound == dst
    }
}

/// The raw socket table.
pub struct RawTable {
    sockets: Mutex<Vec<Arc<RawEndpoint>>>,
    hooks: Option<Arc<dyn SocketWaitHooks>>,
}

impl RawTable {
    pub fn new(hooks: Option<Arc<dyn SocketWaitHooks>>) -> Self {
        RawTable {
            sockets: Mutex::new(Vec::new()),
            hooks,
        }
    }

    fn open(&self, proto: u8) -> Result<Arc<RawEndpoint>, SocketError> {
        let mut sockets = self.sockets.lock();
        if sockets.len() >= MAX_RAW_SOCKETS {
            log::warn!(target: "net::ip", "raw socket table full");
            return Err(SocketError::ResourceExhausted);
        }
        let endpoint = Arc::new(RawEndpoint {
            proto,
            bound: Mutex::new(Ipv4Addr::UNSPECIFIED),
            queue: Mutex::new(VecDeque::new()),
            events: WaitQueue::new(self.hooks.clone()),
        });
        sockets.push(endpoint.clone());
        Ok(endpoint)
    }

    fn remove(&self, endpoint: &Arc<RawEndpoint>) {
        self.sockets.lock().retain(|e| !Arc::ptr_eq(e, endpoint));
    }

    /// Number of open raw sockets.
    pub fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Copy `dgram` to every matching socket. Returns how many got a copy.
    pub(crate) fn deliver(&self, dgram: &Datagram, stats: &NetStats) -> usize {
        let targets: Vec<Arc<RawEndpoint>> = self
            .sockets
            .lock()
            .iter()
            .filter(|e| e.matches(dgram.header.protocol, dgram.header.dst))
            .cloned()
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let Some(packet) = rebuild_packet(dgram) else {
            return 0;
        };

        let mut delivered = 0;
        for endpoint in targets {
            {
                let mut queue = endpoint.queue.lock();
                if queue.len() >= RAW_RECV_QUEUE_LIMIT {
                    continue;
                }
                queue.push_back(RawDatagram {
                    from: dgram.header.src,
                    packet: packet.clone(),
                });
            }
            NetStats::inc(&stats.raw_delivered);
            endpoint.events.post();
            delivered += 1;
        }
        delivered
    }
}

/// Lay a reassembled datagram back out as header plus payload in one
/// buffer, anchored so each copy can find both headers.
fn rebuild_packet(dgram: &Datagram) -> Option<PacketBuffer> {
    let mut header = dgram.header;
    header.total_len = (IPV4_HEADER_LEN + dgram.payload.len()).min(u16::MAX as usize) as u16;

    let mut packet = PacketBuffer::new(IPV4_HEADER_LEN + dgram.payload.len(), 0);
    packet.append_slice(&header.to_bytes()).ok()?;
    packet.append_slice(&dgram.payload).ok()?;
    packet.mark_header(HeaderAnchor::Network);
    packet.pull(IPV4_HEADER_LEN).ok()?;
    packet.mark_header(HeaderAnchor::Transport);
    // Uncover the IP header again; it stays part of what the socket reads.
    packet.prepend(IPV4_HEADER_LEN).ok()?;
    Some(packet)
}

/// A raw IP socket handle.
pub struct RawSocket {
    stack: Arc<NetStack>,
    endpoint: Arc<RawEndpoint>,
}

impl RawSocket {
    pub(crate) fn open(stack: Arc<NetStack>, proto: u8) -> Result<Self, SocketError> {
        let endpoint = stack.raw.open(proto)?;
        Ok(RawSocket { stack, endpoint })
    }

    pub fn protocol(&self) -> u8 {
        self.endpoint.proto
    }

    pub fn events(&self) -> &WaitQueue {
        &self.endpoint.events
    }

    /// Restrict delivery to datagrams addressed to `addr`, and use it as the
    /// source of outgoing datagrams.
    pub fn bind(&self, addr: Ipv4Addr) -> Result<(), SocketError> {
        if !addr.is_unspecified() && !self.stack.ip.ifaces.is_local(addr) {
            return Err(SocketError::AddressNotAvailable);
        }
        *self.endpoint.bound.lock() = addr;
        Ok(())
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        *self.endpoint.bound.lock()
    }

    /// Send `data` as the payload of one IP datagram with this socket's
    /// protocol.
    pub fn send_to(&self, data: &[u8], dst: Ipv4Addr) -> Result<usize, SocketError> {
        if dst.is_unspecified() {
            return Err(SocketError::InvalidArgument);
        }
        let src = Some(self.local_addr()).filter(|a| !a.is_unspecified());
        let payload = PacketBuffer::from_slice(data, crate::DEFAULT_HEADROOM);
        self.stack
            .ip
            .ip_tx_msg(&IpTxParams::new(src, dst, self.endpoint.proto), payload)?;
        Ok(data.len())
    }

    /// Take the oldest datagram copy as a buffer.
    pub fn recv_packet(&self) -> Result<RawDatagram, SocketError> {
        if self.endpoint.events.is_closed() {
            return Err(SocketError::Closed);
        }
        self.endpoint
            .queue
            .lock()
            .pop_front()
            .ok_or(SocketError::WouldBlock)
    }

    /// Take the oldest datagram copy (IP header included). Bytes that do not
    /// fit `buf` are discarded.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr), SocketError> {
        let dgram = self.recv_packet()?;
        let packet = dgram.packet.payload();
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok((n, dgram.from))
    }

    pub fn select(&self, want: PollMask) -> PollMask {
        let mut mask = PollMask::WRITE;
        if !self.endpoint.queue.lock().is_empty() {
            mask |= PollMask::READ;
        }
        mask & (want | PollMask::ERROR | PollMask::HUP)
    }

    pub fn close(&self) {
        self.stack.raw.remove(&self.endpoint);
        self.endpoint.queue.lock().clear();
        self.endpoint.events.close();
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        self.close();
    }
}
