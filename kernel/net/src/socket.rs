//! Socket layer.
//!
//! `Socket` wraps one of the three transports behind a common `SocketOps`
//! contract. Every transport operation is non-blocking; the `*_blocking`
//! helpers retry an operation while it reports `WouldBlock`, sleeping on
//! the socket's `WaitQueue` between attempts.
//!
//! # Blocking
//!
//! ```text
//! attempt ──Ok/Err──▶ return
//!    │ WouldBlock
//!    ▼
//! wait_with_timeout ──Woken──▶ attempt
//!    │ TimedOut / Closed
//!    ▼
//! error
//! ```

use crate::ip::IpTxError;
use crate::iface::IfaceError;
use crate::ipv4::SocketAddrV4;
use crate::raw::RawSocket;
use crate::route::RouteError;
use crate::tcp::{TcpError, TcpState};
use crate::tcp_socket::TcpSocket;
use crate::udp::{UdpError, UdpSocket};
use crate::wait::{WaitOutcome, WaitQueue};

// ============================================================================
// Readiness
// ============================================================================

bitflags::bitflags! {
    /// Readiness mask reported by `select`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollMask: u32 {
        /// Data (or EOF, or a connection to accept) is available
        const READ = 0x0001;
        /// Send space is available
        const WRITE = 0x0002;
        /// A pending error will be reported by the next operation
        const ERROR = 0x0004;
        /// The connection is finished
        const HUP = 0x0008;
    }
}

// ============================================================================
// Socket Errors
// ============================================================================

/// Socket operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Operation would block on a non-blocking socket
    WouldBlock,
    /// Operation needs a connected socket
    NotConnected,
    /// Peer refused the connection
    ConnectionRefused,
    /// Connection reset by peer
    ConnectionReset,
    /// Connection or blocking wait timed out
    TimedOut,
    /// Local address already bound
    AddressInUse,
    /// Local address not assigned to any interface
    AddressNotAvailable,
    /// No route to the destination
    NetworkUnreachable,
    /// Send after shutdown
    BrokenPipe,
    /// Invalid argument (bad address, already bound, ...)
    InvalidArgument,
    /// Invalid socket state for the requested operation
    InvalidState,
    /// Connection already established or in progress
    AlreadyConnected,
    /// Payload exceeds protocol size limits
    MessageTooLarge,
    /// Fixed-size table exhausted
    ResourceExhausted,
    /// Transmit queue full
    NoBufferSpace,
    /// Socket is closed
    Closed,
    /// Operation not available on this transport
    OperationNotSupported,
    /// Interface name does not resolve
    NoSuchDevice,
    /// Entry to delete does not exist
    NotFound,
    /// Entry already exists
    AlreadyExists,
}

impl From<TcpError> for SocketError {
    fn from(e: TcpError) -> Self {
        match e {
            TcpError::ConnectionRefused => SocketError::ConnectionRefused,
            TcpError::ConnectionReset => SocketError::ConnectionReset,
            TcpError::TimedOut => SocketError::TimedOut,
            TcpError::AddressInUse => SocketError::AddressInUse,
            TcpError::NetworkUnreachable => SocketError::NetworkUnreachable,
            TcpError::BrokenPipe => SocketError::BrokenPipe,
            TcpError::WouldBlock => SocketError::WouldBlock,
            TcpError::NotConnected => SocketError::NotConnected,
            TcpError::ResourceExhausted => SocketError::ResourceExhausted,
            TcpError::InvalidState => SocketError::InvalidState,
            TcpError::AlreadyConnected => SocketError::AlreadyConnected,
            TcpError::MessageTooLarge => SocketError::MessageTooLarge,
            TcpError::Truncated | TcpError::InvalidHeaderLen | TcpError::BadChecksum => {
                SocketError::InvalidArgument
            }
        }
    }
}

impl From<UdpError> for SocketError {
    fn from(e: UdpError) -> Self {
        match e {
            UdpError::PayloadTooLarge => SocketError::MessageTooLarge,
            UdpError::QueueFull => SocketError::NoBufferSpace,
            _ => SocketError::InvalidArgument,
        }
    }
}

impl From<IpTxError> for SocketError {
    fn from(e: IpTxError) -> Self {
        match e {
            IpTxError::NetworkUnreachable => SocketError::NetworkUnreachable,
            IpTxError::MessageTooLarge => SocketError::MessageTooLarge,
            IpTxError::NoBufferSpace => SocketError::NoBufferSpace,
        }
    }
}

impl From<RouteError> for SocketError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NoSuchDevice => SocketError::NoSuchDevice,
            RouteError::ResourceExhausted => SocketError::ResourceExhausted,
            RouteError::NotFound => SocketError::NotFound,
        }
    }
}

impl From<IfaceError> for SocketError {
    fn from(e: IfaceError) -> Self {
        match e {
            IfaceError::NoSuchDevice => SocketError::NoSuchDevice,
            IfaceError::ResourceExhausted => SocketError::ResourceExhausted,
            IfaceError::AlreadyExists => SocketError::AlreadyExists,
        }
    }
}

// ============================================================================
// Common Contract
// ============================================================================

/// Operations every transport provides.
///
/// Raw sockets use port 0 in their addresses.
pub trait SocketOps {
    fn bind(&self, local: SocketAddrV4) -> Result<(), SocketError>;

    /// Connect (TCP) or set the default peer (UDP). TCP returns
    /// `WouldBlock` until the handshake completes.
    fn connect(&self, remote: SocketAddrV4) -> Result<(), SocketError>;

    /// Send to `dst`, or to the connected peer when `dst` is `None`.
    fn send_to(&self, data: &[u8], dst: Option<SocketAddrV4>) -> Result<usize, SocketError>;

    /// Receive into `buf`; the sender is reported for datagram transports.
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddrV4>), SocketError>;

    fn select(&self, want: PollMask) -> PollMask;

    fn local_addr(&self) -> SocketAddrV4;

    fn peer_addr(&self) -> Result<SocketAddrV4, SocketError>;

    fn close(&self);

    /// Queue posted on every readiness change.
    fn events(&self) -> &WaitQueue;
}

impl SocketOps for TcpSocket {
    fn bind(&self, local: SocketAddrV4) -> Result<(), SocketError> {
        TcpSocket::bind(self, local)
    }

    fn connect(&self, remote: SocketAddrV4) -> Result<(), SocketError> {
        TcpSocket::connect(self, remote)
    }

    /// The destination of a stream is fixed by `connect`; `dst` is ignored.
    fn send_to(&self, data: &[u8], _dst: Option<SocketAddrV4>) -> Result<usize, SocketError> {
        self.send(data)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddrV4>), SocketError> {
        self.recv(buf).map(|n| (n, None))
    }

    fn select(&self, want: PollMask) -> PollMask {
        TcpSocket::select(self, want)
    }

    fn local_addr(&self) -> SocketAddrV4 {
        TcpSocket::local_addr(self)
    }

    fn peer_addr(&self) -> Result<SocketAddrV4, SocketError> {
        TcpSocket::peer_addr(self)
    }

    fn close(&self) {
        TcpSocket::close(self)
    }

    fn events(&self) -> &WaitQueue {
        TcpSocket::events(self)
    }
}

impl SocketOps for UdpSocket {
    fn bind(&self, local: SocketAddrV4) -> Result<(), SocketError> {
        UdpSocket::bind(self, local)
    }

    fn connect(&self, remote: SocketAddrV4) -> Result<(), SocketError> {
        UdpSocket::connect(self, remote)
    }

    fn send_to(&self, data: &[u8], dst: Option<SocketAddrV4>) -> Result<usize, SocketError> {
        match dst {
            Some(dst) => UdpSocket::send_to(self, data, dst),
            None => self.send(data),
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddrV4>), SocketError> {
        UdpSocket::recv_from(self, buf).map(|(n, from)| (n, Some(from)))
    }

    fn select(&self, want: PollMask) -> PollMask {
        UdpSocket::select(self, want)
    }

    fn local_addr(&self) -> SocketAddrV4 {
        UdpSocket::local_addr(self)
    }

    fn peer_addr(&self) -> Result<SocketAddrV4, SocketError> {
        UdpSocket::peer_addr(self)
    }

    fn close(&self) {
        UdpSocket::close(self)
    }

    fn events(&self) -> &WaitQueue {
        UdpSocket::events(self)
    }
}

impl SocketOps for RawSocket {
    fn bind(&self, local: SocketAddrV4) -> Result<(), SocketError> {
        RawSocket::bind(self, local.ip)
    }

    fn connect(&self, _remote: SocketAddrV4) -> Result<(), SocketError> {
        Err(SocketError::OperationNotSupported)
    }

    fn send_to(&self, data: &[u8], dst: Option<SocketAddrV4>) -> Result<usize, SocketError> {
        let dst = dst.ok_or(SocketError::InvalidArgument)?;
        RawSocket::send_to(self, data, dst.ip)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddrV4>), SocketError> {
        RawSocket::recv_from(self, buf).map(|(n, from)| (n, Some(SocketAddrV4::new(from, 0))))
    }

    fn select(&self, want: PollMask) -> PollMask {
        RawSocket::select(self, want)
    }

    fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(RawSocket::local_addr(self), 0)
    }

    fn peer_addr(&self) -> Result<SocketAddrV4, SocketError> {
        Err(SocketError::NotConnected)
    }

    fn close(&self) {
        RawSocket::close(self)
    }

    fn events(&self) -> &WaitQueue {
        RawSocket::events(self)
    }
}

// ============================================================================
// Socket
// ============================================================================

/// Socket type requested at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// TCP
    Stream,
    /// UDP
    Datagram,
    /// Raw IP with the given protocol number
    Raw(u8),
}

/// Transport behind a socket.
pub enum Transport {
    Tcp(TcpSocket),
    Udp(UdpSocket),
    RawIp(RawSocket),
}

/// A socket of any transport.
pub struct Socket {
    transport: Transport,
}

impl From<TcpSocket> for Socket {
    fn from(sock: TcpSocket) -> Self {
        Socket {
            transport: Transport::Tcp(sock),
        }
    }
}

impl From<UdpSocket> for Socket {
    fn from(sock: UdpSocket) -> Self {
        Socket {
            transport: Transport::Udp(sock),
        }
    }
}

impl From<RawSocket> for Socket {
    fn from(sock: RawSocket) -> Self {
        Socket {
            transport: Transport::RawIp(sock),
        }
    }
}

impl Socket {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn kind(&self) -> SocketKind {
        match &self.transport {
            Transport::Tcp(_) => SocketKind::Stream,
            Transport::Udp(_) => SocketKind::Datagram,
            Transport::RawIp(raw) => SocketKind::Raw(raw.protocol()),
        }
    }

    fn ops(&self) -> &dyn SocketOps {
        match &self.transport {
            Transport::Tcp(s) => s,
            Transport::Udp(s) => s,
            Transport::RawIp(s) => s,
        }
    }

    fn tcp(&self) -> Result<&TcpSocket, SocketError> {
        match &self.transport {
            Transport::Tcp(s) => Ok(s),
            _ => Err(SocketError::OperationNotSupported),
        }
    }

    /// Start listening (TCP only).
    pub fn listen(&self, backlog: usize) -> Result<(), SocketError> {
        self.tcp()?.listen(backlog)
    }

    /// Accept a finished connection (TCP only).
    pub fn accept(&self) -> Result<Socket, SocketError> {
        self.tcp()?.accept().map(Socket::from)
    }

    /// Close the send direction (TCP only).
    pub fn shutdown_write(&self) -> Result<(), SocketError> {
        self.tcp()?.shutdown_write()
    }

    /// TCP state, `None` for other transports.
    pub fn tcp_state(&self) -> Option<TcpState> {
        self.tcp().ok().map(|s| s.state())
    }

    pub fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        self.ops().send_to(data, None)
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.ops().recv_from(buf).map(|(n, _)| n)
    }

    // ========================================================================
    // Blocking Helpers
    // ========================================================================

    /// Connect and wait for the handshake.
    ///
    /// # Arguments
    /// * `timeout_ns` - `Some(0)` polls, `Some(n)` waits up to n ns per
    ///   wakeup, `None` waits indefinitely
    pub fn connect_blocking(
        &self,
        remote: SocketAddrV4,
        timeout_ns: Option<u64>,
    ) -> Result<(), SocketError> {
        block_on(self.events(), timeout_ns, || self.connect(remote))
    }

    pub fn accept_blocking(&self, timeout_ns: Option<u64>) -> Result<Socket, SocketError> {
        block_on(self.events(), timeout_ns, || self.accept())
    }

    pub fn send_blocking(&self, data: &[u8], timeout_ns: Option<u64>) -> Result<usize, SocketError> {
        block_on(self.events(), timeout_ns, || self.send(data))
    }

    pub fn recv_blocking(&self, buf: &mut [u8], timeout_ns: Option<u64>) -> Result<usize, SocketError> {
        let events = self.ops().events();
        loop {
            match self.recv(buf) {
                Err(SocketError::WouldBlock) => {}
                other => return other,
            }
            wait_once(events, timeout_ns)?;
        }
    }
}

impl SocketOps for Socket {
    fn bind(&self, local: SocketAddrV4) -> Result<(), SocketError> {
        self.ops().bind(local)
    }

    fn connect(&self, remote: SocketAddrV4) -> Result<(), SocketError> {
        self.ops().connect(remote)
    }

    fn send_to(&self, data: &[u8], dst: Option<SocketAddrV4>) -> Result<usize, SocketError> {
        self.ops().send_to(data, dst)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddrV4>), SocketError> {
        self.ops().recv_from(buf)
    }

    fn select(&self, want: PollMask) -> PollMask {
        self.ops().select(want)
    }

    fn local_addr(&self) -> SocketAddrV4 {
        self.ops().local_addr()
    }

    fn peer_addr(&self) -> Result<SocketAddrV4, SocketError> {
        self.ops().peer_addr()
    }

    fn close(&self) {
        self.ops().close()
    }

    fn events(&self) -> &WaitQueue {
        self.ops().events()
    }
}

/// Sleep once on `events`, translating the outcome.
fn wait_once(events: &WaitQueue, timeout_ns: Option<u64>) -> Result<(), SocketError> {
    match events.wait_with_timeout(timeout_ns) {
        WaitOutcome::Woken => Ok(()),
        WaitOutcome::TimedOut if timeout_ns == Some(0) => Err(SocketError::WouldBlock),
        WaitOutcome::TimedOut => Err(SocketError::TimedOut),
        WaitOutcome::Closed => Err(SocketError::Closed),
        WaitOutcome::NoProcess => Err(SocketError::WouldBlock),
    }
}

/// Retry `attempt` until it stops reporting `WouldBlock`.
fn block_on<R>(
    events: &WaitQueue,
    timeout_ns: Option<u64>,
    mut attempt: impl FnMut() -> Result<R, SocketError>,
) -> Result<R, SocketError> {
    loop {
        match attempt() {
            Err(SocketError::WouldBlock) => {}
            other => return other,
        }
        wait_once(events, timeout_ns)?;
    }
}

// ============================================================================
// Tests
// ============================================================================
