//! TCP wire format, state names and sequence arithmetic.
//!
//! This module holds everything about TCP that does not need a connection:
//! header parsing and serialization, the MSS option, checksums, the RFC 793
//! state enum, modular sequence comparisons, the error type and counters.
//! The engine itself lives in `tcp_cb` (control block), `tcp_input`,
//! `tcp_output`, `tcp_timer` and `tcp_registry`.
//!
//! # TCP Header Format (RFC 793)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                        Sequence Number                        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                     Acknowledgment Number                     |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Data  |       |U|A|P|R|S|F|                                   |
//! | Offs  | Resv  |R|C|S|S|Y|I|            Window                 |
//! |       |       |G|K|H|T|N|N|                                   |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           Checksum            |         Urgent Pointer        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Options (if data offset > 5)               |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! Only the MSS option (kind 2, length 4) is interpreted; every other option
//! is skipped by its length byte.
//!
//! # State Machine
//!
//! ```text
//! CLOSED --connect--> SYN_SENT --SYN+ACK--> ESTABLISHED
//! LISTEN --SYN--> (child) SYN_RCVD --ACK--> ESTABLISHED
//! ESTABLISHED --close--> FIN_WAIT_1 --ACK--> FIN_WAIT_2 --FIN--> TIME_WAIT
//! ESTABLISHED --FIN--> CLOSE_WAIT --close--> LAST_ACK --ACK--> CLOSED
//! FIN_WAIT_1 --FIN--> CLOSING --ACK--> TIME_WAIT --2MSL--> CLOSED
//! ```
//!
//! # References
//!
//! - RFC 793: Transmission Control Protocol
//! - RFC 1122: Requirements for Internet Hosts
//! - RFC 5681: TCP Congestion Control
//! - RFC 6298: Computing TCP's Retransmission Timer

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::{BufferError, PacketBuffer};
use crate::ipv4::{pseudo_header_checksum, Ipv4Addr};

// ============================================================================
// TCP Constants
// ============================================================================

/// TCP header minimum length in bytes (without options)
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// TCP header maximum length in bytes (with options)
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// IP protocol number for TCP
pub const TCP_PROTO: u8 = 6;

/// Default MSS when the peer sends no MSS option (RFC 1122)
pub const TCP_DEFAULT_MSS: u16 = 536;

/// Largest window representable without window scaling
pub const TCP_MAX_WINDOW: u32 = 65535;

/// IP + TCP header overhead subtracted from the MTU to get the MSS
pub const TCP_IP_OVERHEAD: usize = 40;

/// MSS option kind
pub const TCP_OPT_MSS: u8 = 2;

/// MSS option length
pub const TCP_OPT_MSS_LEN: u8 = 4;

/// Initial slow start threshold
pub const TCP_INITIAL_SSTHRESH: u32 = 65535;

/// Upper bound on the congestion window
pub const TCP_MAX_CWND: u32 = 1 << 20;

// ============================================================================
// TCP Flags
// ============================================================================

/// FIN flag - No more data from sender
pub const TCP_FLAG_FIN: u8 = 0x01;
/// SYN flag - Synchronize sequence numbers
pub const TCP_FLAG_SYN: u8 = 0x02;
/// RST flag - Reset the connection
pub const TCP_FLAG_RST: u8 = 0x04;
/// PSH flag - Push function
pub const TCP_FLAG_PSH: u8 = 0x08;
/// ACK flag - Acknowledgment field significant
pub const TCP_FLAG_ACK: u8 = 0x10;
/// URG flag - Urgent pointer field significant (never generated)
pub const TCP_FLAG_URG: u8 = 0x20;

// ============================================================================
// TCP State Machine
// ============================================================================

/// TCP connection state per RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection state at all
    Closed,
    /// Waiting for a connection request from any remote TCP
    Listen,
    /// Waiting for a matching connection request after having sent one
    SynSent,
    /// Waiting for confirming connection request acknowledgment
    SynReceived,
    /// Open connection, data can be exchanged
    Established,
    /// Waiting for a connection termination request from remote TCP
    /// (after local close)
    FinWait1,
    /// Waiting for a connection termination request from remote TCP
    FinWait2,
    /// Waiting for a connection termination request from local user
    CloseWait,
    /// Waiting for connection termination request acknowledgment from remote TCP
    Closing,
    /// Waiting for acknowledgment of connection termination request
    LastAck,
    /// Waiting for enough time to pass to be sure remote TCP received
    /// acknowledgment of its connection termination request
    TimeWait,
}

impl TcpState {
    /// Check if the application may queue data
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Check if the connection accepts payload from the peer
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }

    /// Check if the connection is closed or closing
    pub fn is_closed(&self) -> bool {
        matches!(self, TcpState::Closed | TcpState::TimeWait)
    }

    /// Check if the connection is synchronized (after handshake)
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
        )
    }

    /// Check if our SYN is outstanding (SYN_SENT or SYN_RCVD)
    pub fn is_handshaking(&self) -> bool {
        matches!(self, TcpState::SynSent | TcpState::SynReceived)
    }

    /// Check if we have already queued our FIN
    pub fn fin_queued(&self) -> bool {
        matches!(
            self,
            TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

// ============================================================================
// TCP Header
// ============================================================================

/// Parsed TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq_num: u32,
    /// Acknowledgment number (valid if ACK flag set)
    pub ack_num: u32,
    /// Data offset in 32-bit words (5-15)
    pub data_offset: u8,
    /// Control flags
    pub flags: u8,
    /// Receive window size
    pub window: u16,
    /// Checksum
    pub checksum: u16,
    /// Urgent pointer (ignored)
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Create a new TCP header with the given parameters
    pub fn new(
        src_port: u16,
        dst_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u8,
        window: u16,
    ) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            data_offset: 5,
            flags,
            window,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & TCP_FLAG_PSH != 0
    }

    /// Serialize the fixed 20-byte part (checksum field as stored)
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_MIN_LEN] {
        let mut bytes = [0u8; TCP_HEADER_MIN_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        bytes[12] = self.data_offset << 4;
        bytes[13] = self.flags;
        bytes[14..16].copy_from_slice(&self.window.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }
}

/// A validated inbound segment.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub header: TcpHeader,
    /// Peer MSS from the options, if present.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Sequence space consumed: payload plus one for each of SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.header.is_syn() {
            len += 1;
        }
        if self.header.is_fin() {
            len += 1;
        }
        len
    }
}

// ============================================================================
// TCP Errors
// ============================================================================

/// Errors from TCP parsing and connection operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Packet is too short
    Truncated,
    /// Invalid header length (data offset)
    InvalidHeaderLen,
    /// Checksum verification failed
    BadChecksum,
    /// Peer answered our SYN with RST
    ConnectionRefused,
    /// Connection reset by peer
    ConnectionReset,
    /// Retransmission limit reached
    TimedOut,
    /// Local address/port already bound
    AddressInUse,
    /// No route to the destination
    NetworkUnreachable,
    /// Send after shutdown
    BrokenPipe,
    /// Non-blocking operation cannot complete now
    WouldBlock,
    /// Operation needs an established connection
    NotConnected,
    /// Registry or port space exhausted
    ResourceExhausted,
    /// Operation not valid in the current state
    InvalidState,
    /// Connection already exists
    AlreadyConnected,
    /// Payload does not fit the path
    MessageTooLarge,
}

/// Result type for TCP operations
pub type TcpResult<T> = Result<T, TcpError>;

// ============================================================================
// TCP Statistics
// ============================================================================

/// TCP stack statistics
#[derive(Debug, Default)]
pub struct TcpStats {
    /// Total segments received
    pub rx_segments: AtomicU64,
    /// Total segments sent
    pub tx_segments: AtomicU64,
    /// Segments dropped (invalid or unacceptable)
    pub rx_dropped: AtomicU64,
    /// Checksum errors
    pub checksum_errors: AtomicU64,
    /// RSTs generated
    pub rst_sent: AtomicU64,
    /// Connections established
    pub connections_established: AtomicU64,
    /// Connections reset by peer
    pub connections_reset: AtomicU64,
    /// Connections aborted by the retransmission limit
    pub connections_timed_out: AtomicU64,
    /// Retransmitted segments (timer and fast retransmit)
    pub retransmissions: AtomicU64,
    /// Fast retransmits triggered by duplicate ACKs
    pub fast_retransmits: AtomicU64,
    /// Segments received out of order (discarded)
    pub out_of_order: AtomicU64,
    /// SYNs dropped because the accept backlog was full
    pub listen_overflows: AtomicU64,
}

impl TcpStats {
    /// Create new statistics
    pub const fn new() -> Self {
        Self {
            rx_segments: AtomicU64::new(0),
            tx_segments: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            rst_sent: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_reset: AtomicU64::new(0),
            connections_timed_out: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            fast_retransmits: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            listen_overflows: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter.
    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// ============================================================================
// TCP Parsing Functions
// ============================================================================

/// Parse TCP header from raw bytes
///
/// Validates the minimum length and the data offset. Does NOT verify the
/// checksum (the caller does, with the pseudo-header addresses).
///
/// # Arguments
///
/// * `data` - Raw TCP segment bytes
///
/// # Returns
///
/// Parsed header on success
pub fn parse_tcp_header(data: &[u8]) -> TcpResult<TcpHeader> {
    if data.len() < TCP_HEADER_MIN_LEN {
        return Err(TcpError::Truncated);
    }

    let data_offset = (data[12] >> 4) & 0x0F;
    if data_offset < 5 {
        return Err(TcpError::InvalidHeaderLen);
    }
    if data.len() < (data_offset as usize) * 4 {
        return Err(TcpError::Truncated);
    }

    Ok(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// Extract the MSS option from the option bytes of `data`.
///
/// Returns `None` when absent, malformed, or zero.
pub fn parse_mss_option(data: &[u8], header: &TcpHeader) -> Option<u16> {
    let header_len = header.header_len();
    if header_len <= TCP_HEADER_MIN_LEN || data.len() < header_len {
        return None;
    }

    let opts = &data[TCP_HEADER_MIN_LEN..header_len];
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            TCP_OPT_MSS => {
                if i + 4 <= opts.len() && opts[i + 1] == TCP_OPT_MSS_LEN {
                    let mss = u16::from_be_bytes([opts[i + 2], opts[i + 3]]);
                    return if mss == 0 { None } else { Some(mss) };
                }
                break;
            }
            _ => {
                if i + 1 >= opts.len() {
                    break;
                }
                let len = opts[i + 1] as usize;
                if len < 2 {
                    break;
                }
                match i.checked_add(len) {
                    Some(next) if next <= opts.len() => i = next,
                    _ => break,
                }
            }
        }
    }
    None
}

/// Parse a full segment: header, MSS option and payload.
pub fn parse_tcp_segment(data: &[u8]) -> TcpResult<TcpSegment<'_>> {
    let header = parse_tcp_header(data)?;
    let mss = parse_mss_option(data, &header);
    Ok(TcpSegment {
        header,
        mss,
        payload: &data[header.header_len()..],
    })
}

/// Compute TCP checksum using IPv4 pseudo-header
///
/// # Arguments
///
/// * `src_ip` - Source IPv4 address
/// * `dst_ip` - Destination IPv4 address
/// * `tcp_data` - Complete TCP segment (header + payload)
pub fn compute_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_data: &[u8]) -> u16 {
    pseudo_header_checksum(src_ip, dst_ip, TCP_PROTO, tcp_data)
}

/// Verify TCP checksum; a valid segment sums to zero.
pub fn verify_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_data: &[u8]) -> bool {
    compute_tcp_checksum(src_ip, dst_ip, tcp_data) == 0
}

/// Build a checksummed TCP segment in a fresh `PacketBuffer` with headroom
/// for the IP and link headers.
///
/// # Arguments
///
/// * `src_ip` / `dst_ip` - Pseudo-header addresses
/// * `header` - Fixed header; `data_offset` and `checksum` are recomputed
/// * `mss` - Emit an MSS option (SYN segments only)
/// * `payload` - Payload pieces, concatenated in order
pub fn build_tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    header: &TcpHeader,
    mss: Option<u16>,
    payload: &[&[u8]],
) -> Result<PacketBuffer, BufferError> {
    let opt_len = if mss.is_some() { TCP_OPT_MSS_LEN as usize } else { 0 };
    let header_len = TCP_HEADER_MIN_LEN + opt_len;
    let payload_len: usize = payload.iter().map(|p| p.len()).sum();

    let mut hdr = *header;
    hdr.data_offset = (header_len / 4) as u8;
    hdr.checksum = 0;

    let mut buf = PacketBuffer::for_payload(header_len + payload_len);
    buf.append_slice(&hdr.to_bytes())?;
    if let Some(mss) = mss {
        let m = mss.to_be_bytes();
        buf.append_slice(&[TCP_OPT_MSS, TCP_OPT_MSS_LEN, m[0], m[1]])?;
    }
    for piece in payload {
        buf.append_slice(piece)?;
    }

    let checksum = compute_tcp_checksum(src_ip, dst_ip, buf.payload());
    buf.payload_mut()[16..18].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

// ============================================================================
// Sequence Number Arithmetic (RFC 793 Section 3.3)
// ============================================================================

/// Check if sequence number a is less than b (with wraparound)
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Check if sequence number a is less than or equal to b (with wraparound)
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Check if sequence number a is greater than b (with wraparound)
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Check if sequence number a is greater than or equal to b (with wraparound)
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Larger of two sequence numbers.
#[inline]
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_gt(a, b) {
        a
    } else {
        b
    }
}

/// Check if sequence number seq is within window [left, left+size)
#[inline]
pub fn seq_in_window(seq: u32, left: u32, size: u32) -> bool {
    size != 0 && seq.wrapping_sub(left) < size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_header_parsing() {
        // SYN packet
        let syn = [
            0x00, 0x50, // src port 80
            0x1F, 0x90, // dst port 8080
            0x00, 0x00, 0x00, 0x01, // seq 1
            0x00, 0x00, 0x00, 0x00, // ack 0
            0x50, // data offset 5 (20 bytes)
            0x02, // SYN flag
            0xFF, 0xFF, // window 65535
            0x00, 0x00, // checksum (placeholder)
            0x00, 0x00, // urgent ptr
        ];

        let header = parse_tcp_header(&syn).unwrap();
        assert_eq!(header.src_port, 80);
        assert_eq!(header.dst_port, 8080);
        assert_eq!(header.seq_num, 1);
        assert_eq!(header.ack_num, 0);
        assert!(header.is_syn());
        assert!(!header.is_ack());
        assert_eq!(parse_mss_option(&syn, &header), None);

        let mut bad = syn;
        bad[12] = 0x40;
        assert_eq!(parse_tcp_header(&bad), Err(TcpError::InvalidHeaderLen));
        assert_eq!(parse_tcp_header(&syn[..19]), Err(TcpError::Truncated));
    }

    #[test]
    fn test_build_with_mss_and_checksum() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let hdr = TcpHeader::new(1234, 80, 7, 0, TCP_FLAG_SYN, 8192);
        let seg = build_tcp_segment(src, dst, &hdr, Some(1460), &[b"ab", b"c"]).unwrap();
        let bytes = seg.payload();
        assert!(verify_tcp_checksum(src, dst, bytes));
        assert!(!verify_tcp_checksum(src, Ipv4Addr::new(10, 0, 0, 3), bytes));

        let parsed = parse_tcp_segment(bytes).unwrap();
        assert_eq!(parsed.header.header_len(), 24);
        assert_eq!(parsed.mss, Some(1460));
        assert_eq!(parsed.payload, b"abc");
        assert_eq!(parsed.seq_len(), 4);
    }

    #[test]
    fn test_unknown_options_are_skipped() {
        let hdr = TcpHeader {
            data_offset: 7,
            ..TcpHeader::new(1, 2, 0, 0, TCP_FLAG_SYN, 0)
        };
        let mut seg = hdr.to_bytes().to_vec();
        // NOP, window scale (kind 3 len 3), MSS 1000, EOL
        seg.extend_from_slice(&[1, 3, 3, 7, 2, 4, 0x03, 0xe8, 0, 0, 0, 0]);
        seg.truncate(28);
        assert_eq!(parse_mss_option(&seg, &hdr), Some(1000));
    }

    #[test]
    fn test_seq_arithmetic() {
        // Normal case
        assert!(seq_lt(100, 200));
        assert!(seq_le(100, 100));
        assert!(seq_gt(200, 100));
        assert!(seq_ge(200, 200));

        // Wraparound case
        assert!(seq_lt(0xFFFFFFFF, 0));
        assert!(seq_gt(0, 0xFFFFFFFF));
        assert!(seq_lt(0xFFFF_FFF0, 0x10));
        assert!(seq_le(0xFFFF_FFF0, 0x10));
        assert!(seq_gt(0x10, 0xFFFF_FFF0));
        assert!(seq_ge(0x10, 0xFFFF_FFF0));
        assert_eq!(seq_max(0xFFFF_FFF0, 0x10), 0x10);

        assert!(seq_in_window(0x5, 0xFFFF_FFFE, 16));
        assert!(!seq_in_window(0x20, 0xFFFF_FFFE, 16));
        assert!(!seq_in_window(7, 7, 0));
    }

    #[test]
    fn test_tcp_state() {
        assert!(!TcpState::Closed.can_send());
        assert!(TcpState::Established.can_send());
        assert!(TcpState::Established.can_receive());
        assert!(!TcpState::TimeWait.can_receive());
        assert!(TcpState::SynReceived.is_handshaking());
        assert!(TcpState::LastAck.fin_queued());
        assert_eq!(alloc::format!("{}", TcpState::FinWait2), "FIN_WAIT_2");
    }
}
