//! ICMP (Internet Control Message Protocol) for IPv4.
//!
//! The stack answers echo requests and emits destination-unreachable when a
//! datagram names a UDP port nobody listens on. Inbound error messages are
//! counted and dropped.
//!
//! # Message Format (RFC 792)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |     Type      |     Code      |           Checksum            |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Rest of header (type specific)             |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! # Rules (RFC 1122 section 3.2.2)
//!
//! - Never answer a datagram sent to a broadcast or multicast address
//! - Never send an error in response to an ICMP error
//! - Never send an error about a datagram with an invalid source

use crate::buffer::PacketBuffer;
use crate::fragment::Datagram;
use crate::ip::{IpLayer, IpTxParams, NetStats};
use crate::ipv4::{compute_checksum, Ipv4Proto, IPV4_HEADER_LEN};
use crate::stack::{DropReason, ProcessResult};

/// ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// Echo reply
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
/// Destination unreachable
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
/// Source quench (deprecated, still an error type)
pub const ICMP_TYPE_SOURCE_QUENCH: u8 = 4;
/// Redirect
pub const ICMP_TYPE_REDIRECT: u8 = 5;
/// Echo request
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
/// Time exceeded
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;
/// Parameter problem
pub const ICMP_TYPE_PARAMETER_PROBLEM: u8 = 12;

/// Destination unreachable: protocol unreachable
pub const ICMP_CODE_PROTO_UNREACHABLE: u8 = 2;
/// Destination unreachable: port unreachable
pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

/// Bytes of the offending datagram's payload quoted in an error.
const ERROR_QUOTE_LEN: usize = 8;

// ============================================================================
// Header
// ============================================================================

/// Parsed ICMP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// Type-specific word (identifier and sequence for echo)
    pub rest: [u8; 4],
}

impl IcmpHeader {
    pub fn to_bytes(&self) -> [u8; ICMP_HEADER_LEN] {
        let mut bytes = [0u8; ICMP_HEADER_LEN];
        bytes[0] = self.icmp_type;
        bytes[1] = self.code;
        bytes[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }

    /// Whether this message reports an error about another datagram.
    #[inline]
    pub fn is_error(&self) -> bool {
        is_error_type(self.icmp_type)
    }
}

/// ICMP parse errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Shorter than the fixed header
    Truncated,
    /// Checksum over the message does not verify
    ChecksumInvalid,
}

/// Whether `icmp_type` is one of the error message types.
pub fn is_error_type(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        ICMP_TYPE_DEST_UNREACHABLE
            | ICMP_TYPE_SOURCE_QUENCH
            | ICMP_TYPE_REDIRECT
            | ICMP_TYPE_TIME_EXCEEDED
            | ICMP_TYPE_PARAMETER_PROBLEM
    )
}

/// Parse and verify an ICMP message.
///
/// # Returns
/// On success: (header, body after the 8-byte header)
pub fn parse_icmp(message: &[u8]) -> Result<(IcmpHeader, &[u8]), IcmpError> {
    if message.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }
    if compute_checksum(message, message.len()) != 0 {
        return Err(IcmpError::ChecksumInvalid);
    }
    let mut rest = [0u8; 4];
    rest.copy_from_slice(&message[4..8]);
    let hdr = IcmpHeader {
        icmp_type: message[0],
        code: message[1],
        checksum: u16::from_be_bytes([message[2], message[3]]),
        rest,
    };
    Ok((hdr, &message[ICMP_HEADER_LEN..]))
}

/// Write `hdr` and `body` into a fresh buffer and fill in the checksum.
fn build_message(hdr: IcmpHeader, body: &[&[u8]]) -> PacketBuffer {
    let body_len: usize = body.iter().map(|b| b.len()).sum();
    let mut buf = PacketBuffer::for_payload(ICMP_HEADER_LEN + body_len);
    let mut hdr = hdr;
    hdr.checksum = 0;
    // Sized by for_payload above.
    let _ = buf.append_slice(&hdr.to_bytes());
    for piece in body {
        let _ = buf.append_slice(piece);
    }
    let checksum = compute_checksum(buf.payload(), buf.size());
    buf.payload_mut()[2..4].copy_from_slice(&checksum.to_be_bytes());
    buf
}

/// Build the echo reply for a verified echo request: same identifier,
/// sequence and data.
pub fn build_echo_reply(request: &IcmpHeader, data: &[u8]) -> PacketBuffer {
    build_message(
        IcmpHeader {
            icmp_type: ICMP_TYPE_ECHO_REPLY,
            code: 0,
            checksum: 0,
            rest: request.rest,
        },
        &[data],
    )
}

/// Build a destination-unreachable message quoting the offending datagram's
/// IP header and the first 8 bytes of its payload.
pub fn build_dest_unreachable(code: u8, ip_header: &[u8], payload: &[u8]) -> PacketBuffer {
    let quote = &payload[..payload.len().min(ERROR_QUOTE_LEN)];
    build_message(
        IcmpHeader {
            icmp_type: ICMP_TYPE_DEST_UNREACHABLE,
            code,
            checksum: 0,
            rest: [0; 4],
        },
        &[ip_header, quote],
    )
}

// ============================================================================
// Protocol Processing
// ============================================================================

/// Handle an ICMP message delivered to this host.
pub(crate) fn icmp_input(ip: &IpLayer, dgram: &Datagram) -> ProcessResult {
    NetStats::inc(&ip.stats.icmp_rx);
    let (hdr, body) = match parse_icmp(&dgram.payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            NetStats::inc(&ip.stats.rx_errors);
            return ProcessResult::Dropped(DropReason::IcmpError(e));
        }
    };

    match hdr.icmp_type {
        ICMP_TYPE_ECHO_REQUEST => {
            let dst = dgram.header.dst;
            if dst.is_broadcast() || dst.is_multicast() || !ip.ifaces.is_local(dst) {
                return ProcessResult::Handled;
            }
            let reply = build_echo_reply(&hdr, body);
            let params = IpTxParams::new(Some(dst), dgram.header.src, Ipv4Proto::Icmp.to_raw());
            match ip.ip_tx_msg(&params, reply) {
                Ok(()) => NetStats::inc(&ip.stats.icmp_echo_tx),
                Err(e) => {
                    log::debug!(target: "net::ip", "echo reply to {} failed: {:?}", dgram.header.src, e)
                }
            }
            ProcessResult::Handled
        }
        t if is_error_type(t) => {
            log::debug!(
                target: "net::ip",
                "icmp error type={} code={} from {}",
                t,
                hdr.code,
                dgram.header.src
            );
            ProcessResult::Handled
        }
        _ => ProcessResult::Handled,
    }
}

/// Report `dgram` as undeliverable to its sender.
///
/// Silently does nothing when the rules above forbid an error.
pub(crate) fn send_dest_unreachable(ip: &IpLayer, dgram: &Datagram, code: u8) {
    let hdr = &dgram.header;
    if hdr.dst.is_broadcast() || hdr.dst.is_multicast() || !hdr.src.is_valid_source() {
        return;
    }
    if hdr.protocol == Ipv4Proto::Icmp.to_raw() {
        let is_error = dgram.payload.first().map_or(true, |t| is_error_type(*t));
        if is_error {
            return;
        }
    }
    if !ip.ifaces.is_local(hdr.dst) {
        return;
    }

    let mut quoted = *hdr;
    quoted.total_len = (IPV4_HEADER_LEN + dgram.payload.len()).min(u16::MAX as usize) as u16;
    let message = build_dest_unreachable(code, &quoted.to_bytes(), &dgram.payload);
    let params = IpTxParams::new(Some(hdr.dst), hdr.src, Ipv4Proto::Icmp.to_raw());
    if ip.ip_tx_msg(&params, message).is_ok() {
        NetStats::inc(&ip.stats.icmp_unreach_tx);
    }
}

// ============================================================================
// Tests
// ============================================================================
