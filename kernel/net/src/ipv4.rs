//! IPv4 wire format.
//!
//! Addresses, the 20-byte header, the Internet checksum and the parse/build
//! helpers shared by the receive and transmit pipelines.
//!
//! IP options are not supported: any header whose IHL is not 5 is rejected.
//!
//! # References
//! - RFC 791: Internet Protocol
//! - RFC 1071: Computing the Internet Checksum

use core::fmt;

/// IPv4 header length in bytes (IHL == 5, options unsupported)
pub const IPV4_HEADER_LEN: usize = 20;

/// Largest value representable by the total-length field.
pub const IPV4_MAX_TOTAL_LEN: usize = 65535;

/// Don't Fragment flag (in the flags/fragment-offset word)
pub const IP_FLAG_DF: u16 = 0x4000;

/// More Fragments flag
pub const IP_FLAG_MF: u16 = 0x2000;

/// Fragment offset mask (8-byte units)
pub const IP_OFFSET_MASK: u16 = 0x1fff;

// ============================================================================
// IPv4 Protocol Numbers
// ============================================================================

/// IPv4 protocol numbers handled by the stack
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Proto {
    /// ICMP (Internet Control Message Protocol)
    Icmp = 1,
    /// TCP (Transmission Control Protocol)
    Tcp = 6,
    /// UDP (User Datagram Protocol)
    Udp = 17,
}

impl Ipv4Proto {
    /// Try to convert from raw protocol number
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            1 => Some(Ipv4Proto::Icmp),
            6 => Some(Ipv4Proto::Tcp),
            17 => Some(Ipv4Proto::Udp),
            _ => None,
        }
    }

    /// Get raw protocol number
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// IPv4 Address
// ============================================================================

/// IPv4 address (4 bytes, network order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// Create from 4 octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    /// All zeros (0.0.0.0), also the wildcard address
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

    /// Loopback (127.0.0.1)
    pub const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    /// Broadcast (255.255.255.255)
    pub const BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

    /// Check if this is a multicast address (224.0.0.0/4)
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    /// Check if this is the broadcast address (255.255.255.255)
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255, 255, 255, 255]
    }

    /// Check if this is the unspecified address (0.0.0.0)
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    /// Check if this is a loopback address (127.0.0.0/8)
    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }

    /// Check if a peer may use this address as the source of a connection.
    ///
    /// Broadcast, multicast and the unspecified address never identify a
    /// single host.
    #[inline]
    pub fn is_valid_source(&self) -> bool {
        !(self.is_broadcast() || self.is_multicast() || self.is_unspecified())
    }

    /// Get the raw bytes
    #[inline]
    pub fn octets(&self) -> [u8; 4] {
        self.0
    }

    /// Host-order integer view.
    #[inline]
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Apply `netmask` to this address.
    #[inline]
    pub fn mask(self, netmask: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::from(self.to_u32() & netmask.to_u32())
    }

    /// Number of bits set in this address when used as a netmask.
    #[inline]
    pub fn prefix_len(self) -> u32 {
        self.to_u32().count_ones()
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Ipv4Addr(bytes)
    }
}

impl From<u32> for Ipv4Addr {
    fn from(ip: u32) -> Self {
        Ipv4Addr(ip.to_be_bytes())
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Transport endpoint: address plus port.
///
/// 0.0.0.0 and port 0 act as wildcards in bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SocketAddrV4 {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl SocketAddrV4 {
    pub const UNSPECIFIED: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        SocketAddrV4 { ip, port }
    }
}

impl fmt::Display for SocketAddrV4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// ============================================================================
// IPv4 Header
// ============================================================================

/// Parsed IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Type of Service (priority / DSCP + ECN)
    pub tos: u8,
    /// Total length of the IP packet (header + payload)
    pub total_len: u16,
    /// Identification for fragmentation
    pub identification: u16,
    /// Flags (3 bits) + Fragment offset (13 bits)
    pub flags_fragment: u16,
    /// Time to Live
    pub ttl: u8,
    /// Protocol number
    pub protocol: u8,
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Get the payload length in bytes
    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(IPV4_HEADER_LEN)
    }

    /// Check if this packet has the "Don't Fragment" flag set
    #[inline]
    pub fn dont_fragment(&self) -> bool {
        self.flags_fragment & IP_FLAG_DF != 0
    }

    /// Check if this packet has the "More Fragments" flag set
    #[inline]
    pub fn more_fragments(&self) -> bool {
        self.flags_fragment & IP_FLAG_MF != 0
    }

    /// Get the fragment offset (in 8-byte units)
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        self.flags_fragment & IP_OFFSET_MASK
    }

    /// Check if this is a fragment
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// Get the protocol as enum if known
    #[inline]
    pub fn proto(&self) -> Option<Ipv4Proto> {
        Ipv4Proto::from_raw(self.protocol)
    }

    /// Serialize to wire format with a freshly computed checksum.
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut hdr = [0u8; IPV4_HEADER_LEN];
        hdr[0] = 0x45;
        hdr[1] = self.tos;
        hdr[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        hdr[4..6].copy_from_slice(&self.identification.to_be_bytes());
        hdr[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        hdr[8] = self.ttl;
        hdr[9] = self.protocol;
        hdr[12..16].copy_from_slice(&self.src.0);
        hdr[16..20].copy_from_slice(&self.dst.0);

        let checksum = compute_checksum(&hdr, IPV4_HEADER_LEN);
        hdr[10..12].copy_from_slice(&checksum.to_be_bytes());
        hdr
    }
}

// ============================================================================
// IPv4 Errors
// ============================================================================

/// Errors that can occur during IPv4 parsing/validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    /// Packet is too short
    Truncated,
    /// IP version is not 4
    BadVersion,
    /// Header carries options (IHL != 5)
    OptionsUnsupported,
    /// Total length field doesn't match packet size
    BadTotalLen,
    /// Header checksum is incorrect
    ChecksumMismatch,
    /// TTL is zero
    InvalidTtl,
}

// ============================================================================
// Checksum Calculation
// ============================================================================

/// Compute the Internet checksum (one's complement sum) over `data`.
///
/// When computing over a header that includes the checksum field, the result
/// is 0 if the checksum is valid.
///
/// # Arguments
/// * `data` - The data to checksum
/// * `len` - Number of bytes to include (will be capped to data.len())
///
/// # Returns
/// The 16-bit checksum value
pub fn compute_checksum(data: &[u8], len: usize) -> u16 {
    let capped = core::cmp::min(data.len(), len);
    checksum_finish(checksum_accumulate(0, &data[..capped]))
}

/// Add `data` to a running 32-bit one's complement sum.
///
/// An odd trailing byte is padded with zero, so only the final chunk passed
/// to a running sum may have odd length.
pub fn checksum_accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold a running sum to 16 bits and complement it.
pub fn checksum_finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of a transport segment including the IPv4 pseudo-header
/// (RFC 793 section 3.1, RFC 768).
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut sum = checksum_accumulate(0, &src.0);
    sum = checksum_accumulate(sum, &dst.0);
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    checksum_finish(checksum_accumulate(sum, segment))
}

// ============================================================================
// IPv4 Parsing
// ============================================================================

/// Parse and validate an IPv4 packet.
///
/// Validation order:
/// - Version check (must be 4)
/// - Header length (IHL must be exactly 5)
/// - Total length against the buffer
/// - TTL check (must be > 0)
/// - Header checksum
///
/// Trailing link-layer padding beyond `total_len` is excluded from the
/// returned payload.
///
/// # Returns
/// On success: (header, payload_slice)
pub fn parse_ipv4(packet: &[u8]) -> Result<(Ipv4Header, &[u8]), Ipv4Error> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(Ipv4Error::Truncated);
    }

    let version = packet[0] >> 4;
    let ihl = packet[0] & 0x0f;
    if version != 4 {
        return Err(Ipv4Error::BadVersion);
    }
    if ihl != 5 {
        return Err(Ipv4Error::OptionsUnsupported);
    }

    let total_len = u16::from_be_bytes([packet[2], packet[3]]);
    if (total_len as usize) > packet.len() {
        return Err(Ipv4Error::Truncated);
    }
    if (total_len as usize) < IPV4_HEADER_LEN {
        return Err(Ipv4Error::BadTotalLen);
    }

    let ttl = packet[8];
    if ttl == 0 {
        return Err(Ipv4Error::InvalidTtl);
    }

    if compute_checksum(&packet[..IPV4_HEADER_LEN], IPV4_HEADER_LEN) != 0 {
        return Err(Ipv4Error::ChecksumMismatch);
    }

    let hdr = Ipv4Header {
        tos: packet[1],
        total_len,
        identification: u16::from_be_bytes([packet[4], packet[5]]),
        flags_fragment: u16::from_be_bytes([packet[6], packet[7]]),
        ttl,
        protocol: packet[9],
        src: Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]),
        dst: Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]),
    };

    Ok((hdr, &packet[IPV4_HEADER_LEN..total_len as usize]))
}

// ============================================================================
// Tests
// ============================================================================
