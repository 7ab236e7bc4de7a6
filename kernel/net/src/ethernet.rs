//! Ethernet II framing.

use core::fmt;

use crate::buffer::{BufferError, PacketBuffer};

/// Ethernet header length in bytes
pub const ETH_HEADER_LEN: usize = 14;

/// EtherType for IPv4
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// EtherType for ARP
pub const ETHERTYPE_ARP: u16 = 0x0806;

// ============================================================================
// Ethernet Address
// ============================================================================

/// 6-byte Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    /// All zeros (used by loopback)
    pub const ZERO: EthAddr = EthAddr([0; 6]);

    /// ff:ff:ff:ff:ff:ff
    pub const BROADCAST: EthAddr = EthAddr([0xff; 6]);

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

// ============================================================================
// Header
// ============================================================================

/// Parsed Ethernet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: EthAddr,
    pub src: EthAddr,
    pub ethertype: u16,
}

/// Ethernet parse errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthError {
    /// Frame shorter than the header
    Truncated,
}

impl EthHeader {
    /// Serialize into the first 14 bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(&self.dst.0);
        out[6..12].copy_from_slice(&self.src.0);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
}

/// Parse an Ethernet frame into header and payload.
pub fn parse_ethernet(frame: &[u8]) -> Result<(EthHeader, &[u8]), EthError> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(EthError::Truncated);
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    let hdr = EthHeader {
        dst: EthAddr(dst),
        src: EthAddr(src),
        ethertype: u16::from_be_bytes([frame[12], frame[13]]),
    };
    Ok((hdr, &frame[ETH_HEADER_LEN..]))
}

/// Prepend an Ethernet header to `buf` in place.
pub fn build_ethernet_frame(buf: &mut PacketBuffer, hdr: &EthHeader) -> Result<(), BufferError> {
    hdr.write(buf.prepend(ETH_HEADER_LEN)?);
    Ok(())
}
