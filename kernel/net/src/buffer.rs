//! Network packet buffer implementation.
//!
//! This module provides the packet buffer passed between every layer of the
//! stack, with independent headroom and tailroom so headers can be prepended
//! and payload appended without copying.

use alloc::vec;
use alloc::vec::Vec;

use crate::DEFAULT_HEADROOM;

// ============================================================================
// Errors
// ============================================================================

/// Errors from buffer composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Not enough headroom or tailroom for the requested operation.
    NoRoom,
}

// ============================================================================
// Header Anchors
// ============================================================================

/// Named header positions a layer can record inside a buffer.
///
/// Each anchor is stored relative to its parent (link relative to the start
/// of the allocation, network relative to link, transport relative to
/// network) so a cloned buffer carries valid anchors without rebasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAnchor {
    /// Ethernet header.
    Link = 0,
    /// IPv4 header.
    Network = 1,
    /// TCP/UDP/ICMP header.
    Transport = 2,
}

impl HeaderAnchor {
    #[inline]
    fn parent(self) -> Option<HeaderAnchor> {
        match self {
            HeaderAnchor::Link => None,
            HeaderAnchor::Network => Some(HeaderAnchor::Link),
            HeaderAnchor::Transport => Some(HeaderAnchor::Network),
        }
    }
}

// ============================================================================
// PacketBuffer
// ============================================================================

/// A packet buffer with headroom/tailroom management.
///
/// # Memory Layout
///
/// ```text
/// +-------------+------------------+-------------+
/// |  headroom   |     payload      |  tailroom   |
/// +-------------+------------------+-------------+
/// ^             ^                  ^             ^
/// |             |                  |             |
/// 0             payload_start      payload_end   capacity
/// ```
///
/// Invariant: `0 <= payload_start <= payload_end <= capacity`.
///
/// Ownership moves down the pipeline: a layer that hands a buffer to the next
/// layer gives it up. `clone()` is a deep copy used for fan-out.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    storage: Vec<u8>,
    payload_start: usize,
    payload_end: usize,
    /// Relative header offsets, indexed by `HeaderAnchor`.
    anchors: [Option<usize>; 3],
}

impl PacketBuffer {
    /// Create an empty buffer of `capacity` bytes with `headroom` reserved.
    ///
    /// `headroom` is clamped to `capacity`.
    pub fn new(capacity: usize, headroom: usize) -> Self {
        let headroom = headroom.min(capacity);
        PacketBuffer {
            storage: vec![0u8; capacity],
            payload_start: headroom,
            payload_end: headroom,
            anchors: [None; 3],
        }
    }

    /// Create a buffer holding a copy of `data` with `headroom` spare bytes in
    /// front of it and no tailroom.
    pub fn from_slice(data: &[u8], headroom: usize) -> Self {
        let mut buf = PacketBuffer::new(headroom + data.len(), headroom);
        buf.storage[headroom..].copy_from_slice(data);
        buf.payload_end = headroom + data.len();
        buf
    }

    /// Create a buffer for a received frame (no headroom needed).
    pub fn from_frame(frame: &[u8]) -> Self {
        PacketBuffer::from_slice(frame, 0)
    }

    /// Create an empty buffer with the default headroom for outgoing headers
    /// and `payload` bytes of tailroom.
    pub fn for_payload(payload: usize) -> Self {
        PacketBuffer::new(DEFAULT_HEADROOM + payload, DEFAULT_HEADROOM)
    }

    /// Returns the current payload length.
    #[inline]
    pub fn size(&self) -> usize {
        self.payload_end - self.payload_start
    }

    /// Returns true if the buffer holds no payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload_end == self.payload_start
    }

    /// Returns the total allocation size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns the available headroom (bytes before the payload).
    #[inline]
    pub fn headroom(&self) -> usize {
        self.payload_start
    }

    /// Returns the available tailroom (bytes after the payload).
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.payload_end
    }

    /// Returns an immutable view of the payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.storage[self.payload_start..self.payload_end]
    }

    /// Returns a mutable view of the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.payload_start..self.payload_end]
    }

    /// Grow the payload at the tail, returning the new region.
    ///
    /// # Arguments
    ///
    /// * `len` - Number of bytes to append
    ///
    /// # Returns
    ///
    /// The zero-initialized appended region, or `BufferError::NoRoom` if the
    /// tailroom is too small.
    pub fn append(&mut self, len: usize) -> Result<&mut [u8], BufferError> {
        if len > self.tailroom() {
            return Err(BufferError::NoRoom);
        }
        let start = self.payload_end;
        self.payload_end += len;
        let region = &mut self.storage[start..self.payload_end];
        region.fill(0);
        Ok(region)
    }

    /// Append a copy of `data` at the tail.
    pub fn append_slice(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.append(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Grow the payload at the head, returning the new region.
    ///
    /// # Returns
    ///
    /// The prepended region, or `BufferError::NoRoom` if the headroom is too
    /// small. The buffer is unchanged on failure.
    pub fn prepend(&mut self, len: usize) -> Result<&mut [u8], BufferError> {
        if len > self.payload_start {
            return Err(BufferError::NoRoom);
        }
        self.payload_start -= len;
        Ok(&mut self.storage[self.payload_start..self.payload_start + len])
    }

    /// Consume `len` bytes from the head of the payload.
    pub fn pull(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.size() {
            return Err(BufferError::NoRoom);
        }
        self.payload_start += len;
        Ok(())
    }

    /// Cut the payload down to `len` bytes. Longer values are a no-op.
    pub fn truncate(&mut self, len: usize) {
        if len < self.size() {
            self.payload_end = self.payload_start + len;
        }
    }

    // ========================================================================
    // Header anchors
    // ========================================================================

    /// Record the current payload start as the position of `anchor`.
    pub fn mark_header(&mut self, anchor: HeaderAnchor) {
        let base = anchor
            .parent()
            .and_then(|p| self.header_offset(p))
            .unwrap_or(0);
        self.anchors[anchor as usize] = Some(self.payload_start.saturating_sub(base));
    }

    /// Forget a recorded anchor.
    pub fn clear_header(&mut self, anchor: HeaderAnchor) {
        self.anchors[anchor as usize] = None;
    }

    /// Absolute offset of `anchor` within the allocation.
    pub fn header_offset(&self, anchor: HeaderAnchor) -> Option<usize> {
        let rel = self.anchors[anchor as usize]?;
        let base = match anchor.parent() {
            Some(parent) => self.header_offset(parent).unwrap_or(0),
            None => 0,
        };
        let abs = base + rel;
        if abs <= self.payload_end {
            Some(abs)
        } else {
            None
        }
    }

    /// Bytes from `anchor` up to the end of the payload.
    pub fn header(&self, anchor: HeaderAnchor) -> Option<&[u8]> {
        let start = self.header_offset(anchor)?;
        Some(&self.storage[start..self.payload_end])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_consumes_headroom() {
        let mut buf = PacketBuffer::new(64, 20);
        buf.append_slice(b"payload").unwrap();
        buf.prepend(20).unwrap().copy_from_slice(&[0xAA; 20]);
        assert_eq!(buf.headroom(), 0);
        assert_eq!(buf.size(), 27);
        assert_eq!(&buf.payload()[20..], b"payload");
        assert_eq!(buf.prepend(1), Err(BufferError::NoRoom));
        assert_eq!(buf.size(), 27);
    }

    #[test]
    fn test_append_fails_without_tailroom() {
        let mut buf = PacketBuffer::new(8, 4);
        assert!(buf.append(4).is_ok());
        assert_eq!(buf.append(1).err(), Some(BufferError::NoRoom));
    }

    #[test]
    fn test_truncate_and_pull() {
        let mut buf = PacketBuffer::from_slice(&[1, 2, 3, 4, 5, 6], 0);
        buf.pull(2).unwrap();
        assert_eq!(buf.payload(), &[3, 4, 5, 6]);
        buf.truncate(2);
        assert_eq!(buf.payload(), &[3, 4]);
        buf.truncate(10);
        assert_eq!(buf.size(), 2);
        assert!(buf.pull(3).is_err());
    }

    #[test]
    fn test_anchors_survive_clone() {
        let mut buf = PacketBuffer::from_frame(&[0u8; 14 + 20 + 8]);
        buf.mark_header(HeaderAnchor::Link);
        buf.pull(14).unwrap();
        buf.mark_header(HeaderAnchor::Network);
        buf.pull(20).unwrap();
        buf.mark_header(HeaderAnchor::Transport);

        let copy = buf.clone();
        drop(buf);
        assert_eq!(copy.header_offset(HeaderAnchor::Link), Some(0));
        assert_eq!(copy.header_offset(HeaderAnchor::Network), Some(14));
        assert_eq!(copy.header_offset(HeaderAnchor::Transport), Some(34));
        assert_eq!(copy.header(HeaderAnchor::Network).map(|h| h.len()), Some(28));
    }
}
