//! IPv4 fragment reassembly (RFC 815).
//!
//! A fixed pool of reassembly slots, one per in-flight datagram, keyed by
//! (src, dst, protocol, identification). Each slot tracks the byte ranges
//! still missing as a list of holes and copies fragments into a flat buffer
//! indexed by fragment offset.
//!
//! # Limits
//! - 16 slots; a fragment for a new datagram is dropped when all are busy
//! - Reassembled datagrams are limited to 65,515 payload bytes
//! - Incomplete datagrams are discarded after the configured timeout
//!   (`ip_do_tick` runs once per second); the sender is not notified
//!
//! # References
//! - RFC 791: Internet Protocol (fragmentation)
//! - RFC 815: IP Datagram Reassembly Algorithms

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::ipv4::{Ipv4Header, IPV4_HEADER_LEN, IPV4_MAX_TOTAL_LEN};

// ============================================================================
// Constants
// ============================================================================

/// Number of datagrams that can be reassembled concurrently.
pub const REASSEMBLY_SLOTS: usize = 16;

/// Maximum reassembled payload (65535 minus the 20-byte header).
pub const MAX_DATAGRAM_PAYLOAD: usize = IPV4_MAX_TOTAL_LEN - IPV4_HEADER_LEN;

/// Right edge of the initial hole ("infinity" in RFC 815).
const HOLE_INFINITY: usize = usize::MAX;

// ============================================================================
// Statistics
// ============================================================================

/// Fragment reassembly statistics
#[derive(Debug, Default)]
pub struct FragmentStats {
    /// Fragments received
    pub fragments_received: AtomicU64,
    /// Successfully reassembled packets
    pub reassembled: AtomicU64,
    /// Slots discarded by timeout
    pub timeout_drops: AtomicU64,
    /// Fragments dropped because no slot was free
    pub pool_exhausted_drops: AtomicU64,
    /// Fragments dropped - datagram too large
    pub too_large_drops: AtomicU64,
}

impl FragmentStats {
    pub const fn new() -> Self {
        Self {
            fragments_received: AtomicU64::new(0),
            reassembled: AtomicU64::new(0),
            timeout_drops: AtomicU64::new(0),
            pool_exhausted_drops: AtomicU64::new(0),
            too_large_drops: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Drop Reasons
// ============================================================================

/// Reason a fragment was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentDropReason {
    /// Fragment would exceed the maximum datagram size; its slot was discarded
    TooLarge,
    /// All reassembly slots are in use
    PoolExhausted,
    /// Fragment carries no data
    ZeroLength,
}

// ============================================================================
// Fragment Key
// ============================================================================

/// Key to identify a reassembly slot
///
/// Per RFC 791, fragments are identified by (src, dst, protocol, identification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentKey {
    pub src: [u8; 4],
    pub dst: [u8; 4],
    pub protocol: u8,
    pub identification: u16,
}

impl FragmentKey {
    /// Create key from IPv4 header
    pub fn from_header(hdr: &Ipv4Header) -> Self {
        Self {
            src: hdr.src.octets(),
            dst: hdr.dst.octets(),
            protocol: hdr.protocol,
            identification: hdr.identification,
        }
    }
}

// ============================================================================
// Reassembled Datagram
// ============================================================================

/// A complete datagram: synthesized header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub header: Ipv4Header,
    pub payload: Vec<u8>,
}

// ============================================================================
// Reassembly Slot
// ============================================================================

/// A missing byte range `[first, last]` (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    first: usize,
    last: usize,
}

struct ReassemblySlot {
    key: FragmentKey,
    /// Disjoint holes, ordered by `first`.
    holes: Vec<Hole>,
    /// Flat payload buffer, grown to the furthest byte seen.
    buffer: Vec<u8>,
    /// Header fields copied into the reassembled datagram.
    header: Ipv4Header,
    have_first: bool,
    /// Seconds left before the slot is discarded.
    timer: u32,
}

impl ReassemblySlot {
    fn new(key: FragmentKey, header: Ipv4Header, timeout: u32) -> Self {
        ReassemblySlot {
            key,
            holes: alloc::vec![Hole {
                first: 0,
                last: HOLE_INFINITY,
            }],
            buffer: Vec::new(),
            header,
            have_first: false,
            timer: timeout,
        }
    }

    /// Fill `[first, last]` with `data`, splitting holes as needed.
    fn insert(&mut self, first: usize, last: usize, more_fragments: bool, data: &[u8]) {
        let mut i = 0;
        while i < self.holes.len() {
            let hole = self.holes[i];
            if first > hole.last || last < hole.first {
                i += 1;
                continue;
            }

            self.holes.remove(i);
            let mut at = i;
            if first > hole.first {
                self.holes.insert(
                    at,
                    Hole {
                        first: hole.first,
                        last: first - 1,
                    },
                );
                at += 1;
            }
            if last < hole.last && more_fragments {
                self.holes.insert(
                    at,
                    Hole {
                        first: last + 1,
                        last: hole.last,
                    },
                );
                at += 1;
            }
            i = at;
        }

        if self.buffer.len() <= last {
            self.buffer.resize(last + 1, 0);
        }
        self.buffer[first..=last].copy_from_slice(data);
    }

    fn is_complete(&self) -> bool {
        self.holes.is_empty()
    }

    fn into_datagram(self) -> Datagram {
        let header = Ipv4Header {
            tos: self.header.tos,
            total_len: (IPV4_HEADER_LEN + self.buffer.len()) as u16,
            identification: self.header.identification,
            flags_fragment: 0,
            ttl: self.header.ttl,
            protocol: self.header.protocol,
            src: self.header.src,
            dst: self.header.dst,
        };
        Datagram {
            header,
            payload: self.buffer,
        }
    }
}

// ============================================================================
// Reassembler
// ============================================================================

/// Fixed-size reassembly pool.
pub struct Reassembler {
    slots: Mutex<[Option<ReassemblySlot>; REASSEMBLY_SLOTS]>,
    timeout_secs: u32,
    stats: FragmentStats,
}

impl Reassembler {
    /// Create an empty pool whose slots expire after `timeout_secs` ticks.
    pub fn new(timeout_secs: u32) -> Self {
        Reassembler {
            slots: Mutex::new(core::array::from_fn(|_| None)),
            timeout_secs: timeout_secs.max(1),
            stats: FragmentStats::new(),
        }
    }

    /// Feed one received datagram or fragment.
    ///
    /// # Arguments
    ///
    /// * `header` - Parsed IPv4 header of the fragment
    /// * `payload` - Fragment data (everything after the IP header)
    ///
    /// # Returns
    ///
    /// - `Ok(Some(datagram))` - the datagram is complete (immediately for
    ///   unfragmented input)
    /// - `Ok(None)` - fragment stored, holes remain
    /// - `Err(reason)` - fragment dropped
    pub fn reassemble(
        &self,
        header: &Ipv4Header,
        payload: &[u8],
    ) -> Result<Option<Datagram>, FragmentDropReason> {
        if !header.is_fragment() {
            return Ok(Some(Datagram {
                header: *header,
                payload: payload.to_vec(),
            }));
        }

        self.stats.fragments_received.fetch_add(1, Ordering::Relaxed);
        if payload.is_empty() {
            return Err(FragmentDropReason::ZeroLength);
        }

        let key = FragmentKey::from_header(header);
        let first = header.fragment_offset() as usize * 8;
        let last = first + payload.len() - 1;

        let mut slots = self.slots.lock();
        let existing = slots
            .iter()
            .position(|s| s.as_ref().map(|s| s.key == key).unwrap_or(false));

        if last >= MAX_DATAGRAM_PAYLOAD {
            if let Some(idx) = existing {
                slots[idx] = None;
            }
            self.stats.too_large_drops.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                target: "net::frag",
                "oversize fragment id={:#06x} from {}",
                header.identification,
                header.src
            );
            return Err(FragmentDropReason::TooLarge);
        }

        let idx = match existing {
            Some(idx) => idx,
            None => {
                let Some(free) = slots.iter().position(|s| s.is_none()) else {
                    self.stats
                        .pool_exhausted_drops
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(FragmentDropReason::PoolExhausted);
                };
                slots[free] = Some(ReassemblySlot::new(key, *header, self.timeout_secs));
                free
            }
        };

        let Some(slot) = slots[idx].as_mut() else {
            return Ok(None);
        };
        if first == 0 && !slot.have_first {
            slot.header = *header;
            slot.have_first = true;
        }
        slot.insert(first, last, header.more_fragments(), payload);
        if !slot.is_complete() {
            return Ok(None);
        }

        let Some(done) = slots[idx].take() else {
            return Ok(None);
        };
        self.stats.reassembled.fetch_add(1, Ordering::Relaxed);
        Ok(Some(done.into_datagram()))
    }

    /// Age every active slot by one second, discarding expired ones.
    ///
    /// Returns the number of slots discarded.
    pub fn tick(&self) -> usize {
        let mut expired = 0;
        let mut slots = self.slots.lock();
        for entry in slots.iter_mut() {
            let Some(slot) = entry.as_mut() else {
                continue;
            };
            slot.timer = slot.timer.saturating_sub(1);
            if slot.timer == 0 {
                log::debug!(
                    target: "net::frag",
                    "reassembly timeout id={:#06x} from {}",
                    slot.key.identification,
                    slot.header.src
                );
                *entry = None;
                expired += 1;
            }
        }
        self.stats
            .timeout_drops
            .fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    /// Number of slots currently in use.
    pub fn active_slots(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Get statistics
    pub fn stats(&self) -> &FragmentStats {
        &self.stats
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::{Ipv4Addr, IP_FLAG_MF};

    fn make_header(src: [u8; 4], id: u16, offset: u16, mf: bool) -> Ipv4Header {
        let flags_frag = if mf { IP_FLAG_MF | offset } else { offset };
        Ipv4Header {
            tos: 0x10,
            total_len: 0,
            identification: id,
            flags_fragment: flags_frag,
            ttl: 64,
            protocol: 17, // UDP
            src: Ipv4Addr(src),
            dst: Ipv4Addr([192, 168, 1, 1]),
        }
    }

    /// Split `payload` into fragments of `chunk` bytes (a multiple of 8).
    fn fragments(id: u16, payload: &[u8], chunk: usize) -> Vec<(Ipv4Header, Vec<u8>)> {
        let mut out = Vec::new();
        let mut off = 0;
        while off < payload.len() {
            let end = (off + chunk).min(payload.len());
            let mf = end < payload.len();
            out.push((
                make_header([10, 0, 0, 1], id, (off / 8) as u16, mf),
                payload[off..end].to_vec(),
            ));
            off = end;
        }
        out
    }

    /// All orderings of `0..n` (Heap's algorithm).
    fn permutations(n: usize) -> Vec<Vec<usize>> {
        fn heap(k: usize, items: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if k == 1 {
                out.push(items.clone());
                return;
            }
            heap(k - 1, items, out);
            for i in 0..k - 1 {
                if k % 2 == 0 {
                    items.swap(i, k - 1);
                } else {
                    items.swap(0, k - 1);
                }
                heap(k - 1, items, out);
            }
        }
        let mut items: Vec<usize> = (0..n).collect();
        let mut out = Vec::new();
        heap(n, &mut items, &mut out);
        out
    }

    #[test]
    fn test_fragment_key() {
        let hdr = make_header([10, 0, 0, 1], 0x1234, 0, true);
        let key = FragmentKey::from_header(&hdr);
        assert_eq!(key.src, [10, 0, 0, 1]);
        assert_eq!(key.identification, 0x1234);
    }

    #[test]
    fn test_unfragmented_passes_through() {
        let pool = Reassembler::new(15);
        let hdr = make_header([10, 0, 0, 1], 7, 0, false);
        let dgram = pool.reassemble(&hdr, &[9, 9, 9]).unwrap().unwrap();
        assert_eq!(dgram.payload, alloc::vec![9, 9, 9]);
        assert_eq!(pool.active_slots(), 0);
    }

    #[test]
    fn test_every_permutation_reassembles() {
        let payload: Vec<u8> = (0..100u8).collect();
        let frags = fragments(0x4242, &payload, 24);
        assert_eq!(frags.len(), 5);

        for order in permutations(frags.len()) {
            let pool = Reassembler::new(15);
            for (n, &i) in order.iter().enumerate() {
                let (hdr, data) = &frags[i];
                let result = pool.reassemble(hdr, data).unwrap();
                if n + 1 < order.len() {
                    assert!(result.is_none(), "completed early for {:?}", order);
                } else {
                    let dgram = result.expect("datagram should be complete");
                    assert_eq!(dgram.payload, payload);
                    assert_eq!(dgram.header.identification, 0x4242);
                    assert_eq!(dgram.header.tos, 0x10);
                    assert_eq!(dgram.header.ttl, 64);
                    assert_eq!(dgram.header.flags_fragment, 0);
                    assert_eq!(dgram.header.total_len as usize, 120);
                }
            }
            assert_eq!(pool.active_slots(), 0);
        }
    }

    #[test]
    fn test_timeout_discards_slot_and_frees_key() {
        let pool = Reassembler::new(15);
        let payload = [5u8; 32];
        let frags = fragments(0x77, &payload, 16);

        assert!(pool.reassemble(&frags[0].0, &frags[0].1).unwrap().is_none());
        for _ in 0..14 {
            assert_eq!(pool.tick(), 0);
        }
        assert_eq!(pool.tick(), 1);
        assert_eq!(pool.active_slots(), 0);
        assert_eq!(pool.stats().timeout_drops.load(Ordering::Relaxed), 1);

        // A late tail starts a fresh slot instead of completing the old one.
        assert!(pool.reassemble(&frags[1].0, &frags[1].1).unwrap().is_none());
        assert!(pool.reassemble(&frags[0].0, &frags[0].1).unwrap().is_some());
    }

    #[test]
    fn test_pool_exhaustion_drops_fragment() {
        let pool = Reassembler::new(15);
        for id in 0..REASSEMBLY_SLOTS as u16 {
            let hdr = make_header([10, 0, 0, 1], id, 0, true);
            assert!(pool.reassemble(&hdr, &[0u8; 8]).unwrap().is_none());
        }
        let hdr = make_header([10, 0, 0, 1], 999, 0, true);
        assert_eq!(
            pool.reassemble(&hdr, &[0u8; 8]),
            Err(FragmentDropReason::PoolExhausted)
        );
        assert_eq!(pool.active_slots(), REASSEMBLY_SLOTS);
    }

    #[test]
    fn test_oversize_fragment_discards_slot() {
        let pool = Reassembler::new(15);
        let hdr = make_header([10, 0, 0, 1], 1, 0, true);
        assert!(pool.reassemble(&hdr, &[0u8; 8]).unwrap().is_none());

        // Offset 8189 * 8 = 65512; 8 bytes reach past 65,515.
        let tail = make_header([10, 0, 0, 1], 1, 8189, false);
        assert_eq!(
            pool.reassemble(&tail, &[0u8; 8]),
            Err(FragmentDropReason::TooLarge)
        );
        assert_eq!(pool.active_slots(), 0);
    }
}
