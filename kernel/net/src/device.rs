//! External collaborators of the stack.
//!
//! The stack never programs hardware or keeps time itself. Drivers implement
//! `NetDevice`, the ARP layer implements `AddressResolver`, and the kernel
//! supplies a `Clock` and optionally a `TxKick` to schedule the deferred
//! transmit worker.
//!
//! # Design Principles
//!
//! 1. **Non-blocking I/O**: `transmit` must never block; a full queue is an
//!    error the stack counts and drops.
//!
//! 2. **Buffer ownership**: `transmit` takes ownership of the `PacketBuffer`.
//!
//! 3. **Shared access**: every method takes `&self`; devices are shared by the
//!    receive path, the transmit worker and administrative calls.

use alloc::collections::VecDeque;
use spin::Mutex;

use crate::buffer::PacketBuffer;
use crate::ethernet::EthAddr;
use crate::iface::Interface;
use crate::ipv4::Ipv4Addr;

/// Default Ethernet MTU.
pub const DEFAULT_MTU: u16 = 1500;

/// MTU of the loopback device.
pub const LOOPBACK_MTU: u16 = 16384;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from transmit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// No descriptors available in the TX queue (try again later).
    QueueFull,
    /// Device link is down or TX queue is stopped.
    LinkDown,
    /// Buffer is invalid (too large, misaligned, etc.).
    InvalidBuffer,
    /// Device encountered an I/O or bus error.
    IoError,
}

// ============================================================================
// NetDevice Trait
// ============================================================================

/// Core trait for network device drivers.
///
/// # Thread Safety
///
/// Implementations handle their own synchronization; `transmit` may be called
/// from the transmit worker while the receive path runs on another core.
pub trait NetDevice: Send + Sync {
    /// Get the device name (e.g., "rtl0", "lo").
    fn name(&self) -> &str;

    /// Get the current MAC address.
    fn mac_address(&self) -> EthAddr;

    /// Get the current MTU (largest IP datagram per frame).
    fn mtu(&self) -> u16 {
        DEFAULT_MTU
    }

    /// Submit a complete link-layer frame for transmission (non-blocking).
    fn transmit(&self, frame: PacketBuffer) -> Result<(), TxError>;
}

// ============================================================================
// Address Resolution
// ============================================================================

/// Result of resolving a next-hop IP address to a link-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Address known.
    Hit(EthAddr),
    /// Request in flight; retry later.
    Pending,
    /// Resolution failed; the packet is dropped.
    Error,
}

/// The ARP layer, consumed as a black box.
pub trait AddressResolver: Send + Sync {
    /// Resolve `next_hop` on `iface`.
    ///
    /// Must not block. Returning `Pending` requeues the packet until the
    /// transmit queue timeout.
    fn resolve(&self, iface: &Interface, next_hop: Ipv4Addr) -> Resolution;

    /// Deliver an inbound ARP frame (payload after the Ethernet header).
    fn input(&self, iface: &Interface, packet: &[u8]) {
        let _ = (iface, packet);
    }
}

// ============================================================================
// Platform Services
// ============================================================================

/// Wall-clock source.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary epoch.
    fn now_us(&self) -> u64;

    /// Milliseconds since the same epoch.
    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }
}

/// Notification that the deferred transmit worker has work.
pub trait TxKick: Send + Sync {
    /// Schedule `NetStack::run_tx_queue` on a worker context.
    fn kick(&self);
}

// ============================================================================
// Loopback Device
// ============================================================================

/// Software loopback: transmitted frames are queued for re-injection by
/// `NetStack::poll`.
pub struct LoopbackDevice {
    queue: Mutex<VecDeque<PacketBuffer>>,
    limit: usize,
}

impl LoopbackDevice {
    /// Queue depth before `transmit` reports `QueueFull`.
    pub const DEFAULT_QUEUE_LIMIT: usize = 256;

    pub fn new() -> Self {
        LoopbackDevice {
            queue: Mutex::new(VecDeque::new()),
            limit: Self::DEFAULT_QUEUE_LIMIT,
        }
    }

    /// Take the oldest looped-back frame.
    pub fn pop(&self) -> Option<PacketBuffer> {
        self.queue.lock().pop_front()
    }

    /// Frames waiting to be re-injected.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NetDevice for LoopbackDevice {
    fn name(&self) -> &str {
        "lo"
    }

    fn mac_address(&self) -> EthAddr {
        EthAddr::ZERO
    }

    fn mtu(&self) -> u16 {
        LOOPBACK_MTU
    }

    fn transmit(&self, frame: PacketBuffer) -> Result<(), TxError> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.limit {
            return Err(TxError::QueueFull);
        }
        queue.push_back(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_queue_bounded() {
        let lo = LoopbackDevice::new();
        for _ in 0..LoopbackDevice::DEFAULT_QUEUE_LIMIT {
            lo.transmit(PacketBuffer::from_frame(&[1, 2, 3])).unwrap();
        }
        assert_eq!(
            lo.transmit(PacketBuffer::from_frame(&[4])),
            Err(TxError::QueueFull)
        );
        assert_eq!(lo.pop().map(|f| f.payload().to_vec()), Some(alloc::vec![1, 2, 3]));
        assert_eq!(lo.pending(), LoopbackDevice::DEFAULT_QUEUE_LIMIT - 1);
    }
}
