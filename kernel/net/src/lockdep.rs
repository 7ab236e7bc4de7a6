//! Typed lock ordering for the TCP engine.
//!
//! # Lock Ordering (acquire in this order, release in reverse)
//!
//! ```text
//! Level 0  Unlocked        (entry points: socket calls, rx path, timer tick)
//! │
//! Level 1  Registry        TcpRegistry::slots, also guards address quadruples
//! │
//! Level 2  Connection      TcpConnection::tcb (one per connection)
//! │
//! Level 3  Leaf locks      routing table, interfaces, reassembly pool,
//!                          raw/UDP tables, transmit queue, IP id counter
//! ```
//!
//! Reference counts are `Arc` strong counts and take no lock.
//!
//! # Rules
//!
//! 1. **Never acquire the registry while holding a connection lock.**
//! 2. **Never hold two connection locks at once.** Timer processing snapshots
//!    `Arc`s under the registry lock, releases it, then locks each
//!    connection independently.
//! 3. **Leaf locks never call back** into the registry or a connection.
//!
//! Rules 1 and 2 are enforced at compile time: an `OrderedMutex<L, _>` can
//! only be locked with a `LockToken` of a level strictly below `L`, and the
//! token stays mutably borrowed for as long as the guard lives. A guard hands
//! out its own token for nested acquisition, so a connection guard can never
//! produce a token that satisfies the registry.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

// ============================================================================
// Lock Levels
// ============================================================================

mod private {
    pub trait Sealed {}
}

/// A position in the lock hierarchy.
pub trait LockLevel: private::Sealed {
    /// Numeric rank, lower is acquired first.
    const RANK: u8;
    /// Name used in debug output.
    const NAME: &'static str;
}

/// `Self` may be held while acquiring a lock of level `L`.
pub trait Below<L: LockLevel>: LockLevel {}

/// No engine lock held.
pub struct Unlocked;
/// The TCP connection registry.
pub struct RegistryLevel;
/// A single TCP connection.
pub struct ConnectionLevel;

impl private::Sealed for Unlocked {}
impl private::Sealed for RegistryLevel {}
impl private::Sealed for ConnectionLevel {}

impl LockLevel for Unlocked {
    const RANK: u8 = 0;
    const NAME: &'static str = "unlocked";
}

impl LockLevel for RegistryLevel {
    const RANK: u8 = 1;
    const NAME: &'static str = "tcp-registry";
}

impl LockLevel for ConnectionLevel {
    const RANK: u8 = 2;
    const NAME: &'static str = "tcp-connection";
}

impl Below<RegistryLevel> for Unlocked {}
impl Below<ConnectionLevel> for Unlocked {}
impl Below<ConnectionLevel> for RegistryLevel {}

// ============================================================================
// Lock Tokens
// ============================================================================

/// Proof that the holder owns no engine lock above level `L`.
///
/// Tokens are neither `Send` nor `Clone`: each execution context mints one
/// root token at its entry point and threads it through by `&mut`.
pub struct LockToken<L: LockLevel> {
    _level: PhantomData<L>,
    _not_send: PhantomData<*const ()>,
}

impl LockToken<Unlocked> {
    /// Mint the root token for an entry point.
    ///
    /// Only called where the current context is known to hold no engine
    /// lock: public socket calls, `NetStack::receive` and the tick functions.
    #[inline]
    pub(crate) fn root() -> Self {
        LockToken {
            _level: PhantomData,
            _not_send: PhantomData,
        }
    }
}

impl<L: LockLevel> LockToken<L> {
    #[inline]
    fn new() -> Self {
        LockToken {
            _level: PhantomData,
            _not_send: PhantomData,
        }
    }

    /// Rank of the level this token represents.
    #[inline]
    pub fn rank(&self) -> u8 {
        L::RANK
    }
}

// ============================================================================
// OrderedMutex
// ============================================================================

/// A `spin::Mutex` tagged with its level in the lock hierarchy.
pub struct OrderedMutex<L: LockLevel, T> {
    inner: Mutex<T>,
    _level: PhantomData<L>,
}

impl<L: LockLevel, T> OrderedMutex<L, T> {
    /// Create a new ordered mutex.
    pub const fn new(value: T) -> Self {
        OrderedMutex {
            inner: Mutex::new(value),
            _level: PhantomData,
        }
    }

    /// Acquire the lock while holding at most level `H < L`.
    ///
    /// `held` stays mutably borrowed until the guard is dropped, so the same
    /// token cannot be reused to take a second lock in the meantime.
    #[inline]
    pub fn lock<'a, H: Below<L>>(&'a self, held: &'a mut LockToken<H>) -> OrderedGuard<'a, L, T> {
        let _ = held;
        OrderedGuard {
            guard: self.inner.lock(),
            token: LockToken::new(),
        }
    }

    /// Non-blocking acquire.
    #[inline]
    pub fn try_lock<'a, H: Below<L>>(
        &'a self,
        held: &'a mut LockToken<H>,
    ) -> Option<OrderedGuard<'a, L, T>> {
        let _ = held;
        self.inner.try_lock().map(|guard| OrderedGuard {
            guard,
            token: LockToken::new(),
        })
    }
}

/// RAII guard for an `OrderedMutex`.
pub struct OrderedGuard<'a, L: LockLevel, T> {
    guard: MutexGuard<'a, T>,
    token: LockToken<L>,
}

impl<'a, L: LockLevel, T> OrderedGuard<'a, L, T> {
    /// Split the guard into the protected data and a token for acquiring
    /// locks of a higher level while this one is held.
    #[inline]
    pub fn split(&mut self) -> (&mut T, &mut LockToken<L>) {
        (&mut *self.guard, &mut self.token)
    }
}

impl<'a, L: LockLevel, T> Deref for OrderedGuard<'a, L, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, L: LockLevel, T> DerefMut for OrderedGuard<'a, L, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_acquisition_in_order() {
        let registry: OrderedMutex<RegistryLevel, u32> = OrderedMutex::new(1);
        let conn: OrderedMutex<ConnectionLevel, u32> = OrderedMutex::new(2);

        let mut root = LockToken::root();
        let mut reg = registry.lock(&mut root);
        let (reg_data, reg_token) = reg.split();
        *reg_data += 10;
        let mut c = conn.lock(reg_token);
        *c += 20;
        assert_eq!(c.token.rank(), ConnectionLevel::RANK);
        drop(c);
        drop(reg);

        let mut root = LockToken::root();
        assert_eq!(*registry.lock(&mut root), 11);
        assert_eq!(*conn.lock(&mut root), 22);
    }

    #[test]
    fn test_try_lock_reports_contention() {
        let conn: OrderedMutex<ConnectionLevel, ()> = OrderedMutex::new(());
        let mut a = LockToken::root();
        let mut b = LockToken::root();
        let held = conn.lock(&mut a);
        assert!(conn.try_lock(&mut b).is_none());
        drop(held);
        assert!(conn.try_lock(&mut b).is_some());
    }

    #[test]
    fn test_ordered_mutex_is_shareable() {
        fn shareable<T: Send + Sync>() {}
        shareable::<OrderedMutex<RegistryLevel, u32>>();
        shareable::<OrderedMutex<ConnectionLevel, alloc::vec::Vec<u8>>>();
    }
}
