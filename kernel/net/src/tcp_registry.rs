//! TCP connection registry.
//!
//! A slot map of live connections keyed by `ConnId` (slot index plus a
//! generation counter, so a stale id never reaches a reused slot). Each entry
//! carries the connection's address quadruple; the registry lock serializes
//! every change to a quadruple with lookups against it, and the copy inside
//! the control block is only written while the registry lock is held.
//!
//! Matching is wildcard-aware: 0.0.0.0 and port 0 in a stored entry match
//! anything, and the entry with the most exact (non-wildcard) fields wins.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ipv4::SocketAddrV4;
use crate::lockdep::{LockToken, OrderedMutex, RegistryLevel, Unlocked};
use crate::tcp::{TcpError, TcpResult};
use crate::tcp_cb::TcpConnection;

/// Maximum number of registered connections
pub const TCP_MAX_CONNECTIONS: usize = 256;

/// First ephemeral port
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Last ephemeral port
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Stable handle to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u16,
    generation: u32,
}

impl ConnId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct Entry {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    conn: Arc<TcpConnection>,
}

impl Entry {
    /// Number of exact matches, or `None` if a non-wildcard field differs.
    fn score(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Option<u8> {
        let mut score = 0;
        for (stored, wanted) in [(self.local.ip, local.ip), (self.remote.ip, remote.ip)] {
            if !stored.is_unspecified() {
                if stored != wanted {
                    return None;
                }
                score += 1;
            }
        }
        for (stored, wanted) in [(self.local.port, local.port), (self.remote.port, remote.port)] {
            if stored != 0 {
                if stored != wanted {
                    return None;
                }
                score += 1;
            }
        }
        Some(score)
    }

    /// Whether a new binding to `local` would collide with this entry.
    fn overlaps(&self, local: SocketAddrV4) -> bool {
        self.local.port == local.port
            && (self.local.ip.is_unspecified()
                || local.ip.is_unspecified()
                || self.local.ip == local.ip)
    }
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct Slots {
    slots: Vec<Slot>,
    live: usize,
    /// Rotating cursor for ephemeral port allocation.
    next_port: u16,
}

impl Slots {
    fn entries(&self) -> impl Iterator<Item = (usize, &Entry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.entry.as_ref().map(|e| (i, e)))
    }

    fn entry(&self, id: ConnId) -> Option<&Entry> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_ref())
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.entries().any(|(_, e)| e.local.port == port)
    }

    fn free_port(&mut self) -> Option<u16> {
        let span = (EPHEMERAL_PORT_END - EPHEMERAL_PORT_START) as u32 + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port >= EPHEMERAL_PORT_END {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return Some(port);
            }
        }
        None
    }

    fn quad_in_use(&self, local: SocketAddrV4, remote: SocketAddrV4, except: Option<usize>) -> bool {
        self.entries()
            .any(|(i, e)| Some(i) != except && e.local == local && e.remote == remote)
    }

    fn insert(&mut self, entry: Entry) -> TcpResult<ConnId> {
        if self.live >= TCP_MAX_CONNECTIONS {
            return Err(TcpError::ResourceExhausted);
        }
        let index = match self.slots.iter().position(|s| s.entry.is_none()) {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.entry = Some(entry);
        self.live += 1;
        Ok(ConnId {
            index: index as u16,
            generation: slot.generation,
        })
    }
}

/// The registry of live TCP connections.
pub struct TcpRegistry {
    inner: OrderedMutex<RegistryLevel, Slots>,
}

impl TcpRegistry {
    pub const fn new() -> Self {
        TcpRegistry {
            inner: OrderedMutex::new(Slots {
                slots: Vec::new(),
                live: 0,
                next_port: EPHEMERAL_PORT_START,
            }),
        }
    }

    /// Register `conn` bound to `local` with a wildcard remote.
    ///
    /// Port 0 picks a free ephemeral port. Fails with `AddressInUse` if
    /// another entry holds the port on an overlapping address, and with
    /// `ResourceExhausted` when the registry or the port range is full.
    pub fn register(
        &self,
        token: &mut LockToken<Unlocked>,
        conn: &Arc<TcpConnection>,
        local: SocketAddrV4,
    ) -> TcpResult<ConnId> {
        let mut guard = self.inner.lock(token);
        let (slots, held) = guard.split();

        let mut local = local;
        if local.port == 0 {
            local.port = slots.free_port().ok_or(TcpError::ResourceExhausted)?;
        } else if slots.entries().any(|(_, e)| e.overlaps(local)) {
            return Err(TcpError::AddressInUse);
        }

        let id = slots.insert(Entry {
            local,
            remote: SocketAddrV4::UNSPECIFIED,
            conn: conn.clone(),
        })?;
        let mut tcb = conn.tcb.lock(held);
        tcb.id = Some(id);
        tcb.local = local;
        tcb.remote = SocketAddrV4::UNSPECIFIED;
        Ok(id)
    }

    /// Register `conn` with a fully specified quadruple, which must be
    /// unique. Used for passively opened children.
    pub fn bind_exact(
        &self,
        token: &mut LockToken<Unlocked>,
        conn: &Arc<TcpConnection>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> TcpResult<ConnId> {
        let mut guard = self.inner.lock(token);
        let (slots, held) = guard.split();
        if slots.quad_in_use(local, remote, None) {
            return Err(TcpError::AddressInUse);
        }
        let id = slots.insert(Entry {
            local,
            remote,
            conn: conn.clone(),
        })?;
        let mut tcb = conn.tcb.lock(held);
        tcb.id = Some(id);
        tcb.local = local;
        tcb.remote = remote;
        Ok(id)
    }

    /// Rebind a registered connection to a concrete quadruple (active open).
    pub fn connect(
        &self,
        token: &mut LockToken<Unlocked>,
        id: ConnId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> TcpResult<()> {
        let mut guard = self.inner.lock(token);
        let (slots, held) = guard.split();
        if slots.entry(id).is_none() {
            return Err(TcpError::NotConnected);
        }
        if slots.quad_in_use(local, remote, Some(id.index())) {
            return Err(TcpError::AddressInUse);
        }
        let entry = match slots.slots[id.index()].entry.as_mut() {
            Some(e) => e,
            None => return Err(TcpError::NotConnected),
        };
        entry.local = local;
        entry.remote = remote;
        let mut tcb = entry.conn.tcb.lock(held);
        tcb.local = local;
        tcb.remote = remote;
        Ok(())
    }

    /// Remove a connection; returns the registry's reference.
    pub fn unregister(
        &self,
        token: &mut LockToken<Unlocked>,
        id: ConnId,
    ) -> Option<Arc<TcpConnection>> {
        let mut guard = self.inner.lock(token);
        let slot = guard.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        guard.live -= 1;
        log::trace!(
            target: "net::tcp",
            "unregister {} <-> {}",
            entry.local,
            entry.remote
        );
        Some(entry.conn)
    }

    /// Look up a connection by id.
    pub fn get(&self, token: &mut LockToken<Unlocked>, id: ConnId) -> Option<Arc<TcpConnection>> {
        let guard = self.inner.lock(token);
        guard.entry(id).map(|e| e.conn.clone())
    }

    /// Best wildcard-aware match for an inbound segment.
    ///
    /// # Arguments
    ///
    /// * `local` - Destination address/port of the segment
    /// * `remote` - Source address/port of the segment
    pub fn find_best_match(
        &self,
        token: &mut LockToken<Unlocked>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Option<(ConnId, Arc<TcpConnection>)> {
        let guard = self.inner.lock(token);
        let mut best: Option<(u8, usize)> = None;
        for (i, entry) in guard.entries() {
            if let Some(score) = entry.score(local, remote) {
                if best.map_or(true, |(b, _)| score > b) {
                    best = Some((score, i));
                }
            }
        }
        let (_, index) = best?;
        let slot = &guard.slots[index];
        let entry = slot.entry.as_ref()?;
        Some((
            ConnId {
                index: index as u16,
                generation: slot.generation,
            },
            entry.conn.clone(),
        ))
    }

    /// An ephemeral port not used by any registered local endpoint.
    pub fn find_free_port(&self, token: &mut LockToken<Unlocked>) -> TcpResult<u16> {
        let mut guard = self.inner.lock(token);
        guard.free_port().ok_or(TcpError::ResourceExhausted)
    }

    /// Snapshot of every live connection. The registry lock is released
    /// before the caller touches any connection.
    pub fn snapshot(&self, token: &mut LockToken<Unlocked>) -> Vec<(ConnId, Arc<TcpConnection>)> {
        let guard = self.inner.lock(token);
        guard
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.entry.as_ref().map(|e| {
                    (
                        ConnId {
                            index: i as u16,
                            generation: s.generation,
                        },
                        e.conn.clone(),
                    )
                })
            })
            .collect()
    }

    /// Registered quadruple of `id`.
    pub fn endpoints(
        &self,
        token: &mut LockToken<Unlocked>,
        id: ConnId,
    ) -> Option<(SocketAddrV4, SocketAddrV4)> {
        let guard = self.inner.lock(token);
        guard.entry(id).map(|e| (e.local, e.remote))
    }

    /// Number of registered connections.
    pub fn len(&self, token: &mut LockToken<Unlocked>) -> usize {
        self.inner.lock(token).live
    }
}

impl Default for TcpRegistry {
    fn default() -> Self {
        Self::new()
    }
}
