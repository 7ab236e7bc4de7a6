//! TCP layer state and the stream socket API.
//!
//! `TcpLayer` owns the connection registry and counters; the input, output
//! and timer paths are implemented on it in their own modules. `TcpSocket` is
//! the application handle. None of its operations block: a caller that gets
//! `WouldBlock` waits on the socket's `WaitQueue` and retries.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::StackConfig;
use crate::ip::IpLayer;
use crate::ipv4::SocketAddrV4;
use crate::lockdep::{LockToken, Unlocked};
use crate::socket::{PollMask, SocketError};
use crate::stack::NetStack;
use crate::tcp::{TcpError, TcpResult, TcpState, TcpStats, TCP_IP_OVERHEAD};
use crate::tcp_cb::{ListenQueue, TcbFlags, TcpConnection, TcpControlBlock, TcpTimer};
use crate::tcp_output::{send_rst, trigger_send, TcpEnv};
use crate::tcp_registry::{ConnId, TcpRegistry};
use crate::wait::{SocketWaitHooks, WaitQueue};

// ============================================================================
// TCP Layer
// ============================================================================

/// Per-stack TCP state.
pub struct TcpLayer {
    pub(crate) registry: TcpRegistry,
    pub(crate) stats: TcpStats,
    pub(crate) config: StackConfig,
    pub(crate) hooks: Option<Arc<dyn SocketWaitHooks>>,
}

impl TcpLayer {
    pub fn new(config: StackConfig, hooks: Option<Arc<dyn SocketWaitHooks>>) -> Self {
        TcpLayer {
            registry: TcpRegistry::new(),
            stats: TcpStats::new(),
            config,
            hooks,
        }
    }

    #[inline]
    pub(crate) fn env<'a>(&'a self, ip: &'a IpLayer) -> TcpEnv<'a> {
        TcpEnv {
            ip,
            stats: &self.stats,
        }
    }

    pub fn stats(&self) -> &TcpStats {
        &self.stats
    }

    /// Number of registered connections (listeners included).
    pub fn connections(&self) -> usize {
        self.registry.len(&mut LockToken::root())
    }

    fn new_connection(&self) -> Arc<TcpConnection> {
        Arc::new(TcpConnection::new(
            TcpControlBlock::new(&self.config),
            WaitQueue::new(self.hooks.clone()),
        ))
    }

    /// Drop a closed connection from the registry and from its listener's
    /// accept queue. Called with no connection lock held.
    pub(crate) fn release(
        &self,
        token: &mut LockToken<Unlocked>,
        id: ConnId,
        parent: Option<ConnId>,
    ) {
        self.registry.unregister(token, id);
        let Some(pid) = parent else {
            return;
        };
        if let Some(listener) = self.registry.get(token, pid) {
            let mut tcb = listener.tcb.lock(token);
            if let Some(queue) = tcb.listen.as_mut() {
                queue.pending.retain(|child| *child != id);
            }
        }
    }
}

/// Queue the FIN for the send side. Returns false if the state has nothing
/// to shut down.
fn begin_close(tcb: &mut TcpControlBlock, env: &TcpEnv<'_>) -> bool {
    let next = match tcb.state {
        TcpState::SynReceived | TcpState::Established => TcpState::FinWait1,
        TcpState::CloseWait => TcpState::LastAck,
        _ => return false,
    };
    log::debug!(target: "net::tcp", "{} -> {}: {} -> {}", tcb.local, tcb.remote, tcb.state, next);
    tcb.state = next;
    tcb.flags.insert(TcbFlags::FIN_PENDING);
    trigger_send(tcb, env, false);
    tcb.wake();
    true
}

// ============================================================================
// Stream Socket
// ============================================================================

/// A TCP socket handle.
///
/// Dropping the handle closes the socket the way `close` does.
pub struct TcpSocket {
    stack: Arc<NetStack>,
    conn: Arc<TcpConnection>,
}

impl TcpSocket {
    pub(crate) fn new(stack: Arc<NetStack>) -> Self {
        let conn = stack.tcp.new_connection();
        TcpSocket { stack, conn }
    }

    #[inline]
    pub(crate) fn connection(&self) -> &Arc<TcpConnection> {
        &self.conn
    }

    /// Event queue posted whenever data, space or state changes.
    pub fn events(&self) -> &WaitQueue {
        &self.conn.events
    }

    /// Run `f` on the locked control block, then post any wakeup it caused.
    fn with_tcb<R>(
        &self,
        token: &mut LockToken<Unlocked>,
        f: impl FnOnce(&mut TcpControlBlock, &TcpEnv<'_>) -> R,
    ) -> R {
        let env = self.stack.tcp.env(&self.stack.ip);
        let (result, wake) = {
            let mut tcb = self.conn.tcb.lock(token);
            let result = f(&mut tcb, &env);
            (result, tcb.take_wake())
        };
        if wake {
            self.conn.events.post();
        }
        result
    }

    /// Bind to a local address. Port 0 picks an ephemeral port.
    pub fn bind(&self, local: SocketAddrV4) -> Result<(), SocketError> {
        let mut token = LockToken::root();
        let (bound, state) = {
            let tcb = self.conn.tcb.lock(&mut token);
            (tcb.id.is_some(), tcb.state)
        };
        if bound || state != TcpState::Closed {
            return Err(SocketError::InvalidArgument);
        }
        if !local.ip.is_unspecified() && !self.stack.ip.ifaces.is_local(local.ip) {
            return Err(SocketError::AddressNotAvailable);
        }
        self.stack.tcp.registry.register(&mut token, &self.conn, local)?;
        Ok(())
    }

    /// Start or poll an active open.
    ///
    /// The first call sends the SYN and returns `WouldBlock`; later calls
    /// return `WouldBlock` until the handshake completes, then `Ok(())`. A
    /// failed handshake reports its error once.
    pub fn connect(&self, remote: SocketAddrV4) -> Result<(), SocketError> {
        let mut token = LockToken::root();
        let (id, local) = {
            let mut tcb = self.conn.tcb.lock(&mut token);
            match tcb.state {
                s if s.is_synchronized() => return Ok(()),
                s if s.is_handshaking() => return Err(SocketError::WouldBlock),
                TcpState::Listen => return Err(SocketError::InvalidState),
                _ => {}
            }
            if let Some(err) = tcb.error.take() {
                return Err(err.into());
            }
            if !tcb.remote.ip.is_unspecified() {
                // A finished connection is not reused.
                return Err(SocketError::InvalidState);
            }
            (tcb.id, tcb.local)
        };

        if remote.port == 0
            || remote.ip.is_unspecified()
            || remote.ip.is_broadcast()
            || remote.ip.is_multicast()
        {
            return Err(SocketError::InvalidArgument);
        }

        let ip = &self.stack.ip;
        let src = if local.ip.is_unspecified() {
            ip.source_for(remote.ip).ok_or(TcpError::NetworkUnreachable)?
        } else {
            local.ip
        };
        let mtu = ip
            .route_mtu(Some(src), remote.ip)
            .ok_or(TcpError::NetworkUnreachable)?;

        let tcp = &self.stack.tcp;
        let id = match id {
            Some(id) => id,
            None => tcp.registry.register(&mut token, &self.conn, SocketAddrV4::UNSPECIFIED)?,
        };
        let port = tcp
            .registry
            .endpoints(&mut token, id)
            .map(|(l, _)| l.port)
            .ok_or(TcpError::NotConnected)?;
        let local = SocketAddrV4::new(src, port);
        tcp.registry.connect(&mut token, id, local, remote)?;

        let iss = ip.now_us() as u32;
        self.with_tcb(&mut token, |tcb, env| {
            tcb.rmss = mtu.saturating_sub(TCP_IP_OVERHEAD).max(1) as u32;
            tcb.smss = tcb.smss.min(tcb.rmss);
            tcb.init_send_sequence(iss);
            tcb.state = TcpState::SynSent;
            log::debug!(target: "net::tcp", "{} -> {}: SYN_SENT iss={}", local, remote, iss);
            trigger_send(tcb, env, false);
        });
        Err(SocketError::WouldBlock)
    }

    /// Turn a bound (or unbound, which binds an ephemeral port) socket into
    /// a listener. The backlog is clamped to `1..=max_backlog`.
    pub fn listen(&self, backlog: usize) -> Result<(), SocketError> {
        let mut token = LockToken::root();
        let backlog = backlog.clamp(1, self.stack.tcp.config.max_backlog.max(1));
        let (bound, state) = {
            let tcb = self.conn.tcb.lock(&mut token);
            (tcb.id.is_some(), tcb.state)
        };
        match state {
            TcpState::Listen => {}
            TcpState::Closed if bound => {}
            TcpState::Closed => {
                self.stack
                    .tcp
                    .registry
                    .register(&mut token, &self.conn, SocketAddrV4::UNSPECIFIED)?;
            }
            _ => return Err(SocketError::InvalidState),
        }

        let mut tcb = self.conn.tcb.lock(&mut token);
        match tcb.listen.as_mut() {
            Some(queue) => queue.backlog = backlog,
            None => {
                if tcb.state != TcpState::Closed || tcb.error.is_some() {
                    return Err(SocketError::InvalidState);
                }
                tcb.state = TcpState::Listen;
                tcb.listen = Some(ListenQueue {
                    backlog,
                    pending: VecDeque::new(),
                });
                log::debug!(target: "net::tcp", "{}: LISTEN backlog={}", tcb.local, backlog);
            }
        }
        Ok(())
    }

    /// Pending children of a listener, oldest first.
    fn pending_children(&self, token: &mut LockToken<Unlocked>) -> Result<Vec<ConnId>, SocketError> {
        let tcb = self.conn.tcb.lock(token);
        match tcb.listen.as_ref() {
            Some(queue) if tcb.state == TcpState::Listen => Ok(queue.pending.iter().copied().collect()),
            _ => Err(SocketError::InvalidState),
        }
    }

    /// Take the oldest child that finished its handshake.
    ///
    /// Children still in SYN_RCVD stay queued; children that died before
    /// being accepted are dropped from the queue.
    pub fn accept(&self) -> Result<TcpSocket, SocketError> {
        let mut token = LockToken::root();
        let pending = self.pending_children(&mut token)?;
        let tcp = &self.stack.tcp;

        let mut dead = Vec::new();
        let mut picked: Option<(ConnId, Arc<TcpConnection>)> = None;
        for id in pending {
            let Some(child) = tcp.registry.get(&mut token, id) else {
                dead.push(id);
                continue;
            };
            let ready = {
                let mut tcb = child.tcb.lock(&mut token);
                if tcb.state.is_synchronized() {
                    tcb.parent = None;
                    true
                } else {
                    false
                }
            };
            if ready {
                picked = Some((id, child));
                break;
            }
        }

        {
            let mut tcb = self.conn.tcb.lock(&mut token);
            if let Some(queue) = tcb.listen.as_mut() {
                let taken = picked.as_ref().map(|(id, _)| *id);
                queue
                    .pending
                    .retain(|id| Some(*id) != taken && !dead.contains(id));
            }
        }

        match picked {
            Some((_, conn)) => Ok(TcpSocket {
                stack: self.stack.clone(),
                conn,
            }),
            None => Err(SocketError::WouldBlock),
        }
    }

    /// Queue bytes for transmission. Returns how many were accepted.
    pub fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        let mut token = LockToken::root();
        let result: TcpResult<usize> = self.with_tcb(&mut token, |tcb, env| {
            if let Some(err) = tcb.error.take() {
                return Err(err);
            }
            if tcb.flags.contains(TcbFlags::FIN_PENDING) {
                return Err(TcpError::BrokenPipe);
            }
            match tcb.state {
                TcpState::Established | TcpState::CloseWait => {
                    if data.is_empty() {
                        return Ok(0);
                    }
                    let queued = tcb.snd_buf.push(data);
                    if queued == 0 {
                        return Err(TcpError::WouldBlock);
                    }
                    trigger_send(tcb, env, false);
                    Ok(queued)
                }
                TcpState::SynSent | TcpState::SynReceived => Err(TcpError::WouldBlock),
                TcpState::Closed | TcpState::Listen => Err(TcpError::NotConnected),
                _ => Err(TcpError::BrokenPipe),
            }
        });
        Ok(result?)
    }

    /// Copy received bytes into `buf`. `Ok(0)` means the peer closed its
    /// side and everything before the FIN has been read.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut token = LockToken::root();
        let result: TcpResult<usize> = self.with_tcb(&mut token, |tcb, env| {
            if !tcb.rcv_buf.is_empty() {
                let n = tcb.rcv_buf.read(buf);
                // Freed space may warrant a window update.
                trigger_send(tcb, env, false);
                return Ok(n);
            }
            if tcb.flags.contains(TcbFlags::FIN_RECEIVED) {
                return Ok(0);
            }
            if let Some(err) = tcb.error.take() {
                return Err(err);
            }
            match tcb.state {
                TcpState::Closed => Err(TcpError::NotConnected),
                TcpState::Listen => Err(TcpError::InvalidState),
                _ => Err(TcpError::WouldBlock),
            }
        });
        Ok(result?)
    }

    /// Close the send direction: queue a FIN behind the buffered data.
    /// Later `send` calls fail with `BrokenPipe`.
    pub fn shutdown_write(&self) -> Result<(), SocketError> {
        let mut token = LockToken::root();
        self.with_tcb(&mut token, |tcb, env| {
            if tcb.flags.contains(TcbFlags::FIN_PENDING) {
                return Ok(());
            }
            match tcb.state {
                TcpState::Established | TcpState::CloseWait | TcpState::SynReceived => {
                    begin_close(tcb, env);
                    Ok(())
                }
                _ => Err(SocketError::NotConnected),
            }
        })
    }

    /// Close the socket.
    ///
    /// A connection with a peer sends its FIN and finishes the close in the
    /// background; listeners reset every child that was never accepted.
    pub fn close(&self) {
        let mut token = LockToken::root();
        let (release, children) = self.with_tcb(&mut token, |tcb, env| {
            let mut children = Vec::new();
            let release = match tcb.state {
                TcpState::Listen => {
                    if let Some(queue) = tcb.listen.take() {
                        children.extend(queue.pending);
                    }
                    tcb.mark_closed();
                    tcb.id
                }
                TcpState::SynSent => {
                    tcb.mark_closed();
                    tcb.id
                }
                TcpState::Closed => tcb.id,
                _ => {
                    tcb.flags.insert(TcbFlags::DETACHED);
                    if !tcb.flags.contains(TcbFlags::FIN_PENDING) {
                        begin_close(tcb, env);
                    }
                    if tcb.state == TcpState::FinWait2 && !tcb.is_armed(TcpTimer::TimeWait) {
                        let ticks = tcb.config.time_wait_ticks();
                        tcb.arm(TcpTimer::TimeWait, ticks);
                    }
                    None
                }
            };
            (release.map(|id| (id, tcb.parent)), children)
        });

        let tcp = &self.stack.tcp;
        if let Some((id, parent)) = release {
            tcp.release(&mut token, id, parent);
        }
        for id in children {
            let Some(child) = tcp.registry.unregister(&mut token, id) else {
                continue;
            };
            let env = tcp.env(&self.stack.ip);
            {
                let mut tcb = child.tcb.lock(&mut token);
                if tcb.state.is_synchronized() || tcb.state == TcpState::SynReceived {
                    send_rst(&tcb, &env);
                }
                tcb.parent = None;
                tcb.mark_closed();
            }
            child.events.post();
        }
    }

    /// Readiness of the socket, restricted to `want`. `ERROR` and `HUP` are
    /// always reported.
    pub fn select(&self, want: PollMask) -> PollMask {
        let mut token = LockToken::root();
        let listening = self.pending_children(&mut token).ok();
        if let Some(pending) = listening {
            let tcp = &self.stack.tcp;
            let mut ready = false;
            for id in pending {
                if let Some(child) = tcp.registry.get(&mut token, id) {
                    let state = child.tcb.lock(&mut token).state;
                    if state.is_synchronized() {
                        ready = true;
                        break;
                    }
                }
            }
            let mut mask = PollMask::empty();
            if ready {
                mask |= PollMask::READ;
            }
            return mask & (want | PollMask::ERROR | PollMask::HUP);
        }

        let tcb = self.conn.tcb.lock(&mut token);
        let mut mask = PollMask::empty();
        if !tcb.rcv_buf.is_empty() || tcb.flags.contains(TcbFlags::FIN_RECEIVED) {
            mask |= PollMask::READ;
        }
        if tcb.state.can_send()
            && !tcb.flags.contains(TcbFlags::FIN_PENDING)
            && tcb.snd_buf.free() > 0
        {
            mask |= PollMask::WRITE;
        }
        if tcb.error.is_some() {
            mask |= PollMask::ERROR | PollMask::READ;
        }
        if tcb.state.is_closed() && !tcb.remote.ip.is_unspecified() {
            mask |= PollMask::HUP;
        }
        mask & (want | PollMask::ERROR | PollMask::HUP)
    }

    /// Local address; unspecified until bound.
    pub fn local_addr(&self) -> SocketAddrV4 {
        let mut token = LockToken::root();
        let id = self.conn.tcb.lock(&mut token).id;
        id.and_then(|id| self.stack.tcp.registry.endpoints(&mut token, id))
            .map(|(local, _)| local)
            .unwrap_or(SocketAddrV4::UNSPECIFIED)
    }

    /// Remote address of a connected socket.
    pub fn peer_addr(&self) -> Result<SocketAddrV4, SocketError> {
        let mut token = LockToken::root();
        let id = self.conn.tcb.lock(&mut token).id;
        id.and_then(|id| self.stack.tcp.registry.endpoints(&mut token, id))
            .map(|(_, remote)| remote)
            .filter(|remote| remote.port != 0)
            .ok_or(SocketError::NotConnected)
    }

    /// Current protocol state.
    pub fn state(&self) -> TcpState {
        self.conn.tcb.lock(&mut LockToken::root()).state
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
        self.conn.events.close();
    }
}
