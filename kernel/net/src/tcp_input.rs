//! TCP input: the SEGMENT ARRIVES processing of RFC 793.
//!
//! Segments are validated, matched to a connection, and processed under
//! that connection's lock. Anything that needs the registry afterwards
//! (unregistering a closed connection, spawning a child for a listener,
//! notifying a listening parent) is recorded in an `InputOutcome` and done
//! only once the connection lock has been released.

use alloc::sync::Arc;

use crate::ip::IpLayer;
use crate::ipv4::{Ipv4Addr, SocketAddrV4};
use crate::lockdep::{LockToken, Unlocked};
use crate::tcp::{
    parse_tcp_segment, seq_gt, seq_in_window, seq_le, seq_lt, verify_tcp_checksum, TcpError,
    TcpSegment, TcpState, TcpStats, TCP_IP_OVERHEAD, TCP_MAX_CWND,
};
use crate::tcp_cb::{TcbFlags, TcpConnection, TcpControlBlock, TcpTimer};
use crate::tcp_output::{reset_reply, send_rst, trigger_send, TcpEnv};
use crate::tcp_registry::ConnId;
use crate::tcp_socket::TcpLayer;
use crate::wait::WaitQueue;

/// A SYN accepted by a listener; the child is built after the listener's
/// lock is dropped.
#[derive(Debug, Clone, Copy)]
struct SpawnRequest {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    irs: u32,
    peer_mss: Option<u16>,
    peer_wnd: u32,
}

/// Registry work deferred until the connection lock is released.
#[derive(Debug, Default)]
struct InputOutcome {
    release: bool,
    established: bool,
    spawn: Option<SpawnRequest>,
}

enum AckOutcome {
    Continue,
    Drop,
}

impl TcpLayer {
    /// Process one inbound TCP segment.
    ///
    /// # Arguments
    ///
    /// * `ip` - IP layer, for replies
    /// * `src` / `dst` - Addresses from the IP header
    /// * `data` - TCP header plus payload
    pub(crate) fn input(&self, ip: &IpLayer, src: Ipv4Addr, dst: Ipv4Addr, data: &[u8]) {
        let env = self.env(ip);
        TcpStats::bump(&self.stats.rx_segments);

        if !verify_tcp_checksum(src, dst, data) {
            TcpStats::bump(&self.stats.checksum_errors);
            return;
        }
        let seg = match parse_tcp_segment(data) {
            Ok(seg) => seg,
            Err(_) => {
                TcpStats::bump(&self.stats.rx_dropped);
                return;
            }
        };
        let local = SocketAddrV4::new(dst, seg.header.dst_port);
        let remote = SocketAddrV4::new(src, seg.header.src_port);

        let mut token = LockToken::root();
        let (id, conn) = match self.registry.find_best_match(&mut token, local, remote) {
            Some(found) => found,
            None => {
                reset_reply(&env, local, remote, &seg);
                return;
            }
        };

        let mut out = InputOutcome::default();
        let (wake, parent) = {
            let mut tcb = conn.tcb.lock(&mut token);
            match tcb.state {
                TcpState::Closed => reset_reply(&env, local, remote, &seg),
                TcpState::Listen => listen_input(&mut tcb, &env, &seg, local, remote, &mut out),
                TcpState::SynSent => syn_sent_input(&mut tcb, &env, &seg, &mut out),
                _ => synchronized_input(&mut tcb, &env, &seg, local, remote, &mut out),
            }
            (tcb.take_wake(), tcb.parent)
        };

        if wake {
            conn.events.post();
        }
        if out.established {
            if let Some(pid) = parent {
                if let Some(listener) = self.registry.get(&mut token, pid) {
                    listener.events.post();
                }
            }
        }
        if out.release {
            self.release(&mut token, id, parent);
        }
        if let Some(req) = out.spawn {
            self.spawn_child(&env, &mut token, id, &conn, req);
        }
    }

    /// Create, register and queue a SYN_RCVD child for a listener, then
    /// answer with SYN+ACK. No connection lock is held on entry.
    fn spawn_child(
        &self,
        env: &TcpEnv<'_>,
        token: &mut LockToken<Unlocked>,
        parent_id: ConnId,
        parent: &Arc<TcpConnection>,
        req: SpawnRequest,
    ) {
        let mtu = match env.ip.route_mtu(Some(req.local.ip), req.remote.ip) {
            Some(mtu) => mtu,
            None => {
                log::debug!(target: "net::tcp", "no route back to {}, SYN dropped", req.remote);
                return;
            }
        };

        let mut tcb = TcpControlBlock::new(&self.config);
        tcb.state = TcpState::SynReceived;
        tcb.parent = Some(parent_id);
        tcb.rmss = mtu.saturating_sub(TCP_IP_OVERHEAD).max(1) as u32;
        tcb.set_peer_mss(req.peer_mss);
        tcb.init_send_sequence(env.ip.now_us() as u32);
        tcb.init_recv_sequence(req.irs);
        tcb.snd_wnd = req.peer_wnd;
        tcb.max_snd_wnd = req.peer_wnd;
        tcb.snd_wl1 = req.irs;
        tcb.snd_wl2 = tcb.iss;

        let child = Arc::new(TcpConnection::new(tcb, WaitQueue::new(self.hooks.clone())));
        let id = match self.registry.bind_exact(token, &child, req.local, req.remote) {
            Ok(id) => id,
            Err(e) => {
                log::debug!(target: "net::tcp", "child {} <-> {} not registered: {:?}", req.local, req.remote, e);
                return;
            }
        };

        let queued = {
            let mut listener = parent.tcb.lock(token);
            let listening = listener.state == TcpState::Listen;
            match listener.listen.as_mut() {
                Some(queue) if listening && !queue.is_full() => {
                    queue.pending.push_back(id);
                    true
                }
                _ => false,
            }
        };
        if !queued {
            TcpStats::bump(&self.stats.listen_overflows);
            self.registry.unregister(token, id);
            return;
        }

        log::debug!(target: "net::tcp", "{} <- {}: SYN_RCVD", req.local, req.remote);
        let wake = {
            let mut tcb = child.tcb.lock(token);
            trigger_send(&mut tcb, env, false);
            tcb.take_wake()
        };
        if wake {
            child.events.post();
        }
    }
}

// ============================================================================
// LISTEN
// ============================================================================

fn listen_input(
    tcb: &mut TcpControlBlock,
    env: &TcpEnv<'_>,
    seg: &TcpSegment<'_>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    out: &mut InputOutcome,
) {
    let h = &seg.header;
    if h.is_rst() {
        return;
    }
    if h.is_ack() {
        reset_reply(env, local, remote, seg);
        return;
    }
    if !h.is_syn() || h.is_fin() {
        TcpStats::bump(&env.stats.rx_dropped);
        return;
    }
    if !remote.ip.is_valid_source() || local.ip.is_broadcast() || local.ip.is_multicast() {
        TcpStats::bump(&env.stats.rx_dropped);
        return;
    }
    if tcb.listen.as_ref().map_or(true, |q| q.is_full()) {
        TcpStats::bump(&env.stats.listen_overflows);
        log::debug!(target: "net::tcp", "{}: accept backlog full, SYN from {} dropped", local, remote);
        return;
    }
    out.spawn = Some(SpawnRequest {
        local,
        remote,
        irs: h.seq_num,
        peer_mss: seg.mss,
        peer_wnd: h.window as u32,
    });
}

// ============================================================================
// SYN_SENT
// ============================================================================

fn syn_sent_input(
    tcb: &mut TcpControlBlock,
    env: &TcpEnv<'_>,
    seg: &TcpSegment<'_>,
    out: &mut InputOutcome,
) {
    let h = &seg.header;
    if h.is_ack() && (seq_le(h.ack_num, tcb.iss) || seq_gt(h.ack_num, tcb.snd_max)) {
        reset_reply(env, tcb.local, tcb.remote, seg);
        TcpStats::bump(&env.stats.rx_dropped);
        return;
    }
    if h.is_rst() {
        if h.is_ack() {
            log::debug!(target: "net::tcp", "{}: connection refused", tcb.remote);
            tcb.set_error(TcpError::ConnectionRefused);
            tcb.mark_closed();
            out.release = true;
        }
        return;
    }
    if !h.is_syn() {
        TcpStats::bump(&env.stats.rx_dropped);
        return;
    }

    tcb.init_recv_sequence(h.seq_num);
    tcb.set_peer_mss(seg.mss);
    tcb.snd_wnd = h.window as u32;
    tcb.max_snd_wnd = tcb.snd_wnd;
    tcb.snd_wl1 = h.seq_num;
    tcb.snd_wl2 = h.ack_num;

    if h.is_ack() {
        tcb.snd_una = h.ack_num;
        if seq_lt(tcb.snd_nxt, tcb.snd_una) {
            tcb.snd_nxt = tcb.snd_una;
        }
        if let Some((timed, ticks)) = tcb.rtt_timing {
            if seq_gt(h.ack_num, timed) {
                tcb.update_rtt(ticks);
                tcb.rtt_timing = None;
            }
        }
        tcb.cancel(TcpTimer::Retransmit);
        tcb.retries = 0;
        tcb.backoff = 0;
        tcb.state = TcpState::Established;
        tcb.flags.insert(TcbFlags::ACK_NOW);
        tcb.wake();
        TcpStats::bump(&env.stats.connections_established);
        log::debug!(target: "net::tcp", "{} -> {}: ESTABLISHED", tcb.local, tcb.remote);
    } else {
        // Simultaneous open: answer with SYN+ACK from the same ISS.
        tcb.state = TcpState::SynReceived;
        tcb.snd_nxt = tcb.iss;
        tcb.cancel(TcpTimer::Retransmit);
    }
    trigger_send(tcb, env, false);
}

// ============================================================================
// Synchronized states (and SYN_RCVD)
// ============================================================================

/// RFC 793 acceptability test against the advertised receive window.
fn acceptable(tcb: &TcpControlBlock, seq: u32, len: u32) -> bool {
    let wnd = tcb.rcv_wnd();
    let nxt = tcb.rcv_nxt;
    match (len, wnd) {
        (0, 0) => seq == nxt,
        (0, _) => seq_in_window(seq, nxt, wnd),
        (_, 0) => false,
        _ => {
            seq_in_window(seq, nxt, wnd)
                || seq_in_window(seq.wrapping_add(len - 1), nxt, wnd)
        }
    }
}

fn synchronized_input(
    tcb: &mut TcpControlBlock,
    env: &TcpEnv<'_>,
    seg: &TcpSegment<'_>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    out: &mut InputOutcome,
) {
    let h = &seg.header;

    if !acceptable(tcb, h.seq_num, seg.seq_len()) {
        TcpStats::bump(&env.stats.rx_dropped);
        if !h.is_rst() {
            if tcb.state == TcpState::TimeWait && h.is_fin() {
                tcb.enter_time_wait();
            }
            tcb.flags.insert(TcbFlags::ACK_NOW);
            trigger_send(tcb, env, false);
        }
        return;
    }

    if h.is_rst() {
        match tcb.state {
            TcpState::SynReceived => tcb.set_error(TcpError::ConnectionRefused),
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait => {
                tcb.set_error(TcpError::ConnectionReset);
                TcpStats::bump(&env.stats.connections_reset);
            }
            _ => {}
        }
        log::debug!(target: "net::tcp", "{} -> {}: reset in {}", tcb.local, tcb.remote, tcb.state);
        tcb.mark_closed();
        out.release = true;
        return;
    }

    if h.is_syn() {
        send_rst(tcb, env);
        tcb.set_error(TcpError::ConnectionReset);
        TcpStats::bump(&env.stats.connections_reset);
        tcb.mark_closed();
        out.release = true;
        return;
    }

    if !h.is_ack() {
        TcpStats::bump(&env.stats.rx_dropped);
        return;
    }

    if tcb.state == TcpState::SynReceived {
        if seq_gt(h.ack_num, tcb.snd_una) && seq_le(h.ack_num, tcb.snd_max) {
            tcb.state = TcpState::Established;
            tcb.snd_wnd = h.window as u32;
            tcb.max_snd_wnd = tcb.max_snd_wnd.max(tcb.snd_wnd);
            tcb.snd_wl1 = h.seq_num;
            tcb.snd_wl2 = h.ack_num;
            tcb.wake();
            out.established = true;
            TcpStats::bump(&env.stats.connections_established);
            log::debug!(target: "net::tcp", "{} <- {}: ESTABLISHED", tcb.local, tcb.remote);
        } else {
            reset_reply(env, local, remote, seg);
            return;
        }
    }

    if let AckOutcome::Drop = process_ack(tcb, env, seg) {
        tcb.flags.insert(TcbFlags::ACK_NOW);
        trigger_send(tcb, env, false);
        return;
    }

    let fin_acked = tcb.flags.contains(TcbFlags::FIN_SENT) && tcb.snd_una == tcb.snd_max;
    if fin_acked {
        match tcb.state {
            TcpState::FinWait1 => {
                tcb.state = TcpState::FinWait2;
                tcb.wake();
                if tcb.flags.contains(TcbFlags::DETACHED) {
                    let ticks = tcb.config.time_wait_ticks();
                    tcb.arm(TcpTimer::TimeWait, ticks);
                }
            }
            TcpState::Closing => tcb.enter_time_wait(),
            TcpState::LastAck => {
                tcb.mark_closed();
                out.release = true;
                return;
            }
            _ => {}
        }
    }

    if !seg.payload.is_empty() {
        receive_data(tcb, env, seg);
    }
    if h.is_fin() {
        receive_fin(tcb, seg);
    }

    trigger_send(tcb, env, false);
}

/// ACK processing: advance `snd_una`, drain the send ring, grow the
/// congestion window, time RTT, and run fast retransmit on duplicates.
fn process_ack(tcb: &mut TcpControlBlock, env: &TcpEnv<'_>, seg: &TcpSegment<'_>) -> AckOutcome {
    let h = &seg.header;
    let ack = h.ack_num;

    if seq_gt(ack, tcb.snd_max) {
        TcpStats::bump(&env.stats.rx_dropped);
        return AckOutcome::Drop;
    }

    if seq_le(ack, tcb.snd_una) {
        let duplicate = seg.payload.is_empty()
            && !h.is_syn()
            && !h.is_fin()
            && ack == tcb.snd_una
            && h.window as u32 == tcb.snd_wnd
            && tcb.in_flight() > 0
            && tcb.is_armed(TcpTimer::Retransmit);
        if duplicate {
            tcb.dup_acks += 1;
            if tcb.dup_acks == 3 {
                fast_retransmit(tcb, env);
            } else if tcb.dup_acks > 3 {
                tcb.cwnd = (tcb.cwnd + tcb.smss).min(TCP_MAX_CWND);
                trigger_send(tcb, env, false);
            }
        } else {
            tcb.dup_acks = 0;
        }
        update_send_window(tcb, seg);
        return AckOutcome::Continue;
    }

    if tcb.dup_acks >= 3 {
        tcb.cwnd = tcb.ssthresh;
    }
    tcb.dup_acks = 0;

    let acked = ack.wrapping_sub(tcb.snd_una);
    if let Some((timed, ticks)) = tcb.rtt_timing {
        if seq_gt(ack, timed) {
            tcb.update_rtt(ticks);
            tcb.rtt_timing = None;
        }
    }

    tcb.retries = 0;
    tcb.backoff = 0;
    if ack == tcb.snd_max {
        tcb.cancel(TcpTimer::Retransmit);
    } else {
        let ticks = tcb.rexmt_timeout();
        tcb.arm(TcpTimer::Retransmit, ticks);
    }

    if tcb.cwnd < tcb.ssthresh {
        tcb.cwnd += tcb.smss.min(acked);
    } else {
        tcb.bytes_acked = tcb.bytes_acked.saturating_add(acked);
        if tcb.bytes_acked >= tcb.cwnd {
            tcb.bytes_acked -= tcb.cwnd;
            tcb.cwnd += tcb.smss;
        }
    }
    tcb.cwnd = tcb.cwnd.min(TCP_MAX_CWND);

    let mut data = acked;
    if tcb.syn_unacked() {
        data -= 1;
    }
    let data = (data as usize).min(tcb.snd_buf.len());
    tcb.snd_buf.consume(data);
    tcb.snd_una = ack;
    if seq_lt(tcb.snd_nxt, tcb.snd_una) {
        tcb.snd_nxt = tcb.snd_una;
    }
    if data > 0 {
        tcb.wake();
    }

    update_send_window(tcb, seg);
    AckOutcome::Continue
}

/// Take the peer's window from the newest segment (RFC 793 SND.WL1/WL2).
fn update_send_window(tcb: &mut TcpControlBlock, seg: &TcpSegment<'_>) {
    let h = &seg.header;
    if seq_lt(tcb.snd_wl1, h.seq_num)
        || (tcb.snd_wl1 == h.seq_num && seq_le(tcb.snd_wl2, h.ack_num))
    {
        tcb.snd_wnd = h.window as u32;
        tcb.snd_wl1 = h.seq_num;
        tcb.snd_wl2 = h.ack_num;
        tcb.max_snd_wnd = tcb.max_snd_wnd.max(tcb.snd_wnd);
        if tcb.snd_wnd > 0 {
            tcb.cancel(TcpTimer::Persist);
        }
    }
}

/// Retransmit the oldest segment after the third duplicate ACK.
fn fast_retransmit(tcb: &mut TcpControlBlock, env: &TcpEnv<'_>) {
    let saved_nxt = tcb.snd_nxt;
    tcb.ssthresh = (tcb.in_flight() / 2).max(2 * tcb.smss);
    tcb.cancel(TcpTimer::Retransmit);
    tcb.rtt_timing = None;
    tcb.snd_nxt = tcb.snd_una;
    tcb.cwnd = tcb.smss;
    TcpStats::bump(&env.stats.fast_retransmits);
    log::debug!(target: "net::tcp", "{} -> {}: fast retransmit at {}", tcb.local, tcb.remote, tcb.snd_una);

    tcb.flags.insert(TcbFlags::FAST_REXMT);
    trigger_send(tcb, env, true);
    tcb.flags.remove(TcbFlags::FAST_REXMT);

    tcb.cwnd = tcb.ssthresh + 3 * tcb.smss;
    if seq_gt(saved_nxt, tcb.snd_nxt) {
        tcb.snd_nxt = saved_nxt;
    }
}

/// Copy in-order payload into the receive ring. Data past `rcv_nxt` means
/// a gap: it is dropped and an ACK asks for the missing bytes.
fn receive_data(tcb: &mut TcpControlBlock, env: &TcpEnv<'_>, seg: &TcpSegment<'_>) {
    if !tcb.state.can_receive() {
        return;
    }
    let seq = seg.header.seq_num;
    if seq_gt(seq, tcb.rcv_nxt) {
        TcpStats::bump(&env.stats.out_of_order);
        tcb.flags.insert(TcbFlags::ACK_NOW);
        return;
    }

    let skip = tcb.rcv_nxt.wrapping_sub(seq) as usize;
    if skip >= seg.payload.len() {
        tcb.flags.insert(TcbFlags::ACK_NOW);
        return;
    }
    let fresh = &seg.payload[skip..];
    let taken = tcb.rcv_buf.push(fresh);
    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(taken as u32);
    if taken > 0 {
        tcb.wake();
    }
    if taken < fresh.len() {
        tcb.flags.insert(TcbFlags::ACK_NOW);
    } else if !tcb.is_armed(TcpTimer::DelayedAck) {
        let ticks = tcb.config.delack_ticks;
        tcb.arm(TcpTimer::DelayedAck, ticks);
    }
}

/// Consume a FIN that directly follows the accepted data.
fn receive_fin(tcb: &mut TcpControlBlock, seg: &TcpSegment<'_>) {
    let fin_seq = seg
        .header
        .seq_num
        .wrapping_add(seg.payload.len() as u32);

    if tcb.flags.contains(TcbFlags::FIN_RECEIVED) {
        if fin_seq.wrapping_add(1) == tcb.rcv_nxt {
            tcb.flags.insert(TcbFlags::ACK_NOW);
            if tcb.state == TcpState::TimeWait {
                tcb.enter_time_wait();
            }
        }
        return;
    }
    if fin_seq != tcb.rcv_nxt {
        return;
    }

    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
    tcb.flags.insert(TcbFlags::FIN_RECEIVED | TcbFlags::ACK_NOW);
    tcb.wake();

    match tcb.state {
        TcpState::SynReceived | TcpState::Established => tcb.state = TcpState::CloseWait,
        TcpState::FinWait1 => tcb.state = TcpState::Closing,
        TcpState::FinWait2 => tcb.enter_time_wait(),
        _ => {}
    }
    log::trace!(target: "net::tcp", "{} <- {}: FIN, now {}", tcb.local, tcb.remote, tcb.state);
}
