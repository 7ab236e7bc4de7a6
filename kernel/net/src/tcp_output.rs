//! TCP output: segment emission and the send decision.
//!
//! `trigger_send` decides whether anything is worth transmitting right now
//! and loops, one MSS per segment, until nothing more may go out. It
//! implements sender-side silly window avoidance (only full segments unless
//! the connection is idle), receiver-side window advertisement that never
//! shrinks the right edge, zero-window probing and the retransmission timer
//! arming rules. It is always called with the connection lock held.

use crate::ip::{IpLayer, IpTxParams};
use crate::ipv4::SocketAddrV4;
use crate::tcp::{
    build_tcp_segment, seq_gt, seq_lt, TcpHeader, TcpSegment, TcpState, TcpStats, TCP_FLAG_ACK,
    TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_MAX_WINDOW, TCP_PROTO,
};
use crate::tcp_cb::{TcbFlags, TcpControlBlock, TcpTimer};

/// What the engine needs from the rest of the stack while it runs under a
/// connection lock. Everything reachable from here takes leaf locks only.
pub(crate) struct TcpEnv<'a> {
    pub ip: &'a IpLayer,
    pub stats: &'a TcpStats,
}

// ============================================================================
// Segment Emission
// ============================================================================

/// Build one segment and hand it to IP. Transmit failures are logged and
/// otherwise ignored; retransmission recovers them.
fn emit(
    env: &TcpEnv<'_>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    header: &TcpHeader,
    mss: Option<u16>,
    payload: &[&[u8]],
) {
    let segment = match build_tcp_segment(local.ip, remote.ip, header, mss, payload) {
        Ok(seg) => seg,
        Err(e) => {
            log::warn!(target: "net::tcp", "segment composition failed: {:?}", e);
            return;
        }
    };
    let params = IpTxParams::new(Some(local.ip), remote.ip, TCP_PROTO);
    match env.ip.ip_tx_msg(&params, segment) {
        Ok(()) => TcpStats::bump(&env.stats.tx_segments),
        Err(e) => {
            log::debug!(target: "net::tcp", "{} -> {}: transmit failed: {:?}", local, remote, e);
        }
    }
}

/// Reply to a segment that matches no connection (or hits a state that
/// refuses it) with a RST, unless the segment is itself a RST.
///
/// # Arguments
///
/// * `local` - The segment's destination (our side)
/// * `remote` - The segment's source
pub(crate) fn reset_reply(
    env: &TcpEnv<'_>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    seg: &TcpSegment<'_>,
) {
    let h = &seg.header;
    if h.is_rst() {
        return;
    }
    let header = if h.is_ack() {
        TcpHeader::new(local.port, remote.port, h.ack_num, 0, TCP_FLAG_RST, 0)
    } else {
        TcpHeader::new(
            local.port,
            remote.port,
            0,
            h.seq_num.wrapping_add(seg.seq_len()),
            TCP_FLAG_RST | TCP_FLAG_ACK,
            0,
        )
    };
    TcpStats::bump(&env.stats.rst_sent);
    emit(env, local, remote, &header, None, &[]);
}

/// Abort the peer's side of a synchronized connection.
pub(crate) fn send_rst(tcb: &TcpControlBlock, env: &TcpEnv<'_>) {
    let header = TcpHeader::new(
        tcb.local.port,
        tcb.remote.port,
        tcb.snd_nxt,
        tcb.rcv_nxt,
        TCP_FLAG_RST | TCP_FLAG_ACK,
        0,
    );
    TcpStats::bump(&env.stats.rst_sent);
    emit(env, tcb.local, tcb.remote, &header, None, &[]);
}

// ============================================================================
// Output Decision
// ============================================================================

/// Window we may advertise now: free receive space, but never less than
/// what is already promised.
fn advertised_window(tcb: &TcpControlBlock) -> (u32, u32) {
    let space = (tcb.rcv_buf.free() as u32).min(TCP_MAX_WINDOW);
    let current = tcb.rcv_wnd();
    (space.max(current), current)
}

/// Record that `window` was advertised at `rcv_nxt`.
fn note_advertised(tcb: &mut TcpControlBlock, window: u32) {
    let edge = tcb.rcv_nxt.wrapping_add(window);
    if seq_gt(edge, tcb.rcv_adv) {
        tcb.rcv_adv = edge;
    }
}

/// SYN or SYN+ACK, sent only when `snd_nxt` sits at the ISS.
fn send_syn(tcb: &mut TcpControlBlock, env: &TcpEnv<'_>) {
    tcb.flags.remove(TcbFlags::ACK_NOW);
    if tcb.snd_nxt != tcb.iss {
        return;
    }
    let synack = tcb.state == TcpState::SynReceived;
    let (window, _) = advertised_window(tcb);
    let (flags, ack) = if synack {
        (TCP_FLAG_SYN | TCP_FLAG_ACK, tcb.rcv_nxt)
    } else {
        (TCP_FLAG_SYN, 0)
    };
    let header = TcpHeader::new(
        tcb.local.port,
        tcb.remote.port,
        tcb.iss,
        ack,
        flags,
        window as u16,
    );
    let mss = tcb.rmss.min(u16::MAX as u32) as u16;
    emit(env, tcb.local, tcb.remote, &header, Some(mss), &[]);

    if tcb.snd_max == tcb.iss {
        if tcb.rtt_timing.is_none() {
            tcb.rtt_timing = Some((tcb.iss, 0));
        }
    } else {
        TcpStats::bump(&env.stats.retransmissions);
    }
    tcb.snd_nxt = tcb.iss.wrapping_add(1);
    if seq_gt(tcb.snd_nxt, tcb.snd_max) {
        tcb.snd_max = tcb.snd_nxt;
    }
    if synack {
        note_advertised(tcb, window);
    }
    if !tcb.is_armed(TcpTimer::Retransmit) {
        let ticks = tcb.rexmt_timeout();
        tcb.arm(TcpTimer::Retransmit, ticks);
    }
    tcb.cancel(TcpTimer::DelayedAck);
}

/// Send whatever the windows, timers and flags allow.
///
/// # Arguments
///
/// * `tcb` - Locked control block
/// * `env` - Transmit path
/// * `force` - Send at least one segment if any data is sendable (used by
///   retransmission and window probes)
pub(crate) fn trigger_send(tcb: &mut TcpControlBlock, env: &TcpEnv<'_>, force: bool) {
    match tcb.state {
        TcpState::Closed | TcpState::Listen => return,
        TcpState::SynSent | TcpState::SynReceived => {
            send_syn(tcb, env);
            return;
        }
        _ => {}
    }

    let mut force = force;
    loop {
        let buffered = tcb.snd_buf.len() as u32;
        let off = tcb.snd_nxt.wrapping_sub(tcb.snd_una);

        let mut win = tcb.snd_wnd;
        if tcb.config.congestion_control {
            win = win.min(tcb.cwnd);
        }
        if tcb.flags.contains(TcbFlags::FAST_REXMT) {
            win = win.min(off.wrapping_add(tcb.smss));
        }
        let probing = tcb.flags.contains(TcbFlags::PROBE) && win == 0;
        if probing {
            win = 1;
        }

        let mut len = win.min(buffered).saturating_sub(off);
        let mut more = false;
        if len > tcb.smss {
            len = tcb.smss;
            more = true;
        }

        // Sequence space already sent once may go again at any size; a
        // short segment reaching into new data waits like any other.
        let resend = seq_lt(tcb.snd_nxt, tcb.snd_max);
        let sent_before = tcb.snd_max.wrapping_sub(tcb.snd_nxt);
        if resend && len > sent_before && len < tcb.smss && !force {
            len = sent_before;
            more = true;
        }

        let fin_due = tcb.flags.contains(TcbFlags::FIN_PENDING)
            && (!tcb.flags.contains(TcbFlags::FIN_SENT) || resend)
            && off.wrapping_add(len) == buffered;

        let (window, current) = advertised_window(tcb);
        let opening = window - current;
        let window_update = opening > 0
            && (opening >= 2 * tcb.rmss || 4 * opening as usize >= tcb.rcv_buf.capacity());

        let idle = tcb.snd_max == tcb.snd_una;
        let mut send = false;
        if len > 0 {
            send = len == tcb.smss
                || (idle && off + len >= buffered)
                || (idle && len >= tcb.max_snd_wnd / 2)
                || force
                || resend;
        }
        if window_update || fin_due || tcb.flags.contains(TcbFlags::ACK_NOW) {
            send = true;
        }
        if !send {
            break;
        }

        let seq = tcb.snd_nxt;
        let mut flags = TCP_FLAG_ACK;
        if fin_due {
            flags |= TCP_FLAG_FIN;
        }
        if len > 0 && off + len == buffered {
            flags |= TCP_FLAG_PSH;
        }
        let header = TcpHeader::new(
            tcb.local.port,
            tcb.remote.port,
            seq,
            tcb.rcv_nxt,
            flags,
            window as u16,
        );
        let (a, b) = tcb.snd_buf.peek(off as usize, len as usize);
        emit(env, tcb.local, tcb.remote, &header, None, &[a, b]);

        if len > 0 || fin_due {
            if seq_lt(seq, tcb.snd_max) {
                TcpStats::bump(&env.stats.retransmissions);
            } else if tcb.rtt_timing.is_none() && !probing {
                tcb.rtt_timing = Some((seq, 0));
            }
        }

        let consumed = len + fin_due as u32;
        let end = seq.wrapping_add(consumed);
        if seq_gt(end, tcb.snd_max) {
            tcb.snd_max = end;
        }
        if fin_due {
            tcb.flags.insert(TcbFlags::FIN_SENT);
        }
        if probing {
            // The probe byte stays unsent from the sender's point of view.
            tcb.snd_nxt = seq;
        } else {
            tcb.snd_nxt = end;
            if consumed > 0 && !tcb.is_armed(TcpTimer::Retransmit) {
                let ticks = tcb.rexmt_timeout();
                tcb.arm(TcpTimer::Retransmit, ticks);
                tcb.cancel(TcpTimer::Persist);
            }
        }

        note_advertised(tcb, window);
        tcb.flags.remove(TcbFlags::ACK_NOW | TcbFlags::PROBE);
        tcb.cancel(TcpTimer::DelayedAck);
        force = false;

        if !more || tcb.flags.contains(TcbFlags::FAST_REXMT) {
            break;
        }
    }

    tcb.set_persist();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;

    fn established(h: &Harness) -> TcpControlBlock {
        let mut tcb = h.control_block();
        tcb.state = TcpState::Established;
        tcb.init_send_sequence(1000);
        tcb.snd_una = 1001;
        tcb.snd_nxt = 1001;
        tcb.snd_max = 1001;
        tcb.init_recv_sequence(5000);
        tcb.rcv_adv = tcb.rcv_nxt.wrapping_add(tcb.rcv_buf.capacity() as u32);
        tcb.snd_wnd = 8192;
        tcb.max_snd_wnd = 8192;
        tcb.smss = 100;
        tcb.rmss = 100;
        tcb.cwnd = 10_000;
        tcb
    }

    #[test]
    fn test_idle_connection_sends_small_remainder() {
        let h = Harness::new();
        let env = h.env();
        let mut tcb = established(&h);
        tcb.snd_buf.push(&[7u8; 30]);
        trigger_send(&mut tcb, &env, false);

        let segs = h.drain_tcp();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].payload.len(), 30);
        assert!(segs[0].header.is_psh());
        assert_eq!(tcb.snd_nxt, 1031);
        assert!(tcb.is_armed(TcpTimer::Retransmit));
        assert_eq!(tcb.rtt_timing, Some((1001, 0)));
    }

    #[test]
    fn test_small_segment_waits_while_data_in_flight() {
        let h = Harness::new();
        let env = h.env();
        let mut tcb = established(&h);
        tcb.snd_buf.push(&[1u8; 250]);
        trigger_send(&mut tcb, &env, false);
        // Two full segments; the 50-byte tail waits behind data in flight.
        let segs = h.drain_tcp();
        assert_eq!(segs.len(), 2);
        assert_eq!(tcb.snd_nxt, 1201);

        trigger_send(&mut tcb, &env, false);
        assert!(h.drain_tcp().is_empty());
    }

    #[test]
    fn test_window_never_shrinks() {
        let h = Harness::new();
        let env = h.env();
        let mut tcb = established(&h);
        let mut last_edge = tcb.rcv_adv;
        for round in 0..6u32 {
            // Peer data fills part of the buffer without being read.
            let fill = [0u8; 1000];
            let n = tcb.rcv_buf.push(&fill[..(round as usize * 700) % 1000]);
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(n as u32);
            tcb.flags.insert(TcbFlags::ACK_NOW);
            trigger_send(&mut tcb, &env, false);
            assert!(!seq_lt(tcb.rcv_adv, last_edge));
            last_edge = tcb.rcv_adv;

            for seg in h.drain_tcp() {
                let edge = seg.header.ack_num.wrapping_add(seg.header.window as u32);
                assert_eq!(edge, tcb.rcv_adv);
            }
        }
    }

    #[test]
    fn test_zero_window_probe_rolls_back() {
        let h = Harness::new();
        let env = h.env();
        let mut tcb = established(&h);
        tcb.snd_wnd = 0;
        tcb.snd_buf.push(b"hello");
        trigger_send(&mut tcb, &env, false);
        assert!(h.drain_tcp().is_empty());
        assert!(tcb.is_armed(TcpTimer::Persist));
        assert!(!tcb.is_armed(TcpTimer::Retransmit));

        tcb.cancel(TcpTimer::Persist);
        tcb.flags.insert(TcbFlags::PROBE);
        trigger_send(&mut tcb, &env, true);
        let segs = h.drain_tcp();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].payload, b"h");
        assert_eq!(tcb.snd_nxt, tcb.snd_una);
        assert!(tcb.is_armed(TcpTimer::Persist));
    }

    #[test]
    fn test_probed_byte_resent_alone_when_window_opens() {
        let h = Harness::new();
        let env = h.env();
        let mut tcb = established(&h);
        tcb.snd_wnd = 0;
        tcb.snd_buf.push(b"hello");
        tcb.flags.insert(TcbFlags::PROBE);
        trigger_send(&mut tcb, &env, true);
        assert_eq!(h.drain_tcp()[0].payload, b"h");
        assert_eq!((tcb.snd_nxt, tcb.snd_max), (1001, 1002));

        // Only the byte already on the wire may skip the small-segment rule.
        tcb.snd_wnd = 8192;
        tcb.cancel(TcpTimer::Persist);
        trigger_send(&mut tcb, &env, false);
        let segs = h.drain_tcp();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].payload, b"h");
        assert_eq!(tcb.snd_nxt, 1002);
        assert!(tcb.is_armed(TcpTimer::Retransmit));

        trigger_send(&mut tcb, &env, false);
        assert!(h.drain_tcp().is_empty());

        // Once acknowledged the connection is idle and the rest goes out.
        tcb.snd_buf.consume(1);
        tcb.snd_una = 1002;
        tcb.cancel(TcpTimer::Retransmit);
        trigger_send(&mut tcb, &env, false);
        let segs = h.drain_tcp();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].payload, b"ello");
    }

    #[test]
    fn test_acknowledged_fin_is_not_sent_again() {
        let h = Harness::new();
        let env = h.env();
        let mut tcb = established(&h);
        tcb.flags.insert(TcbFlags::FIN_PENDING);
        tcb.state = TcpState::FinWait1;
        trigger_send(&mut tcb, &env, false);
        assert!(h.drain_tcp()[0].header.is_fin());

        tcb.snd_una = tcb.snd_max;
        tcb.state = TcpState::FinWait2;
        tcb.cancel(TcpTimer::Retransmit);
        trigger_send(&mut tcb, &env, false);
        assert!(h.drain_tcp().is_empty());
        assert_eq!(tcb.snd_max, 1002);
        assert!(!tcb.is_armed(TcpTimer::Retransmit));

        // A timeout before the ACK still repeats the FIN.
        tcb.snd_una = 1001;
        tcb.snd_nxt = 1001;
        trigger_send(&mut tcb, &env, true);
        let segs = h.drain_tcp();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].header.is_fin());
        assert_eq!(segs[0].header.seq_num, 1001);
    }

    #[test]
    fn test_fin_follows_data() {
        let h = Harness::new();
        let env = h.env();
        let mut tcb = established(&h);
        tcb.snd_buf.push(b"bye");
        tcb.flags.insert(TcbFlags::FIN_PENDING);
        tcb.state = TcpState::FinWait1;
        trigger_send(&mut tcb, &env, false);
        let segs = h.drain_tcp();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].header.is_fin());
        assert_eq!(segs[0].payload, b"bye");
        assert_eq!(tcb.snd_max, 1001 + 4);
        assert!(tcb.flags.contains(TcbFlags::FIN_SENT));

        // Nothing left to send; the FIN is not repeated.
        trigger_send(&mut tcb, &env, false);
        assert!(h.drain_tcp().is_empty());
    }
}
