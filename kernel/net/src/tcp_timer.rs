//! TCP timers.
//!
//! Each connection carries four countdowns (retransmit, delayed ACK,
//! persist, TIME_WAIT) decremented once per engine tick. The tick snapshots
//! the registry, drops the registry lock, and then visits every connection
//! under its own lock, so the registry is never taken beneath a connection.

use crate::ip::IpLayer;
use crate::lockdep::LockToken;
use crate::tcp::{TcpError, TcpState, TcpStats};
use crate::tcp_cb::{TcbFlags, TcpControlBlock, TcpTimer};
use crate::tcp_output::{send_rst, trigger_send, TcpEnv};
use crate::tcp_socket::TcpLayer;

impl TcpLayer {
    /// Advance every connection's timers by one tick.
    pub(crate) fn tick(&self, ip: &IpLayer) {
        let env = self.env(ip);
        let mut token = LockToken::root();
        let snapshot = self.registry.snapshot(&mut token);

        for (id, conn) in snapshot {
            let (wake, release, parent) = {
                let mut tcb = conn.tcb.lock(&mut token);
                let release = tick_connection(&mut tcb, &env);
                (tcb.take_wake(), release, tcb.parent)
            };
            if wake {
                conn.events.post();
            }
            if release {
                self.release(&mut token, id, parent);
            }
        }
    }
}

/// Run one tick for a locked connection. Returns true when the connection
/// closed and must leave the registry.
fn tick_connection(tcb: &mut TcpControlBlock, env: &TcpEnv<'_>) -> bool {
    if let Some((_, ticks)) = tcb.rtt_timing.as_mut() {
        *ticks = ticks.saturating_add(1);
    }

    for timer in TcpTimer::ALL {
        let slot = &mut tcb.timers[timer as usize];
        if *slot == 0 {
            continue;
        }
        *slot -= 1;
        if *slot != 0 {
            continue;
        }
        let closed = match timer {
            TcpTimer::Retransmit => retransmit_expired(tcb, env),
            TcpTimer::DelayedAck => {
                tcb.flags.insert(TcbFlags::ACK_NOW);
                trigger_send(tcb, env, false);
                false
            }
            TcpTimer::Persist => {
                tcb.backoff = (tcb.backoff + 1).min(tcb.config.max_backoff_shift);
                tcb.flags.insert(TcbFlags::PROBE);
                trigger_send(tcb, env, true);
                false
            }
            TcpTimer::TimeWait => {
                log::debug!(target: "net::tcp", "{} <-> {}: {} expired", tcb.local, tcb.remote, tcb.state);
                tcb.mark_closed();
                true
            }
        };
        if closed {
            return true;
        }
    }
    false
}

/// Retransmission timeout: back off and resend from `snd_una`, or abort
/// once the retry limit is reached.
fn retransmit_expired(tcb: &mut TcpControlBlock, env: &TcpEnv<'_>) -> bool {
    let limit = if tcb.state.is_handshaking() {
        tcb.config.max_syn_retries
    } else {
        tcb.config.max_retries
    };

    if tcb.retries >= limit {
        log::warn!(
            target: "net::tcp",
            "{} -> {}: timed out in {} after {} retransmissions",
            tcb.local,
            tcb.remote,
            tcb.state,
            tcb.retries
        );
        if tcb.state != TcpState::SynSent {
            send_rst(tcb, env);
        }
        tcb.set_error(TcpError::TimedOut);
        TcpStats::bump(&env.stats.connections_timed_out);
        tcb.mark_closed();
        return true;
    }

    tcb.retries += 1;
    tcb.backoff = (tcb.backoff + 1).min(tcb.config.max_backoff_shift);
    tcb.ssthresh = (tcb.snd_wnd.min(tcb.cwnd) / 2).max(2 * tcb.smss);
    tcb.cwnd = tcb.smss;
    tcb.dup_acks = 0;
    tcb.bytes_acked = 0;
    tcb.rtt_timing = None;
    tcb.snd_nxt = tcb.snd_una;
    log::debug!(
        target: "net::tcp",
        "{} -> {}: retransmit #{} from {}",
        tcb.local,
        tcb.remote,
        tcb.retries,
        tcb.snd_una
    );
    trigger_send(tcb, env, true);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketError;
    use crate::testutil::{Harness, PEER_ADDR};

    #[test]
    fn test_syn_backoff_then_timeout() {
        let h = Harness::new();
        let sock = h.connect_tcp(PEER_ADDR, 9000);
        let syn = h.expect_tcp(1).remove(0);
        let iss = syn.header.seq_num;

        let mut gaps = alloc::vec::Vec::new();
        let mut since = 0u32;
        for _ in 0..10_000 {
            h.tick_tcp();
            since += 1;
            let segs = h.drain_tcp();
            if !segs.is_empty() {
                assert!(segs[0].header.is_syn());
                assert_eq!(segs[0].header.seq_num, iss);
                gaps.push(since);
                since = 0;
            }
            if h.with_tcb(&sock, |t| t.state) == TcpState::Closed {
                break;
            }
        }

        let cfg = h.config();
        assert_eq!(gaps.len() as u32, cfg.max_syn_retries);
        for pair in gaps.windows(2) {
            assert_eq!(pair[1], (pair[0] * 2).min(cfg.rto_max_ticks));
        }
        assert_eq!(gaps[0], cfg.syn_rto_ticks);
        assert_eq!(h.with_tcb(&sock, |t| t.error), Some(TcpError::TimedOut));
        assert!(matches!(sock.connect(crate::ipv4::SocketAddrV4::new(PEER_ADDR, 9000)), Err(SocketError::TimedOut)));
        assert_eq!(h.registered(), 0);
    }

    #[test]
    fn test_data_retransmit_resets_congestion_window() {
        let h = Harness::new();
        let (sock, _peer) = h.established_tcp(9001);
        sock.send(b"payload").unwrap();
        let first = h.expect_tcp(1).remove(0);
        let (rto, smss) = h.with_tcb(&sock, |t| (t.rexmt_timeout(), t.smss));

        for _ in 0..rto {
            h.tick_tcp();
        }
        let again = h.expect_tcp(1).remove(0);
        assert_eq!(again.header.seq_num, first.header.seq_num);
        assert_eq!(again.payload, first.payload);

        let (cwnd, ssthresh, backoff, timing) =
            h.with_tcb(&sock, |t| (t.cwnd, t.ssthresh, t.backoff, t.rtt_timing));
        assert_eq!(cwnd, smss);
        assert_eq!(ssthresh, 2 * smss);
        assert_eq!(backoff, 1);
        assert!(timing.is_none());
        assert_eq!(h.tcp_stats_retransmissions(), 1);
    }

    #[test]
    fn test_data_retries_exhausted_resets_connection() {
        let h = Harness::new();
        let (sock, peer) = h.established_tcp(9005);
        sock.send(b"lost").unwrap();
        let first = h.expect_tcp(1).remove(0);

        let mut retransmits = 0;
        let mut reset = None;
        for _ in 0..10_000 {
            h.tick_tcp();
            for seg in h.drain_tcp() {
                if seg.header.is_rst() {
                    reset = Some(seg);
                } else {
                    assert_eq!(seg.header.seq_num, first.header.seq_num);
                    assert_eq!(seg.payload, b"lost");
                    retransmits += 1;
                }
            }
            if h.with_tcb(&sock, |t| t.state) == TcpState::Closed {
                break;
            }
        }

        assert_eq!(retransmits, h.config().max_retries);
        let reset = reset.unwrap();
        assert_eq!(reset.header.ack_num, peer.rcv_nxt());
        assert_eq!(h.with_tcb(&sock, |t| t.error), Some(TcpError::TimedOut));
        assert!(matches!(sock.recv(&mut [0u8; 4]), Err(SocketError::TimedOut)));
        assert_eq!(h.registered(), 0);
    }

    #[test]
    fn test_delayed_ack_fires() {
        let h = Harness::new();
        let (_sock, peer) = h.established_tcp(9002);
        h.inject_tcp(&peer.data_at(peer.rcv_nxt(), b"abc"));
        assert!(h.drain_tcp().is_empty());
        for _ in 0..h.config().delack_ticks {
            h.tick_tcp();
        }
        let ack = h.expect_tcp(1).remove(0);
        assert_eq!(ack.header.ack_num, peer.rcv_nxt().wrapping_add(3));
    }

    #[test]
    fn test_persist_probes_closed_window() {
        let h = Harness::new();
        let (sock, peer) = h.established_tcp(9003);
        h.inject_tcp(&peer.window_update(0));
        sock.send(b"blocked").unwrap();
        assert!(h.drain_tcp().is_empty());
        assert!(h.with_tcb(&sock, |t| t.is_armed(TcpTimer::Persist)));

        let mut probe = None;
        for _ in 0..64 {
            h.tick_tcp();
            if let Some(seg) = h.drain_tcp().into_iter().next() {
                probe = Some(seg);
                break;
            }
        }
        let probe = probe.unwrap();
        assert_eq!(probe.payload, b"b");
        let (una, nxt) = h.with_tcb(&sock, |t| (t.snd_una, t.snd_nxt));
        assert_eq!(una, nxt);
        assert_eq!(probe.header.seq_num, una);
    }

    #[test]
    fn test_time_wait_expires() {
        let h = Harness::new();
        let (sock, peer) = h.established_tcp(9004);
        sock.close();
        let fin = h.expect_tcp(1).remove(0);
        assert!(fin.header.is_fin());

        h.inject_tcp(&peer.segment_acking(
            peer.rcv_nxt(),
            fin.header.seq_num.wrapping_add(1),
            crate::tcp::TCP_FLAG_ACK | crate::tcp::TCP_FLAG_FIN,
        ));
        assert_eq!(h.with_tcb(&sock, |t| t.state), TcpState::TimeWait);
        assert_eq!(h.expect_tcp(1)[0].header.ack_num, peer.rcv_nxt().wrapping_add(1));

        for _ in 0..h.config().time_wait_ticks() {
            h.tick_tcp();
        }
        assert_eq!(h.with_tcb(&sock, |t| t.state), TcpState::Closed);
        assert_eq!(h.registered(), 0);
    }
}
