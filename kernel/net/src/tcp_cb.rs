//! TCP control block.
//!
//! One `TcpControlBlock` per connection holds every piece of mutable
//! protocol state: identity, sequence and window variables, congestion and
//! RTT state, the four timers, and the send/receive rings. It is always
//! accessed through the connection lock of its `TcpConnection`.
//!
//! # Sequence space layout (send side)
//!
//! ```text
//!   snd_una          snd_nxt           snd_max
//!      |                |                 |
//!      v                v                 v
//! -----+================+=================+~~~~~~~~~~~~~+-----
//!      | sent, unacked  | being resent    | unsent data  |
//!      +----------------+-----------------+--------------+
//!      ^ head of snd_buf                    tail of snd_buf ^
//! ```
//!
//! The send ring holds exactly the bytes from `snd_una` onward (once the SYN
//! is acknowledged). `snd_nxt` only falls behind `snd_max` while
//! retransmitting.

use alloc::collections::VecDeque;

use crate::config::StackConfig;
use crate::ipv4::SocketAddrV4;
use crate::lockdep::{ConnectionLevel, OrderedMutex};
use crate::ring::RingBuffer;
use crate::tcp::{seq_gt, TcpError, TcpState, TCP_DEFAULT_MSS, TCP_INITIAL_SSTHRESH};
use crate::tcp_registry::ConnId;
use crate::wait::WaitQueue;

// ============================================================================
// Timers
// ============================================================================

/// The four per-connection countdowns, in engine ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTimer {
    Retransmit = 0,
    DelayedAck = 1,
    Persist = 2,
    TimeWait = 3,
}

impl TcpTimer {
    pub const ALL: [TcpTimer; 4] = [
        TcpTimer::Retransmit,
        TcpTimer::DelayedAck,
        TcpTimer::Persist,
        TcpTimer::TimeWait,
    ];
}

bitflags::bitflags! {
    /// Control block flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcbFlags: u32 {
        /// Send an ACK on the next output pass regardless of data
        const ACK_NOW = 0x0001;
        /// Application closed or shut down the send side; FIN follows the data
        const FIN_PENDING = 0x0002;
        /// Our FIN has been transmitted at least once
        const FIN_SENT = 0x0004;
        /// Peer FIN consumed (rcv_nxt already advanced past it)
        const FIN_RECEIVED = 0x0008;
        /// Next output pass is a window probe
        const PROBE = 0x0010;
        /// A waiter must be woken once the connection lock is dropped
        const WAKE = 0x0020;
        /// Application closed the socket; nobody will read again
        const DETACHED = 0x0040;
        /// Fast retransmit in progress: the next output pass sends at most
        /// one segment from `snd_una`
        const FAST_REXMT = 0x0080;
    }
}

/// Accept queue of a listening connection.
#[derive(Debug)]
pub struct ListenQueue {
    pub backlog: usize,
    /// Children in SYN_RCVD or ESTABLISHED, oldest first.
    pub pending: VecDeque<ConnId>,
}

impl ListenQueue {
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.backlog
    }
}

// ============================================================================
// Control Block
// ============================================================================

/// Transmission Control Block
#[derive(Debug)]
pub struct TcpControlBlock {
    pub state: TcpState,
    /// Registry handle, set under the registry lock when registered.
    pub id: Option<ConnId>,
    /// Listening parent of a passively opened connection.
    pub parent: Option<ConnId>,
    /// Local endpoint; written only under the registry lock.
    pub local: SocketAddrV4,
    /// Remote endpoint; written only under the registry lock.
    pub remote: SocketAddrV4,

    // Send sequence variables
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_max: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    /// Largest window the peer has ever advertised.
    pub max_snd_wnd: u32,

    // Receive sequence variables
    pub irs: u32,
    pub rcv_nxt: u32,
    /// Right edge of the last advertised window.
    pub rcv_adv: u32,

    /// MSS we may send (peer's limit).
    pub smss: u32,
    /// MSS we advertise (route MTU minus headers).
    pub rmss: u32,

    // Congestion control
    pub cwnd: u32,
    pub ssthresh: u32,
    pub dup_acks: u32,
    /// Bytes acknowledged since the last congestion-avoidance increase.
    pub bytes_acked: u32,

    // RTT estimation, fixed point scaled by 8
    pub srtt: i32,
    pub rttvar: i32,
    pub rtt_seeded: bool,
    /// Current RTO in ticks, clamped to the configured range.
    pub rto: u32,
    /// Sequence number being timed and ticks elapsed since it was sent.
    pub rtt_timing: Option<(u32, u32)>,
    pub backoff: u32,
    pub retries: u32,

    pub timers: [u32; 4],
    pub flags: TcbFlags,
    /// Error reported to the application once.
    pub error: Option<TcpError>,

    pub snd_buf: RingBuffer,
    pub rcv_buf: RingBuffer,
    pub listen: Option<ListenQueue>,

    pub config: StackConfig,
}

impl TcpControlBlock {
    /// Fresh CLOSED control block.
    pub fn new(config: &StackConfig) -> Self {
        TcpControlBlock {
            state: TcpState::Closed,
            id: None,
            parent: None,
            local: SocketAddrV4::UNSPECIFIED,
            remote: SocketAddrV4::UNSPECIFIED,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_max: 0,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            max_snd_wnd: 0,
            irs: 0,
            rcv_nxt: 0,
            rcv_adv: 0,
            smss: TCP_DEFAULT_MSS as u32,
            rmss: TCP_DEFAULT_MSS as u32,
            cwnd: 2 * TCP_DEFAULT_MSS as u32,
            ssthresh: TCP_INITIAL_SSTHRESH,
            dup_acks: 0,
            bytes_acked: 0,
            srtt: 0,
            rttvar: 0,
            rtt_seeded: false,
            rto: config.rto_init_ticks,
            rtt_timing: None,
            backoff: 0,
            retries: 0,
            timers: [0; 4],
            flags: TcbFlags::empty(),
            error: None,
            snd_buf: RingBuffer::new(config.send_buffer),
            rcv_buf: RingBuffer::new(config.recv_buffer),
            listen: None,
            config: *config,
        }
    }

    /// Initialise the send sequence space from `iss`.
    pub fn init_send_sequence(&mut self, iss: u32) {
        self.iss = iss;
        self.snd_una = iss;
        self.snd_nxt = iss;
        self.snd_max = iss;
    }

    /// Initialise the receive sequence space from the peer's SYN.
    pub fn init_recv_sequence(&mut self, irs: u32) {
        self.irs = irs;
        self.rcv_nxt = irs.wrapping_add(1);
        self.rcv_adv = self.rcv_nxt;
    }

    /// Pick the send MSS from the peer's option and our own limit.
    pub fn set_peer_mss(&mut self, peer: Option<u16>) {
        let peer = peer.unwrap_or(TCP_DEFAULT_MSS) as u32;
        self.smss = peer.min(self.rmss).max(1);
        self.cwnd = 2 * self.smss;
    }

    /// Whether our SYN is still unacknowledged.
    #[inline]
    pub fn syn_unacked(&self) -> bool {
        self.snd_una == self.iss && self.snd_max != self.iss
    }

    /// Sequence space sent but not acknowledged.
    #[inline]
    pub fn in_flight(&self) -> u32 {
        self.snd_max.wrapping_sub(self.snd_una)
    }

    /// Receive window currently advertised to the peer.
    #[inline]
    pub fn rcv_wnd(&self) -> u32 {
        if seq_gt(self.rcv_adv, self.rcv_nxt) {
            self.rcv_adv.wrapping_sub(self.rcv_nxt)
        } else {
            0
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    #[inline]
    pub fn arm(&mut self, timer: TcpTimer, ticks: u32) {
        self.timers[timer as usize] = ticks.max(1);
    }

    #[inline]
    pub fn cancel(&mut self, timer: TcpTimer) {
        self.timers[timer as usize] = 0;
    }

    #[inline]
    pub fn is_armed(&self, timer: TcpTimer) -> bool {
        self.timers[timer as usize] != 0
    }

    pub fn cancel_all_timers(&mut self) {
        self.timers = [0; 4];
    }

    /// Retransmission timeout for the next arm: `base << backoff`, where the
    /// base is the SYN timeout during the handshake and the RTO otherwise.
    pub fn rexmt_timeout(&self) -> u32 {
        let base = if self.state.is_handshaking() {
            self.config.syn_rto_ticks
        } else {
            self.rto
        };
        let shift = self.backoff.min(self.config.max_backoff_shift);
        base.saturating_mul(1 << shift).min(self.config.rto_max_ticks)
    }

    /// Arm the persist timer if data waits behind a closed window with
    /// nothing in flight.
    pub fn set_persist(&mut self) {
        let unsent = self.snd_buf.len() as u32 > self.snd_nxt.wrapping_sub(self.snd_una);
        if unsent
            && self.snd_wnd == 0
            && !self.is_armed(TcpTimer::Retransmit)
            && !self.is_armed(TcpTimer::Persist)
        {
            let ticks = self.rexmt_timeout();
            self.arm(TcpTimer::Persist, ticks);
        }
    }

    // ------------------------------------------------------------------
    // RTT estimation
    // ------------------------------------------------------------------

    /// Feed an RTT sample (in ticks) into the smoothed estimator.
    pub fn update_rtt(&mut self, sample: u32) {
        let sample = sample.min(i32::MAX as u32 / 8) as i32;
        if self.rtt_seeded {
            let delta = 8 * sample - self.srtt;
            self.srtt += delta / 8;
            self.rttvar += (delta.abs() - self.rttvar) / 4;
        } else {
            self.srtt = 8 * sample;
            self.rttvar = self.srtt / 2;
            self.rtt_seeded = true;
        }
        let rto = ((self.srtt + 4 * self.rttvar) / 8).max(0) as u32;
        self.rto = rto.clamp(self.config.rto_init_ticks, self.config.rto_max_ticks);
    }

    // ------------------------------------------------------------------
    // State changes
    // ------------------------------------------------------------------

    /// Request a wakeup of this connection's waiters.
    #[inline]
    pub fn wake(&mut self) {
        self.flags.insert(TcbFlags::WAKE);
    }

    /// Consume the pending wakeup request.
    #[inline]
    pub fn take_wake(&mut self) -> bool {
        let wake = self.flags.contains(TcbFlags::WAKE);
        self.flags.remove(TcbFlags::WAKE);
        wake
    }

    /// Record an error for the application; the first one wins.
    pub fn set_error(&mut self, err: TcpError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.wake();
    }

    /// Move to CLOSED and stop every timer.
    pub fn mark_closed(&mut self) {
        self.state = TcpState::Closed;
        self.cancel_all_timers();
        self.wake();
    }

    /// Enter TIME_WAIT for twice the MSL.
    pub fn enter_time_wait(&mut self) {
        self.state = TcpState::TimeWait;
        self.cancel_all_timers();
        let ticks = self.config.time_wait_ticks();
        self.arm(TcpTimer::TimeWait, ticks);
        self.wake();
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A registered TCP connection: the locked control block plus the event
/// queue its application waits on.
pub struct TcpConnection {
    pub(crate) tcb: OrderedMutex<ConnectionLevel, TcpControlBlock>,
    pub(crate) events: WaitQueue,
}

impl TcpConnection {
    pub fn new(tcb: TcpControlBlock, events: WaitQueue) -> Self {
        TcpConnection {
            tcb: OrderedMutex::new(tcb),
            events,
        }
    }

    pub fn events(&self) -> &WaitQueue {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_first_sample_and_smoothing() {
        let mut tcb = TcpControlBlock::new(&StackConfig::default());
        tcb.update_rtt(8);
        assert_eq!(tcb.srtt, 64);
        assert_eq!(tcb.rttvar, 32);
        // (64 + 128) / 8
        assert_eq!(tcb.rto, 24);

        tcb.update_rtt(16);
        // delta = 128 - 64
        assert_eq!(tcb.srtt, 72);
        assert_eq!(tcb.rttvar, 40);
        assert_eq!(tcb.rto, 29);
    }

    #[test]
    fn test_rto_is_clamped() {
        let cfg = StackConfig::default();
        let mut tcb = TcpControlBlock::new(&cfg);
        tcb.update_rtt(0);
        assert_eq!(tcb.rto, cfg.rto_init_ticks);
        tcb.update_rtt(10_000);
        assert_eq!(tcb.rto, cfg.rto_max_ticks);
    }

    #[test]
    fn test_rexmt_timeout_backoff() {
        let cfg = StackConfig::default();
        let mut tcb = TcpControlBlock::new(&cfg);
        tcb.state = TcpState::SynSent;
        assert_eq!(tcb.rexmt_timeout(), cfg.syn_rto_ticks);
        tcb.backoff = 2;
        assert_eq!(tcb.rexmt_timeout(), cfg.syn_rto_ticks * 4);

        tcb.state = TcpState::Established;
        tcb.backoff = 1;
        assert_eq!(tcb.rexmt_timeout(), cfg.rto_init_ticks * 2);
        tcb.backoff = 30;
        assert_eq!(tcb.rexmt_timeout(), cfg.rto_max_ticks);
    }

    #[test]
    fn test_error_reported_first_wins() {
        let mut tcb = TcpControlBlock::new(&StackConfig::default());
        tcb.set_error(TcpError::ConnectionReset);
        tcb.set_error(TcpError::TimedOut);
        assert_eq!(tcb.error, Some(TcpError::ConnectionReset));
        assert!(tcb.take_wake());
        assert!(!tcb.take_wake());
    }
}
