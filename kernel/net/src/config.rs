//! Stack tunables.
//!
//! Every time-based TCP value is expressed in engine ticks (`tick_ms` each);
//! IP-layer timeouts use the one-second `ip_do_tick` or milliseconds.

/// Configuration captured by `NetStack::new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// Engine tick period in milliseconds.
    pub tick_ms: u32,
    /// TTL placed on locally originated datagrams.
    pub default_ttl: u8,

    // ------------------------------------------------------------------
    // TCP
    // ------------------------------------------------------------------
    /// Initial retransmission timeout; also the lower clamp for the RTO.
    pub rto_init_ticks: u32,
    /// Upper clamp for the RTO.
    pub rto_max_ticks: u32,
    /// Base retransmission timeout for SYN segments.
    pub syn_rto_ticks: u32,
    /// Delayed-ACK timeout.
    pub delack_ticks: u32,
    /// Maximum segment lifetime (TIME_WAIT lasts twice this).
    pub msl_ticks: u32,
    /// Retransmissions of data/FIN before the connection is aborted.
    pub max_retries: u32,
    /// Retransmissions of SYN before the connection is aborted.
    pub max_syn_retries: u32,
    /// Cap on the exponential backoff shift (2^shift multiplier).
    pub max_backoff_shift: u32,
    /// Send ring buffer size per connection.
    pub send_buffer: usize,
    /// Receive ring buffer size per connection.
    pub recv_buffer: usize,
    /// Upper bound on a listener's accept backlog.
    pub max_backlog: usize,
    /// Apply the congestion window to the usable send window.
    pub congestion_control: bool,

    // ------------------------------------------------------------------
    // IP
    // ------------------------------------------------------------------
    /// Seconds an incomplete datagram may wait for missing fragments.
    pub reassembly_timeout_secs: u32,
    /// How long a queued packet may wait for address resolution.
    pub tx_pending_timeout_ms: u64,
}

impl StackConfig {
    /// Duration of TIME_WAIT in ticks.
    #[inline]
    pub fn time_wait_ticks(&self) -> u32 {
        self.msl_ticks.saturating_mul(2)
    }

    /// Convert milliseconds to engine ticks, rounding up.
    #[inline]
    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        let tick = self.tick_ms.max(1);
        ms.div_ceil(tick)
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            tick_ms: 250,
            default_ttl: 64,
            rto_init_ticks: 4,
            rto_max_ticks: 256,
            syn_rto_ticks: 12,
            delack_ticks: 1,
            msl_ticks: 120,
            max_retries: 5,
            max_syn_retries: 5,
            max_backoff_shift: 10,
            send_buffer: 16 * 1024,
            recv_buffer: 16 * 1024,
            max_backlog: 15,
            congestion_control: true,
            reassembly_timeout_secs: 15,
            tx_pending_timeout_ms: 3000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = StackConfig::default();
        assert_eq!(cfg.tick_ms, 250);
        assert_eq!(cfg.time_wait_ticks(), 240);
        assert_eq!(cfg.ms_to_ticks(1000), 4);
        assert_eq!(cfg.ms_to_ticks(1001), 5);
    }
}
