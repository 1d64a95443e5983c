//! RTT estimation and the loss / probe timeout durations derived from it
//! (RFC 9002 §5, §6).

use crate::transport::{Instant, TIMER_GRANULARITY};

/// Upper bound on any single probe timeout: 60 seconds.
pub const MAX_PTO: u64 = 60_000_000;

/// Persistent congestion is declared after this many PTO periods without
/// an acknowledgment (RFC 9002 kPersistentCongestionThreshold).
pub const PERSISTENT_CONGESTION_THRESHOLD: u64 = 3;

/// RTT statistics of one connection, all in microseconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    initial_rtt: u64,
    smoothed_rtt: Option<u64>,
    rttvar: u64,
    min_rtt: u64,
    latest_rtt: u64,
    /// When the first sample was taken.
    first_sample_at: Option<Instant>,
}

impl RttEstimator {
    pub fn new(initial_rtt: u64) -> Self {
        Self {
            initial_rtt,
            smoothed_rtt: None,
            rttvar: initial_rtt / 2,
            min_rtt: u64::MAX,
            latest_rtt: 0,
            first_sample_at: None,
        }
    }

    /// Feed one RTT sample.
    ///
    /// `max_ack_delay` caps the peer-reported `ack_delay`; pass `None`
    /// before the handshake is confirmed, when the delay is used uncapped.
    pub fn update(
        &mut self,
        latest_rtt: u64,
        ack_delay: u64,
        max_ack_delay: Option<u64>,
        now: Instant,
    ) {
        self.latest_rtt = latest_rtt;
        self.min_rtt = self.min_rtt.min(latest_rtt);

        let Some(srtt) = self.smoothed_rtt else {
            self.smoothed_rtt = Some(latest_rtt);
            self.rttvar = latest_rtt / 2;
            self.first_sample_at = Some(now);
            return;
        };

        let ack_delay = max_ack_delay.map_or(ack_delay, |cap| ack_delay.min(cap));
        // Never subtract the ack delay below min_rtt.
        let adjusted_rtt = if latest_rtt >= self.min_rtt + ack_delay {
            latest_rtt - ack_delay
        } else {
            latest_rtt
        };

        self.rttvar = (3 * self.rttvar + srtt.abs_diff(adjusted_rtt)) / 4;
        self.smoothed_rtt = Some((7 * srtt + adjusted_rtt) / 8);
    }

    pub fn has_sample(&self) -> bool {
        self.smoothed_rtt.is_some()
    }

    /// Smoothed RTT, or the configured initial RTT before any sample.
    pub fn smoothed_rtt(&self) -> u64 {
        self.smoothed_rtt.unwrap_or(self.initial_rtt)
    }

    pub fn rttvar(&self) -> u64 {
        self.rttvar
    }

    /// Minimum RTT seen, or the initial RTT before any sample.
    pub fn min_rtt(&self) -> u64 {
        if self.min_rtt == u64::MAX {
            self.initial_rtt
        } else {
            self.min_rtt
        }
    }

    pub fn latest_rtt(&self) -> u64 {
        self.latest_rtt
    }

    pub fn first_sample_at(&self) -> Option<Instant> {
        self.first_sample_at
    }

    /// Age after which an unacknowledged packet below the largest acked
    /// one is declared lost: `max(1.25 * srtt, 1 ms) + max_ack_delay`.
    pub fn loss_delay(&self, max_ack_delay: u64) -> u64 {
        (self.smoothed_rtt() * 5 / 4).max(TIMER_GRANULARITY) + max_ack_delay
    }

    /// Probe timeout before backoff: `srtt + max(4 * rttvar, 1 ms) + max_ack_delay`.
    pub fn pto_base(&self, max_ack_delay: u64) -> u64 {
        self.smoothed_rtt() + (4 * self.rttvar).max(TIMER_GRANULARITY) + max_ack_delay
    }

    /// Probe timeout after `pto_count` consecutive expiries, capped at 60 s.
    pub fn pto(&self, max_ack_delay: u64, pto_count: u32) -> u64 {
        self.pto_base(max_ack_delay)
            .saturating_mul(1u64 << pto_count.min(32))
            .min(MAX_PTO)
    }

    /// Span of lost packets that counts as persistent congestion.
    pub fn persistent_congestion_period(&self, max_ack_delay: u64) -> u64 {
        self.pto_base(max_ack_delay) * PERSISTENT_CONGESTION_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_rtt_before_samples() {
        let rtt = RttEstimator::new(333_000);
        assert!(!rtt.has_sample());
        assert_eq!(rtt.smoothed_rtt(), 333_000);
        assert_eq!(rtt.rttvar(), 166_500);
        // 333 + 4 * 166.5 + 25 ms
        assert_eq!(rtt.pto_base(25_000), 1_024_000);
    }

    #[test]
    fn first_sample_sets_smoothed() {
        let mut rtt = RttEstimator::new(333_000);
        rtt.update(100_000, 0, None, 5);
        assert_eq!(rtt.smoothed_rtt(), 100_000);
        assert_eq!(rtt.rttvar(), 50_000);
        assert_eq!(rtt.min_rtt(), 100_000);
        assert_eq!(rtt.first_sample_at(), Some(5));
    }

    #[test]
    fn subsequent_samples_use_ewma() {
        let mut rtt = RttEstimator::new(333_000);
        rtt.update(100_000, 0, None, 0);
        rtt.update(120_000, 0, None, 0);
        // rttvar = (3 * 50_000 + 20_000) / 4
        assert_eq!(rtt.rttvar(), 42_500);
        // srtt = (7 * 100_000 + 120_000) / 8
        assert_eq!(rtt.smoothed_rtt(), 102_500);
    }

    #[test]
    fn ack_delay_is_capped_once_confirmed() {
        let mut rtt = RttEstimator::new(333_000);
        rtt.update(100_000, 0, None, 0);
        // 50 ms reported, 25 ms cap: 160 - 25 = 135 ms adjusted
        rtt.update(160_000, 50_000, Some(25_000), 0);
        assert_eq!(rtt.smoothed_rtt(), (7 * 100_000 + 135_000) / 8);

        let mut uncapped = RttEstimator::new(333_000);
        uncapped.update(100_000, 0, None, 0);
        uncapped.update(160_000, 50_000, None, 0);
        assert_eq!(uncapped.smoothed_rtt(), (7 * 100_000 + 110_000) / 8);
    }

    #[test]
    fn ack_delay_never_drops_below_min_rtt() {
        let mut rtt = RttEstimator::new(333_000);
        rtt.update(100_000, 0, None, 0);
        rtt.update(110_000, 20_000, Some(25_000), 0);
        // 110 - 20 would undercut min_rtt, so the raw sample is used
        assert_eq!(rtt.smoothed_rtt(), (7 * 100_000 + 110_000) / 8);
    }

    #[test]
    fn loss_delay_has_granularity_floor() {
        let mut rtt = RttEstimator::new(333_000);
        rtt.update(400, 0, None, 0);
        assert_eq!(rtt.loss_delay(0), TIMER_GRANULARITY);
        assert_eq!(rtt.loss_delay(25_000), TIMER_GRANULARITY + 25_000);
    }

    #[test]
    fn pto_backs_off_and_caps() {
        let mut rtt = RttEstimator::new(333_000);
        rtt.update(100_000, 0, None, 0);
        let base = rtt.pto_base(0);
        assert_eq!(base, 100_000 + 200_000);
        assert_eq!(rtt.pto(0, 1), base * 2);
        assert_eq!(rtt.pto(0, 3), base * 8);
        assert_eq!(rtt.pto(0, 20), MAX_PTO);
        assert_eq!(rtt.persistent_congestion_period(0), base * 3);
    }
}
