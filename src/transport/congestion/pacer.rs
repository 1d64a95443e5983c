//! Token-bucket pacing layered on top of any congestion controller.
//!
//! Spreads a window's worth of packets over one smoothed RTT instead of
//! sending it as a single burst. The pacer never blocks: it only reports
//! the earliest time the next packet may go out.

use crate::transport::Instant;

/// Bucket capacity is the share of the window sent within this interval.
const BURST_INTERVAL: u64 = 2_000;
/// Capacity bounds, in datagrams.
const MIN_BURST_DATAGRAMS: u64 = 10;
const MAX_BURST_DATAGRAMS: u64 = 256;

#[derive(Debug, Clone)]
pub struct Pacer {
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
    last_window: u64,
    max_datagram_size: u64,
}

impl Pacer {
    pub fn new(smoothed_rtt: u64, window: u64, max_datagram_size: u64, now: Instant) -> Self {
        let capacity = burst_capacity(smoothed_rtt, window, max_datagram_size);
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
            last_window: window,
            max_datagram_size,
        }
    }

    /// A packet of `bytes` left the connection.
    pub fn on_sent(&mut self, bytes: u64) {
        self.tokens = self.tokens.saturating_sub(bytes);
    }

    /// Earliest time a packet of `bytes` may be sent, or `None` if it may
    /// go out right away.
    ///
    /// Tokens refill at `1.25 * window / smoothed_rtt`; the bucket is
    /// resized whenever the window changes.
    pub fn next_send_time(
        &mut self,
        smoothed_rtt: u64,
        window: u64,
        bytes: u64,
        now: Instant,
    ) -> Option<Instant> {
        if window != self.last_window {
            self.capacity = burst_capacity(smoothed_rtt, window, self.max_datagram_size);
            self.tokens = self.tokens.min(self.capacity);
            self.last_window = window;
        }
        if self.tokens >= bytes || smoothed_rtt == 0 || window == 0 {
            return None;
        }

        let elapsed = now.saturating_sub(self.last_refill);
        let refill = (window as u128 * 5 * elapsed as u128 / (4 * smoothed_rtt as u128)) as u64;
        if refill > 0 {
            self.tokens = self.tokens.saturating_add(refill).min(self.capacity);
            self.last_refill = now;
        }
        if self.tokens >= bytes {
            return None;
        }

        let missing = bytes.min(self.capacity) - self.tokens.min(bytes);
        let wait = (missing as u128 * 4 * smoothed_rtt as u128 / (5 * window as u128)) as u64;
        Some(now + wait.max(1))
    }
}

fn burst_capacity(smoothed_rtt: u64, window: u64, mds: u64) -> u64 {
    let share = if smoothed_rtt == 0 {
        window
    } else {
        (window as u128 * BURST_INTERVAL as u128 / smoothed_rtt as u128) as u64
    };
    share.clamp(MIN_BURST_DATAGRAMS * mds, MAX_BURST_DATAGRAMS * mds)
}
