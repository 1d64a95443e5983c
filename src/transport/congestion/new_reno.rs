//! NewReno (RFC 9002 §7), the reference congestion control strategy.

use alloc::boxed::Box;

use super::{CongestionConfig, CongestionController};
use crate::transport::loss::RttEstimator;
use crate::transport::recovery::SentPacket;
use crate::transport::Instant;

pub struct NewReno {
    /// Congestion window in bytes.
    cwnd: u64,
    /// Slow start threshold.
    ssthresh: u64,
    /// Bytes in flight (sent but not yet acked or declared lost).
    bytes_in_flight: u64,
    /// Start of the current recovery period, if any.
    recovery_start_time: Option<Instant>,
    /// Acked bytes not yet turned into window growth during avoidance.
    bytes_acked: u64,
    max_datagram_size: u64,
    minimum_window: u64,
}

pub(super) fn factory(config: &CongestionConfig) -> Box<dyn CongestionController> {
    Box::new(NewReno::new(config))
}

impl NewReno {
    pub fn new(config: &CongestionConfig) -> Self {
        Self {
            cwnd: config.initial_window(),
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            recovery_start_time: None,
            bytes_acked: 0,
            max_datagram_size: config.max_datagram_size,
            minimum_window: config.minimum_window(),
        }
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    /// A packet sent at `sent_time` belongs to the current recovery period
    /// if it was sent at or before the period started.
    pub fn in_recovery(&self, sent_time: Instant) -> bool {
        self.recovery_start_time
            .is_some_and(|start| sent_time <= start)
    }

    fn on_packet_acked(&mut self, bytes: u64, sent_time: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        if self.in_recovery(sent_time) {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd += bytes;
        } else {
            // one datagram per window's worth of acked bytes
            self.bytes_acked += bytes;
            if self.bytes_acked >= self.cwnd {
                self.bytes_acked -= self.cwnd;
                self.cwnd += self.max_datagram_size;
            }
        }
    }

    fn on_congestion_event(&mut self, sent_time: Instant, now: Instant) {
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start_time = Some(now);
        self.ssthresh = (self.cwnd / 2).max(self.minimum_window);
        self.cwnd = self.ssthresh;
        self.bytes_acked = 0;
        tracing::debug!(cwnd = self.cwnd, "congestion event");
    }
}

impl CongestionController for NewReno {
    fn on_packet_sent(&mut self, _now: Instant, bytes: u64) {
        self.bytes_in_flight += bytes;
    }

    fn on_packets_acked(&mut self, packets: &[SentPacket], _now: Instant) {
        for p in packets.iter().filter(|p| p.in_flight) {
            self.on_packet_acked(p.size as u64, p.time_sent);
        }
    }

    fn on_packets_lost(&mut self, packets: &[SentPacket], now: Instant, persistent_congestion: bool) {
        let mut newest_lost = None;
        for p in packets.iter().filter(|p| p.in_flight) {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(p.size as u64);
            newest_lost = newest_lost.max(Some(p.time_sent));
        }
        let Some(sent_time) = newest_lost else {
            return;
        };
        self.on_congestion_event(sent_time, now);

        if persistent_congestion {
            self.cwnd = self.minimum_window;
            self.recovery_start_time = None;
            tracing::debug!(cwnd = self.cwnd, "persistent congestion");
        }
    }

    fn on_rtt_sample(&mut self, _rtt: &RttEstimator) {}

    fn on_packets_discarded(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketSpace;
    use alloc::vec::Vec;

    const MDS: u64 = 1200;

    fn reno() -> NewReno {
        NewReno::new(&CongestionConfig {
            max_datagram_size: MDS,
        })
    }

    fn pkt(pn: u64, time_sent: Instant) -> SentPacket {
        SentPacket {
            pn,
            space: PacketSpace::Application,
            time_sent,
            size: MDS as usize,
            ack_eliciting: true,
            in_flight: true,
            is_probe: false,
            frames: Vec::new(),
        }
    }

    fn send(cc: &mut NewReno, pn: u64, at: Instant) -> SentPacket {
        cc.on_packet_sent(at, MDS);
        pkt(pn, at)
    }

    #[test]
    fn initial_state() {
        let cc = reno();
        assert_eq!(cc.congestion_window(), 12_000);
        assert_eq!(cc.ssthresh(), u64::MAX);
        assert!(cc.in_slow_start());
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut cc = reno();
        let initial = cc.congestion_window();
        let p = send(&mut cc, 0, 1000);
        assert_eq!(cc.bytes_in_flight(), MDS);
        cc.on_packets_acked(&[p], 2000);
        assert_eq!(cc.congestion_window(), initial + MDS);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn loss_halves_window_once_per_period() {
        let mut cc = reno();
        let initial = cc.congestion_window();
        let a = send(&mut cc, 0, 1000);
        let b = send(&mut cc, 1, 1500);

        cc.on_packets_lost(&[a], 2000, false);
        let halved = (initial / 2).max(2 * MDS);
        assert_eq!(cc.congestion_window(), halved);
        assert_eq!(cc.ssthresh(), halved);
        assert!(!cc.in_slow_start());
        assert!(cc.in_recovery(2000));
        assert!(!cc.in_recovery(2001));

        // b was sent before recovery started: no second reduction
        cc.on_packets_lost(&[b], 3000, false);
        assert_eq!(cc.congestion_window(), halved);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn acks_from_recovery_period_do_not_grow_window() {
        let mut cc = reno();
        let a = send(&mut cc, 0, 1000);
        let b = send(&mut cc, 1, 1500);
        cc.on_packets_lost(&[a], 2000, false);
        let cwnd = cc.congestion_window();
        cc.on_packets_acked(&[b], 2500);
        assert_eq!(cc.congestion_window(), cwnd);
    }

    #[test]
    fn congestion_avoidance_adds_one_datagram_per_window() {
        let mut cc = reno();
        let lost = send(&mut cc, 0, 1000);
        cc.on_packets_lost(&[lost], 2000, false);
        let cwnd = cc.congestion_window();

        let per_window = cwnd / MDS;
        let acked: Vec<_> = (0..per_window).map(|i| send(&mut cc, 10 + i, 3000)).collect();
        cc.on_packets_acked(&acked, 4000);
        assert_eq!(cc.congestion_window(), cwnd + MDS);
    }

    #[test]
    fn persistent_congestion_collapses_window() {
        let mut cc = reno();
        let a = send(&mut cc, 0, 1000);
        let b = send(&mut cc, 1, 2000);
        cc.on_packets_lost(&[a, b], 900_000, true);
        assert_eq!(cc.congestion_window(), 2 * MDS);
        assert!(!cc.in_recovery(1));
    }

    #[test]
    fn discard_and_non_flight_packets_leave_window_alone() {
        let mut cc = reno();
        cc.on_packet_sent(0, 3000);
        cc.on_packets_discarded(3000);
        assert_eq!(cc.bytes_in_flight(), 0);

        let mut ack_only = pkt(5, 10);
        ack_only.in_flight = false;
        let cwnd = cc.congestion_window();
        cc.on_packets_lost(&[ack_only], 20, false);
        assert_eq!(cc.congestion_window(), cwnd);
    }
}
