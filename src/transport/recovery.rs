//! Loss detection and recovery over the three packet number spaces
//! (RFC 9002 §6).
//!
//! The engine keeps a record of every ack-eliciting or in-flight packet
//! sent, processes ACK frames against it, declares packets lost by packet
//! and time thresholds, and drives the probe timeout. Congestion signals go
//! straight to the connection's [`CongestionController`]; the frames of
//! lost packets are handed back to the connection for re-queueing.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;

use crate::error::{Error, TransportError};
use crate::packet::PacketSpace;
use crate::transport::congestion::CongestionController;
use crate::transport::loss::RttEstimator;
use crate::transport::range_set::RangeSet;
use crate::transport::Instant;

/// Received packet ranges remembered per space for ACK generation.
pub const MAX_ACK_RANGES: usize = 32;

/// Ack-eliciting packets received before an Application ACK is sent
/// without waiting for `max_ack_delay`.
pub const ACK_ELICITING_THRESHOLD: u32 = 2;

/// Probe packets scheduled per PTO expiry.
pub const PROBES_PER_PTO: u8 = 2;

/// Retransmission metadata for one frame of a sent packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    /// Never retransmitted.
    Ack { largest: u64 },
    Ping,
    Crypto { offset: u64, len: u64 },
    Stream { stream_id: u64, offset: u64, len: u64, fin: bool },
    ResetStream { stream_id: u64, error_code: u64, final_size: u64 },
    StopSending { stream_id: u64, error_code: u64 },
    MaxData(u64),
    MaxStreamData { stream_id: u64, max: u64 },
    MaxStreams { bidirectional: bool, max: u64 },
    DataBlocked(u64),
    StreamDataBlocked { stream_id: u64, limit: u64 },
    StreamsBlocked { bidirectional: bool, limit: u64 },
    NewConnectionId { sequence: u64 },
    RetireConnectionId { sequence: u64 },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    HandshakeDone,
    ConnectionClose,
}

/// Record of a sent packet awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub pn: u64,
    pub space: PacketSpace,
    pub time_sent: Instant,
    /// Datagram bytes attributed to this packet.
    pub size: usize,
    pub ack_eliciting: bool,
    /// Counted towards bytes in flight.
    pub in_flight: bool,
    /// Sent as a PTO probe, exempt from the congestion window.
    pub is_probe: bool,
    pub frames: Vec<SentFrame>,
}

/// Result of processing one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Newly acknowledged packets, ascending.
    pub acked: Vec<SentPacket>,
    /// Packets declared lost while processing the ACK, ascending.
    pub lost: Vec<SentPacket>,
    /// RTT sample taken from the largest newly acknowledged packet.
    pub rtt_sample: Option<u64>,
    pub persistent_congestion: bool,
}

/// What the loss detection timer fired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTimer {
    LossTime(PacketSpace),
    Pto(PacketSpace),
}

/// Outcome of [`RecoveryEngine::on_timeout`].
#[derive(Debug)]
pub enum TimeoutOutcome {
    /// Nothing was due.
    Idle,
    /// Time-threshold losses in one space.
    Lost(PacketSpace, Vec<SentPacket>),
    /// A probe timeout: probes are owed in this space.
    Probe(PacketSpace),
    /// More consecutive probe timeouts than allowed.
    Exhausted,
}

#[derive(Debug, Default)]
struct SpaceRecovery {
    next_pn: u64,
    sent: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    loss_time: Option<Instant>,
    time_of_last_ack_eliciting: Option<Instant>,
    probes: u8,
    discarded: bool,
}

impl SpaceRecovery {
    fn ack_eliciting_in_flight(&self) -> bool {
        self.sent.values().any(|p| p.ack_eliciting && p.in_flight)
    }
}

/// Sent-side recovery state of one connection.
#[derive(Debug)]
pub struct RecoveryEngine {
    spaces: [SpaceRecovery; 3],
    rtt: RttEstimator,
    pto_count: u32,
    max_pto_probes: u32,
    packet_threshold: u64,
    /// Peer's max_ack_delay in microseconds.
    max_ack_delay: u64,
    handshake_confirmed: bool,
    last_sent: Option<Instant>,
}

impl RecoveryEngine {
    pub fn new(initial_rtt: u64, packet_threshold: u64, max_pto_probes: u32) -> Self {
        Self {
            spaces: Default::default(),
            rtt: RttEstimator::new(initial_rtt),
            pto_count: 0,
            max_pto_probes,
            packet_threshold: packet_threshold.max(1),
            max_ack_delay: 0,
            handshake_confirmed: false,
            last_sent: None,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    /// Peer's `max_ack_delay`, in microseconds, from its transport parameters.
    pub fn set_max_ack_delay(&mut self, max_ack_delay: u64) {
        self.max_ack_delay = max_ack_delay;
    }

    pub fn set_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
    }

    /// Allocate the next packet number of `space`.
    pub fn next_packet_number(&mut self, space: PacketSpace) -> u64 {
        let sp = &mut self.spaces[space.index()];
        let pn = sp.next_pn;
        sp.next_pn += 1;
        pn
    }

    /// The packet number the next packet of `space` will carry.
    pub fn peek_packet_number(&self, space: PacketSpace) -> u64 {
        self.spaces[space.index()].next_pn
    }

    pub fn largest_acked(&self, space: PacketSpace) -> Option<u64> {
        self.spaces[space.index()].largest_acked
    }

    pub fn is_discarded(&self, space: PacketSpace) -> bool {
        self.spaces[space.index()].discarded
    }

    /// Record a sent packet. ACK-only packets are not kept.
    pub fn on_packet_sent(&mut self, packet: SentPacket, cc: &mut dyn CongestionController) {
        let sp = &mut self.spaces[packet.space.index()];
        if packet.ack_eliciting {
            sp.time_of_last_ack_eliciting = Some(packet.time_sent);
        }
        if packet.in_flight {
            cc.on_packet_sent(packet.time_sent, packet.size as u64);
        }
        if packet.is_probe {
            sp.probes = sp.probes.saturating_sub(1);
        }
        self.last_sent = Some(packet.time_sent);
        if packet.ack_eliciting || packet.in_flight {
            sp.sent.insert(packet.pn, packet);
        }
    }

    /// Process the ranges of an ACK frame received in `space`.
    ///
    /// `ranges` lists acknowledged packet numbers, largest range first.
    /// `ack_delay` is already scaled to microseconds. Acknowledging a
    /// packet number never sent is a PROTOCOL_VIOLATION.
    pub fn on_ack_received(
        &mut self,
        space: PacketSpace,
        ranges: impl IntoIterator<Item = Range<u64>>,
        ack_delay: u64,
        now: Instant,
        cc: &mut dyn CongestionController,
    ) -> Result<AckOutcome, Error> {
        let sp = &mut self.spaces[space.index()];
        let mut ranges = ranges.into_iter().peekable();
        let largest = match ranges.peek() {
            Some(r) if r.end > r.start => r.end - 1,
            _ => return Ok(AckOutcome::default()),
        };
        if largest >= sp.next_pn {
            return Err(TransportError::ProtocolViolation.into());
        }
        sp.largest_acked = sp.largest_acked.max(Some(largest));

        let mut outcome = AckOutcome::default();
        for range in ranges {
            if range.start >= range.end {
                continue;
            }
            let pns: Vec<u64> = sp.sent.range(range).map(|(pn, _)| *pn).collect();
            for pn in pns {
                if let Some(p) = sp.sent.remove(&pn) {
                    outcome.acked.push(p);
                }
            }
        }
        if outcome.acked.is_empty() {
            return Ok(outcome);
        }
        outcome.acked.sort_unstable_by_key(|p| p.pn);

        if let Some(newest) = outcome.acked.last() {
            if newest.pn == largest && newest.ack_eliciting {
                let sample = now.saturating_sub(newest.time_sent);
                let cap = self.handshake_confirmed.then_some(self.max_ack_delay);
                self.rtt.update(sample, ack_delay, cap, now);
                cc.on_rtt_sample(&self.rtt);
                outcome.rtt_sample = Some(sample);
            }
        }

        outcome.lost = self.detect_lost(space, now);
        outcome.persistent_congestion = self.persistent_congestion(&outcome.lost, &outcome.acked);

        cc.on_packets_acked(&outcome.acked, now);
        if !outcome.lost.is_empty() {
            cc.on_packets_lost(&outcome.lost, now, outcome.persistent_congestion);
        }
        if outcome.acked.iter().any(|p| p.ack_eliciting) {
            self.pto_count = 0;
        }
        tracing::trace!(
            ?space,
            acked = outcome.acked.len(),
            lost = outcome.lost.len(),
            "processed ack"
        );
        Ok(outcome)
    }

    /// Declare lost every unacknowledged packet below the largest acked
    /// one that crosses the packet or time threshold, and re-arm the loss
    /// timer for the rest.
    fn detect_lost(&mut self, space: PacketSpace, now: Instant) -> Vec<SentPacket> {
        let loss_delay = self.rtt.loss_delay(self.max_ack_delay);
        let threshold = self.packet_threshold;
        let sp = &mut self.spaces[space.index()];
        sp.loss_time = None;
        let Some(largest) = sp.largest_acked else {
            return Vec::new();
        };

        let mut lost_pns = Vec::new();
        for (&pn, p) in sp.sent.range(..largest) {
            let age = now.saturating_sub(p.time_sent);
            if largest >= pn + threshold || age >= loss_delay {
                lost_pns.push(pn);
            } else {
                let deadline = p.time_sent + loss_delay;
                sp.loss_time = Some(sp.loss_time.map_or(deadline, |t| t.min(deadline)));
            }
        }

        let lost: Vec<SentPacket> = lost_pns
            .into_iter()
            .filter_map(|pn| sp.sent.remove(&pn))
            .collect();
        for p in &lost {
            tracing::debug!(?space, pn = p.pn, "packet lost");
        }
        lost
    }

    /// Lost ack-eliciting packets spanning more than the persistent
    /// congestion period, with nothing acknowledged in between and an RTT
    /// sample taken before the first of them was sent.
    fn persistent_congestion(&self, lost: &[SentPacket], acked: &[SentPacket]) -> bool {
        let Some(first_sample) = self.rtt.first_sample_at() else {
            return false;
        };
        let mut eliciting = lost
            .iter()
            .filter(|p| p.ack_eliciting && p.time_sent > first_sample)
            .map(|p| p.time_sent);
        let Some(first) = eliciting.next() else {
            return false;
        };
        let (earliest, latest) = eliciting.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
        let period = self.rtt.persistent_congestion_period(self.max_ack_delay);
        latest - earliest > period
            && !acked
                .iter()
                .any(|p| p.time_sent > earliest && p.time_sent < latest)
    }

    /// Next loss detection deadline and what it is for.
    ///
    /// `anti_deadlock` names the space a client still in its handshake
    /// must probe in when nothing ack-eliciting is in flight.
    pub fn timer(&self, anti_deadlock: Option<PacketSpace>) -> Option<(Instant, RecoveryTimer)> {
        let loss = PacketSpace::ALL
            .iter()
            .filter_map(|&s| self.spaces[s.index()].loss_time.map(|t| (t, s)))
            .min_by_key(|(t, _)| *t);
        if let Some((t, space)) = loss {
            return Some((t, RecoveryTimer::LossTime(space)));
        }

        let mut best: Option<(Instant, RecoveryTimer)> = None;
        for space in PacketSpace::ALL {
            let sp = &self.spaces[space.index()];
            if sp.discarded || !sp.ack_eliciting_in_flight() {
                continue;
            }
            if space == PacketSpace::Application && !self.handshake_confirmed {
                break;
            }
            let Some(last) = sp.time_of_last_ack_eliciting else {
                continue;
            };
            let t = last + self.pto_duration(space);
            if best.map_or(true, |(b, _)| t < b) {
                best = Some((t, RecoveryTimer::Pto(space)));
            }
        }
        if best.is_some() {
            return best;
        }

        let space = anti_deadlock?;
        let base = self.last_sent?;
        Some((base + self.pto_duration(space), RecoveryTimer::Pto(space)))
    }

    fn pto_duration(&self, space: PacketSpace) -> u64 {
        let max_ack_delay = if space == PacketSpace::Application {
            self.max_ack_delay
        } else {
            0
        };
        self.rtt.pto(max_ack_delay, self.pto_count)
    }

    /// Run the loss detection timer if it is due at `now`.
    pub fn on_timeout(
        &mut self,
        now: Instant,
        anti_deadlock: Option<PacketSpace>,
        cc: &mut dyn CongestionController,
    ) -> TimeoutOutcome {
        let Some((deadline, timer)) = self.timer(anti_deadlock) else {
            return TimeoutOutcome::Idle;
        };
        if deadline > now {
            return TimeoutOutcome::Idle;
        }
        match timer {
            RecoveryTimer::LossTime(space) => {
                let lost = self.detect_lost(space, now);
                let persistent = self.persistent_congestion(&lost, &[]);
                if !lost.is_empty() {
                    cc.on_packets_lost(&lost, now, persistent);
                }
                TimeoutOutcome::Lost(space, lost)
            }
            RecoveryTimer::Pto(space) => {
                self.pto_count += 1;
                if self.pto_count > self.max_pto_probes {
                    tracing::debug!(pto_count = self.pto_count, "probe timeouts exhausted");
                    return TimeoutOutcome::Exhausted;
                }
                self.spaces[space.index()].probes = PROBES_PER_PTO;
                // stop the timer from re-firing until a probe goes out
                self.last_sent = Some(now);
                if let Some(t) = self.spaces[space.index()].time_of_last_ack_eliciting.as_mut() {
                    *t = now;
                }
                tracing::debug!(?space, pto_count = self.pto_count, "probe timeout");
                TimeoutOutcome::Probe(space)
            }
        }
    }

    /// Probe packets still owed in `space`.
    pub fn probes_pending(&self, space: PacketSpace) -> u8 {
        self.spaces[space.index()].probes
    }

    /// Drop every record of `space` without a congestion signal.
    pub fn discard_space(&mut self, space: PacketSpace, cc: &mut dyn CongestionController) {
        let sp = &mut self.spaces[space.index()];
        let bytes: u64 = sp
            .sent
            .values()
            .filter(|p| p.in_flight)
            .map(|p| p.size as u64)
            .sum();
        cc.on_packets_discarded(bytes);
        sp.sent.clear();
        sp.loss_time = None;
        sp.time_of_last_ack_eliciting = None;
        sp.probes = 0;
        sp.discarded = true;
        self.pto_count = 0;
        tracing::debug!(?space, "discarded packet number space");
    }
}

/// Receive-side bookkeeping of one packet number space: which packet
/// numbers arrived and when an ACK is owed.
#[derive(Debug, Clone)]
pub struct ReceivedPackets {
    ranges: RangeSet,
    largest: Option<(u64, Instant)>,
    unacked_eliciting: u32,
    ack_deadline: Option<Instant>,
    ack_immediately: bool,
}

impl Default for ReceivedPackets {
    fn default() -> Self {
        Self {
            ranges: RangeSet::with_limit(MAX_ACK_RANGES),
            largest: None,
            unacked_eliciting: 0,
            ack_deadline: None,
            ack_immediately: false,
        }
    }
}

impl ReceivedPackets {
    /// Largest packet number received, for packet number recovery.
    pub fn largest(&self) -> Option<u64> {
        self.largest.map(|(pn, _)| pn)
    }

    pub fn ranges(&self) -> &RangeSet {
        &self.ranges
    }

    /// Record an authenticated packet. Returns `false` for a duplicate,
    /// which leaves the state untouched.
    ///
    /// `max_ack_delay` of `None` asks for an immediate ACK (Initial and
    /// Handshake spaces).
    pub fn on_packet_received(
        &mut self,
        pn: u64,
        ack_eliciting: bool,
        now: Instant,
        max_ack_delay: Option<u64>,
    ) -> bool {
        if !self.ranges.insert_one(pn) {
            return false;
        }
        let out_of_order = self.largest.is_some_and(|(largest, _)| pn < largest);
        if self.largest.map_or(true, |(largest, _)| pn > largest) {
            self.largest = Some((pn, now));
        }
        if !ack_eliciting {
            return true;
        }

        self.unacked_eliciting += 1;
        match max_ack_delay {
            None => self.ack_immediately = true,
            Some(_) if out_of_order || self.unacked_eliciting >= ACK_ELICITING_THRESHOLD => {
                self.ack_immediately = true;
            }
            Some(delay) => {
                let deadline = now + delay;
                self.ack_deadline = Some(self.ack_deadline.map_or(deadline, |d| d.min(deadline)));
            }
        }
        true
    }

    /// Whether an ACK should go out in the next packet built at `now`.
    pub fn ack_due(&self, now: Instant) -> bool {
        self.ack_immediately || self.ack_deadline.is_some_and(|d| d <= now)
    }

    /// Deadline of a delayed ACK, if one is pending.
    pub fn ack_deadline(&self) -> Option<Instant> {
        if self.ack_immediately {
            return None;
        }
        self.ack_deadline
    }

    /// Microseconds since the largest packet arrived.
    pub fn ack_delay(&self, now: Instant) -> u64 {
        self.largest.map_or(0, |(_, t)| now.saturating_sub(t))
    }

    /// An ACK covering the current ranges was sent.
    pub fn on_ack_sent(&mut self) {
        self.unacked_eliciting = 0;
        self.ack_deadline = None;
        self.ack_immediately = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::congestion::{CongestionConfig, CongestionController, NewReno};
    use alloc::vec;

    fn engine() -> (RecoveryEngine, NewReno) {
        let cc = NewReno::new(&CongestionConfig {
            max_datagram_size: 1200,
        });
        (RecoveryEngine::new(333_000, 3, 5), cc)
    }

    fn stream_packet(pn: u64, time_sent: Instant) -> SentPacket {
        SentPacket {
            pn,
            space: PacketSpace::Application,
            time_sent,
            size: 1200,
            ack_eliciting: true,
            in_flight: true,
            is_probe: false,
            frames: vec![SentFrame::Stream {
                stream_id: 0,
                offset: pn * 100,
                len: 100,
                fin: false,
            }],
        }
    }

    fn send_range(rec: &mut RecoveryEngine, cc: &mut NewReno, pns: Range<u64>, at: Instant) {
        for _ in pns {
            let pn = rec.next_packet_number(PacketSpace::Application);
            rec.on_packet_sent(stream_packet(pn, at), cc);
        }
    }

    #[test]
    fn packet_numbers_are_per_space() {
        let (mut rec, _) = engine();
        assert_eq!(rec.next_packet_number(PacketSpace::Initial), 0);
        assert_eq!(rec.next_packet_number(PacketSpace::Initial), 1);
        assert_eq!(rec.next_packet_number(PacketSpace::Application), 0);
        assert_eq!(rec.peek_packet_number(PacketSpace::Initial), 2);
    }

    #[test]
    fn ack_of_five_to_ten_loses_one_to_four() {
        let (mut rec, mut cc) = engine();
        // packet 0 is acked earlier so 1..=10 are the outstanding ones
        send_range(&mut rec, &mut cc, 0..11, 1_000);
        rec.on_ack_received(PacketSpace::Application, [0..1], 0, 50_000, &mut cc)
            .unwrap();

        let outcome = rec
            .on_ack_received(PacketSpace::Application, [5..11], 0, 60_000, &mut cc)
            .unwrap();
        let acked: Vec<u64> = outcome.acked.iter().map(|p| p.pn).collect();
        let lost: Vec<u64> = outcome.lost.iter().map(|p| p.pn).collect();
        assert_eq!(acked, [5, 6, 7, 8, 9, 10]);
        assert_eq!(lost, [1, 2, 3, 4]);
        assert_eq!(outcome.rtt_sample, Some(59_000));

        // a second identical ACK reports nothing new
        let again = rec
            .on_ack_received(PacketSpace::Application, [5..11], 0, 61_000, &mut cc)
            .unwrap();
        assert!(again.acked.is_empty() && again.lost.is_empty());
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn packet_threshold_spares_recent_gaps() {
        let (mut rec, mut cc) = engine();
        send_range(&mut rec, &mut cc, 0..4, 1_000);
        let outcome = rec
            .on_ack_received(PacketSpace::Application, [3..4], 0, 2_000, &mut cc)
            .unwrap();
        // 0 is three below the largest acked; 1 and 2 wait for the loss timer
        let lost: Vec<u64> = outcome.lost.iter().map(|p| p.pn).collect();
        assert_eq!(lost, [0]);
        let (deadline, timer) = rec.timer(None).unwrap();
        assert_eq!(timer, RecoveryTimer::LossTime(PacketSpace::Application));

        match rec.on_timeout(deadline, None, &mut cc) {
            TimeoutOutcome::Lost(PacketSpace::Application, lost) => {
                assert_eq!(lost.iter().map(|p| p.pn).collect::<Vec<_>>(), [1, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn acking_unsent_packet_is_protocol_violation() {
        let (mut rec, mut cc) = engine();
        send_range(&mut rec, &mut cc, 0..2, 0);
        let err = rec
            .on_ack_received(PacketSpace::Application, [0..5], 0, 10, &mut cc)
            .unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::ProtocolViolation));
    }

    #[test]
    fn pto_schedules_probes_and_backs_off() {
        let (mut rec, mut cc) = engine();
        rec.set_handshake_confirmed();
        send_range(&mut rec, &mut cc, 0..1, 0);
        let (first, timer) = rec.timer(None).unwrap();
        assert_eq!(timer, RecoveryTimer::Pto(PacketSpace::Application));
        assert_eq!(first, rec.rtt().pto(0, 0));

        assert!(matches!(rec.on_timeout(first - 1, None, &mut cc), TimeoutOutcome::Idle));
        assert!(matches!(
            rec.on_timeout(first, None, &mut cc),
            TimeoutOutcome::Probe(PacketSpace::Application)
        ));
        assert_eq!(rec.pto_count(), 1);
        assert_eq!(rec.probes_pending(PacketSpace::Application), PROBES_PER_PTO);

        let (second, _) = rec.timer(None).unwrap();
        assert_eq!(second, first + rec.rtt().pto(0, 1));
    }

    #[test]
    fn pto_exhaustion_is_reported() {
        let mut rec = RecoveryEngine::new(333_000, 3, 2);
        let mut cc = NewReno::new(&CongestionConfig {
            max_datagram_size: 1200,
        });
        rec.set_handshake_confirmed();
        send_range(&mut rec, &mut cc, 0..1, 0);
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let (deadline, _) = rec.timer(None).unwrap();
            outcomes.push(rec.on_timeout(deadline, None, &mut cc));
        }
        assert!(matches!(outcomes[0], TimeoutOutcome::Probe(_)));
        assert!(matches!(outcomes[1], TimeoutOutcome::Probe(_)));
        assert!(matches!(outcomes[2], TimeoutOutcome::Exhausted));
    }

    #[test]
    fn application_pto_waits_for_confirmation() {
        let (mut rec, mut cc) = engine();
        send_range(&mut rec, &mut cc, 0..1, 0);
        assert!(rec.timer(None).is_none());
        let (_, timer) = rec.timer(Some(PacketSpace::Handshake)).unwrap();
        assert_eq!(timer, RecoveryTimer::Pto(PacketSpace::Handshake));
    }

    #[test]
    fn discard_space_releases_flight_without_congestion() {
        let (mut rec, mut cc) = engine();
        for _ in 0..3 {
            let pn = rec.next_packet_number(PacketSpace::Initial);
            let mut p = stream_packet(pn, 0);
            p.space = PacketSpace::Initial;
            rec.on_packet_sent(p, &mut cc);
        }
        let cwnd = cc.congestion_window();
        assert_eq!(cc.bytes_in_flight(), 3600);
        rec.discard_space(PacketSpace::Initial, &mut cc);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(cc.congestion_window(), cwnd);
        assert!(rec.is_discarded(PacketSpace::Initial));
        assert!(rec.timer(None).is_none());
    }

    #[test]
    fn persistent_congestion_needs_a_long_loss_span() {
        let (mut rec, mut cc) = engine();
        send_range(&mut rec, &mut cc, 0..1, 0);
        rec.on_ack_received(PacketSpace::Application, [0..1], 0, 100_000, &mut cc)
            .unwrap();
        let period = rec.rtt().persistent_congestion_period(0);

        let start = 200_000;
        send_range(&mut rec, &mut cc, 1..2, start);
        // the 1us sample taken below shrinks the period, so leave headroom
        let later = start + 2 * period;
        send_range(&mut rec, &mut cc, 2..3, later);
        send_range(&mut rec, &mut cc, 3..6, later + 1);
        let outcome = rec
            .on_ack_received(PacketSpace::Application, [5..6], 0, later + 2, &mut cc)
            .unwrap();
        assert_eq!(outcome.lost.len(), 2);
        assert!(outcome.persistent_congestion);
        assert_eq!(cc.congestion_window(), 2400);
    }

    #[test]
    fn received_duplicates_leave_state_unchanged() {
        let mut rx = ReceivedPackets::default();
        assert!(rx.on_packet_received(4, true, 10, Some(25_000)));
        let before = rx.ranges().clone();
        assert!(!rx.on_packet_received(4, true, 20, Some(25_000)));
        assert_eq!(rx.ranges(), &before);
        assert_eq!(rx.ack_deadline(), Some(25_010));
    }

    #[test]
    fn second_eliciting_packet_forces_ack() {
        let mut rx = ReceivedPackets::default();
        rx.on_packet_received(0, true, 0, Some(25_000));
        assert!(!rx.ack_due(0));
        assert!(rx.ack_due(25_000));
        rx.on_packet_received(1, true, 5, Some(25_000));
        assert!(rx.ack_due(5));
        rx.on_ack_sent();
        assert!(!rx.ack_due(100_000));

        // handshake spaces ack right away; ack-only packets never do
        rx.on_packet_received(2, false, 6, None);
        assert!(!rx.ack_due(6));
        rx.on_packet_received(3, true, 6, None);
        assert!(rx.ack_due(6));
        assert_eq!(rx.largest(), Some(3));
        assert_eq!(rx.ack_delay(16), 10);
    }
}
