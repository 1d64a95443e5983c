//! Outbound datagram assembly.
//!
//! Each datagram coalesces at most one packet per space, in Initial,
//! Handshake, 1-RTT order. A space's packet carries an ACK when one is due
//! and, when congestion control and pacing allow, retransmissions and new
//! data: control frames first, then CRYPTO, then STREAM.

use alloc::vec::Vec;

use super::{space_epoch, Close, Connection, Role, State, Transmit};
use crate::crypto::CryptoProvider;
use crate::error::{Error, TransportError};
use crate::frame::{
    self, ConnectionCloseFrame, CryptoFrame, Frame, MaxStreamDataFrame, MaxStreamsFrame,
    NewConnectionIdFrame, ResetStreamFrame, StopSendingFrame, StreamDataBlockedFrame,
    StreamFrame, StreamsBlockedFrame,
};
use crate::packet::{
    encode_long_header, encode_short_header, pn_length, push_pn, PacketSpace, PacketType,
    MIN_INITIAL_PACKET_SIZE,
};
use crate::tls::TlsSession;
use crate::transport::recovery::{SentFrame, SentPacket, MAX_ACK_RANGES};
use crate::transport::Instant;

/// Upper bound on datagrams produced by one call.
const MAX_DATAGRAMS_PER_CALL: usize = 64;

/// Longest CONNECTION_CLOSE reason phrase put on the wire.
const MAX_CLOSE_REASON: usize = 256;

/// A packet being assembled for one space.
struct PacketPlan {
    space: PacketSpace,
    pn_len: usize,
    /// Header, packet number and AEAD tag.
    overhead: usize,
    payload: Vec<u8>,
    frames: Vec<SentFrame>,
    ack_eliciting: bool,
    is_probe: bool,
    /// Carries PADDING that counts towards bytes in flight.
    padded: bool,
    /// Datagram must be expanded to the minimum size (path validation).
    needs_full_datagram: bool,
}

impl PacketPlan {
    fn wire_len(&self) -> usize {
        self.overhead + self.payload.len()
    }

    /// Pad so the header protection sample is always available.
    fn pad_for_sample(&mut self) {
        let min = 4usize.saturating_sub(self.pn_len);
        if self.payload.len() < min {
            self.payload.resize(min, 0);
        }
    }
}

impl<C: CryptoProvider, T: TlsSession> Connection<C, T> {
    /// Datagrams ready to go out at `now`. Call after every input (datagram
    /// received, timer fired, API call) until it returns nothing.
    pub fn datagrams_to_send(&mut self, now: Instant) -> Vec<Transmit> {
        let mut out = Vec::new();
        match self.state {
            State::Terminated | State::Draining => return out,
            State::Closing => {
                self.push_close(now, &mut out);
                return out;
            }
            State::FirstFlight | State::Connected => {}
        }

        match self.build_alternate_probe() {
            Ok(Some(transmit)) => out.push(transmit),
            Ok(None) => {}
            Err(error) => tracing::warn!(%error, "failed to build path probe"),
        }

        while out.len() < MAX_DATAGRAMS_PER_CALL {
            match self.build_datagram(now) {
                Ok(Some(data)) => out.push(Transmit {
                    destination: self.path.remote,
                    data,
                }),
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(%error, "failed to build datagram");
                    self.fail(TransportError::InternalError.into(), None);
                    self.push_close(now, &mut out);
                    break;
                }
            }
        }
        out
    }

    fn push_close(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        match self.build_close(now) {
            Ok(Some(transmit)) => out.push(transmit),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%error, "failed to build CONNECTION_CLOSE");
                self.state = State::Terminated;
            }
        }
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// The space a CONNECTION_CLOSE is sent in: the newest one the peer is
    /// sure to be able to read.
    pub(super) fn close_space(&self) -> Option<PacketSpace> {
        if self.handshake_confirmed && self.can_send_in(PacketSpace::Application) {
            return Some(PacketSpace::Application);
        }
        [
            PacketSpace::Handshake,
            PacketSpace::Initial,
            PacketSpace::Application,
        ]
        .into_iter()
        .find(|space| self.can_send_in(*space))
    }

    fn build_close(&mut self, now: Instant) -> Result<Option<Transmit>, Error> {
        let Some(close) = self.close_pending.take() else {
            return Ok(None);
        };
        let Some(space) = self.close_space() else {
            self.state = State::Terminated;
            return Ok(None);
        };
        // RFC 9000 §10.2.3: application details stay hidden until 1-RTT
        let close = if close.is_application && space != PacketSpace::Application {
            Close::transport(TransportError::ApplicationError, None, Vec::new())
        } else {
            close
        };
        let reason = &close.reason[..close.reason.len().min(MAX_CLOSE_REASON)];

        let mut plan = self.new_plan(space);
        frame::encode(
            &Frame::ConnectionClose(ConnectionCloseFrame {
                is_application: close.is_application,
                error_code: close.error_code,
                frame_type: close.frame_type.unwrap_or(0),
                reason,
            }),
            &mut plan.payload,
        )?;
        plan.frames.push(SentFrame::ConnectionClose);
        if self.role == Role::Client && space == PacketSpace::Initial {
            let target = MIN_INITIAL_PACKET_SIZE.saturating_sub(plan.overhead);
            if plan.payload.len() < target {
                plan.payload.resize(target, 0);
            }
        }
        plan.pad_for_sample();

        let mut data = Vec::with_capacity(plan.wire_len());
        let pn = self.seal(&plan, &mut data)?;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_packet_sent(space, pn, &plan.frames);
        }
        self.path.on_sent(data.len());
        if self.close_deadline.is_none() {
            self.close_deadline = Some(now + 3 * self.pto_base());
        }
        if self.drain_after_close {
            self.state = State::Draining;
        }
        tracing::debug!(?space, code = close.error_code, "sent CONNECTION_CLOSE");
        Ok(Some(Transmit {
            destination: self.path.remote,
            data,
        }))
    }

    // ------------------------------------------------------------------
    // Datagrams
    // ------------------------------------------------------------------

    /// PATH_RESPONSE or PATH_CHALLENGE owed to an address other than the
    /// current path.
    fn build_alternate_probe(&mut self) -> Result<Option<Transmit>, Error> {
        if !self.can_send_in(PacketSpace::Application) {
            return Ok(None);
        }
        let Some(alternate) = self.alternate.as_mut() else {
            return Ok(None);
        };
        let response = alternate.take_response();
        let challenge = alternate.pending_challenge();
        if response.is_none() && challenge.is_none() {
            return Ok(None);
        }
        let budget = alternate.mtu.min(alternate.send_budget().unwrap_or(usize::MAX));
        let destination = alternate.remote;

        let mut plan = self.new_plan(PacketSpace::Application);
        if let Some(data) = response {
            frame::encode(&Frame::PathResponse(data), &mut plan.payload)?;
            plan.frames.push(SentFrame::PathResponse(data));
        }
        if let Some(data) = challenge {
            frame::encode(&Frame::PathChallenge(data), &mut plan.payload)?;
            plan.frames.push(SentFrame::PathChallenge(data));
        }
        let target = MIN_INITIAL_PACKET_SIZE.min(budget).saturating_sub(plan.overhead);
        if plan.payload.len() < target {
            plan.payload.resize(target, 0);
        }
        plan.pad_for_sample();
        if plan.wire_len() > budget {
            tracing::trace!(%destination, "path probe blocked by amplification limit");
            return Ok(None);
        }

        let mut data = Vec::with_capacity(plan.wire_len());
        let pn = self.seal(&plan, &mut data)?;
        if let Some(alternate) = self.alternate.as_mut() {
            if challenge.is_some() {
                alternate.on_challenge_sent();
            }
            alternate.on_sent(data.len());
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.on_packet_sent(PacketSpace::Application, pn, &plan.frames);
        }
        tracing::trace!(%destination, pn, "sent path probe");
        Ok(Some(Transmit { destination, data }))
    }

    /// Assemble the next datagram for the current path, if anything is
    /// allowed and waiting to be sent.
    fn build_datagram(&mut self, now: Instant) -> Result<Option<Vec<u8>>, Error> {
        let budget = self
            .path
            .mtu
            .min(self.path.send_budget().unwrap_or(usize::MAX));
        if budget == 0 {
            return Ok(None);
        }

        // bytes of ack-eliciting packets the congestion window still admits
        let mut window_left =
            usize::try_from(self.congestion.available_window()).unwrap_or(usize::MAX);
        if window_left > 0 {
            let srtt = self.recovery.rtt().smoothed_rtt();
            let window = self.congestion.congestion_window();
            if let Some(at) = self.pacer.next_send_time(srtt, window, budget as u64, now) {
                self.pacing_deadline = Some(at);
                window_left = 0;
            }
        }
        // a datagram that may be padded counts its full size in flight
        let may_pad = self.can_send_in(PacketSpace::Initial)
            || self.path.has_response()
            || self.path.pending_challenge().is_some();
        if may_pad && window_left < MIN_INITIAL_PACKET_SIZE.min(budget) {
            window_left = 0;
        }

        let mut plans: Vec<PacketPlan> = Vec::new();
        let mut remaining = budget;
        for space in PacketSpace::ALL {
            if !self.can_send_in(space) {
                continue;
            }
            // PTO probes are exempt from the window
            let elicit_room = if self.recovery.probes_pending(space) > 0 {
                Some(remaining)
            } else if window_left > 0 {
                Some(remaining.min(window_left))
            } else {
                None
            };
            if let Some(plan) = self.plan_packet(space, remaining, elicit_room, now)? {
                remaining = remaining.saturating_sub(plan.wire_len());
                if plan.ack_eliciting && !plan.is_probe {
                    window_left = window_left.saturating_sub(plan.wire_len());
                }
                plans.push(plan);
            }
        }
        if plans.is_empty() {
            return Ok(None);
        }

        // RFC 9000 §14.1: Initial datagrams, and datagrams used for path
        // validation, are expanded to the minimum size.
        let needs_full = plans.iter().any(|p| {
            p.needs_full_datagram
                || (p.space == PacketSpace::Initial
                    && (self.role == Role::Client || p.ack_eliciting))
        });
        if needs_full {
            let total: usize = plans.iter().map(PacketPlan::wire_len).sum();
            let target = MIN_INITIAL_PACKET_SIZE.min(budget);
            if let Some(last) = plans.last_mut() {
                if total < target {
                    let len = last.payload.len() + target - total;
                    last.payload.resize(len, 0);
                    last.padded = true;
                }
            }
        }

        let mut datagram = Vec::with_capacity(budget);
        let mut sent_handshake = false;
        for plan in plans {
            let start = datagram.len();
            let pn = self.seal(&plan, &mut datagram)?;
            let size = datagram.len() - start;
            sent_handshake |= plan.space == PacketSpace::Handshake;
            self.record_sent(plan, pn, size, now);
        }

        // RFC 9001 §4.9.1
        if self.role == Role::Client && sent_handshake {
            self.discard_space(PacketSpace::Initial);
        }
        self.path.on_sent(datagram.len());
        self.pacer.on_sent(datagram.len() as u64);
        Ok(Some(datagram))
    }

    fn record_sent(&mut self, plan: PacketPlan, pn: u64, size: usize, now: Instant) {
        let space = plan.space;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_packet_sent(space, pn, &plan.frames);
        }
        tracing::trace!(?space, pn, size, eliciting = plan.ack_eliciting, "sent packet");
        if plan.ack_eliciting && !self.eliciting_sent {
            // RFC 9000 §10.1: the idle timer restarts on the first
            // ack-eliciting packet after a receive
            self.last_activity = now;
            self.eliciting_sent = true;
        }
        self.recovery.on_packet_sent(
            SentPacket {
                pn,
                space,
                time_sent: now,
                size,
                ack_eliciting: plan.ack_eliciting,
                in_flight: plan.ack_eliciting || plan.padded,
                is_probe: plan.is_probe,
                frames: plan.frames,
            },
            self.congestion.as_mut(),
        );
    }

    // ------------------------------------------------------------------
    // Packets
    // ------------------------------------------------------------------

    fn new_plan(&self, space: PacketSpace) -> PacketPlan {
        let pn = self.recovery.peek_packet_number(space);
        let pn_len = pn_length(pn, self.recovery.largest_acked(space));
        PacketPlan {
            space,
            pn_len,
            overhead: self.header_len(space) + pn_len + self.epochs.tag_len(),
            payload: Vec::new(),
            frames: Vec::new(),
            ack_eliciting: false,
            is_probe: false,
            padded: false,
            needs_full_datagram: false,
        }
    }

    /// Header bytes before the packet number.
    fn header_len(&self, space: PacketSpace) -> usize {
        let dcid = self.peer_cids.current().len();
        let long = 1 + 4 + 1 + dcid + 1 + self.local_scid.len() + 2;
        match space {
            // empty token: one length byte
            PacketSpace::Initial => long + 1,
            PacketSpace::Handshake => long,
            PacketSpace::Application => 1 + dcid,
        }
    }

    /// Fill a packet of `space` within `room` bytes. `None` if there is
    /// nothing worth sending.
    fn plan_packet(
        &mut self,
        space: PacketSpace,
        room: usize,
        elicit_room: Option<usize>,
        now: Instant,
    ) -> Result<Option<PacketPlan>, Error> {
        let mut plan = self.new_plan(space);
        // room for the payload plus a sample-sized minimum
        if room < plan.overhead + 4 {
            return Ok(None);
        }
        let max_payload = room - plan.overhead;

        let received = &self.received[space.index()];
        let mut ack = Vec::new();
        if !received.ranges().is_empty() {
            let delay = if space == PacketSpace::Application {
                received.ack_delay(now) >> self.config.ack_delay_exponent
            } else {
                0
            };
            frame::encode_ack(received.ranges(), delay, MAX_ACK_RANGES, &mut ack)?;
        }
        let ack_due = received.ack_due(now);
        let largest_received = received.largest();
        let limit = max_payload.saturating_sub(ack.len());

        if let Some(elicit_room) = elicit_room {
            let limit = if elicit_room < room {
                // keep the sample padding inside the allowance
                let cap = elicit_room.saturating_sub(plan.overhead + ack.len());
                if cap < 3 {
                    0
                } else {
                    limit.min(cap)
                }
            } else {
                limit
            };
            self.fill_eliciting(&mut plan, limit)?;
            plan.is_probe = self.recovery.probes_pending(space) > 0;
            if plan.is_probe && !plan.ack_eliciting && limit > 0 {
                frame::encode(&Frame::Ping, &mut plan.payload)?;
                plan.frames.push(SentFrame::Ping);
                plan.ack_eliciting = true;
            }
        }

        let with_ack = !ack.is_empty() && ack.len() <= max_payload && (ack_due || plan.ack_eliciting);
        if with_ack {
            ack.extend_from_slice(&plan.payload);
            plan.payload = ack;
            if let Some(largest) = largest_received {
                plan.frames.insert(0, SentFrame::Ack { largest });
            }
            self.received[space.index()].on_ack_sent();
        } else if !plan.ack_eliciting {
            return Ok(None);
        }
        if !plan.ack_eliciting {
            plan.is_probe = false;
        }
        plan.pad_for_sample();
        Ok(Some(plan))
    }

    /// Add retransmissions and new data to `plan`, up to `limit` payload
    /// bytes.
    fn fill_eliciting(&mut self, plan: &mut PacketPlan, limit: usize) -> Result<(), Error> {
        let space = plan.space;
        let mut scratch = Vec::new();

        if self.ping_pending[space.index()] && plan.payload.len() < limit {
            self.ping_pending[space.index()] = false;
            push_frame(plan, &Frame::Ping, SentFrame::Ping);
        }

        if space == PacketSpace::Application {
            if self.handshake_done_pending && plan.payload.len() < limit {
                self.handshake_done_pending = false;
                push_frame(plan, &Frame::HandshakeDone, SentFrame::HandshakeDone);
            }
            if self.path.has_response() && plan.payload.len() + 9 <= limit {
                if let Some(data) = self.path.take_response() {
                    push_frame(plan, &Frame::PathResponse(data), SentFrame::PathResponse(data));
                    plan.needs_full_datagram = true;
                }
            }
            if let Some(data) = self.path.pending_challenge() {
                if plan.payload.len() + 9 <= limit {
                    self.path.on_challenge_sent();
                    push_frame(plan, &Frame::PathChallenge(data), SentFrame::PathChallenge(data));
                    plan.needs_full_datagram = true;
                }
            }

            while let Some(issued) = self.local_cids.next_pending().cloned() {
                scratch.clear();
                frame::encode(
                    &Frame::NewConnectionId(NewConnectionIdFrame {
                        sequence_number: issued.sequence,
                        retire_prior_to: 0,
                        connection_id: &issued.id,
                        stateless_reset_token: issued.reset_token,
                    }),
                    &mut scratch,
                )?;
                if plan.payload.len() + scratch.len() > limit {
                    break;
                }
                self.local_cids.on_sent(issued.sequence);
                append(plan, &scratch, SentFrame::NewConnectionId {
                    sequence: issued.sequence,
                });
            }

            while let Some(sequence) = self.peer_cids.next_retirement() {
                scratch.clear();
                frame::encode(&Frame::RetireConnectionId(sequence), &mut scratch)?;
                if plan.payload.len() + scratch.len() > limit {
                    break;
                }
                self.peer_cids.on_retire_sent(sequence);
                append(plan, &scratch, SentFrame::RetireConnectionId { sequence });
            }

            while let Some(control) = self.streams.next_control() {
                scratch.clear();
                frame::encode(&control_frame(&control), &mut scratch)?;
                if plan.payload.len() + scratch.len() > limit {
                    break;
                }
                self.streams.on_control_sent(&control);
                append(plan, &scratch, control);
            }
        }

        let crypto = &mut self.crypto[space.index()].send;
        while let Some(offset) = crypto.next_offset() {
            let room = limit.saturating_sub(plan.payload.len());
            let header = frame::crypto_frame_overhead(offset, room);
            if room <= header {
                break;
            }
            let Some(chunk) = crypto.next_chunk(room - header) else {
                break;
            };
            frame::encode(
                &Frame::Crypto(CryptoFrame {
                    offset: chunk.offset,
                    data: &chunk.data,
                }),
                &mut plan.payload,
            )?;
            plan.frames.push(SentFrame::Crypto {
                offset: chunk.offset,
                len: chunk.data.len() as u64,
            });
            plan.ack_eliciting = true;
        }

        if space == PacketSpace::Application {
            while let Some((stream_id, offset)) = self.streams.next_pending() {
                let room = limit.saturating_sub(plan.payload.len());
                let header = frame::stream_frame_overhead(stream_id, offset, room);
                if room <= header {
                    break;
                }
                let Some(chunk) = self.streams.take_chunk(stream_id, room - header) else {
                    break;
                };
                frame::encode(
                    &Frame::Stream(StreamFrame {
                        stream_id,
                        offset: chunk.offset,
                        data: &chunk.data,
                        fin: chunk.fin,
                    }),
                    &mut plan.payload,
                )?;
                plan.frames.push(SentFrame::Stream {
                    stream_id,
                    offset: chunk.offset,
                    len: chunk.data.len() as u64,
                    fin: chunk.fin,
                });
                plan.ack_eliciting = true;
            }
        }
        Ok(())
    }

    /// Protect `plan` and append the packet to `datagram`. Returns the
    /// packet number used.
    fn seal(&mut self, plan: &PacketPlan, datagram: &mut Vec<u8>) -> Result<u64, Error> {
        let space = plan.space;
        let pn = self.recovery.next_packet_number(space);
        let dcid = self.peer_cids.current();
        let mut header = Vec::with_capacity(plan.overhead);
        match space {
            PacketSpace::Initial | PacketSpace::Handshake => {
                let packet_type = if space == PacketSpace::Initial {
                    PacketType::Initial
                } else {
                    PacketType::Handshake
                };
                let remainder = plan.pn_len + plan.payload.len() + self.epochs.tag_len();
                encode_long_header(
                    packet_type,
                    dcid,
                    &self.local_scid,
                    &[],
                    plan.pn_len,
                    remainder,
                    &mut header,
                )?;
            }
            PacketSpace::Application => {
                encode_short_header(dcid, self.epochs.key_phase(), plan.pn_len, &mut header)?;
            }
        }
        push_pn(pn, plan.pn_len, &mut header);
        let packet = self
            .epochs
            .protect(space_epoch(space), pn, &header, &plan.payload)?;
        datagram.extend_from_slice(&packet);
        Ok(pn)
    }
}

/// Encode a frame known to fit and record it.
fn push_frame(plan: &mut PacketPlan, frame: &Frame<'_>, sent: SentFrame) {
    // only fixed-size frames go through here; encoding cannot fail
    if frame::encode(frame, &mut plan.payload).is_ok() {
        plan.ack_eliciting |= frame.is_ack_eliciting();
        plan.frames.push(sent);
    }
}

fn append(plan: &mut PacketPlan, encoded: &[u8], sent: SentFrame) {
    plan.payload.extend_from_slice(encoded);
    plan.frames.push(sent);
    plan.ack_eliciting = true;
}

/// Wire form of a flow control or stream state frame.
fn control_frame(frame: &SentFrame) -> Frame<'static> {
    match *frame {
        SentFrame::ResetStream {
            stream_id,
            error_code,
            final_size,
        } => Frame::ResetStream(ResetStreamFrame {
            stream_id,
            error_code,
            final_size,
        }),
        SentFrame::StopSending {
            stream_id,
            error_code,
        } => Frame::StopSending(StopSendingFrame {
            stream_id,
            error_code,
        }),
        SentFrame::MaxData(max) => Frame::MaxData(max),
        SentFrame::MaxStreamData { stream_id, max } => Frame::MaxStreamData(MaxStreamDataFrame {
            stream_id,
            max_data: max,
        }),
        SentFrame::MaxStreams { bidirectional, max } => Frame::MaxStreams(MaxStreamsFrame {
            bidirectional,
            max_streams: max,
        }),
        SentFrame::DataBlocked(limit) => Frame::DataBlocked(limit),
        SentFrame::StreamDataBlocked { stream_id, limit } => {
            Frame::StreamDataBlocked(StreamDataBlockedFrame {
                stream_id,
                data_limit: limit,
            })
        }
        SentFrame::StreamsBlocked {
            bidirectional,
            limit,
        } => Frame::StreamsBlocked(StreamsBlockedFrame {
            bidirectional,
            max_streams: limit,
        }),
        _ => Frame::Ping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn control_frames_map_to_wire_frames() {
        let frame = control_frame(&SentFrame::MaxStreamData {
            stream_id: 4,
            max: 9000,
        });
        assert_eq!(
            frame,
            Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: 4,
                max_data: 9000,
            })
        );
        assert_eq!(control_frame(&SentFrame::MaxData(7)), Frame::MaxData(7));
        assert!(control_frame(&SentFrame::DataBlocked(5)).is_ack_eliciting());
    }

    #[test]
    fn sample_padding_depends_on_packet_number_length() {
        let mut plan = PacketPlan {
            space: PacketSpace::Application,
            pn_len: 1,
            overhead: 26,
            payload: vec![0x01],
            frames: Vec::new(),
            ack_eliciting: true,
            is_probe: false,
            padded: false,
            needs_full_datagram: false,
        };
        plan.pad_for_sample();
        assert_eq!(plan.payload.len(), 3);
        assert_eq!(plan.wire_len(), 29);

        plan.pn_len = 4;
        plan.payload = vec![0x01];
        plan.pad_for_sample();
        assert_eq!(plan.payload.len(), 1);
    }
}
