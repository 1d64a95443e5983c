//! Inbound datagram processing: packet unprotection and frame dispatch.

use alloc::vec::Vec;
use core::net::SocketAddr;

use super::{
    space_epoch, Close, Connection, Event, Initiator, Role, State, Violation, MAX_CRYPTO_BUFFER,
};
use crate::connection::cid::ConnectionId;
use crate::crypto::{CryptoProvider, Direction, Epoch};
use crate::error::{Error, TransportError};
use crate::frame::{self, Frame};
use crate::packet::{
    CoalescedPackets, PacketHeader, PacketSpace, PacketType, MIN_INITIAL_PACKET_SIZE,
    QUIC_VERSION_1,
};
use crate::tls::TlsSession;
use crate::transport::Instant;

/// Stateless reset: at least 5 unpredictable bytes, then the 16-byte token.
const MIN_STATELESS_RESET_LEN: usize = 21;

/// What the frames of one packet amounted to.
struct FrameSummary {
    frame_types: Vec<u64>,
    ack_eliciting: bool,
    /// Only PADDING, PATH_CHALLENGE, PATH_RESPONSE and NEW_CONNECTION_ID.
    probing_only: bool,
}

impl<C: CryptoProvider, T: TlsSession> Connection<C, T> {
    /// Process one UDP datagram received from `from`.
    ///
    /// Undecodable, undecryptable and duplicate packets are dropped
    /// silently. Protocol violations by the peer close the connection; they
    /// surface as [`Event::ConnectionTerminated`], not as an `Err`.
    pub fn receive_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), Error> {
        match self.state {
            State::Terminated => return Err(Error::InvalidState),
            State::Draining => return Ok(()),
            State::FirstFlight | State::Connected | State::Closing => {}
        }
        self.path_mut(from).on_received(datagram.len());

        // Long header packets are handled first so that keys installed by
        // their CRYPTO frames can open a coalesced 1-RTT packet.
        let mut long = Vec::new();
        let mut short = Vec::new();
        let short_dcid_len = usize::from(self.config.connection_id_length);
        for item in CoalescedPackets::new(datagram, short_dcid_len) {
            match item {
                Ok((header, packet)) if header.is_long() => long.push((header, packet)),
                Ok(entry) => short.push(entry),
                Err(error) => {
                    tracing::trace!(%error, "dropping rest of datagram");
                    break;
                }
            }
        }

        for (header, packet) in long.into_iter().chain(short) {
            if let Err(violation) = self.process_packet(&header, packet, datagram.len(), from, now)
            {
                self.fail(violation.error, violation.frame_type);
                break;
            }
            if matches!(self.state, State::Draining | State::Terminated) {
                break;
            }
        }
        self.on_handshake_progress();
        Ok(())
    }

    fn process_packet(
        &mut self,
        header: &PacketHeader<'_>,
        packet: &[u8],
        datagram_len: usize,
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), Violation> {
        let (space, epoch) = match (header.packet_type.space(), header.packet_type.epoch()) {
            (Some(space), Some(epoch)) if header.packet_type != PacketType::ZeroRtt => {
                (space, epoch)
            }
            _ => {
                if header.packet_type == PacketType::VersionNegotiation {
                    self.on_version_negotiation(header);
                } else {
                    tracing::trace!(packet_type = ?header.packet_type, "ignoring packet");
                }
                return Ok(());
            }
        };

        if self.role == Role::Server
            && header.packet_type == PacketType::Initial
            && !self.epochs.has_keys(Epoch::Initial, Direction::Receive)
            && !self.recovery.is_discarded(PacketSpace::Initial)
        {
            // RFC 9000 §14.1 and §7.2
            if datagram_len < MIN_INITIAL_PACKET_SIZE || header.dcid.len() < 8 {
                tracing::trace!(datagram_len, "dropping undersized first Initial");
                return Ok(());
            }
            self.accept_initial(header.dcid)?;
        }

        if self.recovery.is_discarded(space) || !self.accepts_dcid(header) {
            tracing::trace!(?space, "dropping packet");
            return Ok(());
        }

        let largest = self.received[space.index()].largest();
        let unprotected = match self.epochs.unprotect(epoch, packet, header.pn_offset, largest) {
            Ok(unprotected) => unprotected,
            Err(error) => {
                if !header.is_long() && self.is_stateless_reset(packet) {
                    self.on_stateless_reset(now);
                } else {
                    tracing::trace!(?space, %error, "dropping undecryptable packet");
                }
                return Ok(());
            }
        };
        let pn = unprotected.packet_number;

        let reserved = if header.is_long() { 0x0c } else { 0x18 };
        if unprotected.first_byte & reserved != 0 {
            return Err(Error::from(TransportError::ProtocolViolation).into());
        }
        if unprotected.payload.is_empty() {
            return Err(Error::from(TransportError::ProtocolViolation).into());
        }

        if header.is_long() && self.peer_scid.is_none() {
            let scid = ConnectionId::new(header.scid)?;
            self.peer_cids.set_initial(scid.clone());
            self.peer_scid = Some(scid);
        }
        if self.role == Role::Server && space == PacketSpace::Handshake {
            // only the client could have produced it: the address is proven
            self.path.validated = true;
            self.discard_space(PacketSpace::Initial);
        }

        self.last_activity = now;
        self.eliciting_sent = false;

        let summary = self.process_frames(space, &unprotected.payload, header.dcid, from, now)?;

        let max_ack_delay =
            (space == PacketSpace::Application).then(|| super::micros(self.config.max_ack_delay));
        self.received[space.index()].on_packet_received(
            pn,
            summary.ack_eliciting,
            now,
            max_ack_delay,
        );
        if let Some(observer) = self.observer.as_mut() {
            observer.on_packet_received(space, pn, &summary.frame_types);
        }
        tracing::trace!(?space, pn, frames = summary.frame_types.len(), "received packet");

        if space == PacketSpace::Application && summary.ack_eliciting {
            self.one_rtt_eliciting_received = true;
        }

        // RFC 9000 §9.3: only a non-probing packet with the highest number
        // moves the connection.
        if self.role == Role::Server
            && self.state == State::Connected
            && space == PacketSpace::Application
            && !summary.probing_only
            && from != self.path.remote
            && self.received[space.index()].largest() == Some(pn)
        {
            self.migrate(from, now);
        }
        Ok(())
    }

    /// Server: the client's first Initial fixes the original destination ID
    /// and with it the Initial keys.
    fn accept_initial(&mut self, dcid: &[u8]) -> Result<(), Error> {
        self.original_dcid = ConnectionId::new(dcid)?;
        self.epochs.install_initial(dcid, false)?;
        let mut params = self.config.transport_params(&self.local_scid);
        params.original_destination_connection_id = Some(self.original_dcid.clone());
        params.stateless_reset_token = self.local_cids.initial().map(|c| c.reset_token);
        self.tls.set_local_transport_params(&params);
        tracing::debug!(odcid = ?self.original_dcid, "accepted client Initial");
        Ok(())
    }

    fn accepts_dcid(&self, header: &PacketHeader<'_>) -> bool {
        self.local_cids.contains(header.dcid)
            || (header.packet_type == PacketType::Initial
                && header.dcid == self.original_dcid.as_bytes())
    }

    fn on_version_negotiation(&mut self, header: &PacketHeader<'_>) {
        if self.role != Role::Client
            || self.state != State::FirstFlight
            || self.peer_scid.is_some()
            || header.dcid != self.local_scid.as_bytes()
        {
            return;
        }
        if header.offers_version(QUIC_VERSION_1) {
            // a genuine server would not have sent it
            tracing::trace!("ignoring version negotiation listing our version");
            return;
        }
        tracing::debug!("no compatible version");
        self.terminate(TransportError::VersionNegotiationError, b"no compatible version");
    }

    fn is_stateless_reset(&self, packet: &[u8]) -> bool {
        packet.len() >= MIN_STATELESS_RESET_LEN
            && self
                .peer_cids
                .is_reset_token(&packet[packet.len() - 16..])
    }

    fn on_stateless_reset(&mut self, now: Instant) {
        tracing::debug!("stateless reset");
        if matches!(self.state, State::FirstFlight | State::Connected) {
            self.events.push_back(Event::ConnectionTerminated {
                error_code: TransportError::NoError.to_code(),
                frame_type: None,
                reason: b"stateless reset".to_vec(),
                initiator: Initiator::Peer,
            });
        }
        self.state = State::Draining;
        self.close_pending = None;
        self.close_deadline = Some(now + 3 * self.pto_base());
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    fn process_frames(
        &mut self,
        space: PacketSpace,
        payload: &[u8],
        dcid: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<FrameSummary, Violation> {
        let mut summary = FrameSummary {
            frame_types: Vec::new(),
            ack_eliciting: false,
            probing_only: true,
        };
        let mut cursor = 0;
        while cursor < payload.len() {
            let (frame, len) = frame::decode_frame(payload, cursor)?;
            cursor += len;
            let frame_type = frame.frame_type();
            summary.frame_types.push(frame_type);
            summary.ack_eliciting |= frame.is_ack_eliciting();
            summary.probing_only &= frame.is_probing();

            if space != PacketSpace::Application && !frame.allowed_in_handshake_space() {
                return Err(Violation {
                    error: TransportError::ProtocolViolation.into(),
                    frame_type: Some(frame_type),
                });
            }
            if self.state == State::Closing && !matches!(frame, Frame::ConnectionClose(_)) {
                continue;
            }
            self.on_frame(space, frame, dcid, from, now)
                .map_err(|error| Violation {
                    error,
                    frame_type: Some(frame_type),
                })?;
            if matches!(self.state, State::Draining | State::Terminated) {
                break;
            }
        }
        Ok(summary)
    }

    fn on_frame(
        &mut self,
        space: PacketSpace,
        frame: Frame<'_>,
        dcid: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), Error> {
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack(ack) => {
                let ack_delay = if space == PacketSpace::Application {
                    let exponent = self.peer_params.as_ref().map_or(3, |p| p.ack_delay_exponent);
                    ack.ack_delay.saturating_mul(1u64 << exponent.min(20))
                } else {
                    0
                };
                let outcome = self.recovery.on_ack_received(
                    space,
                    ack.ranges(),
                    ack_delay,
                    now,
                    self.congestion.as_mut(),
                )?;
                for packet in &outcome.acked {
                    self.on_packet_acked(packet);
                }
                if space == PacketSpace::Application
                    && self.role == Role::Client
                    && self.handshake_complete
                    && !outcome.acked.is_empty()
                {
                    // RFC 9001 §4.1.2: an acknowledged 1-RTT packet confirms too
                    self.confirm_handshake();
                }
                self.on_packets_lost(outcome.lost);
            }
            Frame::Crypto(crypto) => {
                let stream = &mut self.crypto[space.index()];
                let end = crypto.offset.saturating_add(crypto.data.len() as u64);
                if end > stream.recv.read_offset() + MAX_CRYPTO_BUFFER {
                    return Err(TransportError::CryptoBufferExceeded.into());
                }
                stream.recv.insert(crypto.offset, crypto.data, false)?;
                let data = stream.recv.read_all();
                if !data.is_empty() {
                    self.tls.read_handshake(space_epoch(space), &data)?;
                    self.pump_tls()?;
                }
            }
            Frame::Stream(stream) => {
                let outcome = self.streams.on_stream_frame(
                    stream.stream_id,
                    stream.offset,
                    stream.data,
                    stream.fin,
                )?;
                self.drain_opened();
                if outcome.fresh || outcome.readable {
                    self.deliver(stream.stream_id, outcome.fresh, outcome.readable)?;
                }
            }
            Frame::ResetStream(reset) => {
                let fresh =
                    self.streams
                        .on_reset_stream(reset.stream_id, reset.error_code, reset.final_size)?;
                self.drain_opened();
                if fresh {
                    self.events.push_back(Event::StreamReset {
                        stream_id: reset.stream_id,
                        error_code: reset.error_code,
                        final_size: reset.final_size,
                    });
                }
                self.streams.maintain(reset.stream_id);
            }
            Frame::StopSending(stop) => {
                let fresh = self.streams.on_stop_sending(stop.stream_id, stop.error_code)?;
                self.drain_opened();
                if fresh {
                    self.events.push_back(Event::StopSending {
                        stream_id: stop.stream_id,
                        error_code: stop.error_code,
                    });
                }
            }
            Frame::NewToken(_) => {
                if self.role == Role::Server {
                    return Err(TransportError::ProtocolViolation.into());
                }
                // address validation tokens are not stored
            }
            Frame::MaxData(max) => self.streams.on_max_data(max),
            Frame::MaxStreamData(f) => {
                self.streams.on_max_stream_data(f.stream_id, f.max_data)?;
                self.drain_opened();
            }
            Frame::MaxStreams(f) => self.streams.on_max_streams(f.bidirectional, f.max_streams)?,
            Frame::DataBlocked(limit) => tracing::trace!(limit, "peer blocked by connection limit"),
            Frame::StreamDataBlocked(f) => {
                self.streams.on_stream_data_blocked(f.stream_id)?;
                self.drain_opened();
            }
            Frame::StreamsBlocked(f) => {
                tracing::trace!(bidirectional = f.bidirectional, limit = f.max_streams, "peer blocked by stream limit");
            }
            Frame::NewConnectionId(f) => {
                self.peer_cids.on_new_connection_id(
                    f.sequence_number,
                    f.retire_prior_to,
                    f.connection_id,
                    f.stateless_reset_token,
                )?;
            }
            Frame::RetireConnectionId(sequence) => {
                if let Some(retired) = self.local_cids.retire(sequence, dcid)? {
                    self.events.push_back(Event::ConnectionIdRetired {
                        connection_id: retired.id,
                    });
                    self.issue_connection_ids();
                }
            }
            Frame::PathChallenge(data) => self.path_mut(from).queue_response(data),
            Frame::PathResponse(data) => {
                if !self.path.on_response(data) {
                    if let Some(alternate) = self.alternate.as_mut() {
                        alternate.on_response(data);
                    }
                }
            }
            Frame::ConnectionClose(close) => self.on_connection_close(
                Close {
                    is_application: close.is_application,
                    error_code: close.error_code,
                    frame_type: (!close.is_application).then_some(close.frame_type),
                    reason: close.reason.to_vec(),
                },
                now,
            ),
            Frame::HandshakeDone => {
                if self.role == Role::Server {
                    return Err(TransportError::ProtocolViolation.into());
                }
                self.confirm_handshake();
            }
        }
        Ok(())
    }

    fn on_connection_close(&mut self, close: Close, now: Instant) {
        tracing::debug!(
            code = close.error_code,
            application = close.is_application,
            "peer closed connection"
        );
        if self.state == State::Closing {
            self.state = State::Draining;
            self.close_pending = None;
            if self.close_deadline.is_none() {
                self.close_deadline = Some(now + 3 * self.pto_base());
            }
            return;
        }
        self.start_close(
            close,
            Initiator::Peer,
            Close::transport(TransportError::NoError, None, Vec::new()),
        );
        if self.state == State::Closing {
            self.drain_after_close = true;
        }
    }

    /// Hand newly received stream data to the application.
    fn deliver(&mut self, stream_id: u64, fresh: bool, readable: bool) -> Result<(), Error> {
        match self.config.stream_delivery {
            super::StreamDelivery::Events => {
                let mut data = Vec::new();
                for chunk in self.streams.read(stream_id)? {
                    data.extend_from_slice(&chunk);
                }
                let end_stream = self.streams.is_read_finished(stream_id);
                if !data.is_empty() || (fresh && end_stream) {
                    self.events.push_back(Event::StreamDataReceived {
                        stream_id,
                        data,
                        end_stream,
                    });
                }
            }
            super::StreamDelivery::Pull => {
                if readable {
                    self.events.push_back(Event::StreamReadable { stream_id });
                }
            }
        }
        self.streams.maintain(stream_id);
        Ok(())
    }

    fn drain_opened(&mut self) {
        while let Some(stream_id) = self.streams.poll_opened() {
            self.events.push_back(Event::StreamOpened { stream_id });
        }
    }
}
