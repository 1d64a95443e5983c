//! QUIC connection state machine.
//!
//! [`Connection`] ties packet protection, loss recovery, congestion
//! control, the stream map, connection IDs and network paths together. It
//! performs no I/O of its own: the caller feeds received datagrams through
//! [`Connection::receive_datagram`] and timer ticks through
//! [`Connection::handle_timer`], then drains
//! [`Connection::datagrams_to_send`] and [`Connection::next_event`].
//!
//! ```text
//! FirstFlight -> Connected -> Closing -> Draining -> Terminated
//! ```
//!
//! `Terminated` is absorbing: every operation that would touch the network
//! afterwards fails with [`Error::InvalidState`].

pub mod cid;
pub mod config;
pub mod path;
mod recv;
mod transmit;

pub use cid::{ConnectionId, ConnectionIdTable, IssuedConnectionId};
pub use config::{StreamDelivery, TransportConfig};
pub use path::Path;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::vec::Vec;
use core::net::SocketAddr;
use core::time::Duration;

use crate::crypto::epoch::EpochManager;
use crate::crypto::{CryptoProvider, Direction, Epoch};
use crate::error::{Error, TransportError};
use crate::packet::{PacketSpace, MIN_INITIAL_PACKET_SIZE};
use crate::tls::{TlsSession, TransportParams};
use crate::transport::congestion::{
    CongestionConfig, CongestionControlRegistry, CongestionController, Pacer,
};
use crate::transport::recovery::{
    ReceivedPackets, RecoveryEngine, SentFrame, SentPacket, TimeoutOutcome,
};
use crate::transport::stream::{RecvBuffer, SendBuffer, StreamLimits, StreamMap};
use crate::transport::{Instant, Rng, MICROS_PER_MILLI};

use self::cid::{LocalConnectionIds, PeerConnectionIds};

/// Out-of-order CRYPTO data buffered per epoch before the connection gives
/// up with CRYPTO_BUFFER_EXCEEDED.
const MAX_CRYPTO_BUFFER: u64 = 64 * 1024;

/// Peer max_ack_delay assumed until its transport parameters arrive.
const DEFAULT_MAX_ACK_DELAY: u64 = 25 * MICROS_PER_MILLI;

/// TLS handshake_failure alert, reported for handshake engine errors.
const HANDSHAKE_FAILURE_ALERT: u8 = 40;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Handshake in progress.
    FirstFlight,
    /// Handshake complete and 1-RTT traffic flowing.
    Connected,
    /// CONNECTION_CLOSE queued or sent; waiting out the close period.
    Closing,
    /// The peer closed; nothing more is sent.
    Draining,
    Terminated,
}

/// Which side ended the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Local,
    Peer,
}

/// Notifications for the application, drained with
/// [`Connection::next_event`] in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HandshakeCompleted {
        alpn: Option<Vec<u8>>,
    },
    /// The peer opened a stream (explicitly or by using a higher ID).
    StreamOpened {
        stream_id: u64,
    },
    /// Contiguous data arrived. Only emitted with [`StreamDelivery::Events`].
    StreamDataReceived {
        stream_id: u64,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// Data can be pulled with [`Connection::data_to_read`]. Only emitted
    /// with [`StreamDelivery::Pull`].
    StreamReadable {
        stream_id: u64,
    },
    StreamReset {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    /// The peer acknowledged every byte of the stream plus its FIN.
    StreamFinished {
        stream_id: u64,
    },
    /// Route datagrams addressed to this ID to the connection.
    ConnectionIdIssued {
        connection_id: ConnectionId,
    },
    /// Stop routing this ID to the connection.
    ConnectionIdRetired {
        connection_id: ConnectionId,
    },
    /// Emitted once, when the connection starts shutting down.
    ConnectionTerminated {
        error_code: u64,
        frame_type: Option<u64>,
        reason: Vec<u8>,
        initiator: Initiator,
    },
}

/// A datagram to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub data: Vec<u8>,
}

/// Hook for tracing or testing that sees every packet sent and received.
pub trait PacketObserver: Send {
    fn on_packet_sent(&mut self, _space: PacketSpace, _packet_number: u64, _frames: &[SentFrame]) {}

    /// `frame_types` lists the wire type of each frame, in packet order.
    fn on_packet_received(
        &mut self,
        _space: PacketSpace,
        _packet_number: u64,
        _frame_types: &[u64],
    ) {
    }
}

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

/// Contents of a CONNECTION_CLOSE.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Close {
    is_application: bool,
    error_code: u64,
    frame_type: Option<u64>,
    reason: Vec<u8>,
}

impl Close {
    fn transport(error: TransportError, frame_type: Option<u64>, reason: Vec<u8>) -> Self {
        Self {
            is_application: false,
            error_code: error.to_code(),
            frame_type,
            reason,
        }
    }
}

/// A peer-caused error that closes the connection, with the type of the
/// frame that triggered it.
#[derive(Debug)]
struct Violation {
    error: Error,
    frame_type: Option<u64>,
}

impl From<Error> for Violation {
    fn from(error: Error) -> Self {
        Self {
            error,
            frame_type: None,
        }
    }
}

/// Handshake bytes of one packet number space.
#[derive(Debug, Default)]
struct CryptoStream {
    send: SendBuffer,
    recv: RecvBuffer,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct Connection<C: CryptoProvider, T: TlsSession> {
    role: Role,
    state: State,
    config: TransportConfig,
    tls: T,
    epochs: EpochManager<C>,
    recovery: RecoveryEngine,
    congestion: Box<dyn CongestionController>,
    pacer: Pacer,
    received: [ReceivedPackets; 3],
    crypto: [CryptoStream; 3],
    streams: StreamMap,

    /// Source ID of our long header packets (sequence 0).
    local_scid: ConnectionId,
    local_cids: LocalConnectionIds,
    peer_cids: PeerConnectionIds,
    /// Destination ID of the client's first Initial.
    original_dcid: ConnectionId,
    /// Source ID of the peer's first long header packet.
    peer_scid: Option<ConnectionId>,
    peer_params: Option<TransportParams>,

    path: Path,
    /// Previous path after a migration, or an address the peer probed from.
    alternate: Option<Path>,

    rng: Box<dyn Rng + Send>,
    events: VecDeque<Event>,
    observer: Option<Box<dyn PacketObserver>>,

    handshake_complete: bool,
    handshake_confirmed: bool,
    one_rtt_eliciting_received: bool,
    handshake_done_pending: bool,
    ping_pending: [bool; 3],
    close_pending: Option<Close>,
    /// The close being sent answers the peer's; drain once it is out.
    drain_after_close: bool,
    close_deadline: Option<Instant>,
    pacing_deadline: Option<Instant>,
    last_activity: Instant,
    /// An ack-eliciting packet went out since the last packet arrived.
    eliciting_sent: bool,
}

impl<C: CryptoProvider, T: TlsSession> Connection<C, T> {
    /// Start a client connection to `remote`. The first flight is ready in
    /// [`datagrams_to_send`](Self::datagrams_to_send) right away.
    pub fn client<R: Rng + Send + 'static>(
        config: TransportConfig,
        registry: &CongestionControlRegistry,
        provider: C,
        tls: T,
        remote: SocketAddr,
        rng: R,
        now: Instant,
    ) -> Result<Self, Error> {
        let mut rng: Box<dyn Rng + Send> = Box::new(rng);
        // RFC 9000 §7.2: at least 8 unpredictable bytes
        let original_dcid = ConnectionId::random(rng.as_mut(), 8);
        let mut conn = Self::new(
            Role::Client,
            config,
            registry,
            provider,
            tls,
            remote,
            rng,
            original_dcid.clone(),
            now,
        )?;
        conn.epochs.install_initial(&original_dcid, true)?;
        conn.original_dcid = original_dcid;
        let params = conn.config.transport_params(&conn.local_scid);
        conn.tls.set_local_transport_params(&params);
        conn.pump_tls()?;
        Ok(conn)
    }

    /// Create the server side of a connection whose first datagram came
    /// from `remote`. Keys are derived once that datagram is received.
    pub fn server<R: Rng + Send + 'static>(
        config: TransportConfig,
        registry: &CongestionControlRegistry,
        provider: C,
        tls: T,
        remote: SocketAddr,
        rng: R,
        now: Instant,
    ) -> Result<Self, Error> {
        Self::new(
            Role::Server,
            config,
            registry,
            provider,
            tls,
            remote,
            Box::new(rng),
            ConnectionId::default(),
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        role: Role,
        config: TransportConfig,
        registry: &CongestionControlRegistry,
        provider: C,
        tls: T,
        remote: SocketAddr,
        mut rng: Box<dyn Rng + Send>,
        peer_cid: ConnectionId,
        now: Instant,
    ) -> Result<Self, Error> {
        let cc_config = CongestionConfig {
            max_datagram_size: MIN_INITIAL_PACKET_SIZE as u64,
        };
        let congestion = registry.create(&config.congestion_control_algorithm, &cc_config)?;
        let initial_rtt = micros(config.initial_rtt);
        let recovery =
            RecoveryEngine::new(initial_rtt, config.packet_threshold, config.max_pto_probes);
        let pacer = Pacer::new(
            initial_rtt,
            congestion.congestion_window(),
            cc_config.max_datagram_size,
            now,
        );

        let local_scid =
            ConnectionId::random(rng.as_mut(), usize::from(config.connection_id_length));
        let mut reset_token = [0u8; 16];
        rng.fill(&mut reset_token);
        let local_cids = LocalConnectionIds::new(local_scid.clone(), reset_token);
        let peer_cids =
            PeerConnectionIds::new(peer_cid, usize::from(config.active_connection_id_limit));

        let mut events = VecDeque::new();
        events.push_back(Event::ConnectionIdIssued {
            connection_id: local_scid.clone(),
        });
        tracing::debug!(?role, scid = ?local_scid, %remote, "new connection");

        Ok(Self {
            role,
            state: State::FirstFlight,
            streams: StreamMap::new(role == Role::Client, config.stream_limits()),
            tls,
            epochs: EpochManager::new(provider)?,
            recovery,
            congestion,
            pacer,
            received: Default::default(),
            crypto: Default::default(),
            local_scid,
            local_cids,
            peer_cids,
            original_dcid: ConnectionId::default(),
            peer_scid: None,
            peer_params: None,
            path: Path::new(remote, role == Role::Client, MIN_INITIAL_PACKET_SIZE),
            alternate: None,
            rng,
            events,
            observer: None,
            handshake_complete: false,
            handshake_confirmed: false,
            one_rtt_eliciting_received: false,
            handshake_done_pending: false,
            ping_pending: [false; 3],
            close_pending: None,
            drain_after_close: false,
            close_deadline: None,
            pacing_deadline: None,
            last_activity: now,
            eliciting_sent: false,
            config,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Connected
    }

    /// Address datagrams are currently sent to.
    pub fn remote_address(&self) -> SocketAddr {
        self.path.remote
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Transport parameters the peer sent, once the handshake delivered them.
    pub fn peer_transport_params(&self) -> Option<&TransportParams> {
        self.peer_params.as_ref()
    }

    pub fn congestion_window(&self) -> u64 {
        self.congestion.congestion_window()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.congestion.bytes_in_flight()
    }

    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_micros(self.recovery.rtt().smoothed_rtt())
    }

    /// Key phase bit of outgoing 1-RTT packets.
    pub fn key_phase(&self) -> bool {
        self.epochs.key_phase()
    }

    /// Install a packet observer, replacing any previous one.
    pub fn set_observer(&mut self, observer: Box<dyn PacketObserver>) {
        self.observer = Some(observer);
    }

    /// Next application event, oldest first.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Stream API
    // ------------------------------------------------------------------

    /// Open a locally-initiated stream.
    pub fn open_stream(&mut self, bidirectional: bool) -> Result<u64, Error> {
        self.require_connected()?;
        let id = self.streams.open(bidirectional)?;
        tracing::debug!(stream_id = id, "opened stream");
        Ok(id)
    }

    /// Queue `data` on a stream. Either everything is accepted or, when
    /// flow control forbids it, nothing is.
    pub fn send_stream_data(
        &mut self,
        stream_id: u64,
        data: &[u8],
        end_stream: bool,
    ) -> Result<(), Error> {
        self.require_connected()?;
        self.streams.write(stream_id, data, end_stream)
    }

    /// Take all contiguous data received on a stream, and whether the peer's
    /// FIN has been reached.
    pub fn data_to_read(&mut self, stream_id: u64) -> Result<(Vec<u8>, bool), Error> {
        if self.state == State::Terminated {
            return Err(Error::InvalidState);
        }
        let mut data = Vec::new();
        for chunk in self.streams.read(stream_id)? {
            data.extend_from_slice(&chunk);
        }
        let end_stream = self.streams.is_read_finished(stream_id);
        self.streams.maintain(stream_id);
        Ok((data, end_stream))
    }

    /// Abandon sending on a stream with RESET_STREAM.
    pub fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> Result<(), Error> {
        self.require_active()?;
        self.streams.reset(stream_id, error_code)
    }

    /// Ask the peer to stop sending on a stream.
    pub fn stop_sending(&mut self, stream_id: u64, error_code: u64) -> Result<(), Error> {
        self.require_active()?;
        self.streams.stop_sending(stream_id, error_code)
    }

    // ------------------------------------------------------------------
    // Lifecycle API
    // ------------------------------------------------------------------

    /// Close the connection with an application error code. Calling it
    /// again, or after the connection already started closing, does nothing.
    pub fn close(&mut self, error_code: u64, reason: &[u8]) {
        let close = Close {
            is_application: true,
            error_code,
            frame_type: None,
            reason: reason.to_vec(),
        };
        self.start_close(close.clone(), Initiator::Local, close);
    }

    /// Start a 1-RTT key update (RFC 9001 §6).
    pub fn initiate_key_update(&mut self) -> Result<(), Error> {
        self.require_connected()?;
        self.epochs.initiate_key_update()
    }

    /// Earliest time [`handle_timer`](Self::handle_timer) must be called.
    pub fn get_timer_deadline(&self) -> Option<Instant> {
        match self.state {
            State::Terminated => None,
            State::Closing | State::Draining => self.close_deadline,
            State::FirstFlight | State::Connected => {
                let recovery = self
                    .recovery
                    .timer(self.anti_deadlock_space())
                    .map(|(deadline, _)| deadline);
                let acks = PacketSpace::ALL
                    .into_iter()
                    .filter(|space| self.can_send_in(*space))
                    .filter_map(|space| self.received[space.index()].ack_deadline());
                [
                    recovery,
                    self.idle_deadline(),
                    self.pacing_deadline,
                    self.path.challenge_deadline(),
                    self.alternate.as_ref().and_then(Path::challenge_deadline),
                ]
                .into_iter()
                .flatten()
                .chain(acks)
                .min()
            }
        }
    }

    /// Run every timer due at `now`.
    pub fn handle_timer(&mut self, now: Instant) -> Result<(), Error> {
        match self.state {
            State::Terminated => return Err(Error::InvalidState),
            State::Closing | State::Draining => {
                if self.close_deadline.is_some_and(|d| d <= now) {
                    tracing::debug!("close period over");
                    self.state = State::Terminated;
                }
                return Ok(());
            }
            State::FirstFlight | State::Connected => {}
        }

        if self.idle_deadline().is_some_and(|d| d <= now) {
            tracing::debug!("idle timeout");
            self.terminate(TransportError::NoError, b"idle timeout");
            return Ok(());
        }
        if self.pacing_deadline.is_some_and(|d| d <= now) {
            self.pacing_deadline = None;
        }
        self.check_path_timers(now);

        let anti_deadlock = self.anti_deadlock_space();
        match self
            .recovery
            .on_timeout(now, anti_deadlock, self.congestion.as_mut())
        {
            TimeoutOutcome::Idle => {}
            TimeoutOutcome::Lost(_, packets) => self.on_packets_lost(packets),
            TimeoutOutcome::Probe(space) => {
                if space != PacketSpace::Application {
                    self.crypto[space.index()].send.requeue_unacked();
                }
            }
            TimeoutOutcome::Exhausted => {
                self.terminate(TransportError::NoViablePath, b"probe timeouts exhausted");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn require_connected(&self) -> Result<(), Error> {
        if self.state == State::Connected {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    fn require_active(&self) -> Result<(), Error> {
        match self.state {
            State::FirstFlight | State::Connected => Ok(()),
            _ => Err(Error::InvalidState),
        }
    }

    /// Whether packets of `space` can be sealed.
    fn can_send_in(&self, space: PacketSpace) -> bool {
        !self.recovery.is_discarded(space) && self.epochs.has_keys(space_epoch(space), Direction::Send)
    }

    /// Space a client probes in while the server may still be blocked by
    /// its anti-amplification limit (RFC 9002 §6.2.2.1).
    fn anti_deadlock_space(&self) -> Option<PacketSpace> {
        if self.role != Role::Client
            || self.handshake_confirmed
            || self.recovery.largest_acked(PacketSpace::Handshake).is_some()
        {
            return None;
        }
        [PacketSpace::Handshake, PacketSpace::Initial]
            .into_iter()
            .find(|space| self.can_send_in(*space))
    }

    fn peer_max_ack_delay(&self) -> u64 {
        self.peer_params
            .as_ref()
            .map_or(DEFAULT_MAX_ACK_DELAY, |p| p.max_ack_delay.saturating_mul(MICROS_PER_MILLI))
    }

    fn pto_base(&self) -> u64 {
        self.recovery.rtt().pto_base(self.peer_max_ack_delay())
    }

    /// Negotiated idle timeout in microseconds, never shorter than three
    /// PTOs. `None` when both sides disabled it.
    fn idle_timeout(&self) -> Option<u64> {
        let local = micros(self.config.idle_timeout);
        let peer = self
            .peer_params
            .as_ref()
            .map_or(0, |p| p.max_idle_timeout.saturating_mul(MICROS_PER_MILLI));
        let timeout = match (local, peer) {
            (0, 0) => return None,
            (0, t) | (t, 0) => t,
            (a, b) => a.min(b),
        };
        Some(timeout.max(3 * self.pto_base()))
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.idle_timeout().map(|t| self.last_activity.saturating_add(t))
    }

    /// Drop keys and recovery state of a space that is no longer used.
    fn discard_space(&mut self, space: PacketSpace) {
        if self.recovery.is_discarded(space) {
            return;
        }
        self.epochs.discard(space_epoch(space));
        self.recovery.discard_space(space, self.congestion.as_mut());
        self.crypto[space.index()] = CryptoStream::default();
        self.ping_pending[space.index()] = false;
    }

    /// Move handshake bytes and secrets between the TLS session and the
    /// crypto streams, then apply the peer's transport parameters once
    /// they are available.
    fn pump_tls(&mut self) -> Result<(), Error> {
        loop {
            let mut progress = false;
            while let Some(update) = self.tls.next_key_update() {
                tracing::debug!(epoch = ?update.epoch, direction = ?update.direction, "new keys");
                self.epochs
                    .install_keys(update.epoch, update.direction, &update.material)?;
                progress = true;
            }
            while let Some((epoch, data)) = self.tls.write_handshake() {
                self.crypto[epoch.space().index()].send.write(&data);
                progress = true;
            }
            if !progress {
                break;
            }
        }
        if self.peer_params.is_none() {
            if let Some(params) = self.tls.peer_transport_params().cloned() {
                self.apply_peer_params(params)?;
            }
        }
        Ok(())
    }

    /// Authenticate the connection IDs carried in the peer's parameters
    /// (RFC 9000 §7.3) and apply its limits.
    fn apply_peer_params(&mut self, params: TransportParams) -> Result<(), Error> {
        if params.initial_source_connection_id.as_ref() != self.peer_scid.as_ref() {
            return Err(TransportError::TransportParameterError.into());
        }
        match self.role {
            Role::Client => {
                if params.original_destination_connection_id.as_ref() != Some(&self.original_dcid) {
                    return Err(TransportError::TransportParameterError.into());
                }
                if let Some(token) = params.stateless_reset_token {
                    self.peer_cids.set_initial_reset_token(token);
                }
            }
            Role::Server => {
                if params.original_destination_connection_id.is_some()
                    || params.stateless_reset_token.is_some()
                {
                    return Err(TransportError::TransportParameterError.into());
                }
            }
        }

        self.streams.apply_peer_limits(StreamLimits {
            max_data: params.initial_max_data,
            max_stream_data_bidi_local: params.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: params.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: params.initial_max_stream_data_uni,
            max_streams_bidi: params.initial_max_streams_bidi,
            max_streams_uni: params.initial_max_streams_uni,
        })?;
        self.recovery
            .set_max_ack_delay(params.max_ack_delay.saturating_mul(MICROS_PER_MILLI));
        tracing::debug!(
            max_data = params.initial_max_data,
            max_streams_bidi = params.initial_max_streams_bidi,
            "applied peer transport parameters"
        );
        self.peer_params = Some(params);
        Ok(())
    }

    /// Advance `FirstFlight` once the handshake engine finished and the
    /// peer has spoken 1-RTT.
    fn on_handshake_progress(&mut self) {
        if self.state != State::FirstFlight {
            return;
        }
        if !self.handshake_complete && self.tls.is_complete() {
            self.handshake_complete = true;
            tracing::debug!(role = ?self.role, "handshake complete");
            match self.role {
                Role::Client => self.ping_pending[PacketSpace::Application.index()] = true,
                Role::Server => {
                    self.handshake_done_pending = true;
                    self.confirm_handshake();
                }
            }
        }
        if self.handshake_complete && self.one_rtt_eliciting_received {
            self.state = State::Connected;
            let alpn = self.tls.alpn().map(<[u8]>::to_vec);
            self.events.push_back(Event::HandshakeCompleted { alpn });
            self.issue_connection_ids();
            tracing::debug!(role = ?self.role, "connected");
        }
    }

    /// RFC 9001 §4.1.2: servers confirm on completion, clients on
    /// HANDSHAKE_DONE. Handshake keys are no longer needed afterwards.
    fn confirm_handshake(&mut self) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        self.recovery.set_handshake_confirmed();
        self.discard_space(PacketSpace::Initial);
        self.discard_space(PacketSpace::Handshake);
        tracing::debug!(role = ?self.role, "handshake confirmed");
    }

    /// Top up the peer's supply of our connection IDs.
    fn issue_connection_ids(&mut self) {
        let len = usize::from(self.config.connection_id_length);
        if len == 0 {
            return;
        }
        let peer_limit = self
            .peer_params
            .as_ref()
            .map_or(2, |p| p.active_connection_id_limit);
        let target = peer_limit.min(u64::from(self.config.active_connection_id_limit)) as usize;
        while self.local_cids.active_count() < target {
            let issued = self.local_cids.issue(self.rng.as_mut(), len);
            tracing::trace!(sequence = issued.sequence, "issued connection id");
            self.events.push_back(Event::ConnectionIdIssued {
                connection_id: issued.id,
            });
        }
    }

    /// Report a fatal error and start closing.
    fn fail(&mut self, error: Error, frame_type: Option<u64>) {
        tracing::warn!(%error, ?frame_type, "closing connection");
        let close = Close::transport_from(&error, frame_type);
        self.start_close(close.clone(), Initiator::Local, close);
    }

    /// Enter `Closing` with `reply` queued for sending. `reported` is what
    /// the application is told.
    fn start_close(&mut self, reported: Close, initiator: Initiator, reply: Close) {
        if !matches!(self.state, State::FirstFlight | State::Connected) {
            return;
        }
        self.events.push_back(Event::ConnectionTerminated {
            error_code: reported.error_code,
            frame_type: reported.frame_type,
            reason: reported.reason,
            initiator,
        });
        if PacketSpace::ALL.into_iter().any(|s| self.can_send_in(s)) {
            self.state = State::Closing;
            self.close_pending = Some(reply);
        } else {
            // nothing to protect a CONNECTION_CLOSE with
            self.state = State::Terminated;
        }
    }

    /// End the connection without a CONNECTION_CLOSE.
    fn terminate(&mut self, error: TransportError, reason: &[u8]) {
        if self.state == State::Terminated {
            return;
        }
        if matches!(self.state, State::FirstFlight | State::Connected) {
            self.events.push_back(Event::ConnectionTerminated {
                error_code: error.to_code(),
                frame_type: None,
                reason: reason.to_vec(),
                initiator: Initiator::Local,
            });
        }
        self.state = State::Terminated;
    }

    // ------------------------------------------------------------------
    // Acknowledgment and loss of sent frames
    // ------------------------------------------------------------------

    fn on_packet_acked(&mut self, packet: &SentPacket) {
        for frame in &packet.frames {
            match *frame {
                SentFrame::Crypto { offset, len } => {
                    self.crypto[packet.space.index()]
                        .send
                        .on_ack(offset..offset + len, false);
                }
                SentFrame::Stream {
                    stream_id,
                    offset,
                    len,
                    fin,
                } => {
                    if self.streams.on_stream_acked(stream_id, offset, len, fin) {
                        self.events.push_back(Event::StreamFinished { stream_id });
                    }
                    self.streams.maintain(stream_id);
                }
                SentFrame::ResetStream { stream_id, .. } => {
                    self.streams.on_reset_acked(stream_id);
                    self.streams.maintain(stream_id);
                }
                SentFrame::StopSending { stream_id, .. } => {
                    self.streams.maintain(stream_id);
                }
                _ => {}
            }
        }
    }

    /// Queue whatever the lost packets carried that is still current.
    fn on_packets_lost(&mut self, packets: Vec<SentPacket>) {
        for packet in packets {
            for frame in &packet.frames {
                match *frame {
                    SentFrame::Crypto { offset, len } => {
                        if !self.recovery.is_discarded(packet.space) {
                            self.crypto[packet.space.index()]
                                .send
                                .on_lost(offset..offset + len, false);
                        }
                    }
                    SentFrame::Stream {
                        stream_id,
                        offset,
                        len,
                        fin,
                    } => self.streams.on_stream_lost(stream_id, offset, len, fin),
                    SentFrame::ResetStream { .. }
                    | SentFrame::StopSending { .. }
                    | SentFrame::MaxData(_)
                    | SentFrame::MaxStreamData { .. }
                    | SentFrame::MaxStreams { .. } => self.streams.on_control_lost(frame),
                    SentFrame::NewConnectionId { sequence } => self.local_cids.on_lost(sequence),
                    SentFrame::RetireConnectionId { sequence } => {
                        self.peer_cids.on_retire_lost(sequence);
                    }
                    SentFrame::HandshakeDone => self.handshake_done_pending = true,
                    // ACKs are rebuilt, PINGs and path frames are not repeated
                    _ => {}
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    /// The path for `remote`, tracking it as the alternate if it is new.
    fn path_mut(&mut self, remote: SocketAddr) -> &mut Path {
        if self.path.remote == remote {
            return &mut self.path;
        }
        let alternate = self
            .alternate
            .get_or_insert_with(|| Path::new(remote, false, MIN_INITIAL_PACKET_SIZE));
        if alternate.remote != remote {
            *alternate = Path::new(remote, false, MIN_INITIAL_PACKET_SIZE);
        }
        alternate
    }

    /// The peer moved to `remote`: send there from now on and validate it,
    /// keeping the old path to fall back to.
    fn migrate(&mut self, remote: SocketAddr, now: Instant) {
        let next = match self.alternate.take() {
            Some(path) if path.remote == remote => path,
            _ => Path::new(remote, false, MIN_INITIAL_PACKET_SIZE),
        };
        let previous = core::mem::replace(&mut self.path, next);
        if !self.path.validated {
            let mut challenge = [0u8; 8];
            self.rng.fill(&mut challenge);
            let deadline = now + 3 * self.pto_base();
            self.path.start_challenge(challenge, deadline);
        }
        tracing::debug!(from = %previous.remote, to = %remote, "peer migrated");
        self.alternate = Some(previous);
    }

    fn check_path_timers(&mut self, now: Instant) {
        if self.path.challenge_deadline().is_some_and(|d| d <= now) {
            self.path.abandon_challenge();
            let can_revert = self.alternate.as_ref().is_some_and(|p| p.validated);
            match self.alternate.take().filter(|_| can_revert) {
                Some(previous) => {
                    let failed = core::mem::replace(&mut self.path, previous);
                    tracing::debug!(remote = %failed.remote, "path validation failed, reverting");
                }
                None => tracing::debug!(remote = %self.path.remote, "path validation failed"),
            }
        }
        if let Some(alternate) = self.alternate.as_mut() {
            if alternate.challenge_deadline().is_some_and(|d| d <= now) {
                alternate.abandon_challenge();
            }
        }
    }
}

impl Close {
    /// A transport close for a locally detected error.
    fn transport_from(error: &Error, frame_type: Option<u64>) -> Self {
        let code = match error {
            Error::Transport(e) => e.to_code(),
            Error::Handshake(_) => TransportError::crypto_error(HANDSHAKE_FAILURE_ALERT),
            Error::MalformedPacket | Error::BufferTooSmall { .. } => {
                TransportError::FrameEncodingError.to_code()
            }
            Error::Crypto | Error::InvalidState => TransportError::InternalError.to_code(),
            _ => TransportError::ProtocolViolation.to_code(),
        };
        Self {
            is_application: false,
            error_code: code,
            frame_type: Some(frame_type.unwrap_or(0)),
            reason: format!("{error}").into_bytes(),
        }
    }
}

/// Epoch whose keys protect packets of `space`.
fn space_epoch(space: PacketSpace) -> Epoch {
    match space {
        PacketSpace::Initial => Epoch::Initial,
        PacketSpace::Handshake => Epoch::Handshake,
        PacketSpace::Application => Epoch::OneRtt,
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
