//! Integration tests for milli-quic exercising the full QUIC stack via the
//! public API only.
//!
//! A client and a server `Connection` exchange encrypted datagrams in
//! memory (no real network) under a simulated clock. The scripted
//! handshake engine stands in for TLS so both sides derive matching keys.

extern crate std;

use std::cell::Cell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use milli_quic::crypto::rustcrypto::Aes128GcmProvider;
use milli_quic::packet::{decode_header, PacketSpace};
use milli_quic::tls::ScriptedSession;
use milli_quic::transport::congestion::{
    CongestionConfig, CongestionControlRegistry, CongestionController, NewReno,
};
use milli_quic::transport::loss::RttEstimator;
use milli_quic::transport::recovery::{SentFrame, SentPacket};
use milli_quic::{
    Connection, Error, Event, Initiator, PacketObserver, Rng, State, StreamDelivery,
    TransportConfig, TransportError,
};

// =========================================================================
// Test infrastructure
// =========================================================================

type Conn = Connection<Aes128GcmProvider, ScriptedSession>;

const ALPN: &[u8] = b"hq-interop";

/// A deterministic RNG: an incrementing byte sequence from a seed.
struct TestRng(u8);

impl Rng for TestRng {
    fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.0;
            self.0 = self.0.wrapping_add(1);
        }
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn client_addr() -> SocketAddr {
    addr(40_000)
}

fn server_addr() -> SocketAddr {
    addr(4433)
}

fn make_client(config: TransportConfig, registry: &CongestionControlRegistry) -> Result<Conn, Error> {
    Connection::client(
        config,
        registry,
        Aes128GcmProvider,
        ScriptedSession::client(&[ALPN], [0x11; 32]),
        server_addr(),
        TestRng(0x10),
        0,
    )
}

fn make_server(config: TransportConfig, registry: &CongestionControlRegistry) -> Conn {
    Connection::server(
        config,
        registry,
        Aes128GcmProvider,
        ScriptedSession::server(&[ALPN], [0x22; 32]),
        client_addr(),
        TestRng(0x50),
        0,
    )
    .unwrap()
}

/// A client and server wired back to back.
struct Pair {
    client: Conn,
    server: Conn,
    /// Address the server sees the client's datagrams come from.
    client_addr: SocketAddr,
    now: u64,
}

impl Pair {
    fn new() -> Self {
        Self::with_configs(TransportConfig::default(), TransportConfig::default())
    }

    fn with_configs(client: TransportConfig, server: TransportConfig) -> Self {
        Self::with_registry(client, server, &CongestionControlRegistry::with_defaults())
    }

    fn with_registry(
        client: TransportConfig,
        server: TransportConfig,
        registry: &CongestionControlRegistry,
    ) -> Self {
        Self {
            client: make_client(client, registry).unwrap(),
            server: make_server(server, registry),
            client_addr: client_addr(),
            now: 1_000,
        }
    }

    /// Move every pending datagram once in each direction. Returns how many
    /// were moved.
    fn exchange(&mut self) -> usize {
        let mut moved = 0;
        for transmit in self.client.datagrams_to_send(self.now) {
            assert_eq!(transmit.destination, server_addr());
            let _ = self
                .server
                .receive_datagram(&transmit.data, self.client_addr, self.now);
            moved += 1;
        }
        for transmit in self.server.datagrams_to_send(self.now) {
            assert_eq!(transmit.destination, self.client_addr);
            let _ = self
                .client
                .receive_datagram(&transmit.data, server_addr(), self.now);
            moved += 1;
        }
        moved
    }

    fn exchange_until_quiet(&mut self) {
        for _ in 0..100 {
            if self.exchange() == 0 {
                return;
            }
        }
        panic!("connections never went quiet");
    }

    /// Exchange datagrams and run short timers (delayed ACKs, probes)
    /// until nothing is due within the next 100 ms.
    fn settle(&mut self) {
        for _ in 0..50 {
            self.exchange_until_quiet();
            let next = [
                self.client.get_timer_deadline(),
                self.server.get_timer_deadline(),
            ]
            .into_iter()
            .flatten()
            .min();
            match next {
                Some(deadline) if deadline <= self.now + 100_000 => {
                    self.now = self.now.max(deadline);
                    let _ = self.client.handle_timer(self.now);
                    let _ = self.server.handle_timer(self.now);
                }
                _ => return,
            }
        }
    }

    fn handshake(&mut self) {
        self.settle();
        assert_eq!(self.client.state(), State::Connected);
        assert_eq!(self.server.state(), State::Connected);
    }
}

fn drain_events(conn: &mut Conn) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = conn.next_event() {
        events.push(event);
    }
    events
}

/// Records the frames of every packet a connection sends.
#[derive(Clone, Default)]
struct SentLog(Arc<Mutex<Vec<(PacketSpace, Vec<SentFrame>)>>>);

impl SentLog {
    fn take(&self) -> Vec<(PacketSpace, Vec<SentFrame>)> {
        core::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl PacketObserver for SentLog {
    fn on_packet_sent(&mut self, space: PacketSpace, _packet_number: u64, frames: &[SentFrame]) {
        self.0.lock().unwrap().push((space, frames.to_vec()));
    }
}

// =========================================================================
// Handshake
// =========================================================================

#[test]
fn handshake_completes_and_reports_alpn() {
    let mut pair = Pair::new();
    pair.handshake();

    let completed = Event::HandshakeCompleted {
        alpn: Some(ALPN.to_vec()),
    };
    assert!(drain_events(&mut pair.client).contains(&completed));
    assert!(drain_events(&mut pair.server).contains(&completed));

    let params = pair.client.peer_transport_params().unwrap();
    assert_eq!(params.initial_max_streams_bidi, 100);
    assert!(params.stateless_reset_token.is_some());
}

#[test]
fn client_first_flight_is_padded() {
    let mut client = make_client(
        TransportConfig::default(),
        &CongestionControlRegistry::with_defaults(),
    )
    .unwrap();
    let first = client.datagrams_to_send(0);
    assert_eq!(first.len(), 1);
    assert!(first[0].data.len() >= 1200);
    assert!(client.datagrams_to_send(0).is_empty());
}

#[test]
fn connection_ids_are_issued_up_to_peer_limit() {
    let mut pair = Pair::new();
    pair.handshake();

    let issued: Vec<_> = drain_events(&mut pair.client)
        .into_iter()
        .filter_map(|e| match e {
            Event::ConnectionIdIssued { connection_id } => Some(connection_id),
            _ => None,
        })
        .collect();
    // the handshake ID plus three more, all distinct
    assert_eq!(issued.len(), 4);
    for (i, id) in issued.iter().enumerate() {
        assert_eq!(id.len(), 8);
        assert!(!issued[i + 1..].contains(id));
    }
}

#[test]
fn lost_first_flight_is_retransmitted() {
    let mut pair = Pair::new();
    let lost = pair.client.datagrams_to_send(pair.now);
    assert_eq!(lost.len(), 1);

    let deadline = pair.client.get_timer_deadline().unwrap();
    assert!(deadline > pair.now);
    pair.now = deadline;
    pair.client.handle_timer(pair.now).unwrap();

    pair.handshake();
}

#[test]
fn operations_before_handshake_fail() {
    let mut pair = Pair::new();
    assert_eq!(pair.client.open_stream(true), Err(Error::InvalidState));
    assert_eq!(pair.client.initiate_key_update(), Err(Error::InvalidState));
    assert_eq!(
        pair.client.send_stream_data(0, b"early", false),
        Err(Error::InvalidState)
    );
}

#[test]
fn version_negotiation_without_v1_terminates() {
    let mut client = make_client(
        TransportConfig::default(),
        &CongestionControlRegistry::with_defaults(),
    )
    .unwrap();
    let first = client.datagrams_to_send(0).remove(0);
    let header = decode_header(&first.data, 0).unwrap();

    let mut vn = vec![0x80, 0, 0, 0, 0];
    vn.push(header.scid.len() as u8);
    vn.extend_from_slice(header.scid);
    vn.push(header.dcid.len() as u8);
    vn.extend_from_slice(header.dcid);
    vn.extend_from_slice(&[0xff, 0x00, 0x00, 0x1d]);

    client.receive_datagram(&vn, server_addr(), 10).unwrap();
    assert_eq!(client.state(), State::Terminated);
    let events = drain_events(&mut client);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionTerminated {
            error_code: 0x11,
            initiator: Initiator::Local,
            ..
        }
    )));
    assert_eq!(
        client.receive_datagram(&vn, server_addr(), 20),
        Err(Error::InvalidState)
    );
}

#[test]
fn unknown_congestion_algorithm_fails_fast() {
    let result = make_client(
        TransportConfig::default().with_congestion_control("cubic"),
        &CongestionControlRegistry::with_defaults(),
    );
    assert!(matches!(
        result,
        Err(Error::UnknownCongestionControlAlgorithm(name)) if name == "cubic"
    ));
}

// =========================================================================
// Streams
// =========================================================================

#[test]
fn request_and_response_on_bidirectional_stream() {
    let mut pair = Pair::new();
    pair.handshake();
    drain_events(&mut pair.client);
    drain_events(&mut pair.server);

    let id = pair.client.open_stream(true).unwrap();
    assert_eq!(id, 0);
    pair.client.send_stream_data(id, b"GET /\r\n", true).unwrap();
    pair.exchange_until_quiet();

    let events = drain_events(&mut pair.server);
    assert!(events.contains(&Event::StreamOpened { stream_id: 0 }));
    assert!(events.contains(&Event::StreamDataReceived {
        stream_id: 0,
        data: b"GET /\r\n".to_vec(),
        end_stream: true,
    }));

    pair.server.send_stream_data(0, b"hello", true).unwrap();
    pair.settle();

    let events = drain_events(&mut pair.client);
    assert!(events.contains(&Event::StreamDataReceived {
        stream_id: 0,
        data: b"hello".to_vec(),
        end_stream: true,
    }));
    assert!(events.contains(&Event::StreamFinished { stream_id: 0 }));
    assert!(drain_events(&mut pair.server).contains(&Event::StreamFinished { stream_id: 0 }));
}

#[test]
fn duplicated_datagram_is_delivered_once() {
    let mut pair = Pair::new();
    pair.handshake();
    drain_events(&mut pair.server);

    let id = pair.client.open_stream(true).unwrap();
    pair.client.send_stream_data(id, b"exactly once", true).unwrap();
    let out = pair.client.datagrams_to_send(pair.now);
    assert!(!out.is_empty());
    for transmit in &out {
        for _ in 0..2 {
            pair.server
                .receive_datagram(&transmit.data, client_addr(), pair.now)
                .unwrap();
        }
    }

    let events = drain_events(&mut pair.server);
    let data: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::StreamDataReceived { .. }))
        .collect();
    assert_eq!(
        data,
        [&Event::StreamDataReceived {
            stream_id: id,
            data: b"exactly once".to_vec(),
            end_stream: true,
        }]
    );
    let opened = events
        .iter()
        .filter(|e| matches!(e, Event::StreamOpened { .. }))
        .count();
    assert_eq!(opened, 1);
    assert_eq!(pair.server.state(), State::Connected);
}

#[test]
fn pull_delivery_buffers_until_read() {
    let server_config = TransportConfig::default().with_stream_delivery(StreamDelivery::Pull);
    let mut pair = Pair::with_configs(TransportConfig::default(), server_config);
    pair.handshake();
    drain_events(&mut pair.server);

    let id = pair.client.open_stream(true).unwrap();
    pair.client.send_stream_data(id, b"first ", false).unwrap();
    pair.exchange_until_quiet();
    pair.client.send_stream_data(id, b"second", true).unwrap();
    pair.exchange_until_quiet();

    let events = drain_events(&mut pair.server);
    assert!(events.contains(&Event::StreamReadable { stream_id: id }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::StreamDataReceived { .. })));

    let (data, end) = pair.server.data_to_read(id).unwrap();
    assert_eq!(data, b"first second");
    assert!(end);
}

#[test]
fn large_transfer_arrives_in_order() {
    let mut pair = Pair::new();
    pair.handshake();
    drain_events(&mut pair.server);

    let payload: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
    let id = pair.client.open_stream(false).unwrap();
    assert_eq!(id, 2);
    pair.client.send_stream_data(id, &payload, true).unwrap();
    pair.settle();

    let mut received = Vec::new();
    let mut finished = false;
    for event in drain_events(&mut pair.server) {
        if let Event::StreamDataReceived {
            stream_id,
            data,
            end_stream,
        } = event
        {
            assert_eq!(stream_id, id);
            assert!(!finished);
            received.extend_from_slice(&data);
            finished = end_stream;
        }
    }
    assert!(finished);
    assert_eq!(received, payload);
}

#[test]
fn flow_control_limits_are_enforced_on_write() {
    let server_config = TransportConfig::default()
        .with_max_stream_data(1_000)
        .with_max_streams(1, 0);
    let mut pair = Pair::with_configs(TransportConfig::default(), server_config);
    pair.handshake();

    let id = pair.client.open_stream(true).unwrap();
    assert_eq!(
        pair.client.send_stream_data(id, &[0u8; 1_001], false),
        Err(Error::Transport(TransportError::FlowControlError))
    );
    // nothing was queued by the rejected write
    pair.client.send_stream_data(id, &[0u8; 1_000], false).unwrap();
    assert_eq!(
        pair.client.send_stream_data(id, &[0u8; 1], false),
        Err(Error::Transport(TransportError::FlowControlError))
    );

    assert_eq!(pair.client.open_stream(true), Err(Error::StreamLimitExhausted));
    assert_eq!(pair.client.open_stream(false), Err(Error::StreamLimitExhausted));
}

#[test]
fn reset_stream_is_reported_to_peer() {
    let mut pair = Pair::new();
    pair.handshake();
    drain_events(&mut pair.server);

    let id = pair.client.open_stream(true).unwrap();
    pair.client.send_stream_data(id, b"partial", false).unwrap();
    pair.exchange_until_quiet();
    pair.client.reset_stream(id, 7).unwrap();
    pair.exchange_until_quiet();

    let events = drain_events(&mut pair.server);
    assert!(events.contains(&Event::StreamReset {
        stream_id: id,
        error_code: 7,
        final_size: 7,
    }));
}

#[test]
fn stop_sending_is_answered_with_reset() {
    let mut pair = Pair::new();
    pair.handshake();
    drain_events(&mut pair.client);

    let id = pair.client.open_stream(true).unwrap();
    pair.client.send_stream_data(id, b"ping", false).unwrap();
    pair.exchange_until_quiet();
    pair.server.stop_sending(id, 9).unwrap();
    pair.exchange_until_quiet();

    assert!(drain_events(&mut pair.client).contains(&Event::StopSending {
        stream_id: id,
        error_code: 9,
    }));
    assert_eq!(
        pair.client.send_stream_data(id, b"more", false),
        Err(Error::StreamFinished)
    );
}

#[test]
fn key_update_keeps_data_flowing() {
    let mut pair = Pair::new();
    pair.handshake();
    drain_events(&mut pair.server);

    assert!(!pair.client.key_phase());
    pair.client.initiate_key_update().unwrap();
    assert!(pair.client.key_phase());

    let id = pair.client.open_stream(true).unwrap();
    pair.client.send_stream_data(id, b"after update", true).unwrap();
    pair.settle();

    assert!(drain_events(&mut pair.server).contains(&Event::StreamDataReceived {
        stream_id: id,
        data: b"after update".to_vec(),
        end_stream: true,
    }));
    assert!(pair.server.key_phase());
}

// =========================================================================
// Closing
// =========================================================================

#[test]
fn application_close_reaches_peer() {
    let mut pair = Pair::new();
    pair.handshake();
    drain_events(&mut pair.client);
    drain_events(&mut pair.server);

    pair.client.close(0x42, b"bye");
    pair.client.close(0x43, b"again");
    assert_eq!(pair.client.state(), State::Closing);
    assert_eq!(
        drain_events(&mut pair.client),
        vec![Event::ConnectionTerminated {
            error_code: 0x42,
            frame_type: None,
            reason: b"bye".to_vec(),
            initiator: Initiator::Local,
        }]
    );

    pair.exchange_until_quiet();
    assert_eq!(
        drain_events(&mut pair.server),
        vec![Event::ConnectionTerminated {
            error_code: 0x42,
            frame_type: None,
            reason: b"bye".to_vec(),
            initiator: Initiator::Peer,
        }]
    );
    assert_eq!(pair.server.state(), State::Draining);

    let deadline = pair.client.get_timer_deadline().unwrap();
    pair.client.handle_timer(deadline).unwrap();
    assert_eq!(pair.client.state(), State::Terminated);
    assert!(pair.client.datagrams_to_send(deadline).is_empty());
    assert_eq!(pair.client.handle_timer(deadline + 1), Err(Error::InvalidState));
    assert_eq!(
        pair.client.receive_datagram(&[0x40; 64], server_addr(), deadline),
        Err(Error::InvalidState)
    );
    assert_eq!(pair.client.data_to_read(0), Err(Error::InvalidState));
}

#[test]
fn idle_timeout_terminates_quietly() {
    let config = TransportConfig::default().with_idle_timeout(core::time::Duration::from_secs(5));
    let mut pair = Pair::with_configs(config, TransportConfig::default());
    pair.handshake();
    drain_events(&mut pair.client);

    let deadline = pair.client.get_timer_deadline().unwrap();
    assert!(deadline >= pair.now + 4_000_000);
    pair.client.handle_timer(deadline).unwrap();
    assert_eq!(pair.client.state(), State::Terminated);
    assert!(pair.client.datagrams_to_send(deadline).is_empty());
    assert!(drain_events(&mut pair.client).iter().any(|e| matches!(
        e,
        Event::ConnectionTerminated {
            error_code: 0,
            initiator: Initiator::Local,
            ..
        }
    )));
}

// =========================================================================
// Congestion control and migration
// =========================================================================

std::thread_local! {
    /// Congestion window forced on `FixedWindow`; zero leaves NewReno's own.
    static WINDOW_CAP: Cell<u64> = const { Cell::new(0) };
}

/// NewReno whose window can be pinned to a small fixed size.
struct FixedWindow(NewReno);

impl CongestionController for FixedWindow {
    fn on_packet_sent(&mut self, now: u64, bytes: u64) {
        self.0.on_packet_sent(now, bytes);
    }
    fn on_packets_acked(&mut self, packets: &[SentPacket], now: u64) {
        self.0.on_packets_acked(packets, now);
    }
    fn on_packets_lost(&mut self, packets: &[SentPacket], now: u64, persistent: bool) {
        self.0.on_packets_lost(packets, now, persistent);
    }
    fn on_rtt_sample(&mut self, rtt: &RttEstimator) {
        self.0.on_rtt_sample(rtt);
    }
    fn on_packets_discarded(&mut self, bytes: u64) {
        self.0.on_packets_discarded(bytes);
    }
    fn congestion_window(&self) -> u64 {
        match WINDOW_CAP.with(Cell::get) {
            0 => self.0.congestion_window(),
            cap => cap,
        }
    }
    fn bytes_in_flight(&self) -> u64 {
        self.0.bytes_in_flight()
    }
}

fn fixed_window(config: &CongestionConfig) -> Box<dyn CongestionController> {
    Box::new(FixedWindow(NewReno::new(config)))
}

/// Handshake with the client on `FixedWindow`, then pin its window.
fn fixed_window_pair(cap: u64) -> Pair {
    let mut registry = CongestionControlRegistry::with_defaults();
    registry.register("fixed", fixed_window);
    let mut pair = Pair::with_registry(
        TransportConfig::default().with_congestion_control("fixed"),
        TransportConfig::default(),
        &registry,
    );
    pair.handshake();
    WINDOW_CAP.with(|c| c.set(cap));
    assert_eq!(pair.client.congestion_window(), cap);
    pair
}

#[test]
fn small_window_bounds_bytes_in_flight() {
    let mut pair = fixed_window_pair(3_000);
    drain_events(&mut pair.server);

    let payload = vec![7u8; 10_000];
    let id = pair.client.open_stream(true).unwrap();
    pair.client.send_stream_data(id, &payload, true).unwrap();

    let mut received = Vec::new();
    let mut first_flight = None;
    for _ in 0..500 {
        let out = pair.client.datagrams_to_send(pair.now);
        assert!(pair.client.bytes_in_flight() <= pair.client.congestion_window());
        if first_flight.is_none() {
            first_flight = Some(out.iter().map(|t| t.data.len()).sum::<usize>());
        }
        let mut moved = out.len();
        for transmit in out {
            let _ = pair
                .server
                .receive_datagram(&transmit.data, pair.client_addr, pair.now);
        }
        for transmit in pair.server.datagrams_to_send(pair.now) {
            let _ = pair
                .client
                .receive_datagram(&transmit.data, server_addr(), pair.now);
            moved += 1;
        }
        for event in drain_events(&mut pair.server) {
            if let Event::StreamDataReceived { data, .. } = event {
                received.extend_from_slice(&data);
            }
        }
        if received.len() == payload.len() {
            break;
        }
        if moved == 0 {
            // only delayed ACKs are outstanding
            let next = [
                pair.client.get_timer_deadline(),
                pair.server.get_timer_deadline(),
            ]
            .into_iter()
            .flatten()
            .min()
            .unwrap();
            pair.now = pair.now.max(next);
            let _ = pair.client.handle_timer(pair.now);
            let _ = pair.server.handle_timer(pair.now);
        }
    }

    let first_flight = first_flight.unwrap();
    assert!(first_flight > 0 && first_flight <= 3_000);
    assert_eq!(received, payload);
}

#[test]
fn full_window_only_lets_probes_out() {
    let mut pair = fixed_window_pair(3_000);

    let log = SentLog::default();
    pair.client.set_observer(Box::new(log.clone()));

    let id = pair.client.open_stream(true).unwrap();
    pair.client.send_stream_data(id, &[1u8; 8_000], false).unwrap();
    // the window's worth goes out and is lost
    assert!(!pair.client.datagrams_to_send(pair.now).is_empty());
    assert!(pair.client.bytes_in_flight() <= 3_000);
    assert!(pair.client.datagrams_to_send(pair.now).is_empty());
    log.take();

    let pto = pair.client.get_timer_deadline().unwrap();
    pair.client.handle_timer(pto).unwrap();
    let probes = pair.client.datagrams_to_send(pto);
    assert!(!probes.is_empty() && probes.len() <= 2);
    assert!(pair.client.datagrams_to_send(pto).is_empty());

    let sent = log.take();
    assert_eq!(sent.len(), probes.len());
    assert!(sent.iter().all(|(space, frames)| *space == PacketSpace::Application
        && frames.iter().any(|f| !matches!(f, SentFrame::Ack { .. }))));
    assert!(sent
        .iter()
        .flat_map(|(_, frames)| frames)
        .any(|f| matches!(f, SentFrame::Stream { stream_id: 0, .. })));
}

#[test]
fn server_follows_migrated_client() {
    let mut pair = Pair::new();
    pair.handshake();
    drain_events(&mut pair.server);

    let new_addr = addr(40_001);
    pair.client_addr = new_addr;
    let id = pair.client.open_stream(true).unwrap();
    pair.client.send_stream_data(id, b"from a new port", true).unwrap();
    pair.settle();

    assert_eq!(pair.server.remote_address(), new_addr);
    assert_eq!(pair.server.state(), State::Connected);
    assert!(drain_events(&mut pair.server).contains(&Event::StreamDataReceived {
        stream_id: id,
        data: b"from a new port".to_vec(),
        end_stream: true,
    }));

    pair.server.send_stream_data(id, b"ok", true).unwrap();
    let out = pair.server.datagrams_to_send(pair.now);
    assert!(!out.is_empty());
    assert!(out.iter().all(|t| t.destination == new_addr));
}
