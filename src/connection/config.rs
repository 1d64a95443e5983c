//! Per-connection configuration.

use alloc::string::{String, ToString};
use core::time::Duration;

use crate::connection::cid::ConnectionId;
use crate::tls::TransportParams;
use crate::transport::congestion::DEFAULT_ALGORITHM;
use crate::transport::stream::StreamLimits;

/// How received stream data reaches the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamDelivery {
    /// Contiguous data is pushed in `Event::StreamDataReceived` and counts
    /// as consumed immediately; `data_to_read` finds nothing new.
    #[default]
    Events,
    /// Only `Event::StreamReadable` is emitted; the application pulls with
    /// `Connection::data_to_read`.
    Pull,
}

/// Tunables of one connection, fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Name looked up in the congestion control registry.
    pub congestion_control_algorithm: String,
    /// Zero disables the idle timeout on our side.
    pub idle_timeout: Duration,
    pub max_udp_payload_size: u16,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_ack_delay: Duration,
    pub ack_delay_exponent: u8,
    /// Peer IDs we are willing to hold.
    pub active_connection_id_limit: u8,
    /// Length of the connection IDs we issue.
    pub connection_id_length: u8,
    pub packet_threshold: u64,
    /// Consecutive probe timeouts tolerated before giving up.
    pub max_pto_probes: u32,
    /// RTT assumed before the first sample.
    pub initial_rtt: Duration,
    pub stream_delivery: StreamDelivery,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            congestion_control_algorithm: DEFAULT_ALGORITHM.to_string(),
            idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: 1452,
            initial_max_data: 1_048_576,
            initial_max_stream_data_bidi_local: 262_144,
            initial_max_stream_data_bidi_remote: 262_144,
            initial_max_stream_data_uni: 262_144,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_ack_delay: Duration::from_millis(25),
            ack_delay_exponent: 3,
            active_connection_id_limit: 4,
            connection_id_length: 8,
            packet_threshold: 3,
            max_pto_probes: 5,
            initial_rtt: Duration::from_millis(333),
            stream_delivery: StreamDelivery::Events,
        }
    }
}

impl TransportConfig {
    pub fn with_congestion_control(mut self, name: &str) -> Self {
        self.congestion_control_algorithm = name.to_string();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_udp_payload_size(mut self, size: u16) -> Self {
        self.max_udp_payload_size = size;
        self
    }

    /// Connection-level receive window.
    pub fn with_max_data(mut self, max: u64) -> Self {
        self.initial_max_data = max;
        self
    }

    /// Same receive window for every kind of stream.
    pub fn with_max_stream_data(mut self, max: u64) -> Self {
        self.initial_max_stream_data_bidi_local = max;
        self.initial_max_stream_data_bidi_remote = max;
        self.initial_max_stream_data_uni = max;
        self
    }

    pub fn with_max_streams(mut self, bidi: u64, uni: u64) -> Self {
        self.initial_max_streams_bidi = bidi;
        self.initial_max_streams_uni = uni;
        self
    }

    pub fn with_max_ack_delay(mut self, delay: Duration) -> Self {
        self.max_ack_delay = delay;
        self
    }

    pub fn with_packet_threshold(mut self, threshold: u64) -> Self {
        self.packet_threshold = threshold;
        self
    }

    pub fn with_max_pto_probes(mut self, probes: u32) -> Self {
        self.max_pto_probes = probes;
        self
    }

    pub fn with_initial_rtt(mut self, rtt: Duration) -> Self {
        self.initial_rtt = rtt;
        self
    }

    pub fn with_stream_delivery(mut self, delivery: StreamDelivery) -> Self {
        self.stream_delivery = delivery;
        self
    }

    /// Receive limits we grant the peer.
    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            max_data: self.initial_max_data,
            max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: self.initial_max_stream_data_uni,
            max_streams_bidi: self.initial_max_streams_bidi,
            max_streams_uni: self.initial_max_streams_uni,
        }
    }

    /// Our transport parameters, before the connection IDs are filled in.
    pub fn transport_params(&self, initial_source: &ConnectionId) -> TransportParams {
        TransportParams {
            max_idle_timeout: self.idle_timeout.as_millis() as u64,
            max_udp_payload_size: u64::from(self.max_udp_payload_size),
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            initial_max_streams_uni: self.initial_max_streams_uni,
            ack_delay_exponent: u64::from(self.ack_delay_exponent),
            max_ack_delay: self.max_ack_delay.as_millis() as u64,
            active_connection_id_limit: u64::from(self.active_connection_id_limit.max(2)),
            initial_source_connection_id: Some(initial_source.clone()),
            ..TransportParams::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TransportConfig::default();
        assert_eq!(config.congestion_control_algorithm, "reno");
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_udp_payload_size, 1452);
        assert_eq!(config.packet_threshold, 3);
        assert_eq!(config.max_pto_probes, 5);
        assert_eq!(config.initial_rtt, Duration::from_millis(333));
        assert_eq!(config.stream_delivery, StreamDelivery::Events);
    }

    #[test]
    fn transport_params_validate() {
        let cid = ConnectionId::new(&[1; 8]).unwrap();
        let config = TransportConfig::default().with_max_streams(10, 3);
        let params = config.transport_params(&cid);
        params.validate().unwrap();
        assert_eq!(params.max_idle_timeout, 30_000);
        assert_eq!(params.max_ack_delay, 25);
        assert_eq!(params.initial_max_streams_uni, 3);
        assert_eq!(params.initial_source_connection_id, Some(cid));
    }
}
