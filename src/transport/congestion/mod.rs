//! Pluggable congestion control.
//!
//! The recovery engine reports sends, acknowledgments, losses and RTT
//! samples to a [`CongestionController`]; the connection reads back the
//! window. Strategies are looked up by name in a
//! [`CongestionControlRegistry`] once, when a connection is built.

pub mod new_reno;
pub mod pacer;

pub use new_reno::NewReno;
pub use pacer::Pacer;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::Error;
use crate::transport::loss::RttEstimator;
use crate::transport::recovery::SentPacket;
use crate::transport::Instant;

/// Name of the strategy every registry built with
/// [`CongestionControlRegistry::with_defaults`] provides.
pub const DEFAULT_ALGORITHM: &str = "reno";

/// Parameters handed to a strategy factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionConfig {
    /// Largest datagram the connection sends, in bytes.
    pub max_datagram_size: u64,
}

impl CongestionConfig {
    /// RFC 9002 initial window: `min(10 * mds, max(2 * mds, 14720))`.
    pub fn initial_window(&self) -> u64 {
        let mds = self.max_datagram_size;
        (10 * mds).min((2 * mds).max(14_720))
    }

    /// Window after persistent congestion: two datagrams.
    pub fn minimum_window(&self) -> u64 {
        2 * self.max_datagram_size
    }
}

/// A congestion control strategy.
///
/// The slices passed to the `on_packets_*` callbacks hold every packet the
/// event covers; packets with `in_flight == false` never counted towards
/// `bytes_in_flight` and must be skipped.
pub trait CongestionController: Send {
    /// An in-flight packet of `bytes` was sent.
    fn on_packet_sent(&mut self, now: Instant, bytes: u64);

    fn on_packets_acked(&mut self, packets: &[SentPacket], now: Instant);

    /// `persistent_congestion` is set when the losses span more than the
    /// persistent congestion period.
    fn on_packets_lost(&mut self, packets: &[SentPacket], now: Instant, persistent_congestion: bool);

    fn on_rtt_sample(&mut self, rtt: &RttEstimator);

    /// A packet number space was dropped: its `bytes` leave flight without
    /// signalling congestion.
    fn on_packets_discarded(&mut self, bytes: u64);

    fn congestion_window(&self) -> u64;

    fn bytes_in_flight(&self) -> u64;

    fn in_slow_start(&self) -> bool {
        false
    }

    /// Room left in the window.
    fn available_window(&self) -> u64 {
        self.congestion_window().saturating_sub(self.bytes_in_flight())
    }
}

/// Builds a strategy instance for one connection.
pub type CongestionFactory = fn(&CongestionConfig) -> Box<dyn CongestionController>;

/// Explicit name to factory mapping.
#[derive(Clone, Default)]
pub struct CongestionControlRegistry {
    factories: BTreeMap<String, CongestionFactory>,
}

impl CongestionControlRegistry {
    /// A registry with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding only the `"reno"` reference strategy.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_ALGORITHM, new_reno::factory);
        registry
    }

    /// Add (or replace) a strategy.
    pub fn register(&mut self, name: &str, factory: CongestionFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate the strategy registered under `name`.
    pub fn create(
        &self,
        name: &str,
        config: &CongestionConfig,
    ) -> Result<Box<dyn CongestionController>, Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownCongestionControlAlgorithm(name.to_string()))?;
        Ok(factory(config))
    }
}

impl core::fmt::Debug for CongestionControlRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    impl CongestionController for Fixed {
        fn on_packet_sent(&mut self, _: Instant, _: u64) {}
        fn on_packets_acked(&mut self, _: &[SentPacket], _: Instant) {}
        fn on_packets_lost(&mut self, _: &[SentPacket], _: Instant, _: bool) {}
        fn on_rtt_sample(&mut self, _: &RttEstimator) {}
        fn on_packets_discarded(&mut self, _: u64) {}
        fn congestion_window(&self) -> u64 {
            self.0
        }
        fn bytes_in_flight(&self) -> u64 {
            0
        }
    }

    fn fixed(_: &CongestionConfig) -> Box<dyn CongestionController> {
        Box::new(Fixed(4_000))
    }

    const CONFIG: CongestionConfig = CongestionConfig {
        max_datagram_size: 1200,
    };

    #[test]
    fn defaults_provide_only_reno() {
        let registry = CongestionControlRegistry::with_defaults();
        assert_eq!(registry.names(), ["reno"]);
        let cc = registry.create("reno", &CONFIG).unwrap();
        assert_eq!(cc.congestion_window(), 12_000);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn unknown_name_fails_fast() {
        let registry = CongestionControlRegistry::with_defaults();
        let err = registry.create("cubic", &CONFIG).err();
        assert_eq!(
            err,
            Some(Error::UnknownCongestionControlAlgorithm("cubic".into()))
        );
        assert!(CongestionControlRegistry::new().create("reno", &CONFIG).is_err());
    }

    #[test]
    fn registered_strategy_is_used() {
        let mut registry = CongestionControlRegistry::with_defaults();
        registry.register("fixed", fixed);
        assert!(registry.contains("fixed"));
        let cc = registry.create("fixed", &CONFIG).unwrap();
        assert_eq!(cc.congestion_window(), 4_000);
        assert_eq!(cc.available_window(), 4_000);
        assert!(!cc.in_slow_start());
    }

    #[test]
    fn initial_window_bounds() {
        assert_eq!(CONFIG.initial_window(), 12_000);
        let jumbo = CongestionConfig {
            max_datagram_size: 9000,
        };
        assert_eq!(jumbo.initial_window(), 18_000);
        assert_eq!(jumbo.minimum_window(), 18_000);
    }
}
