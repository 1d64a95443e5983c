//! Boundary between the transport and a TLS 1.3 handshake engine.
//!
//! QUIC uses TLS 1.3 differently from TCP:
//! - No TLS record layer: QUIC carries raw handshake messages in CRYPTO frames
//! - No TLS content encryption: QUIC does its own packet protection
//! - QUIC transport parameters are exchanged as a TLS extension
//!
//! The connection drives any [`TlsSession`]: it feeds received CRYPTO bytes
//! per epoch, sends whatever the session writes, and installs the traffic
//! secrets the session hands out. [`ScriptedSession`] is a deterministic
//! stand-in used for simulation and tests; it authenticates nothing.

pub mod scripted;
pub mod transport_params;

pub use scripted::ScriptedSession;
pub use transport_params::TransportParams;

use alloc::vec::Vec;

use crate::crypto::{Direction, Epoch, TrafficSecret};
use crate::error::Error;

/// A traffic secret ready to be installed for one epoch and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdate {
    pub epoch: Epoch,
    pub direction: Direction,
    pub material: TrafficSecret,
}

/// The TLS session interface used by QUIC.
pub trait TlsSession {
    /// Process incoming handshake bytes from CRYPTO frames of `epoch`, in
    /// stream order.
    ///
    /// Returning [`Error::Handshake`] closes the connection with a
    /// CRYPTO_ERROR; a transport error (such as a bad transport parameter)
    /// closes it with that code.
    fn read_handshake(&mut self, epoch: Epoch, data: &[u8]) -> Result<(), Error>;

    /// Next handshake bytes to send and the epoch they belong to.
    fn write_handshake(&mut self) -> Option<(Epoch, Vec<u8>)>;

    /// Next secret that became available, in the order it must be used.
    fn next_key_update(&mut self) -> Option<KeyUpdate>;

    /// Is the handshake complete?
    fn is_complete(&self) -> bool;

    /// Negotiated application protocol (e.g., b"h3").
    fn alpn(&self) -> Option<&[u8]>;

    /// Set our QUIC transport parameters. Called once, before the first
    /// `write_handshake`.
    fn set_local_transport_params(&mut self, params: &TransportParams);

    /// Peer's QUIC transport parameters, once received and validated.
    fn peer_transport_params(&self) -> Option<&TransportParams>;
}
