//! Sans-IO QUIC v1 transport engine.
//!
//! A [`Connection`] turns received datagrams, timer ticks and application
//! calls into datagrams to send and [`Event`]s, without touching sockets or
//! clocks itself. The caller owns the UDP socket and the timer, and routes
//! datagrams by connection ID with a [`ConnectionIdTable`].
//!
//! ```text
//!             receive_datagram / handle_timer / stream API
//!  caller  ------------------------------------------------->  Connection
//!          <-------------------------------------------------
//!             datagrams_to_send / next_event / get_timer_deadline
//! ```
//!
//! The handshake engine is pluggable through [`tls::TlsSession`]; packet
//! protection backends through [`crypto::CryptoProvider`]; congestion
//! control through
//! [`CongestionControlRegistry`](transport::congestion::CongestionControlRegistry).

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

pub mod error;
pub mod frame;
pub mod varint;

pub mod transport;
pub use transport::{Instant, Rng};

pub mod crypto;
pub mod packet;
pub mod tls;

pub mod connection;
pub use connection::{
    Connection, ConnectionId, ConnectionIdTable, Event, Initiator, PacketObserver, Role, State,
    StreamDelivery, Transmit, TransportConfig,
};
pub use error::{Error, TransportError};
