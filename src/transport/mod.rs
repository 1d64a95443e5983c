//! Transport machinery shared by every connection: loss recovery,
//! congestion control, flow control and stream buffers.
//!
//! Nothing in here performs I/O. Time is passed in by the caller as an
//! [`Instant`], and randomness comes from a caller-supplied [`Rng`].

pub mod congestion;
pub mod flow_control;
pub mod loss;
pub mod range_set;
pub mod recovery;
pub mod stream;

/// Timestamp in microseconds from an arbitrary epoch.
/// Used for RTT measurement and every timer deadline.
pub type Instant = u64;

/// Microseconds per millisecond, for converting configured durations.
pub const MICROS_PER_MILLI: u64 = 1_000;

/// Granularity of the loss detection timers (RFC 9002 kGranularity).
pub const TIMER_GRANULARITY: u64 = MICROS_PER_MILLI;

/// Random bytes for connection IDs, reset tokens and path challenges.
///
/// On embedded targets implement this with a hardware TRNG peripheral;
/// elsewhere any cryptographic RNG source will do.
pub trait Rng {
    /// Fill `buf` with random bytes.
    fn fill(&mut self, buf: &mut [u8]);
}
