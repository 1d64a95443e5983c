//! Credit-based flow control (RFC 9000 §4).
//!
//! The same two windows serve both levels: a [`SendWindow`] tracks the
//! peer's limit on what we may send, a [`RecvWindow`] tracks the limit we
//! advertised and decides when to raise it. [`StreamCount`] does the same
//! for the number of streams of one kind.

use crate::error::{Error, TransportError};

// ---------------------------------------------------------------------------
// Send side
// ---------------------------------------------------------------------------

/// Peer-imposed limit on bytes sent (MAX_DATA / MAX_STREAM_DATA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    max: u64,
    used: u64,
    /// Limit a DATA_BLOCKED-style frame was last queued for.
    blocked_at: Option<u64>,
}

impl SendWindow {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            used: 0,
            blocked_at: None,
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Bytes that may still be sent.
    pub fn capacity(&self) -> u64 {
        self.max.saturating_sub(self.used)
    }

    /// Fails with FLOW_CONTROL_ERROR if `bytes` more would exceed the limit.
    pub fn check(&self, bytes: u64) -> Result<(), Error> {
        if bytes > self.capacity() {
            return Err(TransportError::FlowControlError.into());
        }
        Ok(())
    }

    pub fn consume(&mut self, bytes: u64) -> Result<(), Error> {
        self.check(bytes)?;
        self.used += bytes;
        Ok(())
    }

    /// Peer raised its limit. Smaller values are ignored; returns whether
    /// the limit grew.
    pub fn update_max(&mut self, max: u64) -> bool {
        if max <= self.max {
            return false;
        }
        self.max = max;
        true
    }

    /// Limit to report as blocking, once per limit value.
    pub fn blocked(&self) -> Option<u64> {
        (self.capacity() == 0 && self.blocked_at != Some(self.max)).then_some(self.max)
    }

    pub fn on_blocked_sent(&mut self) {
        self.blocked_at = Some(self.max);
    }
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

/// Locally advertised limit on bytes received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    window: u64,
    /// Limit last advertised to the peer.
    max: u64,
    /// Highest offset (or byte count) received so far.
    highest: u64,
    /// Bytes handed to the application.
    consumed: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            max: window,
            highest: 0,
            consumed: 0,
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Peer data reached `end`. Returns how far the highest received
    /// offset advanced; data past the advertised limit is a
    /// FLOW_CONTROL_ERROR.
    pub fn on_received(&mut self, end: u64) -> Result<u64, Error> {
        if end > self.max {
            return Err(TransportError::FlowControlError.into());
        }
        let grown = end.saturating_sub(self.highest);
        self.highest = self.highest.max(end);
        Ok(grown)
    }

    /// Account `bytes` towards the connection-level total, which grows by
    /// increments instead of absolute offsets.
    pub fn on_received_bytes(&mut self, bytes: u64) -> Result<(), Error> {
        self.on_received(self.highest + bytes).map(|_| ())
    }

    pub fn on_consumed(&mut self, bytes: u64) {
        self.consumed = (self.consumed + bytes).min(self.highest);
    }

    /// New limit to advertise once the unconsumed part of the window drops
    /// below half of it.
    pub fn pending_update(&self) -> Option<u64> {
        let remaining = self.max.saturating_sub(self.consumed);
        if remaining >= self.window / 2 {
            return None;
        }
        let next = self.consumed + self.window;
        (next > self.max).then_some(next)
    }

    /// A frame advertising `limit` was queued.
    pub fn commit_update(&mut self, limit: u64) {
        self.max = self.max.max(limit);
    }

    /// Whether a lost frame carrying `limit` is still worth resending.
    pub fn is_current(&self, limit: u64) -> bool {
        limit == self.max
    }
}

// ---------------------------------------------------------------------------
// Stream counts
// ---------------------------------------------------------------------------

/// Stream count limits for one kind (bidirectional or unidirectional).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCount {
    /// Streams we may open, per the peer's MAX_STREAMS.
    local_max: u64,
    local_opened: u64,
    /// Streams the peer may open, as last advertised.
    remote_max: u64,
    remote_initial: u64,
    /// Peer streams fully reclaimed so far.
    remote_reclaimed: u64,
}

impl StreamCount {
    pub fn new(remote_initial: u64) -> Self {
        Self {
            local_max: 0,
            local_opened: 0,
            remote_max: remote_initial,
            remote_initial,
            remote_reclaimed: 0,
        }
    }

    pub fn local_max(&self) -> u64 {
        self.local_max
    }

    pub fn remote_max(&self) -> u64 {
        self.remote_max
    }

    /// Reserve the index of the next local stream.
    pub fn open_local(&mut self) -> Result<u64, Error> {
        if self.local_opened >= self.local_max {
            return Err(Error::StreamLimitExhausted);
        }
        let index = self.local_opened;
        self.local_opened += 1;
        Ok(index)
    }

    /// Whether the next local stream would be refused.
    pub fn local_blocked(&self) -> bool {
        self.local_opened >= self.local_max
    }

    pub fn local_opened(&self) -> u64 {
        self.local_opened
    }

    /// Peer sent MAX_STREAMS. A value above 2^60 is a FRAME_ENCODING_ERROR.
    pub fn update_local_max(&mut self, max: u64) -> Result<(), Error> {
        if max > 1 << 60 {
            return Err(TransportError::FrameEncodingError.into());
        }
        self.local_max = self.local_max.max(max);
        Ok(())
    }

    /// The peer used stream `index` of this kind.
    pub fn check_remote(&self, index: u64) -> Result<(), Error> {
        if index >= self.remote_max {
            return Err(TransportError::StreamLimitError.into());
        }
        Ok(())
    }

    pub fn on_remote_reclaimed(&mut self) {
        self.remote_reclaimed += 1;
    }

    /// New MAX_STREAMS value once half of the initial allowance has been
    /// reclaimed since the last update.
    pub fn pending_update(&self) -> Option<u64> {
        let next = self.remote_initial + self.remote_reclaimed;
        let step = (self.remote_initial / 2).max(1);
        (next >= self.remote_max + step).then_some(next)
    }

    pub fn commit_update(&mut self, max: u64) {
        self.remote_max = self.remote_max.max(max);
    }

    pub fn is_current(&self, max: u64) -> bool {
        max == self.remote_max
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
