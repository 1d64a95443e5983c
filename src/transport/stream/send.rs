//! Send-side byte buffer shared by stream and CRYPTO data.
//!
//! Bytes stay buffered from the moment they are written until every byte
//! below them has been acknowledged. Pending ranges are what the packet
//! builder still has to put on the wire: fresh data plus anything declared
//! lost that was not acknowledged meanwhile.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::ops::Range;

use crate::transport::range_set::RangeSet;

/// A chunk the packet builder should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
    pub fin: bool,
}

#[derive(Debug, Default)]
pub struct SendBuffer {
    /// Unacknowledged bytes from `base` up to `written`.
    data: VecDeque<u8>,
    /// Everything below this offset is acknowledged and dropped.
    base: u64,
    written: u64,
    pending: RangeSet,
    /// Acknowledged ranges at or above `base`.
    acked: RangeSet,
    final_size: Option<u64>,
    fin_pending: bool,
    fin_acked: bool,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn is_finished(&self) -> bool {
        self.final_size.is_some()
    }

    /// Bytes written but not yet acknowledged.
    pub fn buffered(&self) -> usize {
        self.data.len()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let start = self.written;
        self.data.extend(bytes.iter().copied());
        self.written += bytes.len() as u64;
        self.pending.insert(start..self.written);
    }

    /// No more bytes follow; the final size is the current length.
    pub fn finish(&mut self) {
        if self.final_size.is_none() {
            self.final_size = Some(self.written);
            self.fin_pending = true;
        }
    }

    /// Whether there is anything left to transmit.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.fin_pending
    }

    /// Offset of the next chunk [`next_chunk`](Self::next_chunk) would send.
    pub fn next_offset(&self) -> Option<u64> {
        match self.pending.first() {
            Some(r) => Some(r.start),
            None => self.fin_pending.then_some(self.written),
        }
    }

    /// Take up to `max_len` bytes of the lowest pending range.
    pub fn next_chunk(&mut self, max_len: usize) -> Option<Chunk> {
        let Some(range) = self.pending.first() else {
            if !self.fin_pending {
                return None;
            }
            self.fin_pending = false;
            return Some(Chunk {
                offset: self.written,
                data: Vec::new(),
                fin: true,
            });
        };
        if max_len == 0 {
            return None;
        }
        let end = range.end.min(range.start + max_len as u64);
        self.pending.remove(range.start..end);

        let from = (range.start - self.base) as usize;
        let to = (end - self.base) as usize;
        let data: Vec<u8> = self.data.range(from..to).copied().collect();

        let fin = self.fin_pending && self.final_size == Some(end);
        if fin {
            self.fin_pending = false;
        }
        Some(Chunk {
            offset: range.start,
            data,
            fin,
        })
    }

    /// A frame covering `range` was acknowledged.
    pub fn on_ack(&mut self, range: Range<u64>, fin: bool) {
        if fin {
            self.fin_acked = true;
        }
        let start = range.start.max(self.base);
        if start >= range.end {
            return;
        }
        self.acked.insert(start..range.end);
        self.pending.remove(start..range.end);

        while let Some(first) = self.acked.first() {
            if first.start != self.base {
                break;
            }
            self.acked.pop_first();
            let n = (first.end - self.base) as usize;
            self.data.drain(..n);
            self.base = first.end;
        }
    }

    /// A frame covering `range` was lost: re-queue what is still unacknowledged.
    pub fn on_lost(&mut self, range: Range<u64>, fin: bool) {
        if fin && !self.fin_acked {
            self.fin_pending = true;
        }
        let start = range.start.max(self.base);
        if start >= range.end {
            return;
        }
        for gap in self.acked.gaps_in(start..range.end) {
            self.pending.insert(gap);
        }
    }

    /// Queue every unacknowledged byte again (PTO in the handshake spaces).
    pub fn requeue_unacked(&mut self) {
        let range = self.base..self.written;
        for gap in self.acked.gaps_in(range) {
            self.pending.insert(gap);
        }
        if self.final_size.is_some() && !self.fin_acked {
            self.fin_pending = true;
        }
    }

    /// All data and the final size were acknowledged.
    pub fn is_fully_acked(&self) -> bool {
        self.fin_acked && Some(self.base) == self.final_size
    }

    /// Whether every byte below `offset` was acknowledged.
    pub fn is_acked_below(&self, offset: u64) -> bool {
        self.base >= offset
    }

    /// Drop all buffered data after a reset.
    pub fn clear(&mut self) {
        self.data.clear();
        self.pending = RangeSet::new();
        self.acked = RangeSet::new();
        self.base = self.written;
        self.fin_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_size_limit() {
        let mut buf = SendBuffer::new();
        buf.write(b"hello world");
        buf.finish();

        let a = buf.next_chunk(5).unwrap();
        assert_eq!((a.offset, a.data.as_slice(), a.fin), (0, &b"hello"[..], false));
        let b = buf.next_chunk(100).unwrap();
        assert_eq!((b.offset, b.data.as_slice(), b.fin), (5, &b" world"[..], true));
        assert!(buf.next_chunk(100).is_none());
        assert!(!buf.has_pending());
    }

    #[test]
    fn bare_fin_is_sent_after_data() {
        let mut buf = SendBuffer::new();
        buf.write(b"abc");
        let chunk = buf.next_chunk(10).unwrap();
        assert!(!chunk.fin);
        buf.finish();
        let fin = buf.next_chunk(10).unwrap();
        assert_eq!(fin, Chunk { offset: 3, data: Vec::new(), fin: true });
    }

    #[test]
    fn lost_ranges_skip_acknowledged_bytes() {
        let mut buf = SendBuffer::new();
        buf.write(&[7; 30]);
        buf.next_chunk(30).unwrap();

        buf.on_ack(10..20, false);
        buf.on_lost(0..30, false);
        let first = buf.next_chunk(100).unwrap();
        assert_eq!((first.offset, first.data.len()), (0, 10));
        let second = buf.next_chunk(100).unwrap();
        assert_eq!((second.offset, second.data.len()), (20, 10));
        assert!(buf.next_chunk(100).is_none());
    }

    #[test]
    fn acked_prefix_is_released() {
        let mut buf = SendBuffer::new();
        buf.write(b"0123456789");
        buf.finish();
        buf.next_chunk(4).unwrap();
        buf.next_chunk(10).unwrap();

        buf.on_ack(4..10, true);
        assert_eq!(buf.buffered(), 10);
        assert!(!buf.is_fully_acked());
        buf.on_ack(0..4, false);
        assert_eq!(buf.buffered(), 0);
        assert!(buf.is_fully_acked());

        // late loss of an acked frame requeues nothing
        buf.on_lost(0..4, false);
        assert!(!buf.has_pending());
    }

    #[test]
    fn requeue_unacked_for_probes() {
        let mut buf = SendBuffer::new();
        buf.write(b"crypto");
        buf.next_chunk(10).unwrap();
        buf.on_ack(0..2, false);
        buf.requeue_unacked();
        let chunk = buf.next_chunk(10).unwrap();
        assert_eq!((chunk.offset, chunk.data.as_slice()), (2, &b"ypto"[..]));
    }
}
