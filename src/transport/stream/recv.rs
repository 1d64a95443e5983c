//! Receive-side reassembly shared by stream and CRYPTO data.
//!
//! Fragments may arrive in any order and overlap arbitrarily. Each byte
//! offset is stored at most once, and only the contiguous prefix starting
//! at the read offset is ever handed out.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::{Error, TransportError};
use crate::transport::range_set::RangeSet;

#[derive(Debug, Default)]
pub struct RecvBuffer {
    /// Non-overlapping undelivered fragments keyed by offset.
    fragments: BTreeMap<u64, Vec<u8>>,
    /// Offsets at or above `read` already stored.
    stored: RangeSet,
    read: u64,
    highest: u64,
    final_size: Option<u64>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next byte the application will get.
    pub fn read_offset(&self) -> u64 {
        self.read
    }

    /// Highest offset seen in any frame.
    pub fn highest(&self) -> u64 {
        self.highest
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Check `end` (and `fin`) against what is known of the final size.
    pub fn check_final_size(&self, end: u64, fin: bool) -> Result<(), Error> {
        match self.final_size {
            Some(size) if fin && size != end => Err(TransportError::FinalSizeError.into()),
            Some(size) if end > size => Err(TransportError::FinalSizeError.into()),
            None if fin && end < self.highest => Err(TransportError::FinalSizeError.into()),
            _ => Ok(()),
        }
    }

    /// Store a fragment. Returns whether any byte (or the final size) was
    /// new.
    pub fn insert(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<bool, Error> {
        let end = offset + data.len() as u64;
        self.check_final_size(end, fin)?;

        let mut fresh = false;
        if fin && self.final_size.is_none() {
            self.final_size = Some(end);
            fresh = true;
        }
        self.highest = self.highest.max(end);

        let start = offset.max(self.read);
        if start >= end {
            return Ok(fresh);
        }
        for gap in self.stored.gaps_in(start..end) {
            let from = (gap.start - offset) as usize;
            let to = (gap.end - offset) as usize;
            self.fragments.insert(gap.start, data[from..to].to_vec());
            self.stored.insert(gap);
            fresh = true;
        }
        Ok(fresh)
    }

    /// Whether the next contiguous byte is available.
    pub fn is_readable(&self) -> bool {
        self.fragments.contains_key(&self.read)
    }

    /// Every byte up to the known final size has arrived.
    pub fn is_complete(&self) -> bool {
        match self.final_size {
            Some(size) => size == self.read || self.stored.contains_range(&(self.read..size)),
            None => false,
        }
    }

    /// Every byte up to the final size was handed out.
    pub fn is_fully_read(&self) -> bool {
        self.final_size == Some(self.read)
    }

    /// Lazily yield contiguous chunks, advancing the read offset as each
    /// is taken. Dropping the iterator early loses nothing.
    pub fn read_chunks(&mut self) -> ReadChunks<'_> {
        ReadChunks { buf: self }
    }

    /// Drain everything contiguous into one buffer.
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in self.read_chunks() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// The peer reset the stream: pin the final size and drop what is
    /// buffered.
    pub fn reset(&mut self, final_size: u64) -> Result<(), Error> {
        self.check_final_size(final_size, true)?;
        self.final_size = Some(final_size);
        self.highest = self.highest.max(final_size);
        self.fragments.clear();
        self.stored = RangeSet::new();
        Ok(())
    }
}

/// Iterator over the contiguous data of a [`RecvBuffer`].
#[derive(Debug)]
pub struct ReadChunks<'a> {
    buf: &'a mut RecvBuffer,
}

impl Iterator for ReadChunks<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let buf = &mut *self.buf;
        let chunk = buf.fragments.remove(&buf.read)?;
        let end = buf.read + chunk.len() as u64;
        buf.stored.remove_below(end);
        buf.read = end;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn out_of_order_held_until_gap_fills() {
        let mut buf = RecvBuffer::new();
        assert!(buf.insert(5, b"world", false).unwrap());
        assert!(!buf.is_readable());
        assert_eq!(buf.read_all(), b"");

        buf.insert(0, b"hello", false).unwrap();
        let mut chunks = buf.read_chunks();
        assert_eq!(chunks.next().unwrap(), b"hello");
        drop(chunks);
        // restart after partial consumption
        assert_eq!(buf.read_all(), b"world");
        assert_eq!(buf.read_offset(), 10);
    }

    #[test]
    fn duplicates_and_overlaps_are_stored_once() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"abcd", false).unwrap();
        assert!(!buf.insert(0, b"abcd", false).unwrap());
        assert!(buf.insert(2, b"cdef", false).unwrap());
        assert_eq!(buf.read_all(), b"abcdef");
        // data already delivered is ignored
        assert!(!buf.insert(1, b"bcd", false).unwrap());
        assert_eq!(buf.read_all(), b"");
    }

    #[test]
    fn final_size_is_enforced() {
        let final_size = Error::Transport(TransportError::FinalSizeError);
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"abc", true).unwrap();
        assert_eq!(buf.insert(3, b"d", false).unwrap_err(), final_size);
        assert_eq!(buf.insert(0, b"ab", true).unwrap_err(), final_size);
        buf.insert(0, b"abc", true).unwrap();

        let mut late = RecvBuffer::new();
        late.insert(10, b"xyz", false).unwrap();
        assert_eq!(late.insert(0, b"a", true).unwrap_err(), final_size);
    }

    #[test]
    fn fully_read_after_fin() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"", true).unwrap();
        assert!(buf.is_fully_read());

        let mut buf = RecvBuffer::new();
        buf.insert(0, b"hi", true).unwrap();
        assert!(!buf.is_fully_read());
        buf.read_all();
        assert!(buf.is_fully_read());
    }

    #[test]
    fn reset_checks_final_size() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"abcdef", false).unwrap();
        assert!(buf.reset(3).is_err());
        buf.reset(6).unwrap();
        assert_eq!(buf.final_size(), Some(6));
        assert!(!buf.is_readable());
    }

    proptest! {
        #[test]
        fn reassembly_under_permutation(
            data in proptest::collection::vec(any::<u8>(), 1..400),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
            order in any::<prop::sample::Index>(),
            dup in any::<prop::sample::Index>(),
        ) {
            let mut bounds: Vec<usize> = cuts.iter().map(|i| i.index(data.len())).collect();
            bounds.push(0);
            bounds.push(data.len());
            bounds.sort_unstable();
            bounds.dedup();
            let mut pieces: Vec<(usize, usize)> =
                bounds.windows(2).map(|w| (w[0], w[1])).collect();

            // rotate, reverse and duplicate one fragment
            let k = order.index(pieces.len());
            pieces.rotate_left(k);
            if k % 2 == 1 {
                pieces.reverse();
            }
            let extra = pieces[dup.index(pieces.len())];
            pieces.push(extra);

            let mut buf = RecvBuffer::new();
            let mut out = Vec::new();
            for (start, end) in pieces {
                let fin = end == data.len();
                buf.insert(start as u64, &data[start..end], fin).unwrap();
                for chunk in buf.read_chunks() {
                    out.extend_from_slice(&chunk);
                }
            }
            prop_assert_eq!(out, data);
            prop_assert!(buf.is_fully_read());
        }
    }
}
