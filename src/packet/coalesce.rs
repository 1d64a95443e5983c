//! Iterator over coalesced QUIC packets in a single UDP datagram.

use crate::error::Error;
use crate::packet::{decode_header, PacketHeader};

/// Splits a datagram into its coalesced packets (RFC 9000 §12.2).
///
/// Long header packets are delimited by their Length field. A short header
/// packet always runs to the end of the datagram. After the first malformed
/// header the iterator yields the error once and stops, since the remaining
/// bytes can no longer be delimited.
pub struct CoalescedPackets<'a> {
    buf: &'a [u8],
    offset: usize,
    short_dcid_len: usize,
}

impl<'a> CoalescedPackets<'a> {
    pub fn new(datagram: &'a [u8], short_dcid_len: usize) -> Self {
        CoalescedPackets {
            buf: datagram,
            offset: 0,
            short_dcid_len,
        }
    }
}

impl<'a> Iterator for CoalescedPackets<'a> {
    /// The decoded header and the packet's bytes.
    type Item = Result<(PacketHeader<'a>, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.buf.get(self.offset..).filter(|r| !r.is_empty())?;
        match decode_header(remaining, self.short_dcid_len) {
            Ok(header) => {
                let packet = &remaining[..header.packet_len];
                self.offset += header.packet_len;
                Some(Ok((header, packet)))
            }
            Err(e) => {
                self.offset = self.buf.len();
                Some(Err(e))
            }
        }
    }
}
