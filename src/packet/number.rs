//! Packet number truncation and recovery (RFC 9000 §17.1, A.2, A.3).

use alloc::vec::Vec;

/// Bytes needed to encode `full_pn` so the peer can recover it.
///
/// Chooses the smallest encoding whose half-window covers the distance from
/// `largest_acked` (or from the start of the space when nothing was acked
/// yet), per RFC 9000 §A.2.
pub fn pn_length(full_pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(acked) => full_pn.saturating_sub(acked),
        None => full_pn + 1,
    };
    if num_unacked < (1 << 7) {
        1
    } else if num_unacked < (1 << 15) {
        2
    } else if num_unacked < (1 << 23) {
        3
    } else {
        4
    }
}

/// Append the low `pn_len` bytes of `full_pn` in network order.
pub fn push_pn(full_pn: u64, pn_len: usize, out: &mut Vec<u8>) {
    let bytes = full_pn.to_be_bytes();
    out.extend_from_slice(&bytes[8 - pn_len..]);
}

/// Recover a full packet number from its truncated form.
///
/// `largest_pn` is the largest packet number successfully processed in the
/// space, if any.
pub fn decode_pn(truncated_pn: u64, pn_len: usize, largest_pn: Option<u64>) -> u64 {
    let expected_pn = largest_pn.map_or(0, |pn| pn + 1);
    let pn_win = 1u64 << (pn_len as u64 * 8);
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate_pn = (expected_pn & !pn_mask) | truncated_pn;

    if candidate_pn + pn_hwin <= expected_pn && candidate_pn + pn_win < (1u64 << 62) {
        candidate_pn + pn_win
    } else if candidate_pn > expected_pn + pn_hwin && candidate_pn >= pn_win {
        candidate_pn - pn_win
    } else {
        candidate_pn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 9000 §A.3 example.
    #[test]
    fn decode_rfc_example() {
        assert_eq!(decode_pn(0x9b32, 2, Some(0xa82f30ea)), 0xa82f9b32);
    }

    /// RFC 9000 §A.2 example: 0xac5c02 with 0xabe8b3 acked needs 2 bytes.
    #[test]
    fn length_rfc_example() {
        assert_eq!(pn_length(0xac5c02, Some(0xabe8b3)), 2);
        assert_eq!(pn_length(0xace8fe, Some(0xabe8b3)), 3);
    }

    #[test]
    fn first_packets_fit_one_byte() {
        assert_eq!(pn_length(0, None), 1);
        assert_eq!(pn_length(126, None), 1);
        assert_eq!(pn_length(127, None), 2);
    }

    #[test]
    fn wraps_forward_across_window() {
        // largest 250, one byte 0x02 is 258 rather than 2
        assert_eq!(decode_pn(0x02, 1, Some(250)), 258);
        assert_eq!(decode_pn(0xfe, 1, Some(257)), 254);
    }

    #[test]
    fn truncate_then_recover() {
        let mut out = Vec::new();
        let full = 0x1_2345;
        let len = pn_length(full, Some(0x1_2300));
        push_pn(full, len, &mut out);
        let truncated = out.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        assert_eq!(decode_pn(truncated, len, Some(0x1_2300)), full);
    }
}
