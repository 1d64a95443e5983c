#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for dcid_len in [0, 8, 20] {
        if let Ok(header) = milli_quic::packet::decode_header(data, dcid_len) {
            assert!(header.packet_len <= data.len());
            assert!(header.pn_offset <= header.packet_len);
        }

        let mut total = 0;
        for packet in milli_quic::packet::CoalescedPackets::new(data, dcid_len) {
            match packet {
                Ok((_, bytes)) => total += bytes.len(),
                Err(_) => break,
            }
        }
        assert!(total <= data.len());
    }
});
