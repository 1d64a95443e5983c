#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Walk the buffer like a packet payload; must never panic.
    let mut cursor = 0;
    while cursor < data.len() {
        match milli_quic::frame::decode_frame(data, cursor) {
            Ok((frame, len)) => {
                assert!(len > 0);
                cursor += len;
                if let milli_quic::frame::Frame::Ack(ack) = frame {
                    for range in ack.ranges() {
                        assert!(range.start < range.end);
                    }
                }
            }
            Err(_) => break,
        }
    }
});
