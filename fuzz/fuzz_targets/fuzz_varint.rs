#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding accepts any width; re-encoding always picks the shortest.
    if let Ok((value, consumed)) = milli_quic::varint::decode_varint(data) {
        assert!(consumed >= milli_quic::varint::varint_len(value));
        let mut buf = [0u8; 8];
        let written = milli_quic::varint::encode_varint(value, &mut buf).unwrap();
        assert_eq!(written, milli_quic::varint::varint_len(value));
        let (again, _) = milli_quic::varint::decode_varint(&buf[..written]).unwrap();
        assert_eq!(value, again);
    }
});
