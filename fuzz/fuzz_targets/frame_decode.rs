//! Fuzz target for the stream length-prefix framing.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((payload, consumed)) = kelpie_core::framing::decode_frame(data) {
        assert!(consumed <= data.len());
        assert!(payload.len() <= consumed);
    }
});
