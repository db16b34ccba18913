//! Fuzz target for message deserialization.
//!
//! The decoder must never panic on arbitrary bytes, only return Ok or
//! Err, and anything it accepts must reserialize.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = kelpie_core::deserialize(data) {
        let _ = kelpie_core::serialize(&msg);
    }
});
