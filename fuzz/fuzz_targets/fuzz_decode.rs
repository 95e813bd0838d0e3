//! Fuzz target for the frame decoder.
//!
//! Arbitrary bytes must never panic the decoder; whatever cannot be
//! tokenized has to land in the remainder or the error list.

#![no_main]

use libfuzzer_sys::fuzz_target;
use resp_stream::resp::{decode, frame_len};

fuzz_target!(|data: &[u8]| {
    let out = decode(data);
    // Delimiting the first reply must not panic either.
    let _ = frame_len(&out.tokens);
});
