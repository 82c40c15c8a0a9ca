//! Fuzz target for the inbound packet decoder.
//!
//! Feeds arbitrary bytes to a plaintext [`Decoder`] in two uneven pieces and
//! drains every packet it yields. The decoder must reject bad input with an
//! error, never a panic.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_decoder -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use skein_proto::ssh::codec::Decoder;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let mut decoder = Decoder::new(Arc::new(AtomicBool::new(false)));
    let split = data.first().map(|b| *b as usize % (data.len() + 1)).unwrap_or(0);
    let (head, tail) = data.split_at(split);

    for piece in [head, tail] {
        decoder.received(piece);
        loop {
            match decoder.next_packet() {
                Ok(Some(packet)) => {
                    // Payloads are never empty: the length check guarantees a message id.
                    assert!(!packet.payload.as_slice().is_empty());
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        assert!(decoder.bytes_needed() > 0);
    }
});
