#![no_main]

use ddsbridge_core::dds::frame::{self, Frame};
use ddsbridge_core::events::parse_event_line;
use libfuzzer_sys::fuzz_target;

/// Feed `data` to the incremental decoder in chunks, the first byte choosing
/// the chunk size. Every decoded frame must re-encode to bytes that decode
/// back to the same frame.
fn decode_in_chunks(data: &[u8]) {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(split).max(1);
    let mut buffer = Vec::new();
    for piece in rest.chunks(chunk) {
        buffer.extend_from_slice(piece);
        loop {
            match frame::decode_from_buffer(&mut buffer) {
                Ok(Some(decoded)) => check_round_trip(&decoded),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
}

fn check_round_trip(decoded: &Frame) {
    let bytes = decoded.encode().expect("decoded frame re-encodes");
    let mut again = bytes.clone();
    let reparsed = frame::decode_from_buffer(&mut again)
        .expect("re-encoded frame decodes")
        .expect("re-encoded frame is complete");
    assert_eq!(&reparsed, decoded);
    assert!(again.is_empty());
    let _ = decoded.as_server_error();
}

fuzz_target!(|data: &[u8]| {
    decode_in_chunks(data);
    if let Ok(text) = std::str::from_utf8(data) {
        for line in text.lines() {
            let _ = parse_event_line(1, "fuzz", line);
        }
    }
});
