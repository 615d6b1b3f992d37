#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::{PacketHeader, validate_packet_size};

fuzz_target!(|data: &[u8]| {
    // Headers arrive straight off the socket; a bad length must be an
    // error, never a panic or an oversized allocation downstream.
    let mut cursor = data;
    if let Ok(header) = PacketHeader::decode(&mut cursor) {
        let _ = header.is_end_of_message();
        let _ = validate_packet_size(usize::from(header.length));
    }
});
