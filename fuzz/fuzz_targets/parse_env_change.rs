#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::EnvChange;

fuzz_target!(|data: &[u8]| {
    // Database, packet size, transaction and user-instance changes all
    // travel in this token.
    let mut bytes = Bytes::copy_from_slice(data);
    while let Ok(Some(change)) = EnvChange::decode(&mut bytes) {
        let _ = change.ends_transaction();
    }
});
