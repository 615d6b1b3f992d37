#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::PreLogin;

fuzz_target!(|data: &[u8]| {
    // PRELOGIN responses are parsed before any authentication.
    if let Ok(prelogin) = PreLogin::decode(Bytes::copy_from_slice(data)) {
        let _ = prelogin.encryption.needs_tls();
        let _ = prelogin.encode();
    }
});
