#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::{Done, DoneKind, LoginAck, ServerError};

#[derive(Debug, Arbitrary)]
enum Message {
    Done(u8),
    Error,
    LoginAck,
}

#[derive(Debug, Arbitrary)]
struct Input {
    message: Message,
    body: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut bytes = Bytes::from(input.body);
    match input.message {
        Message::Done(kind) => {
            let kind = match kind % 3 {
                0 => DoneKind::Done,
                1 => DoneKind::Proc,
                _ => DoneKind::InProc,
            };
            if let Ok(done) = Done::decode(kind, &mut bytes) {
                let _ = done.rows_affected();
                let _ = done.is_attention_ack();
            }
        }
        Message::Error => {
            let _ = ServerError::decode(&mut bytes);
        }
        Message::LoginAck => {
            if let Ok(ack) = LoginAck::decode(&mut bytes) {
                let _ = ack.tds_version();
            }
        }
    }
});
