//! Mock TDS server fidelity tests.
//!
//! These drive the mock over raw loopback TCP with the `tds-protocol`
//! encoders, checking the bytes a client would see.
//!
//! ```bash
//! cargo test -p sqlclient-testing --test mock_fidelity
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use sqlclient_testing::mock_server::{MockColumn, MockResponse, MockTdsServer, ScalarValue};
use tds_protocol::token::EnvChangeType;
use tds_protocol::{
    Done, DoneKind, EnvChange, EncryptionLevel, Login7, LoginAck, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType, PreLogin, SqlBatch, TokenType, attention_packet,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// =============================================================================
// Raw client helpers
// =============================================================================

async fn send(stream: &mut TcpStream, packet_type: PacketType, payload: &[u8]) {
    let mut buf = BytesMut::new();
    PacketHeader::new(
        packet_type,
        PacketStatus::END_OF_MESSAGE,
        (PACKET_HEADER_SIZE + payload.len()) as u16,
    )
    .with_packet_id(1)
    .encode(&mut buf);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.unwrap();
}

/// Read one message; returns its payload and the header of every packet.
async fn receive(stream: &mut TcpStream) -> (Bytes, Vec<PacketHeader>) {
    let mut payload = BytesMut::new();
    let mut headers = Vec::new();
    loop {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        stream.read_exact(&mut raw).await.unwrap();
        let header = PacketHeader::from_array(&raw).unwrap();
        let mut body = vec![0u8; header.body_length().unwrap()];
        stream.read_exact(&mut body).await.unwrap();
        payload.extend_from_slice(&body);
        headers.push(header);
        if header.is_end_of_message() {
            return (payload.freeze(), headers);
        }
    }
}

async fn login(stream: &mut TcpStream, login: Login7) -> Bytes {
    send(stream, PacketType::PreLogin, &PreLogin::new().encode()).await;
    let (prelogin, _) = receive(stream).await;
    let prelogin = PreLogin::decode(prelogin).unwrap();
    assert_eq!(prelogin.encryption, EncryptionLevel::NotSupported);

    send(stream, PacketType::Tds7Login, &login.encode()).await;
    receive(stream).await.0
}

fn env_changes(mut tokens: Bytes) -> Vec<EnvChange> {
    let mut changes = Vec::new();
    while tokens.has_remaining() {
        match TokenType::from_u8(tokens.get_u8()).unwrap() {
            TokenType::EnvChange => {
                if let Some(change) = EnvChange::decode(&mut tokens).unwrap() {
                    changes.push(change);
                }
            }
            TokenType::LoginAck => {
                LoginAck::decode(&mut tokens).unwrap();
            }
            TokenType::Done => {
                Done::decode(DoneKind::Done, &mut tokens).unwrap();
            }
            other => panic!("unexpected token {other:?}"),
        }
    }
    changes
}

fn last_done(tokens: &Bytes) -> Done {
    let mut tail = tokens.slice(tokens.len() - Done::SIZE - 1..);
    assert_eq!(tail.get_u8(), TokenType::Done as u8);
    Done::decode(DoneKind::Done, &mut tail).unwrap()
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_login_reports_database_and_packet_size() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();

    let response = login(
        &mut stream,
        Login7::new().with_database("sales").with_packet_size(8192),
    )
    .await;
    let changes = env_changes(response);

    assert_eq!(changes[0].new_database(), Some("sales"));
    assert_eq!(changes[1].packet_size(), Some(8192));
    assert_eq!(server.login_count(), 1);
}

#[tokio::test]
async fn test_login_reports_user_instance_when_requested() {
    let server = MockTdsServer::builder()
        .with_user_instance("\\\\.\\pipe\\LOCALDB#1234\\tsql\\query")
        .build()
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();

    let response = login(&mut stream, Login7::new().with_user_instance(true)).await;
    let changes = env_changes(response);

    let instance = changes
        .iter()
        .find(|c| c.env_type == EnvChangeType::UserInstanceStarted)
        .and_then(EnvChange::user_instance);
    assert_eq!(instance, Some("\\\\.\\pipe\\LOCALDB#1234\\tsql\\query"));
}

#[tokio::test]
async fn test_prelogin_records_instance_name() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();

    send(
        &mut stream,
        PacketType::PreLogin,
        &PreLogin::new().with_instance("SQLEXPRESS").encode(),
    )
    .await;
    receive(&mut stream).await;

    assert_eq!(server.requested_instances().await, vec!["SQLEXPRESS"]);
}

#[tokio::test]
async fn test_failed_login_returns_error_token() {
    let server = MockTdsServer::builder().build().await.unwrap();
    server.fail_logins(true);
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();

    let mut response = login(&mut stream, Login7::new()).await;
    assert_eq!(response.get_u8(), TokenType::Error as u8);
    let error = tds_protocol::ServerError::decode(&mut response).unwrap();
    assert_eq!(error.number, 18456);
    assert_eq!(server.login_count(), 0);
}

// =============================================================================
// Batches
// =============================================================================

#[tokio::test]
async fn test_batch_response_is_split_at_packet_size() {
    let text = "x".repeat(3000);
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT doc",
            MockResponse::rows(
                vec![MockColumn::nvarchar_max("doc")],
                vec![vec![ScalarValue::String(text)]],
            ),
        )
        .build()
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();
    login(&mut stream, Login7::new().with_packet_size(512)).await;

    send(&mut stream, PacketType::SqlBatch, &SqlBatch::new("SELECT doc").encode()).await;
    let (payload, headers) = receive(&mut stream).await;

    assert!(headers.len() > 1);
    assert!(headers.iter().all(|h| h.length as usize <= 512));
    assert!(headers[..headers.len() - 1].iter().all(|h| !h.is_end_of_message()));
    assert_eq!(headers[0].packet_id, 1);
    assert_eq!(last_done(&payload).rows_affected(), Some(1));
    assert_eq!(server.batches().await, vec!["SELECT doc"]);
}

#[tokio::test]
async fn test_multi_response_chains_done_more() {
    let server = MockTdsServer::builder()
        .with_response(
            "EXEC two",
            MockResponse::Multi(vec![MockResponse::affected(3), MockResponse::scalar_int(9)]),
        )
        .build()
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();
    login(&mut stream, Login7::new()).await;

    send(&mut stream, PacketType::SqlBatch, &SqlBatch::new("EXEC two").encode()).await;
    let (mut payload, _) = receive(&mut stream).await;

    assert_eq!(payload.get_u8(), TokenType::Done as u8);
    let first = Done::decode(DoneKind::Done, &mut payload).unwrap();
    assert!(first.has_more());
    assert_eq!(first.rows_affected(), Some(3));
    assert_eq!(payload.get_u8(), TokenType::ColMetaData as u8);
}

#[tokio::test]
async fn test_attention_interrupts_delayed_response() {
    let server = MockTdsServer::builder()
        .with_response(
            "WAITFOR DELAY '00:01'",
            MockResponse::affected(0).delayed(Duration::from_secs(60)),
        )
        .build()
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();
    login(&mut stream, Login7::new()).await;

    send(
        &mut stream,
        PacketType::SqlBatch,
        &SqlBatch::new("WAITFOR DELAY '00:01'").encode(),
    )
    .await;
    stream.write_all(&attention_packet()).await.unwrap();

    let (payload, _) = tokio::time::timeout(Duration::from_secs(5), receive(&mut stream))
        .await
        .expect("attention should be acknowledged promptly");
    assert!(last_done(&payload).is_attention_ack());
    assert_eq!(server.attention_count(), 1);
}

#[tokio::test]
async fn test_ignored_message_gets_no_response() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();
    login(&mut stream, Login7::new()).await;

    let mut ignored = BytesMut::new();
    PacketHeader::new(
        PacketType::SqlBatch,
        PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE_EVENT,
        PACKET_HEADER_SIZE as u16,
    )
    .encode(&mut ignored);
    stream.write_all(&ignored).await.unwrap();
    send(&mut stream, PacketType::SqlBatch, &SqlBatch::new("SELECT 1").encode()).await;

    let (payload, _) = receive(&mut stream).await;
    assert_eq!(last_done(&payload).rows_affected(), Some(1));
    assert_eq!(server.batches().await, vec!["SELECT 1"]);
}

#[tokio::test]
async fn test_kill_connections_closes_socket() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();
    login(&mut stream, Login7::new()).await;

    server.kill_connections();

    let mut byte = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}
