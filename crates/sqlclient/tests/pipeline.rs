//! Command pipeline tests against the mock TDS server.
//!
//! Covers the three ways of driving an execution, result streaming,
//! server errors, transactions, and the completion side channels
//! (hooks, event sink, statistics).

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlclient::{
    Client, CompletionHook, Config, Error, EventSink, ExecutionEvent, ExecutionOutcome, SinkError,
};
use sqlclient_testing::mock_server::{MockColumn, MockResponse, MockTdsServer, ScalarValue};
use uuid::Uuid;

fn config_for(server: &MockTdsServer) -> Config {
    Config::new()
        .with_host(server.host())
        .with_port(server.port())
        .with_sql_auth("sa", "Password123")
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

// =============================================================================
// Non-query execution
// =============================================================================

#[tokio::test]
async fn test_execute_returns_rows_affected() {
    let server = MockTdsServer::builder()
        .with_response("UPDATE users SET active = 1", MockResponse::affected(4))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let rows = conn.execute("UPDATE users SET active = 1").await.unwrap();
    assert_eq!(rows, 4);
    assert_eq!(server.batches().await, vec!["UPDATE users SET active = 1"]);

    conn.close().await;
}

#[tokio::test]
async fn test_execute_sums_counts_across_statements() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::Multi(vec![
            MockResponse::affected(2),
            MockResponse::affected(3),
        ]))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let rows = conn
        .execute("DELETE FROM a; DELETE FROM b")
        .await
        .unwrap();
    assert_eq!(rows, 5);
}

#[tokio::test]
async fn test_non_query_ignores_result_set_rows() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    assert_eq!(conn.execute("SELECT 1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_server_error_surfaces_number_and_keeps_connection() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT * FROM missing",
            MockResponse::error(208, "Invalid object name 'missing'."),
        )
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let err = conn.execute("SELECT * FROM missing").await.unwrap_err();
    assert_eq!(err.server_number(), Some(208));
    assert!(err.is_server_error(208));
    assert!(!err.is_fatal());
    assert!(conn.is_open());

    assert_eq!(conn.execute("UPDATE t SET x = 1").await.unwrap(), 1);
    assert_eq!(server.total_connections(), 1);
}

#[tokio::test]
async fn test_begin_and_end_non_query() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(9))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let pending = conn
        .command("INSERT INTO t SELECT * FROM s")
        .begin_execute_non_query()
        .await
        .unwrap();
    assert!(pending.operation_id().is_some());
    assert_eq!(pending.end().await.unwrap(), 9);

    assert_eq!(conn.execute("INSERT INTO t VALUES (1)").await.unwrap(), 9);
}

#[tokio::test]
async fn test_dropped_pending_non_query_is_drained_by_next_execution() {
    let server = MockTdsServer::builder()
        .with_response("UPDATE a SET x = 1", MockResponse::affected(2))
        .with_response("UPDATE b SET x = 1", MockResponse::affected(5))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let pending = conn
        .command("UPDATE a SET x = 1")
        .begin_execute_non_query()
        .await
        .unwrap();
    drop(pending);

    // The first response is still unread; it must not leak into this one.
    assert_eq!(conn.execute("UPDATE b SET x = 1").await.unwrap(), 5);
    assert_eq!(server.total_connections(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_execution() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(6))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect_blocking(config_for(&server)).unwrap();

    let rows = conn
        .command("UPDATE t SET x = 2")
        .execute_non_query_blocking()
        .unwrap();
    assert_eq!(rows, 6);
}

#[tokio::test]
async fn test_blocking_execution_needs_multi_thread_runtime() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let err = conn
        .command("UPDATE t SET x = 2")
        .execute_non_query_blocking()
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

// =============================================================================
// Readers
// =============================================================================

#[tokio::test]
async fn test_reader_streams_rows() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT id, name FROM users",
            MockResponse::rows(
                vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
                vec![
                    vec![ScalarValue::Int(1), ScalarValue::String("ada".into())],
                    vec![ScalarValue::Int(2), ScalarValue::String("grace".into())],
                ],
            ),
        )
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let mut reader = conn
        .command("SELECT id, name FROM users")
        .execute_reader_async()
        .await
        .unwrap();
    assert_eq!(reader.column_count(), 2);
    assert_eq!(reader.columns()[1].name, "name");

    let mut seen = Vec::new();
    while reader.read().await.unwrap() {
        let id = reader.get_bytes(0).unwrap().to_vec();
        let name = reader.get_bytes(1).unwrap().to_vec();
        seen.push((id, name));
    }
    assert_eq!(
        seen,
        vec![
            (1i32.to_le_bytes().to_vec(), utf16("ada")),
            (2i32.to_le_bytes().to_vec(), utf16("grace")),
        ]
    );
    assert!(!reader.next_result().await.unwrap());
    reader.close().await.unwrap();

    assert_eq!(conn.execute("SELECT 1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_reader_nbc_rows_and_nulls() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::nbc_rows(
            vec![
                MockColumn::int("id"),
                MockColumn::nvarchar("nickname", 50).with_nullable(true),
                MockColumn::bigint("score").with_nullable(true),
            ],
            vec![
                vec![ScalarValue::Int(1), ScalarValue::Null, ScalarValue::BigInt(40)],
                vec![ScalarValue::Int(2), ScalarValue::String("g".into()), ScalarValue::Null],
            ],
        ))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let mut reader = conn
        .command("SELECT id, nickname, score FROM players")
        .execute_reader_async()
        .await
        .unwrap();

    assert!(reader.read().await.unwrap());
    assert!(reader.is_null(1));
    assert_eq!(reader.get_bytes(2).unwrap().as_ref(), &40i64.to_le_bytes()[..]);

    assert!(reader.read().await.unwrap());
    assert_eq!(reader.get_bytes(1).unwrap().as_ref(), utf16("g").as_slice());
    assert!(reader.is_null(2));

    assert!(!reader.read().await.unwrap());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_reader_plp_value_spanning_packets() {
    let long = "x".repeat(10_000);
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::rows(
            vec![MockColumn::nvarchar_max("body")],
            vec![vec![ScalarValue::String(long.clone())]],
        ))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let mut reader = conn
        .command("SELECT body FROM documents")
        .execute_reader_async()
        .await
        .unwrap();
    assert!(reader.read().await.unwrap());
    assert_eq!(reader.get_bytes(0).unwrap().len(), long.len() * 2);
    assert_eq!(reader.get_bytes(0).unwrap().as_ref(), utf16(&long).as_slice());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_reader_walks_multiple_results() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::Multi(vec![
            MockResponse::rows(
                vec![MockColumn::int("a")],
                vec![vec![ScalarValue::Int(1)], vec![ScalarValue::Int(2)]],
            ),
            MockResponse::affected(3),
            MockResponse::scalar_int(42),
        ]))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let mut reader = conn
        .command("SELECT a FROM t; UPDATE t SET a = 0; SELECT 42")
        .execute_reader_async()
        .await
        .unwrap();

    // Leave the first result half read.
    assert!(reader.read().await.unwrap());
    assert!(reader.next_result().await.unwrap());
    assert!(reader.read().await.unwrap());
    assert_eq!(reader.get_bytes(0).unwrap().as_ref(), &42i32.to_le_bytes()[..]);
    assert!(!reader.read().await.unwrap());

    assert!(!reader.next_result().await.unwrap());
    assert_eq!(reader.records_affected(), Some(3));
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_reader_open_fails_on_server_error() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::error(207, "Invalid column name 'nope'."))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let err = conn
        .command("SELECT nope FROM t")
        .execute_reader_async()
        .await
        .unwrap_err();
    assert_eq!(err.server_number(), Some(207));
    assert!(conn.is_open());
}

#[tokio::test]
async fn test_dropped_reader_leaves_connection_usable() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT n FROM numbers",
            MockResponse::rows(
                vec![MockColumn::int("n")],
                (0..100).map(|i| vec![ScalarValue::Int(i)]).collect(),
            ),
        )
        .with_response("UPDATE numbers SET n = 0", MockResponse::affected(100))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    {
        let mut reader = conn
            .command("SELECT n FROM numbers")
            .execute_reader_async()
            .await
            .unwrap();
        assert!(reader.read().await.unwrap());
    }

    assert_eq!(conn.execute("UPDATE numbers SET n = 0").await.unwrap(), 100);
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test]
async fn test_transaction_tracking() {
    let server = MockTdsServer::builder()
        .with_response("BEGIN TRANSACTION", MockResponse::BeginTransaction(7))
        .with_response("COMMIT TRANSACTION", MockResponse::CommitTransaction(7))
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();
    assert!(!conn.is_in_transaction());

    conn.execute("BEGIN TRANSACTION").await.unwrap();
    assert!(conn.is_in_transaction());

    conn.execute("UPDATE accounts SET balance = 0").await.unwrap();
    assert!(conn.is_in_transaction());

    conn.execute("COMMIT TRANSACTION").await.unwrap();
    assert!(!conn.is_in_transaction());
}

// =============================================================================
// Completion side channels
// =============================================================================

#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<(Uuid, bool, Option<u64>)>>,
}

impl CompletionHook for RecordingHook {
    fn on_complete(&self, operation_id: Uuid, outcome: &ExecutionOutcome) {
        self.calls
            .lock()
            .unwrap()
            .push((operation_id, outcome.is_success(), outcome.rows_affected));
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl EventSink for RecordingSink {
    fn begin_execute(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("begin {} {}", event.operation, event.statement));
        Ok(())
    }

    fn end_execute(&self, event: &ExecutionEvent, outcome: &ExecutionOutcome) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("end {} ok={}", event.operation, outcome.is_success()));
        Err("sink storage full".into())
    }
}

#[tokio::test]
async fn test_completion_hook_runs_once_per_execution() {
    let server = MockTdsServer::builder()
        .with_response("DELETE FROM bad", MockResponse::error(547, "constraint"))
        .with_default_response(MockResponse::affected(2))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();
    let hook = Arc::new(RecordingHook::default());

    conn.command("DELETE FROM good")
        .with_hook(hook.clone())
        .execute_non_query_async()
        .await
        .unwrap();
    conn.command("DELETE FROM bad")
        .with_hook(hook.clone())
        .execute_non_query_async()
        .await
        .unwrap_err();

    let calls = hook.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].0, calls[1].0);
    assert_eq!((calls[0].1, calls[0].2), (true, Some(2)));
    assert_eq!((calls[1].1, calls[1].2), (false, None));
}

#[tokio::test]
async fn test_event_sink_sees_sanitized_statements_and_failures_are_ignored() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    let client = Client::new().with_event_sink(sink.clone());
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let rows = conn
        .execute("UPDATE users SET password = 'hunter2' WHERE id = 42")
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let events = sink.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "begin UPDATE UPDATE users SET password = ? WHERE id = ?".to_string(),
            "end UPDATE ok=true".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_statistics_collection() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT id FROM users",
            MockResponse::rows(
                vec![MockColumn::int("id")],
                vec![vec![ScalarValue::Int(1)], vec![ScalarValue::Int(2)]],
            ),
        )
        .with_default_response(MockResponse::affected(3))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client
        .connect(config_for(&server).with_statistics(true))
        .await
        .unwrap();

    conn.execute("UPDATE users SET x = 1").await.unwrap();
    let mut reader = conn
        .command("SELECT id FROM users")
        .execute_reader_async()
        .await
        .unwrap();
    while reader.read().await.unwrap() {}
    reader.close().await.unwrap();

    let stats = conn.retrieve_statistics();
    assert_eq!(stats.executions, 2);
    assert_eq!(stats.server_roundtrips, 2);
    assert_eq!(stats.idu_count, 1);
    assert_eq!(stats.idu_rows, 3);
    assert_eq!(stats.result_sets, 1);
    assert_eq!(stats.select_count, 1);
    assert_eq!(stats.select_rows, 2);
    assert!(stats.bytes_sent > 0);
    assert!(stats.bytes_received > 0);
    assert_eq!(stats.to_map()["SelectRows"], 2);

    conn.reset_statistics();
    assert_eq!(conn.retrieve_statistics().executions, 0);

    conn.set_statistics_enabled(false);
    conn.execute("UPDATE users SET x = 2").await.unwrap();
    assert_eq!(conn.retrieve_statistics().executions, 0);
}

#[tokio::test]
async fn test_command_timeout_zero_waits_forever() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(1).delayed(Duration::from_millis(200)))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client.connect(config_for(&server)).await.unwrap();

    let command = conn.command("UPDATE t SET x = 1").with_timeout(Duration::ZERO);
    assert_eq!(command.timeout(), None);
    assert_eq!(command.execute_non_query_async().await.unwrap(), 1);
}
