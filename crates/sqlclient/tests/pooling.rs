//! Pool integration: reuse, reset, limits, user instances and login
//! environment.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use sqlclient::{CancellationToken, Client, Config, Error, PoolGroupOptions};
use sqlclient_testing::mock_server::{MockResponse, MockTdsServer};

fn config_for(server: &MockTdsServer) -> Config {
    Config::new()
        .with_host(server.host())
        .with_port(server.port())
        .with_sql_auth("sa", "Password123")
}

// =============================================================================
// Reuse and reset
// =============================================================================

#[tokio::test]
async fn test_returned_connection_is_reused_and_reset() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let config = config_for(&server).with_statistics(true);

    let mut conn = client.connect(config.clone()).await.unwrap();
    assert!(conn.is_pooled());
    conn.execute("UPDATE t SET x = 1").await.unwrap();
    conn.close().await;
    assert_eq!(server.reset_count(), 0);

    let mut conn = client.connect(config).await.unwrap();
    conn.execute("UPDATE t SET x = 2").await.unwrap();
    assert_eq!(server.total_connections(), 1);
    assert_eq!(server.login_count(), 1);

    // Only the first request after the return carries the reset bit.
    assert_eq!(server.reset_count(), 1);
    assert_eq!(conn.retrieve_statistics().connection_resets, 1);
    conn.execute("UPDATE t SET x = 3").await.unwrap();
    assert_eq!(server.reset_count(), 1);
}

#[tokio::test]
async fn test_reset_survives_request_cancelled_before_send() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let config = config_for(&server);

    let conn = client.connect(config.clone()).await.unwrap();
    conn.close().await;

    let mut conn = client.connect(config).await.unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let err = conn
        .command("UPDATE t SET x = 1")
        .with_cancellation(token)
        .execute_non_query_async()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled), "unexpected error: {err:?}");
    assert_eq!(server.reset_count(), 0);

    // The next request that reaches the server carries the reset.
    conn.execute("UPDATE t SET x = 2").await.unwrap();
    assert_eq!(server.reset_count(), 1);
    assert_eq!(server.batches().await, vec!["UPDATE t SET x = 2".to_string()]);
}

#[tokio::test]
async fn test_reset_drops_transaction_state() {
    let server = MockTdsServer::builder()
        .with_response("BEGIN TRANSACTION", MockResponse::BeginTransaction(3))
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let config = config_for(&server);

    let mut conn = client.connect(config.clone()).await.unwrap();
    conn.execute("BEGIN TRANSACTION").await.unwrap();
    assert!(conn.is_in_transaction());
    conn.close().await;

    let conn = client.connect(config).await.unwrap();
    assert!(!conn.is_in_transaction());
    assert_eq!(server.total_connections(), 1);
}

#[tokio::test]
async fn test_non_pooled_connections_are_closed() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let config = config_for(&server).with_pooling(false);

    let mut conn = client.connect(config.clone()).await.unwrap();
    assert!(!conn.is_pooled());
    conn.execute("UPDATE t SET x = 1").await.unwrap();
    conn.close().await;

    let mut conn = client.connect(config).await.unwrap();
    conn.execute("UPDATE t SET x = 2").await.unwrap();
    assert_eq!(server.total_connections(), 2);
    assert_eq!(server.reset_count(), 0);
}

#[tokio::test]
async fn test_different_databases_use_different_pools() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = Client::new();

    let sales = client
        .connect(config_for(&server).with_database("sales"))
        .await
        .unwrap();
    assert_eq!(sales.database(), Some("sales"));
    sales.close().await;

    let hr = client
        .connect(config_for(&server).with_database("hr"))
        .await
        .unwrap();
    assert_eq!(hr.database(), Some("hr"));
    assert_eq!(server.total_connections(), 2);
}

#[tokio::test]
async fn test_clear_pool_closes_idle_connections() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = Client::new();
    let config = config_for(&server);

    let conn = client.connect(config.clone()).await.unwrap();
    conn.close().await;
    client.clear_pool(&config).await;

    let conn = client.connect(config).await.unwrap();
    assert!(conn.is_open());
    assert_eq!(server.total_connections(), 2);
}

#[tokio::test]
async fn test_shutdown_rejects_new_connections() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = Client::new();
    let config = config_for(&server);

    let conn = client.connect(config.clone()).await.unwrap();
    conn.close().await;
    client.shutdown().await;

    assert!(client.connect(config).await.is_err());
}

// =============================================================================
// Limits
// =============================================================================

#[tokio::test]
async fn test_exhausted_pool_times_out() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = Client::new();
    let config = config_for(&server).with_pool(
        PoolGroupOptions::new()
            .with_max_pool_size(1)
            .with_creation_timeout(Duration::from_millis(300)),
    );

    let held = client.connect(config.clone()).await.unwrap();
    let err = client.connect(config.clone()).await.unwrap_err();
    assert!(matches!(err, Error::PoolTimeout(_)), "unexpected error: {err:?}");
    assert!(err.is_timeout());

    held.close().await;
    let conn = client.connect(config).await.unwrap();
    assert!(conn.is_open());
    assert_eq!(server.total_connections(), 1);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_before_connecting() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = Client::new();

    let err = client
        .connect(config_for(&server).with_packet_size(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "unexpected error: {err:?}");

    let err = client
        .connect(config_for(&server).with_connect_retry(1, Duration::from_secs(90)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "unexpected error: {err:?}");
    assert_eq!(server.total_connections(), 0);
}

// =============================================================================
// Login environment
// =============================================================================

#[tokio::test]
async fn test_login_environment_is_applied() {
    let server = MockTdsServer::builder()
        .with_server_name("InventoryServer")
        .with_database("inventory")
        .with_packet_size(8192)
        .build()
        .await
        .unwrap();
    let client = Client::new();

    let conn = client.connect(config_for(&server)).await.unwrap();
    assert_eq!(conn.database(), Some("inventory"));
    assert_eq!(conn.packet_size(), Some(8192));
    assert_eq!(conn.server_name(), Some("InventoryServer"));
    assert!(conn.tds_version().is_some());
}

#[tokio::test]
async fn test_user_instance_handshake_is_cached_per_pool() {
    let server = MockTdsServer::builder()
        .with_user_instance("sqlexpress-user")
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let config = config_for(&server).with_user_instance(true);

    let mut first = client.connect(config.clone()).await.unwrap();
    let mut second = client.connect(config).await.unwrap();
    first.execute("UPDATE t SET x = 1").await.unwrap();
    second.execute("UPDATE t SET x = 2").await.unwrap();

    // One discovery login, then one login per pooled connection.
    assert_eq!(server.total_connections(), 3);
    assert_eq!(
        server.requested_instances().await,
        vec!["sqlexpress-user".to_string(), "sqlexpress-user".to_string()]
    );
}

#[tokio::test]
async fn test_user_instance_unavailable() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = Client::new();

    let err = client
        .connect(config_for(&server).with_user_instance(true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Pool(_)), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_mars_connection_falls_back_to_primary_session() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(4))
        .build()
        .await
        .unwrap();
    let client = Client::new();
    let mut conn = client
        .connect(config_for(&server).with_mars(true))
        .await
        .unwrap();

    assert_eq!(conn.execute("UPDATE t SET x = 1").await.unwrap(), 4);
    assert_eq!(conn.execute("UPDATE t SET x = 2").await.unwrap(), 4);
    assert_eq!(server.total_connections(), 1);
}

#[tokio::test]
async fn test_connection_string_round_trip_to_server() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(2))
        .build()
        .await
        .unwrap();
    let config = Config::from_connection_string(&format!(
        "Server={},{};Database=orders;User Id=sa;Password=secret;Max Pool Size=5;Application Name=billing",
        server.host(),
        server.port()
    ))
    .unwrap();
    assert_eq!(config.pool.max_pool_size, 5);

    let client = Client::new();
    let mut conn = client.connect(config).await.unwrap();
    assert_eq!(conn.database(), Some("orders"));
    assert_eq!(conn.execute("DELETE FROM stale").await.unwrap(), 2);
}
