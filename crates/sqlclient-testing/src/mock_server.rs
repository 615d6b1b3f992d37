//! Mock TDS server for tests.
//!
//! A loopback server that speaks enough TDS 7.4 to take a client through
//! PRELOGIN and LOGIN7 and answer SQL batches from a table of canned
//! responses.
//!
//! ## Features
//!
//! - PRELOGIN with encryption `NOT_SUP` (no TLS)
//! - LOGIN7 with database, packet size and user-instance ENVCHANGEs
//! - Responses split into packets of the negotiated size
//! - ROW and NBCROW encodings, ERROR tokens, multiple result sets
//! - Delayed responses that an ATTENTION interrupts with a DONE(ATTN)
//! - Runtime fault injection: dropped connections, slow or failing logins
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlclient_testing::mock_server::{MockTdsServer, MockResponse};
//!
//! #[tokio::test]
//! async fn test_query() {
//!     let server = MockTdsServer::builder()
//!         .with_response("SELECT 1", MockResponse::scalar_int(1))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let addr = server.addr();
//!     // Connect your client to addr...
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tds_protocol::codec::{decode_utf16_le, write_b_varchar, write_us_varchar};
use tds_protocol::login7::OptionFlags3;
use tds_protocol::types::{MAX_LEN_PLP, TypeId};
use tds_protocol::{
    ALL_HEADERS_SIZE, DEFAULT_PACKET_SIZE, Done, DoneKind, DoneStatus, EncryptionLevel,
    EnvChangeType, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType, PreLogin, TdsVersion, TokenType,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent something the mock does not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection was dropped on purpose.
    #[error("Connection dropped")]
    Dropped,
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// Mock response configuration.
#[derive(Clone)]
pub enum MockResponse {
    /// Return a single scalar value.
    Scalar(ScalarValue),

    /// Return multiple rows with columns.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row data.
        rows: Vec<Vec<ScalarValue>>,
    },

    /// Return rows in null-bitmap-compressed form.
    NbcRows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row data.
        rows: Vec<Vec<ScalarValue>>,
    },

    /// Return an error.
    Error {
        /// Error number.
        number: i32,
        /// Error message.
        message: String,
        /// Severity class.
        severity: u8,
    },

    /// Return rows affected count (for INSERT/UPDATE/DELETE).
    RowsAffected(u64),

    /// Several results, each closed by a DONE with the MORE bit except the last.
    Multi(Vec<MockResponse>),

    /// Announce a new transaction with this descriptor.
    BeginTransaction(u64),

    /// Commit the transaction with this descriptor.
    CommitTransaction(u64),

    /// Answer after a delay; an ATTENTION received meanwhile cancels it.
    Delay(Duration, Box<MockResponse>),

    /// Close the connection instead of answering.
    Disconnect,

    /// Return raw pre-encoded TDS tokens.
    Raw(Bytes),

    /// Compute the response from the SQL text.
    Custom(Arc<dyn Fn(&str) -> MockResponse + Send + Sync>),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::NbcRows { columns, rows } => f
                .debug_struct("NbcRows")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::Error {
                number,
                message,
                severity,
            } => f
                .debug_struct("Error")
                .field("number", number)
                .field("message", message)
                .field("severity", severity)
                .finish(),
            Self::RowsAffected(n) => f.debug_tuple("RowsAffected").field(n).finish(),
            Self::Multi(parts) => f.debug_tuple("Multi").field(parts).finish(),
            Self::BeginTransaction(d) => f.debug_tuple("BeginTransaction").field(d).finish(),
            Self::CommitTransaction(d) => f.debug_tuple("CommitTransaction").field(d).finish(),
            Self::Delay(d, inner) => f.debug_tuple("Delay").field(d).field(inner).finish(),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// Create a scalar integer response.
    pub fn scalar_int(value: i32) -> Self {
        Self::Scalar(ScalarValue::Int(value))
    }

    /// Create a scalar string response.
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self::Scalar(ScalarValue::String(value.into()))
    }

    /// Create an empty result response.
    pub fn empty() -> Self {
        Self::RowsAffected(0)
    }

    /// Create a rows affected response.
    pub fn affected(count: u64) -> Self {
        Self::RowsAffected(count)
    }

    /// Create an error response.
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
            severity: 16,
        }
    }

    /// Create a multi-row response.
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// Create a multi-row response encoded as NBC rows.
    pub fn nbc_rows(columns: Vec<MockColumn>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self::NbcRows { columns, rows }
    }

    /// Delay this response.
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delay(delay, Box::new(self))
    }

    /// Compute the response from the SQL text.
    pub fn custom(handler: impl Fn(&str) -> MockResponse + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(handler))
    }
}

/// Scalar value for mock responses.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// NULL value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    BigInt(i64),
    /// 64-bit float.
    Double(f64),
    /// String value.
    String(String),
    /// Binary data.
    Binary(Vec<u8>),
}

impl ScalarValue {
    /// Column that can carry this value.
    fn column(&self) -> MockColumn {
        match self {
            Self::Null | Self::Int(_) => MockColumn::int(""),
            Self::Bool(_) => MockColumn::new("", TypeId::BitN).with_max_length(1),
            Self::BigInt(_) => MockColumn::bigint(""),
            Self::Double(_) => MockColumn::new("", TypeId::FloatN).with_max_length(8),
            Self::String(s) if s.encode_utf16().count() * 2 >= MAX_LEN_PLP as usize => {
                MockColumn::nvarchar_max("")
            }
            Self::String(_) => MockColumn::nvarchar("", 4000),
            Self::Binary(_) => MockColumn::varbinary("", 8000),
        }
    }

    /// Value bytes without a length prefix.
    fn raw(&self) -> Vec<u8> {
        match self {
            Self::Null => Vec::new(),
            Self::Bool(v) => vec![u8::from(*v)],
            Self::Int(v) => v.to_le_bytes().to_vec(),
            Self::BigInt(v) => v.to_le_bytes().to_vec(),
            Self::Double(v) => v.to_le_bytes().to_vec(),
            Self::String(s) => s.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Self::Binary(data) => data.clone(),
        }
    }

    /// Encode the value as `column` would carry it in a ROW token.
    fn encode(&self, column: &MockColumn, dst: &mut BytesMut) {
        let is_null = matches!(self, Self::Null);
        let raw = self.raw();

        if let Some(size) = column.type_id.fixed_size() {
            let mut fixed = raw;
            fixed.resize(size, 0);
            dst.extend_from_slice(&fixed);
            return;
        }

        match column.type_id {
            TypeId::NVarChar | TypeId::NChar | TypeId::BigVarChar | TypeId::BigChar
            | TypeId::BigVarBinary | TypeId::BigBinary => {
                if column.max_length == Some(MAX_LEN_PLP) {
                    encode_plp(dst, (!is_null).then_some(&raw[..]));
                } else if is_null {
                    dst.put_u16_le(0xFFFF);
                } else {
                    dst.put_u16_le(raw.len() as u16);
                    dst.extend_from_slice(&raw);
                }
            }
            _ => {
                dst.put_u8(raw.len() as u8);
                dst.extend_from_slice(&raw);
            }
        }
    }
}

/// Encode a PLP value as one chunk and a terminator.
fn encode_plp(dst: &mut BytesMut, value: Option<&[u8]>) {
    let Some(value) = value else {
        dst.put_u64_le(u64::MAX);
        return;
    };
    dst.put_u64_le(value.len() as u64);
    if !value.is_empty() {
        dst.put_u32_le(value.len() as u32);
        dst.extend_from_slice(value);
    }
    dst.put_u32_le(0);
}

/// Mock column definition.
#[derive(Debug, Clone)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// Column type.
    pub type_id: TypeId,
    /// Maximum length (for variable-length types).
    pub max_length: Option<u32>,
    /// Whether the column is nullable.
    pub nullable: bool,
}

impl MockColumn {
    /// Create a new column definition.
    pub fn new(name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            name: name.into(),
            type_id,
            max_length: None,
            nullable: true,
        }
    }

    /// Create an INT column.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN).with_max_length(4)
    }

    /// Create a BIGINT column.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN).with_max_length(8)
    }

    /// Create an NVARCHAR column.
    pub fn nvarchar(name: impl Into<String>, max_len: u32) -> Self {
        Self::new(name, TypeId::NVarChar).with_max_length(max_len * 2)
    }

    /// Create an NVARCHAR(MAX) column.
    pub fn nvarchar_max(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::NVarChar).with_max_length(MAX_LEN_PLP)
    }

    /// Create a VARBINARY column.
    pub fn varbinary(name: impl Into<String>, max_len: u32) -> Self {
        Self::new(name, TypeId::BigVarBinary).with_max_length(max_len)
    }

    /// Set the maximum length.
    pub fn with_max_length(mut self, len: u32) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Set nullable flag.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Configuration for the mock TDS server.
pub struct MockServerConfig {
    /// Pre-configured responses keyed by upper-cased, trimmed SQL.
    responses: HashMap<String, MockResponse>,
    /// Default response for unmatched queries.
    default_response: MockResponse,
    /// Server name to report in LoginAck.
    server_name: String,
    /// TDS version to report.
    tds_version: TdsVersion,
    /// Default database name.
    database: String,
    /// Packet size granted regardless of the client's request.
    packet_size: Option<usize>,
    /// Name reported to clients asking for a user instance.
    user_instance: Option<String>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            responses: HashMap::new(),
            default_response: MockResponse::empty(),
            server_name: "MockSQLServer".to_string(),
            tds_version: TdsVersion::V7_4,
            database: "master".to_string(),
            packet_size: None,
            user_instance: None,
        }
    }
}

/// Builder for `MockTdsServer`.
#[derive(Default)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response for a specific SQL query.
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        let key = sql.into().trim().to_uppercase();
        self.config.responses.insert(key, response);
        self
    }

    /// Set the default response for unmatched queries.
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Set the server name reported in LoginAck.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Set the default database.
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Grant this packet size instead of the one the client asks for.
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.config.packet_size = Some(size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE));
        self
    }

    /// Report `name` to clients that request a user instance.
    pub fn with_user_instance(mut self, name: impl Into<String>) -> Self {
        self.config.user_instance = Some(name.into());
        self
    }

    /// Build and start the mock server.
    pub async fn build(self) -> Result<MockTdsServer> {
        MockTdsServer::start(self.config).await
    }
}

/// State shared by the accept loop, connection tasks and the test.
struct ServerState {
    config: MockServerConfig,
    active: AtomicUsize,
    accepted: AtomicUsize,
    logins: AtomicUsize,
    attentions: AtomicUsize,
    resets: AtomicUsize,
    login_delay_ms: AtomicU64,
    fail_logins: AtomicBool,
    batches: Mutex<Vec<String>>,
    instances: Mutex<Vec<String>>,
    kill_tx: broadcast::Sender<()>,
}

/// A mock TDS server for testing.
///
/// Every accepted connection runs on its own task. Dropping the server
/// stops the accept loop; established connections stay up until the
/// client closes them or [`kill_connections`](Self::kill_connections) is
/// called.
pub struct MockTdsServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    state: Arc<ServerState>,
}

impl MockTdsServer {
    /// Create a new builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let (kill_tx, _) = broadcast::channel(1);
        let state = Arc::new(ServerState {
            config,
            active: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            attentions: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            login_delay_ms: AtomicU64::new(0),
            fail_logins: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
            instances: Mutex::new(Vec::new()),
            kill_tx,
        });

        let mut shutdown_rx = shutdown_tx.subscribe();
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let state = Arc::clone(&accept_state);
                                let spid = 51 + state.accepted.fetch_add(1, Ordering::SeqCst) as u16;
                                tokio::spawn(async move {
                                    state.active.fetch_add(1, Ordering::SeqCst);
                                    let mut kill_rx = state.kill_tx.subscribe();
                                    let outcome = tokio::select! {
                                        result = handle_connection(stream, &state, spid) => result,
                                        _ = kill_rx.recv() => Err(MockServerError::Dropped),
                                    };
                                    if let Err(e) = outcome {
                                        tracing::debug!(%peer, spid, error = %e, "mock connection ended");
                                    }
                                    state.active.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "mock server accept failed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx,
            state,
        })
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections currently open.
    pub fn connection_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Connections accepted since start.
    pub fn total_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Successful logins since start.
    pub fn login_count(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    /// ATTENTION packets received since start.
    pub fn attention_count(&self) -> usize {
        self.state.attentions.load(Ordering::SeqCst)
    }

    /// Batches that arrived with the reset-connection status bit.
    pub fn reset_count(&self) -> usize {
        self.state.resets.load(Ordering::SeqCst)
    }

    /// SQL text of every batch received, in arrival order.
    pub async fn batches(&self) -> Vec<String> {
        self.state.batches.lock().await.clone()
    }

    /// Instance names requested in PRELOGIN, in arrival order.
    pub async fn requested_instances(&self) -> Vec<String> {
        self.state.instances.lock().await.clone()
    }

    /// Delay every subsequent login response by `delay`.
    pub fn set_login_delay(&self, delay: Duration) {
        self.state
            .login_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Reject subsequent logins with error 18456.
    pub fn fail_logins(&self, fail: bool) {
        self.state.fail_logins.store(fail, Ordering::SeqCst);
    }

    /// Drop every open connection.
    pub fn kill_connections(&self) {
        let _ = self.state.kill_tx.send(());
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One reassembled client message.
struct Message {
    packet_type: PacketType,
    /// Flags of the first packet.
    status: PacketStatus,
    /// The client ended the message with IGNORE.
    ignored: bool,
    payload: Bytes,
}

/// Per-connection writer that frames messages at the negotiated size.
struct Framer<W> {
    writer: W,
    spid: u16,
    packet_size: usize,
}

impl<W: AsyncWrite + Unpin> Framer<W> {
    async fn send(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let body_size = self.packet_size - PACKET_HEADER_SIZE;
        let mut chunks = payload.chunks(body_size).peekable();
        let mut packet_id: u8 = 1;
        let mut buf = BytesMut::with_capacity(payload.len() + PACKET_HEADER_SIZE * 2);

        if chunks.peek().is_none() {
            PacketHeader::new(packet_type, PacketStatus::END_OF_MESSAGE, PACKET_HEADER_SIZE as u16)
                .with_spid(self.spid)
                .with_packet_id(packet_id)
                .encode(&mut buf);
        }
        while let Some(chunk) = chunks.next() {
            let status = if chunks.peek().is_none() {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            PacketHeader::new(packet_type, status, (PACKET_HEADER_SIZE + chunk.len()) as u16)
                .with_spid(self.spid)
                .with_packet_id(packet_id)
                .encode(&mut buf);
            buf.extend_from_slice(chunk);
            packet_id = packet_id.wrapping_add(1);
        }

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_connection(stream: TcpStream, state: &ServerState, spid: u16) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let mut framer = Framer {
        writer,
        spid,
        packet_size: DEFAULT_PACKET_SIZE,
    };

    // Step 1: PRELOGIN
    let prelogin = read_message(&mut reader).await?;
    if prelogin.packet_type != PacketType::PreLogin {
        return Err(MockServerError::Protocol(format!(
            "Expected PreLogin, got {:?}",
            prelogin.packet_type
        )));
    }
    let request =
        PreLogin::decode(prelogin.payload).map_err(|e| MockServerError::Protocol(e.to_string()))?;
    if let Some(instance) = request.instance {
        state.instances.lock().await.push(instance);
    }
    let response = PreLogin {
        version: state.config.tds_version,
        encryption: EncryptionLevel::NotSupported,
        ..PreLogin::default()
    };
    framer.send(PacketType::TabularResult, &response.encode()).await?;

    // Step 2: LOGIN7
    let login = read_message(&mut reader).await?;
    if login.packet_type != PacketType::Tds7Login {
        return Err(MockServerError::Protocol(format!(
            "Expected Tds7Login, got {:?}",
            login.packet_type
        )));
    }
    let login = LoginRequest::parse(&login.payload)?;

    let delay = state.login_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.fail_logins.load(Ordering::SeqCst) {
        let mut buf = BytesMut::new();
        encode_error(&mut buf, 18456, "Login failed for user.", 14);
        encode_done(&mut buf, DoneKind::Done, DoneStatus::ERROR, 0);
        framer.send(PacketType::TabularResult, &buf).await?;
        return Ok(());
    }

    let granted = state
        .config
        .packet_size
        .unwrap_or_else(|| login.packet_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE));
    let mut buf = BytesMut::new();
    let database = login.database.as_deref().unwrap_or(&state.config.database);
    encode_env_change(&mut buf, EnvChangeType::Database, database, "master");
    encode_env_change(
        &mut buf,
        EnvChangeType::PacketSize,
        &granted.to_string(),
        &DEFAULT_PACKET_SIZE.to_string(),
    );
    if login.user_instance {
        if let Some(name) = &state.config.user_instance {
            encode_env_change(&mut buf, EnvChangeType::UserInstanceStarted, name, "");
        }
    }
    encode_login_ack(&mut buf, &state.config.server_name, state.config.tds_version);
    encode_done(&mut buf, DoneKind::Done, DoneStatus::empty(), 0);
    framer.send(PacketType::TabularResult, &buf).await?;
    framer.packet_size = granted;
    state.logins.fetch_add(1, Ordering::SeqCst);

    // Step 3: requests
    loop {
        let message = match read_message(&mut reader).await {
            Ok(m) => m,
            Err(MockServerError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e),
        };

        if message.ignored {
            tracing::trace!(spid, "ignored message discarded");
            continue;
        }

        match message.packet_type {
            PacketType::SqlBatch => {
                let sql = decode_sql_batch(&message.payload)?;
                let reset = message.status.contains(PacketStatus::RESET_CONNECTION);
                if reset {
                    tracing::trace!(spid, "connection reset requested");
                    state.resets.fetch_add(1, Ordering::SeqCst);
                }
                state.batches.lock().await.push(sql.clone());
                let response = find_response(&sql, &state.config);
                if !respond(&mut reader, &mut framer, state, &sql, response, reset).await? {
                    return Err(MockServerError::Dropped);
                }
            }
            PacketType::Attention => {
                state.attentions.fetch_add(1, Ordering::SeqCst);
                send_attention_ack(&mut framer).await?;
            }
            other => {
                tracing::debug!(spid, packet_type = ?other, "unexpected packet type");
            }
        }
    }

    Ok(())
}

/// Answer one batch. Returns `false` when the connection must be dropped.
async fn respond<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    framer: &mut Framer<W>,
    state: &ServerState,
    sql: &str,
    response: MockResponse,
    reset: bool,
) -> Result<bool> {
    let mut response = resolve(response, sql);
    loop {
        match response {
            MockResponse::Disconnect => return Ok(false),
            MockResponse::Delay(delay, inner) => {
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    message = read_message(reader) => {
                        let message = message?;
                        if message.packet_type != PacketType::Attention {
                            return Err(MockServerError::Protocol(format!(
                                "Expected Attention during delay, got {:?}",
                                message.packet_type
                            )));
                        }
                        true
                    }
                };
                if interrupted {
                    state.attentions.fetch_add(1, Ordering::SeqCst);
                    send_attention_ack(framer).await?;
                    return Ok(true);
                }
                response = resolve(*inner, sql);
            }
            other => {
                let mut buf = BytesMut::new();
                if reset {
                    encode_env_change(&mut buf, EnvChangeType::ResetConnectionAck, "", "");
                }
                encode_response(&mut buf, &other, sql, false);
                framer.send(PacketType::TabularResult, &buf).await?;
                return Ok(true);
            }
        }
    }
}

fn resolve(response: MockResponse, sql: &str) -> MockResponse {
    match response {
        MockResponse::Custom(handler) => resolve(handler(sql), sql),
        other => other,
    }
}

/// Read a complete TDS message, reassembling multi-packet messages.
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut payload = BytesMut::new();
    let mut first: Option<(PacketType, PacketStatus)> = None;

    loop {
        let mut header_buf = [0u8; PACKET_HEADER_SIZE];
        reader.read_exact(&mut header_buf).await?;
        let header = PacketHeader::from_array(&header_buf)
            .map_err(|e| MockServerError::Protocol(e.to_string()))?;
        let body_len = header
            .body_length()
            .map_err(|e| MockServerError::Protocol(e.to_string()))?;

        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            reader.read_exact(&mut body).await?;
        }
        payload.extend_from_slice(&body);
        let (packet_type, status) = *first.get_or_insert((header.packet_type, header.status));

        if header.is_end_of_message() {
            return Ok(Message {
                packet_type,
                status,
                ignored: header.is_ignore(),
                payload: payload.freeze(),
            });
        }
    }
}

/// Fields the mock needs from a LOGIN7 payload.
#[derive(Debug)]
struct LoginRequest {
    packet_size: usize,
    user_instance: bool,
    database: Option<String>,
}

impl LoginRequest {
    const PACKET_SIZE_OFFSET: usize = 8;
    const FLAGS3_OFFSET: usize = 27;
    const DATABASE_ENTRY_OFFSET: usize = 68;

    fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::DATABASE_ENTRY_OFFSET + 4 {
            return Err(MockServerError::Protocol("LOGIN7 too short".into()));
        }
        let mut size = &payload[Self::PACKET_SIZE_OFFSET..];
        let packet_size = size.get_u32_le() as usize;
        let flags3 = OptionFlags3::from_bits_retain(payload[Self::FLAGS3_OFFSET]);

        let mut entry = &payload[Self::DATABASE_ENTRY_OFFSET..];
        let offset = entry.get_u16_le() as usize;
        let chars = entry.get_u16_le() as usize;
        let database = if chars == 0 {
            None
        } else {
            let raw = payload
                .get(offset..offset + chars * 2)
                .ok_or_else(|| MockServerError::Protocol("LOGIN7 database out of range".into()))?;
            Some(decode_utf16_le(raw).map_err(|e| MockServerError::Protocol(e.to_string()))?)
        };

        Ok(Self {
            packet_size,
            user_instance: flags3.contains(OptionFlags3::USER_INSTANCE),
            database,
        })
    }
}

/// Encode an EnvChange token with string values.
fn encode_env_change(dst: &mut BytesMut, env_type: EnvChangeType, new_val: &str, old_val: &str) {
    let mut body = BytesMut::new();
    body.put_u8(env_type as u8);
    write_b_varchar(&mut body, new_val);
    write_b_varchar(&mut body, old_val);

    dst.put_u8(TokenType::EnvChange as u8);
    dst.put_u16_le(body.len() as u16);
    dst.extend_from_slice(&body);
}

/// Encode an EnvChange token with binary values.
fn encode_env_change_binary(dst: &mut BytesMut, env_type: EnvChangeType, new_val: &[u8], old_val: &[u8]) {
    dst.put_u8(TokenType::EnvChange as u8);
    dst.put_u16_le((3 + new_val.len() + old_val.len()) as u16);
    dst.put_u8(env_type as u8);
    dst.put_u8(new_val.len() as u8);
    dst.extend_from_slice(new_val);
    dst.put_u8(old_val.len() as u8);
    dst.extend_from_slice(old_val);
}

/// Encode a LoginAck token.
fn encode_login_ack(dst: &mut BytesMut, server_name: &str, tds_version: TdsVersion) {
    let mut body = BytesMut::new();
    body.put_u8(1); // interface: SQL
    body.put_u32(tds_version.raw());
    write_b_varchar(&mut body, server_name);
    body.put_u32(0x1000_0000); // 16.0.0.0

    dst.put_u8(TokenType::LoginAck as u8);
    dst.put_u16_le(body.len() as u16);
    dst.extend_from_slice(&body);
}

/// Encode a DONE-family token.
fn encode_done(dst: &mut BytesMut, kind: DoneKind, status: DoneStatus, row_count: u64) {
    Done {
        kind,
        status,
        cur_cmd: 0xC1,
        row_count,
    }
    .encode(dst);
}

/// Decode SQL from a SQL_BATCH payload.
fn decode_sql_batch(payload: &Bytes) -> Result<String> {
    let mut text = payload.as_ref();

    if text.len() >= 4 {
        let total_len = u32::from_le_bytes([text[0], text[1], text[2], text[3]]) as usize;
        if total_len == ALL_HEADERS_SIZE && total_len <= text.len() {
            text = &text[total_len..];
        }
    }
    if text.len() % 2 != 0 {
        return Err(MockServerError::Protocol(
            "Invalid UTF-16 SQL text length".to_string(),
        ));
    }
    decode_utf16_le(text).map_err(|e| MockServerError::Protocol(e.to_string()))
}

/// Find the response for a SQL query.
fn find_response(sql: &str, config: &MockServerConfig) -> MockResponse {
    config
        .responses
        .get(&sql.trim().to_uppercase())
        .cloned()
        .unwrap_or_else(|| config.default_response.clone())
}

/// Encode the token stream for `response`. `more` marks the final DONE
/// as followed by further results.
fn encode_response(buf: &mut BytesMut, response: &MockResponse, sql: &str, more: bool) {
    let more_bit = if more { DoneStatus::MORE } else { DoneStatus::empty() };

    match response {
        MockResponse::Scalar(value) => {
            let column = value.column();
            encode_colmetadata(buf, std::slice::from_ref(&column));
            encode_row(buf, std::slice::from_ref(&column), std::slice::from_ref(value));
            encode_done(buf, DoneKind::Done, DoneStatus::COUNT | more_bit, 1);
        }
        MockResponse::Rows { columns, rows } => {
            encode_colmetadata(buf, columns);
            for row in rows {
                encode_row(buf, columns, row);
            }
            encode_done(buf, DoneKind::Done, DoneStatus::COUNT | more_bit, rows.len() as u64);
        }
        MockResponse::NbcRows { columns, rows } => {
            encode_colmetadata(buf, columns);
            for row in rows {
                encode_nbc_row(buf, columns, row);
            }
            encode_done(buf, DoneKind::Done, DoneStatus::COUNT | more_bit, rows.len() as u64);
        }
        MockResponse::Error {
            number,
            message,
            severity,
        } => {
            encode_error(buf, *number, message, *severity);
            encode_done(buf, DoneKind::Done, DoneStatus::ERROR | more_bit, 0);
        }
        MockResponse::RowsAffected(count) => {
            encode_done(buf, DoneKind::Done, DoneStatus::COUNT | more_bit, *count);
        }
        MockResponse::Multi(parts) => {
            let last = parts.len().saturating_sub(1);
            for (i, part) in parts.iter().enumerate() {
                encode_response(buf, part, sql, more || i < last);
            }
            if parts.is_empty() {
                encode_done(buf, DoneKind::Done, more_bit, 0);
            }
        }
        MockResponse::BeginTransaction(descriptor) => {
            encode_env_change_binary(buf, EnvChangeType::BeginTransaction, &descriptor.to_le_bytes(), &[]);
            encode_done(buf, DoneKind::Done, more_bit, 0);
        }
        MockResponse::CommitTransaction(descriptor) => {
            encode_env_change_binary(buf, EnvChangeType::CommitTransaction, &[], &descriptor.to_le_bytes());
            encode_done(buf, DoneKind::Done, more_bit, 0);
        }
        MockResponse::Raw(data) => buf.extend_from_slice(data),
        MockResponse::Custom(handler) => encode_response(buf, &handler(sql), sql, more),
        MockResponse::Delay(_, inner) => encode_response(buf, inner, sql, more),
        MockResponse::Disconnect => {}
    }
}

/// Encode COLMETADATA token.
fn encode_colmetadata(dst: &mut BytesMut, columns: &[MockColumn]) {
    dst.put_u8(TokenType::ColMetaData as u8);
    dst.put_u16_le(columns.len() as u16);

    for col in columns {
        dst.put_u32_le(0); // user type
        dst.put_u16_le(if col.nullable { 0x01 } else { 0x00 });
        dst.put_u8(col.type_id as u8);

        match col.type_id {
            TypeId::IntN | TypeId::BitN | TypeId::FloatN | TypeId::MoneyN | TypeId::DateTimeN => {
                dst.put_u8(col.max_length.unwrap_or(4) as u8);
            }
            TypeId::NVarChar | TypeId::NChar | TypeId::BigVarChar | TypeId::BigChar => {
                dst.put_u16_le(col.max_length.unwrap_or(8000) as u16);
                dst.put_u32_le(0x0904_D000); // LCID
                dst.put_u8(0x34); // sort id
            }
            TypeId::BigVarBinary | TypeId::BigBinary => {
                dst.put_u16_le(col.max_length.unwrap_or(8000) as u16);
            }
            _ => {}
        }

        write_b_varchar(dst, &col.name);
    }
}

/// Encode ROW token.
fn encode_row(dst: &mut BytesMut, columns: &[MockColumn], values: &[ScalarValue]) {
    dst.put_u8(TokenType::Row as u8);
    for (column, value) in columns.iter().zip(values) {
        value.encode(column, dst);
    }
}

/// Encode NBCROW token: a bitmap of null columns, then the non-null values.
fn encode_nbc_row(dst: &mut BytesMut, columns: &[MockColumn], values: &[ScalarValue]) {
    dst.put_u8(TokenType::NbcRow as u8);
    let mut bitmap = vec![0u8; columns.len().div_ceil(8)];
    for (i, value) in values.iter().enumerate() {
        if matches!(value, ScalarValue::Null) {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    dst.extend_from_slice(&bitmap);
    for (column, value) in columns.iter().zip(values) {
        if !matches!(value, ScalarValue::Null) {
            value.encode(column, dst);
        }
    }
}

/// Encode ERROR token.
fn encode_error(dst: &mut BytesMut, number: i32, message: &str, severity: u8) {
    let mut body = BytesMut::new();
    body.put_i32_le(number);
    body.put_u8(1); // state
    body.put_u8(severity);
    write_us_varchar(&mut body, message);
    write_b_varchar(&mut body, "MockServer");
    write_b_varchar(&mut body, "");
    body.put_i32_le(1); // line

    dst.put_u8(TokenType::Error as u8);
    dst.put_u16_le(body.len() as u16);
    dst.extend_from_slice(&body);
}

/// Send attention acknowledgment.
async fn send_attention_ack<W: AsyncWrite + Unpin>(framer: &mut Framer<W>) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_done(&mut buf, DoneKind::Done, DoneStatus::ATTN, 0);
    framer.send(PacketType::TabularResult, &buf).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockTdsServer::builder()
            .with_server_name("TestServer")
            .build()
            .await
            .unwrap();

        assert!(server.port() > 0);
        assert_eq!(server.host(), "127.0.0.1");
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_mock_response_error() {
        let response = MockResponse::error(50000, "Test error");
        match response {
            MockResponse::Error {
                number,
                message,
                severity,
            } => {
                assert_eq!(number, 50000);
                assert_eq!(message, "Test error");
                assert_eq!(severity, 16);
            }
            _ => panic!("Expected error response"),
        }
    }

    #[test]
    fn test_scalar_value_encode_int() {
        let mut buf = BytesMut::new();
        ScalarValue::Int(42).encode(&MockColumn::int("id"), &mut buf);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf[0], 4);
        assert_eq!(i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]), 42);
    }

    #[test]
    fn test_scalar_value_encode_null_follows_column_type() {
        let mut buf = BytesMut::new();
        ScalarValue::Null.encode(&MockColumn::int("id"), &mut buf);
        assert_eq!(&buf[..], &[0]);

        let mut buf = BytesMut::new();
        ScalarValue::Null.encode(&MockColumn::nvarchar("name", 10), &mut buf);
        assert_eq!(&buf[..], &[0xFF, 0xFF]);

        let mut buf = BytesMut::new();
        ScalarValue::Null.encode(&MockColumn::nvarchar_max("doc"), &mut buf);
        assert_eq!(&buf[..], &u64::MAX.to_le_bytes());
    }

    #[test]
    fn test_scalar_value_encode_plp() {
        let mut buf = BytesMut::new();
        ScalarValue::String("ab".into()).encode(&MockColumn::nvarchar_max("doc"), &mut buf);

        let mut src = &buf[..];
        assert_eq!(src.get_u64_le(), 4);
        assert_eq!(src.get_u32_le(), 4);
        src.advance(4);
        assert_eq!(src.get_u32_le(), 0);
        assert!(src.is_empty());
    }

    #[test]
    fn test_nbc_row_bitmap() {
        let columns = vec![MockColumn::int("a"), MockColumn::int("b"), MockColumn::int("c")];
        let mut buf = BytesMut::new();
        encode_nbc_row(
            &mut buf,
            &columns,
            &[ScalarValue::Null, ScalarValue::Int(7), ScalarValue::Null],
        );

        assert_eq!(buf[0], TokenType::NbcRow as u8);
        assert_eq!(buf[1], 0b101);
        assert_eq!(&buf[2..], &[4, 7, 0, 0, 0]);
    }

    #[test]
    fn test_multi_sets_more_on_all_but_last_done() {
        let mut buf = BytesMut::new();
        let response = MockResponse::Multi(vec![MockResponse::affected(1), MockResponse::affected(2)]);
        encode_response(&mut buf, &response, "", false);

        let mut src = buf.freeze();
        assert_eq!(src.get_u8(), TokenType::Done as u8);
        let first = Done::decode(DoneKind::Done, &mut src).unwrap();
        assert_eq!(src.get_u8(), TokenType::Done as u8);
        let second = Done::decode(DoneKind::Done, &mut src).unwrap();
        assert!(first.has_more());
        assert!(!second.has_more());
        assert_eq!(second.rows_affected(), Some(2));
    }

    #[test]
    fn test_custom_response_sees_sql() {
        let response = MockResponse::custom(|sql| MockResponse::affected(sql.len() as u64));
        match resolve(response, "DELETE") {
            MockResponse::RowsAffected(n) => assert_eq!(n, 6),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_sql_batch_skips_all_headers() {
        let payload = tds_protocol::SqlBatch::new("SELECT 1").encode();
        assert_eq!(decode_sql_batch(&payload).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_login_request_parse() {
        let payload = tds_protocol::Login7::new()
            .with_database("sales")
            .with_packet_size(8000)
            .with_user_instance(true)
            .encode();
        let login = LoginRequest::parse(&payload).unwrap();

        assert_eq!(login.packet_size, 8000);
        assert!(login.user_instance);
        assert_eq!(login.database.as_deref(), Some("sales"));
    }
}
