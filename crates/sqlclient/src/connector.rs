//! TCP connector.
//!
//! Opens a socket, runs PRELOGIN and LOGIN7 on the primary session and
//! applies the login ENVCHANGEs. The pool drives it through
//! [`Connector`], including the two-phase user instance handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlclient_pool::{ConnectTarget, Connector, PoolError};
use tds_protocol::{
    EncryptionLevel, Login7, PacketType, PreLogin, ProtocolError, Token, TokenType,
};
use tds_session::{NoMultiplexing, SessionPool, SessionState};
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::config::Config;
use crate::connection::{ConnectionState, PhysicalConnection};
use crate::error::{Error, Result};
use crate::instrumentation::span_names;
use crate::parser::TokenParser;

/// Opens physical connections over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    hostname: String,
}

impl TcpConnector {
    /// Create a connector reporting this machine's host name at login.
    #[must_use]
    pub fn new() -> Self {
        let hostname = std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self { hostname }
    }

    /// Override the client host name sent in LOGIN7.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    async fn open(&self, config: &Config, target: &ConnectTarget) -> Result<PhysicalConnection> {
        if config.integrated_security {
            return Err(Error::Config(
                "integrated security needs an SSPI provider, which this connector lacks".into(),
            ));
        }

        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;
        let mut session =
            SessionState::primary(stream).with_attention_timeout(config.timeouts.attention_timeout);

        self.prelogin(&mut session, config, target).await?;

        let mut login = Login7::new()
            .with_sql_auth(&config.user, &config.password)
            .with_hostname(&self.hostname)
            .with_app_name(&config.application_name)
            .with_server_name(&config.host)
            .with_packet_size(config.packet_size as u32)
            .with_user_instance(*target == ConnectTarget::UserInstanceDiscovery);
        if let Some(database) = &config.database {
            login = login.with_database(database);
        }
        session
            .send_message(PacketType::Tds7Login, &login.encode(), false)
            .await?;
        session.allow_inbound_packet_size(config.packet_size);

        let sessions = config
            .mars
            .then(|| {
                SessionPool::new(Arc::new(NoMultiplexing))
                    .with_attention_timeout(config.timeouts.attention_timeout)
            });

        let mut state = ConnectionState::default();
        let mut parser = TokenParser::new();
        let mut ack = None;
        let mut failure: Option<Error> = None;
        while let Some(token) = parser.next_token(&mut session).await? {
            match token {
                Token::LoginAck(login_ack) => ack = Some(login_ack),
                Token::EnvChange(change) => {
                    state.apply(&mut session, sessions.as_ref(), &change)?;
                }
                Token::Error(e) => {
                    if failure.is_none() {
                        failure = Some(e.into());
                    }
                }
                Token::Info(info) => {
                    tracing::trace!(number = info.number, message = %info.message, "login info");
                }
                _ => {}
            }
        }
        session.complete_response();

        if let Some(e) = failure {
            return Err(e);
        }
        let ack = ack.ok_or(ProtocolError::InvalidField {
            field: "login response token",
            value: u32::from(TokenType::LoginAck as u8),
        })?;
        tracing::debug!(
            server = %ack.prog_name,
            tds_version = ack.tds_version,
            database = ?state.database,
            "login complete"
        );

        Ok(PhysicalConnection::new(
            session,
            sessions,
            state,
            ack.tds_version(),
            ack.prog_name,
        ))
    }

    async fn prelogin(
        &self,
        session: &mut SessionState,
        config: &Config,
        target: &ConnectTarget,
    ) -> Result<()> {
        let instance = match target {
            ConnectTarget::UserInstance(name) => Some(name.to_string()),
            _ => config.instance.clone(),
        };
        let mut request = PreLogin::new()
            .with_encryption(EncryptionLevel::NotSupported)
            .with_mars(config.mars)
            .with_thread_id(std::process::id());
        if let Some(instance) = instance {
            request = request.with_instance(instance);
        }
        session
            .send_message(PacketType::PreLogin, &request.encode(), false)
            .await?;

        let response = PreLogin::decode(session.read_message_remainder().await?)?;
        session.complete_response();
        if response.encryption.needs_tls() {
            return Err(Error::Config(format!(
                "server requires encryption ({:?}) and this connector has no TLS",
                response.encryption
            )));
        }
        tracing::trace!(version = ?response.version, mars = response.mars, "prelogin response");
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Options = Config;
    type Connection = PhysicalConnection;

    fn wants_user_instance(&self, options: &Config) -> bool {
        options.user_instance
    }

    async fn connect(
        &self,
        options: &Config,
        target: ConnectTarget,
        timeout: Duration,
    ) -> std::result::Result<PhysicalConnection, PoolError> {
        let span = tracing::debug_span!(
            span_names::CONNECT,
            host = %options.host,
            port = options.port,
            target = ?target,
            timeout_ms = timeout.as_millis() as u64,
        );
        self.open(options, &target)
            .instrument(span)
            .await
            .map_err(|e| match e {
                Error::Config(message) => PoolError::Configuration(message),
                Error::Pool(pool) => pool,
                other => {
                    tracing::debug!(error = %other, "connect failed");
                    PoolError::connect(other)
                }
            })
    }
}
