//! Opening TDS sessions.

use std::time::Duration;

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::session::TdsSession;
use crate::config::ConnectionProperties;
use crate::core::{Connector, Session};
use crate::error::{BulkLoadError, ConnectFailure, ConnectFailureKind, Result};

const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Server error numbers that classify a failed login.
const LOGIN_FAILED: u32 = 18456;
const CANNOT_OPEN_DATABASE: u32 = 4060;

/// Opens [`TdsSession`]s with tiberius.
#[derive(Debug, Clone, Copy, Default)]
pub struct TdsConnector;

impl TdsConnector {
    pub fn new() -> Self {
        Self
    }

    fn build_config(props: &ConnectionProperties) -> Config {
        let mut config = Config::new();
        config.host(&props.host);
        match &props.instance_name {
            Some(instance) => config.instance_name(instance),
            None => config.port(props.port),
        }
        if !props.database.is_empty() {
            config.database(&props.database);
        }
        config.application_name(&props.application_name);
        config.authentication(AuthMethod::sql_server(&props.user, &props.password));

        if props.encrypt {
            config.encryption(EncryptionLevel::Required);
            if props.trust_server_certificate {
                config.trust_cert();
            } else if let Some(ca) = &props.trust_store {
                config.trust_cert_ca(ca);
            }
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        if props.host_name_in_certificate.is_some() {
            warn!("host_name_in_certificate is not supported by the TDS driver and is ignored");
        }
        if props.multi_subnet_failover {
            debug!("multi_subnet_failover: connecting to the first resolved address");
        }
        config
    }

    async fn connect_tcp(config: &Config, props: &ConnectionProperties) -> Result<TcpStream> {
        let unreachable = |e: &dyn std::fmt::Display| {
            BulkLoadError::from(ConnectFailure::new(
                ConnectFailureKind::Unreachable,
                format!(
                    "The TCP/IP connection to the host {} has failed. Error: \"{}\".",
                    props.server_display(),
                    e
                ),
            ))
        };

        let tcp = if props.instance_name.is_some() {
            TcpStream::connect_named(config)
                .await
                .map_err(|e| unreachable(&e))?
        } else {
            TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| unreachable(&e))?
        };
        tcp.set_nodelay(true).ok();

        let std_tcp = tcp.into_std().map_err(|e| unreachable(&e))?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on SQL Server connection: {}", e);
        }

        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        TcpStream::from_std(std_tcp).map_err(|e| unreachable(&e))
    }
}

#[async_trait]
impl Connector for TdsConnector {
    async fn open(
        &self,
        props: &ConnectionProperties,
        client_connection_id: Uuid,
    ) -> Result<Box<dyn Session>> {
        let config = Self::build_config(props);
        let tcp = Self::connect_tcp(&config, props).await?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| classify_login_error(e, client_connection_id))?;

        debug!(
            "TDS session {} established with {}",
            client_connection_id,
            props.server_display()
        );
        Ok(Box::new(TdsSession::new(client)))
    }
}

/// Turn a login-phase error into a connectivity failure.
fn classify_login_error(error: tiberius::error::Error, id: Uuid) -> BulkLoadError {
    let kind = match &error {
        tiberius::error::Error::Server(token) => match token.code() {
            LOGIN_FAILED => ConnectFailureKind::LoginFailed,
            CANNOT_OPEN_DATABASE => ConnectFailureKind::CannotOpenDatabase,
            _ => ConnectFailureKind::LoginFailed,
        },
        _ => ConnectFailureKind::Unreachable,
    };
    let message = match &error {
        tiberius::error::Error::Server(token) => token.message().to_string(),
        other => other.to_string(),
    };
    ConnectFailure::new(kind, message)
        .with_connection_id(id)
        .into()
}
