// QUIC transport configuration and primitives for gateway channels.
use anyhow::{Context, Result, anyhow};
use quinn::{ClientConfig, Connection, ConnectionError, Endpoint, RecvStream, SendStream, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Transport-level configuration defaults.
///
/// ```
/// use kvproxy_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_streams > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_streams: u16,
    pub keep_alive_interval: Option<Duration>,
    /// A connection with no traffic for this long is closed by QUIC and the
    /// owning channel reports itself idle.
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_streams: 1024,
            keep_alive_interval: None,
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> Result<quinn::TransportConfig> {
        let mut config = quinn::TransportConfig::default();
        let streams = quinn::VarInt::from_u32(self.max_streams as u32);
        config.max_concurrent_bidi_streams(streams);
        config.max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
        config.keep_alive_interval(self.keep_alive_interval);
        let idle = match self.idle_timeout {
            Some(timeout) => Some(
                quinn::IdleTimeout::try_from(timeout).context("idle timeout out of range")?,
            ),
            None => None,
        };
        config.max_idle_timeout(idle);
        Ok(config)
    }
}

/// Connectivity of one pooled gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Connecting,
    Ready,
    /// No connection is held, either never opened or closed for inactivity.
    Idle,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    pub fn as_u8(self) -> u8 {
        match self {
            ConnectivityState::Connecting => 0,
            ConnectivityState::Ready => 1,
            ConnectivityState::Idle => 2,
            ConnectivityState::TransientFailure => 3,
            ConnectivityState::Shutdown => 4,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectivityState::Connecting,
            1 => ConnectivityState::Ready,
            2 => ConnectivityState::Idle,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }

    /// Whether a channel in this state should be asked to reconnect.
    pub fn wants_probe(self) -> bool {
        matches!(
            self,
            ConnectivityState::Idle | ConnectivityState::TransientFailure
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Stable connection identifier used for tracing/logging.
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone)]
/// Metadata about a live QUIC connection.
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
}

/// QUIC server endpoint wrapper. The client never runs one; it exists for
/// gateways written against this crate and for tests.
#[derive(Debug)]
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    pub fn bind(
        addr: SocketAddr,
        mut server_config: ServerConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config()?;
        server_config.transport_config(Arc::new(quinn_transport));
        let endpoint = Endpoint::server(server_config, addr).context("bind QUIC server")?;
        Ok(Self { endpoint })
    }

    pub async fn accept(&self) -> Result<QuicConnection> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("no incoming QUIC connections"))?;
        let connection = incoming.await.context("accept QUIC connection")?;
        Ok(QuicConnection::new(connection))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("read QUIC local address")
    }
}

/// QUIC client endpoint shared by every channel of one executor.
#[derive(Debug)]
pub struct QuicClient {
    endpoint: Endpoint,
}

impl QuicClient {
    pub fn bind(
        addr: SocketAddr,
        mut client_config: ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config()?;
        client_config.transport_config(Arc::new(quinn_transport));
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self { endpoint })
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .context("initiate QUIC connection")?;
        let connection = connecting.await.context("establish QUIC connection")?;
        Ok(QuicConnection::new(connection))
    }

    pub async fn connect_with_timeout(
        &self,
        addr: SocketAddr,
        server_name: &str,
        timeout: Duration,
    ) -> Result<QuicConnection> {
        tokio::time::timeout(timeout, self.connect(addr, server_name))
            .await
            .map_err(|_| anyhow!("connect to {addr} timed out after {timeout:?}"))?
    }

    /// Close every connection of this endpoint immediately.
    pub fn close(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"client closed");
    }
}

/// Active QUIC connection wrapper. Cloning shares the underlying connection.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    info: ConnectionInfo,
}

impl QuicConnection {
    fn new(connection: Connection) -> Self {
        let info = ConnectionInfo {
            id: ConnectionId(connection.stable_id() as u64),
            peer_addr: connection.remote_address(),
        };
        Self {
            inner: connection,
            info,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Current connectivity as seen from this end.
    pub fn state(&self) -> ConnectivityState {
        match self.inner.close_reason() {
            None => ConnectivityState::Ready,
            Some(ConnectionError::TimedOut) => ConnectivityState::Idle,
            Some(ConnectionError::LocallyClosed) => ConnectivityState::Shutdown,
            Some(_) => ConnectivityState::TransientFailure,
        }
    }

    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.open_bi().await.context("open bidi stream")
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.accept_bi().await.context("accept bidi stream")
    }

    pub fn close(&self, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(0), reason.as_bytes());
    }
}
