//! Capability seams and dispatch tables
//!
//! This module owns the mapping policy from configuration strings to concrete
//! capability instances, not the byte movers themselves:
//!
//! - a [`Transporter`] establishes the outbound session for a hop,
//! - a [`Connector`] negotiates an application protocol over that session,
//! - a [`Listener`] accepts inbound connections on a bound local address,
//! - a [`Handler`] serves an inbound protocol, walking the chain when it
//!   needs an upstream connection.
//!
//! Transport keys map through [`transport`] (clients) and [`listener`]
//! (servers); protocol keys map through [`connector`] (clients) and
//! [`handler`] (servers). Unknown keys fall back to documented defaults
//! (plain TCP, auto-detection) rather than erroring.

pub mod connector;
pub mod handler;
pub mod listener;
pub mod stream;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{HopError, Result};
use crate::node::Credential;
use crate::tls::ClientTls;

pub use handler::{Handler, HandlerOptions, RedirectOptions};

/// Unified stream bound: everything a hop session must support.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed transport session stream.
pub type TransportStream = Box<dyn AsyncStream>;

/// Establishes the underlying byte-stream/datagram session for a hop.
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Open the raw connection to `addr`.
    async fn dial(&self, addr: &str, opts: &DialOptions) -> Result<TransportStream>;

    /// Perform the transport-level handshake (TLS, WebSocket upgrade, ...)
    /// over an established connection.
    async fn handshake(
        &self,
        stream: TransportStream,
        opts: &HandshakeOptions,
    ) -> Result<TransportStream>;

    /// Whether sessions of this transport can carry multiple logical streams.
    fn multiplex(&self) -> bool {
        false
    }
}

/// Negotiates an outbound application protocol over a transporter's session,
/// yielding a stream connected to `target`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        stream: TransportStream,
        target: &str,
        opts: &ConnectOptions,
    ) -> Result<TransportStream>;
}

/// Accepts inbound connections/datagram sessions on a bound local address.
#[async_trait]
pub trait Listener: Send + Sync {
    fn local_addr(&self) -> String;

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)>;

    /// Stop background listener work (e.g. datagram demux). The bound socket
    /// itself closes when the listener is dropped.
    fn close(&self) {}
}

/// Derived client capability pair of a chain node.
pub struct Client {
    pub connector: Arc<dyn Connector>,
    pub transporter: Arc<dyn Transporter>,
}

impl Client {
    pub fn new(connector: Arc<dyn Connector>, transporter: Arc<dyn Transporter>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            transporter,
        })
    }
}

/// Options applied when dialing a hop's raw connection.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Connect timeout; zero/absent means the built-in default.
    pub timeout: Option<Duration>,
    /// Host name for SNI/Host-header use, distinct from the dial address.
    pub host: String,
    /// Routing mark applied to outbound sockets (SO_MARK, Linux).
    pub mark: u32,
    /// Outbound interface to bind (SO_BINDTODEVICE, Linux).
    pub interface: String,
}

impl DialOptions {
    pub fn timeout_or_default(&self) -> Duration {
        match self.timeout {
            Some(t) if !t.is_zero() => t,
            _ => Duration::from_secs(10),
        }
    }
}

/// Options applied when a connector negotiates its protocol.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub user_agent: Option<String>,
    /// Suppress protocol-level TLS even when the scheme implies it.
    pub no_tls: bool,
    pub no_delay: bool,
}

/// Options applied during the transport-level handshake.
#[derive(Clone, Default)]
pub struct HandshakeOptions {
    /// The hop address the handshake targets.
    pub addr: String,
    /// Host name override (WebSocket Host header, TLS SNI).
    pub host: String,
    pub user: Option<Credential>,
    pub tls: Option<Arc<ClientTls>>,
    /// Keep-alive probe interval.
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retry: u32,
    pub ssh: Option<SshConfig>,
}

impl HandshakeOptions {
    pub fn timeout_or_default(&self) -> Duration {
        match self.timeout {
            Some(t) if !t.is_zero() => t,
            _ => Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for HandshakeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOptions")
            .field("addr", &self.addr)
            .field("host", &self.host)
            .field("retry", &self.retry)
            .finish()
    }
}

/// SSH material carried by handshake options and tunnel listeners.
#[derive(Clone, Default)]
pub struct SshConfig {
    pub key: Option<SshPrivateKey>,
    pub authorized_keys: Vec<String>,
}

/// A private key loaded for SSH transports.
#[derive(Clone)]
pub struct SshPrivateKey {
    pem: String,
}

impl SshPrivateKey {
    /// Load a PEM private key file, validating it carries a private-key block.
    pub fn from_file(path: &str) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            HopError::InvalidConfig(format!("failed to read ssh key {}: {}", path, e))
        })?;
        if !pem.contains("PRIVATE KEY") {
            return Err(HopError::InvalidConfig(format!(
                "{} does not contain a private key",
                path
            )));
        }
        Ok(Self { pem })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

/// Load an authorized_keys file into its non-comment lines.
pub fn parse_authorized_keys(path: &str) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HopError::InvalidConfig(format!("failed to read authorized keys {}: {}", path, e))
    })?;
    Ok(content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_string())
        .collect())
}

/// Copy data bidirectionally between two streams until both directions close.
///
/// Returns (client→server, server→client) byte counts; copy errors end the
/// direction rather than failing the relay.
pub async fn relay_bidirectional<C, S>(client: C, server: S) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(client_to_server, server_to_client);

    let sent = sent.unwrap_or_else(|e| {
        debug!("client to server copy ended: {}", e);
        0
    });
    let received = received.unwrap_or_else(|e| {
        debug!("server to client copy ended: {}", e);
        0
    });

    (sent, received)
}
