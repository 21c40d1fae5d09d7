//! Protocol dispatch (client side)
//!
//! Maps a chain node's protocol key to a [`Connector`] negotiating the
//! application protocol over an established hop session. Unknown or absent
//! keys fall back to the auto connector (HTTP CONNECT semantics).

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_socks::tcp::socks4::Socks4Stream;
use tokio_socks::tcp::Socks5Stream;

use crate::dispatch::{ConnectOptions, Connector, TransportStream};
use crate::error::{HopError, Result};
use crate::node::{Credential, Node};

/// The closed protocol key set for the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Http2,
    Socks5,
    Socks4,
    Socks4a,
    Shadow,
    ShadowUdp,
    SshDirect,
    SshRemote,
    Forward,
    Sni,
    Http,
    Relay,
    Auto,
}

impl ConnectorKind {
    /// Map a protocol key; unknown or empty keys default to auto.
    pub fn from_key(key: &str) -> Self {
        match key {
            "http2" => Self::Http2,
            "socks" | "socks5" => Self::Socks5,
            "socks4" => Self::Socks4,
            "socks4a" => Self::Socks4a,
            "ss" => Self::Shadow,
            "ssu" => Self::ShadowUdp,
            "direct" => Self::SshDirect,
            "remote" => Self::SshRemote,
            "forward" => Self::Forward,
            "sni" => Self::Sni,
            "http" => Self::Http,
            "relay" => Self::Relay,
            _ => Self::Auto,
        }
    }
}

/// Build the connector for a chain node's protocol key.
pub fn connector(node: &Node) -> Arc<dyn Connector> {
    let user = node.user.clone();
    match ConnectorKind::from_key(&node.protocol) {
        ConnectorKind::Socks5 => Arc::new(Socks5Connector { user }),
        ConnectorKind::Socks4 => Arc::new(Socks4Connector { resolve_remotely: false }),
        ConnectorKind::Socks4a => Arc::new(Socks4Connector { resolve_remotely: true }),
        ConnectorKind::Http => Arc::new(HttpConnector { user }),
        ConnectorKind::Forward => Arc::new(ForwardConnector),
        ConnectorKind::Sni => Arc::new(SniConnector {
            host: node.get("host").map(|s| s.to_string()),
        }),
        ConnectorKind::SshDirect => Arc::new(SshDirectForwardConnector),
        ConnectorKind::SshRemote => Arc::new(SshRemoteForwardConnector),
        ConnectorKind::Shadow => Arc::new(ExternalConnector { kind: "shadowsocks" }),
        ConnectorKind::ShadowUdp => Arc::new(ExternalConnector { kind: "shadowsocks" }),
        ConnectorKind::Http2 => Arc::new(ExternalConnector { kind: "http2" }),
        ConnectorKind::Relay => Arc::new(ExternalConnector { kind: "relay" }),
        ConnectorKind::Auto => Arc::new(AutoConnector { user }),
    }
}

/// SSH direct-forward connector for the last-hop substitution.
pub fn ssh_direct_forward_connector() -> Arc<dyn Connector> {
    Arc::new(SshDirectForwardConnector)
}

/// SSH remote-forward connector for the last-hop substitution.
pub fn ssh_remote_forward_connector() -> Arc<dyn Connector> {
    Arc::new(SshRemoteForwardConnector)
}

/// SOCKS5 with optional username/password authentication.
pub struct Socks5Connector {
    user: Option<Credential>,
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(
        &self,
        stream: TransportStream,
        target: &str,
        _opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        let stream = match &self.user {
            Some(user) => {
                Socks5Stream::connect_with_password_and_socket(
                    stream,
                    target,
                    &user.username,
                    user.password_or_empty(),
                )
                .await?
            }
            None => Socks5Stream::connect_with_socket(stream, target).await?,
        };
        Ok(Box::new(stream))
    }
}

/// SOCKS4/SOCKS4A. Plain SOCKS4 requires an IPv4 target; SOCKS4A passes
/// host names through for remote resolution.
pub struct Socks4Connector {
    resolve_remotely: bool,
}

#[async_trait]
impl Connector for Socks4Connector {
    async fn connect(
        &self,
        stream: TransportStream,
        target: &str,
        _opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        if !self.resolve_remotely {
            let host = target.rsplit_once(':').map(|(h, _)| h).unwrap_or(target);
            if host.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(HopError::ConnectFailed(
                    "SOCKS4 requires an IPv4 target; use socks4a or socks5 for host names"
                        .to_string(),
                ));
            }
        }
        let stream = Socks4Stream::connect_with_socket(stream, target).await?;
        Ok(Box::new(stream))
    }
}

/// HTTP CONNECT with optional Basic proxy authorization.
pub struct HttpConnector {
    user: Option<Credential>,
}

impl HttpConnector {
    fn build_request(&self, target: &str, opts: &ConnectOptions) -> String {
        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
            target, target
        );
        if let Some(agent) = &opts.user_agent {
            request.push_str(&format!("User-Agent: {}\r\n", agent));
        }
        if let Some(user) = &self.user {
            let credentials = format!("{}:{}", user.username, user.password_or_empty());
            request.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                BASE64.encode(credentials.as_bytes())
            ));
        }
        request.push_str("\r\n");
        request
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        mut stream: TransportStream,
        target: &str,
        opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        let request = self.build_request(target, opts);
        stream.write_all(request.as_bytes()).await?;

        let head = read_response_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or("");
        if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
            return Err(HopError::ConnectFailed(format!(
                "CONNECT failed: {}",
                status_line
            )));
        }
        Ok(stream)
    }
}

/// Read an HTTP response head (through the blank line) byte by byte so no
/// tunneled payload is consumed.
async fn read_response_head(stream: &mut TransportStream) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 16 * 1024 {
            return Err(HopError::Protocol("oversized response head".to_string()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(HopError::ConnectFailed(
                "connection closed during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Plain forward: the session already points at the hop's fixed remote.
pub struct ForwardConnector;

#[async_trait]
impl Connector for ForwardConnector {
    async fn connect(
        &self,
        stream: TransportStream,
        _target: &str,
        _opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        Ok(stream)
    }
}

/// SNI pass-through. The upstream routes on the TLS server name; an explicit
/// `host` option records the name the hop advertises.
pub struct SniConnector {
    #[allow(dead_code)]
    host: Option<String>,
}

#[async_trait]
impl Connector for SniConnector {
    async fn connect(
        &self,
        stream: TransportStream,
        _target: &str,
        _opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        Ok(stream)
    }
}

/// Auto connector: HTTP CONNECT semantics for unclassified protocols.
pub struct AutoConnector {
    user: Option<Credential>,
}

#[async_trait]
impl Connector for AutoConnector {
    async fn connect(
        &self,
        stream: TransportStream,
        target: &str,
        opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        HttpConnector {
            user: self.user.clone(),
        }
        .connect(stream, target, opts)
        .await
    }
}

/// SSH direct port-forward (external backend).
pub struct SshDirectForwardConnector;

#[async_trait]
impl Connector for SshDirectForwardConnector {
    async fn connect(
        &self,
        _stream: TransportStream,
        _target: &str,
        _opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable("ssh"))
    }
}

/// SSH remote port-forward (external backend).
pub struct SshRemoteForwardConnector;

#[async_trait]
impl Connector for SshRemoteForwardConnector {
    async fn connect(
        &self,
        _stream: TransportStream,
        _target: &str,
        _opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable("ssh"))
    }
}

/// Shim for protocols whose negotiators are not compiled into this crate.
struct ExternalConnector {
    kind: &'static str,
}

#[async_trait]
impl Connector for ExternalConnector {
    async fn connect(
        &self,
        _stream: TransportStream,
        _target: &str,
        _opts: &ConnectOptions,
    ) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable(self.kind))
    }
}
