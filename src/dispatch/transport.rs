//! Transport dispatch (client side)
//!
//! Maps a chain node's transport key to a [`Transporter`]. The closed key set
//! mirrors the server-side listener table; unknown or absent keys fall back
//! to plain TCP. Transports whose byte movers live outside this crate (KCP,
//! SSH, HTTP/2 family, obfuscation, fake-TCP, vsock) still parse their full
//! configuration here and surface a backend-unavailable error on first dial.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD_NO_PAD as BASE64_RAW, Engine};
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::dispatch::stream::{UdpConnStream, WsFramedStream};
use crate::dispatch::{DialOptions, HandshakeOptions, Transporter, TransportStream};
use crate::error::{HopError, Result};
use crate::node::Node;

/// The closed transport key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Mtls,
    Ws,
    Mws,
    Wss,
    Mwss,
    Kcp,
    Ssh,
    Http2,
    H2,
    H2c,
    Obfs4,
    ObfsHttp,
    ObfsTls,
    FakeTcp,
    Udp,
    Vsock,
}

impl TransportKind {
    /// Map a transport key; unknown or empty keys default to plain TCP.
    pub fn from_key(key: &str) -> Self {
        match key {
            "tls" => Self::Tls,
            "mtls" => Self::Mtls,
            "ws" => Self::Ws,
            "mws" => Self::Mws,
            "wss" => Self::Wss,
            "mwss" => Self::Mwss,
            "kcp" => Self::Kcp,
            "ssh" => Self::Ssh,
            "http2" => Self::Http2,
            "h2" => Self::H2,
            "h2c" => Self::H2c,
            "obfs4" => Self::Obfs4,
            "ohttp" => Self::ObfsHttp,
            "otls" => Self::ObfsTls,
            "ftcp" => Self::FakeTcp,
            "udp" => Self::Udp,
            "vsock" => Self::Vsock,
            _ => Self::Tcp,
        }
    }
}

/// WebSocket transport options parsed from node options.
#[derive(Debug, Clone, Default)]
pub struct WsOptions {
    pub enable_compression: bool,
    pub read_buffer_size: Option<u32>,
    pub write_buffer_size: Option<u32>,
    pub user_agent: Option<String>,
    pub path: String,
}

impl WsOptions {
    pub fn from_node(node: &Node) -> Self {
        Self {
            enable_compression: node.get_bool("compression"),
            read_buffer_size: node.get_int("rbuf"),
            write_buffer_size: node.get_int("wbuf"),
            user_agent: node.get("agent").map(|s| s.to_string()),
            path: node.get_or("path", "/ws"),
        }
    }
}

/// KCP datagram-session configuration, loaded from a JSON file (`c` option)
/// or defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KcpConfig {
    pub key: String,
    pub crypt: String,
    pub mode: String,
    pub mtu: u32,
    pub sndwnd: u32,
    pub rcvwnd: u32,
    pub datashard: u32,
    pub parityshard: u32,
    pub dscp: u32,
    pub nocomp: bool,
    pub acknodelay: bool,
    pub nodelay: u32,
    pub interval: u32,
    pub resend: u32,
    pub nc: u32,
    pub sockbuf: u32,
    pub keepalive: u32,
    pub tcp: bool,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            key: "it's a secret".to_string(),
            crypt: "aes".to_string(),
            mode: "fast".to_string(),
            mtu: 1350,
            sndwnd: 1024,
            rcvwnd: 1024,
            datashard: 10,
            parityshard: 3,
            dscp: 0,
            nocomp: false,
            acknodelay: false,
            nodelay: 0,
            interval: 50,
            resend: 0,
            nc: 0,
            sockbuf: 4194304,
            keepalive: 10,
            tcp: false,
        }
    }
}

/// Parse a KCP config file. Absent option → `None`; malformed file → error.
pub fn parse_kcp_config(path: Option<&str>) -> Result<Option<KcpConfig>> {
    let path = match path {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(None),
    };
    let data = std::fs::read_to_string(path).map_err(|e| {
        HopError::InvalidConfig(format!("failed to read KCP config {}: {}", path, e))
    })?;
    let config = serde_json::from_str(&data)?;
    Ok(Some(config))
}

/// Out-of-band obfs4 negotiation check, performed once per expanded node
/// before first use. Client side requires a well-formed bridge certificate
/// (unpadded base64, 52 bytes: 20-byte node ID + 32-byte public key) and a
/// known IAT mode.
pub fn obfs4_check(cert: Option<&str>, iat_mode: Option<&str>, server: bool) -> Result<()> {
    if server {
        return Ok(());
    }
    let cert = cert.filter(|c| !c.is_empty()).ok_or_else(|| {
        HopError::InvalidConfig("obfs4 requires a cert option".to_string())
    })?;
    let decoded = BASE64_RAW
        .decode(cert)
        .map_err(|e| HopError::InvalidConfig(format!("malformed obfs4 cert: {}", e)))?;
    if decoded.len() != 52 {
        return Err(HopError::InvalidConfig(format!(
            "malformed obfs4 cert: expected 52 bytes, got {}",
            decoded.len()
        )));
    }
    match iat_mode.unwrap_or("0") {
        "0" | "1" | "2" => Ok(()),
        other => Err(HopError::InvalidConfig(format!(
            "unknown obfs4 iat-mode {}",
            other
        ))),
    }
}

/// Build the transporter for a chain node's transport key.
pub fn transporter(node: &Node) -> Result<Arc<dyn Transporter>> {
    let tr: Arc<dyn Transporter> = match TransportKind::from_key(&node.transport) {
        TransportKind::Tls => Arc::new(TlsTransporter { mux: false }),
        TransportKind::Mtls => Arc::new(TlsTransporter { mux: true }),
        TransportKind::Ws => Arc::new(WsTransporter::new(WsOptions::from_node(node), false, false)),
        TransportKind::Mws => Arc::new(WsTransporter::new(WsOptions::from_node(node), false, true)),
        TransportKind::Wss => Arc::new(WsTransporter::new(WsOptions::from_node(node), true, false)),
        TransportKind::Mwss => Arc::new(WsTransporter::new(WsOptions::from_node(node), true, true)),
        TransportKind::Kcp => {
            let config = match parse_kcp_config(node.get("c"))? {
                Some(config) => config,
                None => {
                    let mut config = KcpConfig::default();
                    if node.get_bool("tcp") {
                        config.tcp = true;
                    }
                    config
                }
            };
            Arc::new(KcpTransporter { _config: config })
        }
        TransportKind::Ssh => {
            if node.protocol == "direct" || node.protocol == "remote" {
                Arc::new(SshForwardTransporter)
            } else {
                Arc::new(SshTunnelTransporter)
            }
        }
        TransportKind::Http2 | TransportKind::H2 | TransportKind::H2c => {
            Arc::new(ExternalTransporter { kind: "http2" })
        }
        TransportKind::Obfs4 => Arc::new(ExternalTransporter { kind: "obfs4" }),
        TransportKind::ObfsHttp => Arc::new(ExternalTransporter { kind: "obfs-http" }),
        TransportKind::ObfsTls => Arc::new(ExternalTransporter { kind: "obfs-tls" }),
        TransportKind::FakeTcp => Arc::new(ExternalTransporter { kind: "fake-tcp" }),
        TransportKind::Udp => Arc::new(UdpTransporter),
        TransportKind::Vsock => Arc::new(ExternalTransporter { kind: "vsock" }),
        TransportKind::Tcp => Arc::new(TcpTransporter),
    };
    Ok(tr)
}

/// SSH port-forwarding transporter, substituted onto the last chain hop for
/// native forwarding listeners.
pub fn ssh_forward_transporter() -> Arc<dyn Transporter> {
    Arc::new(SshForwardTransporter)
}

/// Dial a TCP connection honoring the routing mark, bound interface and
/// connect timeout.
pub async fn tcp_dial(addr: &str, opts: &DialOptions) -> Result<TcpStream> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| HopError::Resolve(format!("{}: {}", addr, e)))?;
    let sa = addrs
        .next()
        .ok_or_else(|| HopError::Resolve(addr.to_string()))?;

    let socket = if sa.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    #[cfg(target_os = "linux")]
    {
        let sock = socket2::SockRef::from(&socket);
        if opts.mark != 0 {
            sock.set_mark(opts.mark)?;
        }
        if !opts.interface.is_empty() {
            sock.bind_device(Some(opts.interface.as_bytes()))?;
        }
    }

    let stream = timeout(opts.timeout_or_default(), socket.connect(sa))
        .await
        .map_err(|_| HopError::Timeout)?
        .map_err(|e| HopError::ConnectFailed(format!("{}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Plain TCP: dialing is the whole session, handshake is a no-op.
pub struct TcpTransporter;

#[async_trait]
impl Transporter for TcpTransporter {
    async fn dial(&self, addr: &str, opts: &DialOptions) -> Result<TransportStream> {
        Ok(Box::new(tcp_dial(addr, opts).await?))
    }

    async fn handshake(
        &self,
        stream: TransportStream,
        _opts: &HandshakeOptions,
    ) -> Result<TransportStream> {
        Ok(stream)
    }
}

/// TLS over TCP. `mux` marks the multiplex-capable variant.
pub struct TlsTransporter {
    mux: bool,
}

#[async_trait]
impl Transporter for TlsTransporter {
    async fn dial(&self, addr: &str, opts: &DialOptions) -> Result<TransportStream> {
        Ok(Box::new(tcp_dial(addr, opts).await?))
    }

    async fn handshake(
        &self,
        stream: TransportStream,
        opts: &HandshakeOptions,
    ) -> Result<TransportStream> {
        let wrapped = tls_wrap(stream, opts).await?;
        Ok(Box::new(wrapped))
    }

    fn multiplex(&self) -> bool {
        self.mux
    }
}

/// Wrap an established stream in client TLS per the handshake options.
async fn tls_wrap(
    stream: TransportStream,
    opts: &HandshakeOptions,
) -> Result<tokio_rustls::client::TlsStream<TransportStream>> {
    let tls = opts
        .tls
        .as_ref()
        .ok_or_else(|| HopError::HandshakeFailed("no TLS configuration".to_string()))?;
    let server_name = ServerName::try_from(tls.server_name.clone())
        .map_err(|e| HopError::Tls(format!("invalid server name: {}", e)))?;
    let connector = TlsConnector::from(tls.config());
    timeout(opts.timeout_or_default(), connector.connect(server_name, stream))
        .await
        .map_err(|_| HopError::Timeout)?
        .map_err(|e| HopError::HandshakeFailed(e.to_string()))
}

/// WebSocket family: plain (`ws`/`mws`) or TLS-wrapped (`wss`/`mwss`).
pub struct WsTransporter {
    opts: WsOptions,
    tls: bool,
    mux: bool,
}

impl WsTransporter {
    pub fn new(opts: WsOptions, tls: bool, mux: bool) -> Self {
        Self { opts, tls, mux }
    }

    async fn upgrade(&self, stream: TransportStream, opts: &HandshakeOptions) -> Result<TransportStream> {
        let host = if !opts.host.is_empty() {
            opts.host.clone()
        } else {
            opts.addr.clone()
        };
        let url = format!("ws://{}{}", host, self.opts.path);
        let mut request = url
            .into_client_request()
            .map_err(|e| HopError::HandshakeFailed(e.to_string()))?;
        if let Some(agent) = &self.opts.user_agent {
            if let Ok(value) = HeaderValue::from_str(agent) {
                request.headers_mut().insert(USER_AGENT, value);
            }
        }

        let (ws, _response) = timeout(opts.timeout_or_default(), client_async(request, stream))
            .await
            .map_err(|_| HopError::Timeout)?
            .map_err(|e| HopError::HandshakeFailed(e.to_string()))?;
        Ok(Box::new(WsFramedStream::new(ws)))
    }
}

#[async_trait]
impl Transporter for WsTransporter {
    async fn dial(&self, addr: &str, opts: &DialOptions) -> Result<TransportStream> {
        Ok(Box::new(tcp_dial(addr, opts).await?))
    }

    async fn handshake(
        &self,
        stream: TransportStream,
        opts: &HandshakeOptions,
    ) -> Result<TransportStream> {
        let stream: TransportStream = if self.tls {
            Box::new(tls_wrap(stream, opts).await?)
        } else {
            stream
        };
        self.upgrade(stream, opts).await
    }

    fn multiplex(&self) -> bool {
        self.mux
    }
}

/// UDP: a connected datagram socket exposed as a stream.
pub struct UdpTransporter;

#[async_trait]
impl Transporter for UdpTransporter {
    async fn dial(&self, addr: &str, _opts: &DialOptions) -> Result<TransportStream> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(addr)
            .await
            .map_err(|e| HopError::ConnectFailed(format!("{}: {}", addr, e)))?;
        Ok(Box::new(UdpConnStream::new(Arc::new(socket))))
    }

    async fn handshake(
        &self,
        stream: TransportStream,
        _opts: &HandshakeOptions,
    ) -> Result<TransportStream> {
        Ok(stream)
    }
}

/// KCP datagram sessions: configuration is parsed and carried, the datagram
/// engine itself is an external backend.
pub struct KcpTransporter {
    _config: KcpConfig,
}

#[async_trait]
impl Transporter for KcpTransporter {
    async fn dial(&self, _addr: &str, _opts: &DialOptions) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable("kcp"))
    }

    async fn handshake(
        &self,
        _stream: TransportStream,
        _opts: &HandshakeOptions,
    ) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable("kcp"))
    }

    fn multiplex(&self) -> bool {
        true
    }
}

/// SSH port-forwarding sessions (direct/remote protocols).
pub struct SshForwardTransporter;

#[async_trait]
impl Transporter for SshForwardTransporter {
    async fn dial(&self, _addr: &str, _opts: &DialOptions) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable("ssh"))
    }

    async fn handshake(
        &self,
        _stream: TransportStream,
        _opts: &HandshakeOptions,
    ) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable("ssh"))
    }

    fn multiplex(&self) -> bool {
        true
    }
}

/// SSH tunneling sessions (proxy protocols over SSH).
pub struct SshTunnelTransporter;

#[async_trait]
impl Transporter for SshTunnelTransporter {
    async fn dial(&self, _addr: &str, _opts: &DialOptions) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable("ssh"))
    }

    async fn handshake(
        &self,
        _stream: TransportStream,
        _opts: &HandshakeOptions,
    ) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable("ssh"))
    }

    fn multiplex(&self) -> bool {
        true
    }
}

/// Shim for transports whose byte movers are not compiled into this crate.
struct ExternalTransporter {
    kind: &'static str,
}

#[async_trait]
impl Transporter for ExternalTransporter {
    async fn dial(&self, _addr: &str, _opts: &DialOptions) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable(self.kind))
    }

    async fn handshake(
        &self,
        _stream: TransportStream,
        _opts: &HandshakeOptions,
    ) -> Result<TransportStream> {
        Err(HopError::BackendUnavailable(self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_transport_kind_from_key() {
        assert_eq!(TransportKind::from_key("tls"), TransportKind::Tls);
        assert_eq!(TransportKind::from_key("mwss"), TransportKind::Mwss);
        assert_eq!(TransportKind::from_key("kcp"), TransportKind::Kcp);
        // Unknown and absent keys default to plain TCP.
        assert_eq!(TransportKind::from_key(""), TransportKind::Tcp);
        assert_eq!(TransportKind::from_key("carrier-pigeon"), TransportKind::Tcp);
    }

    #[test]
    fn test_kcp_config_defaults_and_parse() {
        let defaults = KcpConfig::default();
        assert_eq!(defaults.mtu, 1350);
        assert_eq!(defaults.mode, "fast");
        assert!(!defaults.tcp);

        let mut path = std::env::temp_dir();
        path.push(format!("hopchain-kcp-{}.json", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(br#"{"mode":"fast3","mtu":1200,"tcp":true}"#).unwrap();
        drop(f);

        let config = parse_kcp_config(path.to_str()).unwrap().unwrap();
        assert_eq!(config.mode, "fast3");
        assert_eq!(config.mtu, 1200);
        assert!(config.tcp);
        // Unspecified fields keep their defaults.
        assert_eq!(config.sndwnd, 1024);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_kcp_config_errors() {
        assert!(parse_kcp_config(None).unwrap().is_none());
        assert!(parse_kcp_config(Some("/nonexistent/kcp.json")).is_err());
    }

    #[test]
    fn test_obfs4_check() {
        // 52 bytes of zeroes, unpadded standard base64.
        let cert = BASE64_RAW.encode([0u8; 52]);
        assert!(obfs4_check(Some(&cert), None, false).is_ok());
        assert!(obfs4_check(Some(&cert), Some("2"), false).is_ok());

        assert!(obfs4_check(None, None, false).is_err());
        assert!(obfs4_check(Some("???"), None, false).is_err());
        let short = BASE64_RAW.encode([0u8; 20]);
        assert!(obfs4_check(Some(&short), None, false).is_err());
        assert!(obfs4_check(Some(&cert), Some("3"), false).is_err());

        // Server side needs no client certificate material.
        assert!(obfs4_check(None, None, true).is_ok());
    }

    #[test]
    fn test_transporter_factory_closed_set() {
        let node = Node::parse("socks5+tls://h:1080").unwrap();
        assert!(!transporter(&node).unwrap().multiplex());

        let node = Node::parse("socks5+mtls://h:1080").unwrap();
        assert!(transporter(&node).unwrap().multiplex());

        let node = Node::parse("direct+ssh://h:22").unwrap();
        assert!(transporter(&node).is_ok());

        // Malformed KCP config aborts construction.
        let node = Node::parse("socks5+kcp://h:1080?c=/nonexistent/kcp.json").unwrap();
        assert!(transporter(&node).is_err());
    }

    #[tokio::test]
    async fn test_tcp_transporter_dials() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = TcpTransporter
            .dial(&addr.to_string(), &DialOptions::default())
            .await;
        assert!(stream.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_external_transporter_reports_backend() {
        let tr = ExternalTransporter { kind: "vsock" };
        let err = tr.dial("h:1", &DialOptions::default()).await.err().unwrap();
        assert!(matches!(err, HopError::BackendUnavailable("vsock")));
    }
}
