//! Listener dispatch (server side)
//!
//! Maps a serve node's transport key to a bound [`Listener`]. The key set
//! mirrors the client transport table plus server-only variants (UDP with
//! backlog/queue/TTL, remote-forward bound to the chain, TUN/TAP, DNS,
//! UDP-redirect). Unknown keys bind plain TCP.
//!
//! The one piece of non-delegated logic lives in the TCP branch: a
//! `sourceInterface` option replaces the listen host with the interface's
//! first IPv4 address, aborting construction when the interface is unusable.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::dispatch::stream::{UdpSessionStream, WsFramedStream};
use crate::dispatch::transport::{obfs4_check, parse_kcp_config};
use crate::dispatch::{Listener, SshConfig, TransportStream};
use crate::error::{HopError, Result};
use crate::iface;
use crate::node::Node;
use crate::tls::ServerTls;

/// UDP listen tuning parsed from serve-node options.
#[derive(Debug, Clone)]
pub struct UdpListenConfig {
    /// Idle session expiry.
    pub ttl: Duration,
    /// Pending-session accept backlog.
    pub backlog: usize,
    /// Per-session datagram queue depth.
    pub queue_size: usize,
}

impl UdpListenConfig {
    pub fn from_node(node: &Node) -> Self {
        Self {
            ttl: node.get_duration("ttl").unwrap_or(Duration::from_secs(60)),
            backlog: node.get_int("backlog").map(|n| n as usize).filter(|n| *n > 0).unwrap_or(128),
            queue_size: node.get_int("queue").map(|n| n as usize).filter(|n| *n > 0).unwrap_or(128),
        }
    }
}

/// A static route pushed onto a TUN interface.
#[derive(Debug, Clone)]
pub struct IpRoute {
    pub dest: IpNet,
    pub gateway: Option<IpAddr>,
}

/// Parse the `route` option: comma-separated CIDRs. Malformed entries are
/// skipped with a warning.
pub fn parse_ip_routes(s: Option<&str>) -> Vec<IpRoute> {
    let s = match s {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Vec::new(),
    };
    s.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            match entry.parse::<IpNet>() {
                Ok(dest) => Some(IpRoute {
                    dest,
                    gateway: None,
                }),
                Err(e) => {
                    warn!("skipping route {}: {}", entry, e);
                    None
                }
            }
        })
        .collect()
}

/// TUN interface configuration from serve-node options.
#[derive(Debug, Clone, Default)]
pub struct TunConfig {
    pub name: String,
    pub net: String,
    pub peer: String,
    pub mtu: Option<u32>,
    pub routes: Vec<IpRoute>,
    pub gateway: Option<IpAddr>,
}

impl TunConfig {
    pub fn from_node(node: &Node) -> Self {
        let gateway = node.get("gw").and_then(|s| s.parse().ok());
        let mut routes = parse_ip_routes(node.get("route"));
        for route in &mut routes {
            if route.gateway.is_none() {
                route.gateway = gateway;
            }
        }
        Self {
            name: node.get_or("name", ""),
            net: node.get_or("net", ""),
            peer: node.get_or("peer", ""),
            mtu: node.get_int("mtu"),
            routes,
            gateway,
        }
    }
}

/// TAP interface configuration. Routes stay raw strings at this layer.
#[derive(Debug, Clone, Default)]
pub struct TapConfig {
    pub name: String,
    pub net: String,
    pub mtu: Option<u32>,
    pub routes: Vec<String>,
    pub gateway: Option<IpAddr>,
}

impl TapConfig {
    pub fn from_node(node: &Node) -> Self {
        Self {
            name: node.get_or("name", ""),
            net: node.get_or("net", ""),
            mtu: node.get_int("mtu"),
            routes: node
                .get("route")
                .map(|s| {
                    s.split(',')
                        .map(|r| r.trim().to_string())
                        .filter(|r| !r.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            gateway: node.get("gw").and_then(|s| s.parse().ok()),
        }
    }
}

/// Build the listener for a serve node's transport key.
///
/// `chain` is consulted by the TCP/remote-forward branches for the SSH
/// last-hop substitution and carried by remote-forward listeners.
pub async fn build_listener(
    node: &Node,
    chain: &Arc<Chain>,
    server_tls: Option<&ServerTls>,
    ssh: &SshConfig,
) -> Result<Arc<dyn Listener>> {
    let addr = normalize_bind_addr(&node.addr);
    let udp_config = UdpListenConfig::from_node(node);

    let listener: Arc<dyn Listener> = match node.transport.as_str() {
        "tls" => {
            let config = require_tls(server_tls)?.server_config(false)?;
            Arc::new(TlsListenerWrap::bind(&addr, config).await?)
        }
        "mtls" => {
            let config = require_tls(server_tls)?.server_config(true)?;
            Arc::new(TlsListenerWrap::bind(&addr, config).await?)
        }
        "ws" | "mws" => Arc::new(WsListenerWrap::bind(&addr, None).await?),
        "wss" | "mwss" => {
            let config = require_tls(server_tls)?.server_config(false)?;
            Arc::new(WsListenerWrap::bind(&addr, Some(TlsAcceptor::from(config))).await?)
        }
        "kcp" => {
            // The config must parse even though the datagram engine is external.
            parse_kcp_config(node.get("c"))?;
            Arc::new(ExternalListener::new("kcp", &addr))
        }
        "ssh" => {
            if node.protocol == "forward" {
                Arc::new(TcpListenerWrap::bind(&addr).await?)
            } else {
                Arc::new(SshTunnelListener::new(&addr, ssh.clone()))
            }
        }
        "http2" | "h2" | "h2c" => Arc::new(ExternalListener::new("http2", &addr)),
        "udp" => Arc::new(UdpListenerWrap::bind(&addr, udp_config).await?),
        "rtcp" => {
            substitute_ssh_forward(chain, false);
            Arc::new(RemoteForwardListener::new(&addr, chain.clone()))
        }
        "rudp" => Arc::new(RemoteForwardListener::new(&addr, chain.clone())),
        "obfs4" => {
            obfs4_check(node.get("cert"), node.get("iat-mode"), true)?;
            Arc::new(ExternalListener::new("obfs4", &addr))
        }
        "ohttp" => Arc::new(ExternalListener::new("obfs-http", &addr)),
        "otls" => Arc::new(ExternalListener::new("obfs-tls", &addr)),
        "tun" => Arc::new(TunListener::new(TunConfig::from_node(node))),
        "tap" => Arc::new(TapListener::new(TapConfig::from_node(node))),
        "ftcp" => Arc::new(ExternalListener::new("fake-tcp", &addr)),
        "dns" => match node.get_or("mode", "udp").as_str() {
            "tcp" => Arc::new(TcpListenerWrap::bind(&addr).await?),
            "udp" => Arc::new(UdpListenerWrap::bind(&addr, udp_config).await?),
            _ => Arc::new(ExternalListener::new("dns-over-tls", &addr)),
        },
        "redu" | "redirectu" => Arc::new(ExternalListener::new("udp-redirect", &addr)),
        "vsock" => Arc::new(ExternalListener::new("vsock", &addr)),
        _ => {
            substitute_ssh_forward(chain, true);
            let addr = match node.get("sourceInterface") {
                Some(ifname) if !ifname.is_empty() => iface::override_listen_addr(&addr, ifname)?,
                _ => addr,
            };
            Arc::new(TcpListenerWrap::bind(&addr).await?)
        }
    };
    Ok(listener)
}

/// When the chain's last hop is `forward+ssh`, swap in the SSH forwarding
/// client so forwarding listeners use it natively.
fn substitute_ssh_forward(chain: &Arc<Chain>, direct: bool) {
    let last = match chain.last_node() {
        Some(node) => node,
        None => return,
    };
    if last.protocol != "forward" || last.transport != "ssh" {
        return;
    }
    let connector = if direct {
        crate::dispatch::connector::ssh_direct_forward_connector()
    } else {
        crate::dispatch::connector::ssh_remote_forward_connector()
    };
    chain.substitute_last_client(connector, crate::dispatch::transport::ssh_forward_transporter());
}

fn require_tls<'a>(tls: Option<&'a ServerTls>) -> Result<&'a ServerTls> {
    tls.ok_or_else(|| HopError::Tls("listener requires cert and key options".to_string()))
}

/// An empty-host bind address gets the wildcard host.
fn normalize_bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

/// Plain TCP listener.
pub struct TcpListenerWrap {
    inner: TcpListener,
    addr: String,
}

impl TcpListenerWrap {
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let addr = inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Self { inner, addr })
    }
}

#[async_trait]
impl Listener for TcpListenerWrap {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer))
    }
}

/// TLS listener (plain or mutual, depending on the server config).
pub struct TlsListenerWrap {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    addr: String,
}

impl TlsListenerWrap {
    pub async fn bind(addr: &str, config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let addr = inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Self {
            inner,
            acceptor: TlsAcceptor::from(config),
            addr,
        })
    }
}

#[async_trait]
impl Listener for TlsListenerWrap {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| HopError::HandshakeFailed(e.to_string()))?;
        Ok((Box::new(tls), peer))
    }
}

/// WebSocket listener, optionally TLS-wrapped (`wss`).
pub struct WsListenerWrap {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
    addr: String,
}

impl WsListenerWrap {
    pub async fn bind(addr: &str, tls: Option<TlsAcceptor>) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let addr = inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Self { inner, tls, addr })
    }
}

#[async_trait]
impl Listener for WsListenerWrap {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        let stream: TransportStream = match &self.tls {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| HopError::HandshakeFailed(e.to_string()))?,
            ),
            None => Box::new(stream),
        };
        let ws = accept_async(stream)
            .await
            .map_err(|e| HopError::HandshakeFailed(e.to_string()))?;
        Ok((Box::new(WsFramedStream::new(ws)), peer))
    }
}

/// UDP listener demultiplexing datagrams into per-peer sessions.
///
/// New peers surface through `accept`; datagrams queue per session up to
/// `queue_size`, sessions idle past `ttl` are dropped, and at most `backlog`
/// unaccepted sessions are held.
pub struct UdpListenerWrap {
    addr: String,
    accept_rx: Mutex<mpsc::Receiver<(TransportStream, SocketAddr)>>,
    reader: tokio::task::JoinHandle<()>,
}

impl UdpListenerWrap {
    pub async fn bind(addr: &str, config: UdpListenConfig) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let addr = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        let (accept_tx, accept_rx) = mpsc::channel(config.backlog);

        let reader_socket = socket.clone();
        let reader = tokio::spawn(async move {
            Self::demux_loop(reader_socket, accept_tx, config).await;
        });

        Ok(Self {
            addr,
            accept_rx: Mutex::new(accept_rx),
            reader,
        })
    }

    async fn demux_loop(
        socket: Arc<UdpSocket>,
        accept_tx: mpsc::Sender<(TransportStream, SocketAddr)>,
        config: UdpListenConfig,
    ) {
        struct Session {
            tx: mpsc::Sender<Vec<u8>>,
            last_seen: Instant,
        }

        let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    debug!("udp listener read error: {}", e);
                    break;
                }
            };
            let data = buf[..n].to_vec();

            sessions.retain(|_, s| s.last_seen.elapsed() < config.ttl);

            match sessions.get_mut(&peer) {
                Some(session) => {
                    session.last_seen = Instant::now();
                    // Queue overflow drops the datagram, not the session.
                    let _ = session.tx.try_send(data);
                }
                None => {
                    let (tx, rx) = mpsc::channel(config.queue_size);
                    let stream = UdpSessionStream::new(socket.clone(), peer, rx);
                    if accept_tx
                        .try_send((Box::new(stream) as TransportStream, peer))
                        .is_err()
                    {
                        // Accept backlog full: drop the datagram and session.
                        continue;
                    }
                    let _ = tx.try_send(data);
                    sessions.insert(
                        peer,
                        Session {
                            tx,
                            last_seen: Instant::now(),
                        },
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Listener for UdpListenerWrap {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| HopError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "udp listener closed",
            )))
    }

    fn close(&self) {
        self.reader.abort();
    }
}

/// SSH tunnel listener (external backend); carries the host key material and
/// authorized keys for the backend's use.
pub struct SshTunnelListener {
    addr: String,
    config: SshConfig,
}

impl SshTunnelListener {
    pub fn new(addr: &str, config: SshConfig) -> Self {
        Self {
            addr: addr.to_string(),
            config,
        }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

#[async_trait]
impl Listener for SshTunnelListener {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        Err(HopError::BackendUnavailable("ssh"))
    }
}

/// Remote-forward listener bound to the chain (external backend).
pub struct RemoteForwardListener {
    addr: String,
    _chain: Arc<Chain>,
}

impl RemoteForwardListener {
    pub fn new(addr: &str, chain: Arc<Chain>) -> Self {
        Self {
            addr: addr.to_string(),
            _chain: chain,
        }
    }
}

#[async_trait]
impl Listener for RemoteForwardListener {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        Err(HopError::BackendUnavailable("remote-forward"))
    }
}

/// TUN virtual-interface listener (external backend); the parsed
/// configuration is carried for the backend's use.
pub struct TunListener {
    config: TunConfig,
}

impl TunListener {
    pub fn new(config: TunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TunConfig {
        &self.config
    }
}

#[async_trait]
impl Listener for TunListener {
    fn local_addr(&self) -> String {
        self.config.net.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        Err(HopError::BackendUnavailable("tun"))
    }
}

/// TAP virtual-interface listener (external backend).
pub struct TapListener {
    config: TapConfig,
}

impl TapListener {
    pub fn new(config: TapConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TapConfig {
        &self.config
    }
}

#[async_trait]
impl Listener for TapListener {
    fn local_addr(&self) -> String {
        self.config.net.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        Err(HopError::BackendUnavailable("tap"))
    }
}

/// Shim for listeners whose byte movers are not compiled into this crate.
struct ExternalListener {
    kind: &'static str,
    addr: String,
}

impl ExternalListener {
    fn new(kind: &'static str, addr: &str) -> Self {
        Self {
            kind,
            addr: addr.to_string(),
        }
    }
}

#[async_trait]
impl Listener for ExternalListener {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        Err(HopError::BackendUnavailable(self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn chain() -> Arc<Chain> {
        Arc::new(Chain::new())
    }

    #[tokio::test]
    async fn test_default_transport_binds_tcp() {
        let node = Node::parse("socks5://127.0.0.1:0").unwrap();
        let listener = build_listener(&node, &chain(), None, &SshConfig::default())
            .await
            .unwrap();
        assert!(listener.local_addr().starts_with("127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_wildcard_bind_normalized() {
        let node = Node::parse("socks5://:0").unwrap();
        let listener = build_listener(&node, &chain(), None, &SshConfig::default())
            .await
            .unwrap();
        assert!(listener.local_addr().starts_with("0.0.0.0:"));
    }

    #[tokio::test]
    async fn test_source_interface_failure_aborts_construction() {
        let node = Node::parse("socks5://:0?sourceInterface=eth7-nonexistent").unwrap();
        let err = build_listener(&node, &chain(), None, &SshConfig::default())
            .await
            .err().unwrap();
        assert!(matches!(err, HopError::Interface(_)));
    }

    #[tokio::test]
    async fn test_tls_listener_requires_material() {
        let node = Node::parse("socks5+tls://127.0.0.1:0").unwrap();
        let err = build_listener(&node, &chain(), None, &SshConfig::default())
            .await
            .err().unwrap();
        assert!(matches!(err, HopError::Tls(_)));
    }

    #[tokio::test]
    async fn test_tcp_listener_roundtrip() {
        let listener = TcpListenerWrap::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let (mut stream, _peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_listener_demux_sessions() {
        let config = UdpListenConfig {
            ttl: Duration::from_secs(60),
            backlog: 8,
            queue_size: 8,
        };
        let listener = UdpListenerWrap::bind("127.0.0.1:0", config).await.unwrap();
        let addr: SocketAddr = listener.local_addr().parse().unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"from-a", addr).await.unwrap();
        b.send_to(b"from-b", addr).await.unwrap();

        let (mut s1, p1) = listener.accept().await.unwrap();
        let (mut s2, p2) = listener.accept().await.unwrap();
        assert_ne!(p1, p2);

        let mut buf = [0u8; 16];
        let n = s1.read(&mut buf).await.unwrap();
        let first = buf[..n].to_vec();
        let n = s2.read(&mut buf).await.unwrap();
        let second = buf[..n].to_vec();
        assert_ne!(first, second);

        // Replies route back to the right peer.
        s1.write_all(b"reply-1").await.unwrap();
        let (sock, expected) = if p1 == a.local_addr().unwrap() {
            (&a, b"reply-1")
        } else {
            (&b, b"reply-1")
        };
        let n = sock.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], expected);

        listener.close();
    }

    #[test]
    fn test_parse_ip_routes() {
        let routes = parse_ip_routes(Some("10.0.0.0/8, 192.168.0.0/16, junk"));
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].dest.to_string(), "10.0.0.0/8");
        assert!(parse_ip_routes(None).is_empty());
    }

    #[test]
    fn test_tun_config_gateway_fill() {
        let node =
            Node::parse("tun://:0?net=10.1.0.1/24&route=172.16.0.0/12,10.8.0.0/16&gw=10.1.0.254")
                .unwrap();
        let config = TunConfig::from_node(&node);
        assert_eq!(config.net, "10.1.0.1/24");
        assert_eq!(config.routes.len(), 2);
        for route in &config.routes {
            assert_eq!(route.gateway, Some("10.1.0.254".parse().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_external_listener_reports_backend() {
        let node = Node::parse("relay+kcp://127.0.0.1:0").unwrap();
        let listener = build_listener(&node, &chain(), None, &SshConfig::default())
            .await
            .unwrap();
        let err = listener.accept().await.err().unwrap();
        assert!(matches!(err, HopError::BackendUnavailable("kcp")));
    }
}
