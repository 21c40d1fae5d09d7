//! Handler dispatch (server side)
//!
//! Maps a serve node's protocol key to a [`Handler`]. The key set mirrors the
//! client connector table plus server-only handlers (redirect family,
//! TUN/TAP, DNS, remote-forward). An unknown protocol falls back to plain TCP
//! forwarding when the node carries a remote target, else to protocol
//! auto-detection.

mod auto;
mod dns;
mod forward;
mod http;
mod sni;
mod socks;

pub use auto::AutoHandler;
pub use dns::DnsHandler;
pub use forward::{ForwardTcpHandler, ForwardUdpHandler};
pub use http::HttpHandler;
pub use sni::SniHandler;
pub use socks::{Socks4Handler, Socks5Handler};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::auth::Authenticator;
use crate::bypass::Bypass;
use crate::chain::strategy::{new_strategy, Strategy};
use crate::chain::Chain;
use crate::dispatch::listener::IpRoute;
use crate::dispatch::TransportStream;
use crate::error::{HopError, Result};
use crate::hosts::Hosts;
use crate::node::{Credential, Node};
use crate::permissions::Permissions;
use crate::resolver::ChainResolver;
use crate::tls::ServerTls;

/// Serves one inbound application protocol, walking the chain for upstream
/// connections.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Apply the cross-cutting configuration set. Called once per handler at
    /// router assembly.
    fn init(&mut self, options: HandlerOptions);

    /// Second initialization pass for transparent-redirect protocols only;
    /// the options are meaningless (and unsafe to request) elsewhere, so the
    /// default is a no-op.
    fn init_redirect(&mut self, _options: RedirectOptions) {}

    /// Serve one accepted connection to completion.
    async fn handle(&self, stream: TransportStream, peer: SocketAddr) -> Result<()>;
}

/// The cross-cutting option set a handler may need.
#[derive(Clone)]
pub struct HandlerOptions {
    /// Bound listen address.
    pub addr: String,
    pub chain: Arc<Chain>,
    pub user: Option<Credential>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub tls: Option<Arc<ServerTls>>,
    pub whitelist: Option<Permissions>,
    pub blacklist: Option<Permissions>,
    pub strategy: Arc<dyn Strategy>,
    pub max_fails: Option<u32>,
    pub fail_timeout: Option<Duration>,
    pub bypass: Option<Arc<Bypass>>,
    pub resolver: Option<Arc<ChainResolver>>,
    pub hosts: Option<Arc<Hosts>>,
    /// Per-handler retry budget, overriding the chain's global setting.
    pub retry: u32,
    pub timeout: Option<Duration>,
    pub probe_resist: Option<String>,
    pub knock: Option<String>,
    /// The originating serve node.
    pub node: Option<Node>,
    pub ips: Vec<String>,
    pub tcp_mode: bool,
    pub routes: Vec<IpRoute>,
    pub proxy_agent: Option<String>,
    pub http_tunnel: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            addr: String::new(),
            chain: Arc::new(Chain::new()),
            user: None,
            authenticator: None,
            tls: None,
            whitelist: None,
            blacklist: None,
            strategy: new_strategy(None),
            max_fails: None,
            fail_timeout: None,
            bypass: None,
            resolver: None,
            hosts: None,
            retry: 0,
            timeout: None,
            probe_resist: None,
            knock: None,
            node: None,
            ips: Vec::new(),
            tcp_mode: false,
            routes: Vec::new(),
            proxy_agent: None,
            http_tunnel: false,
        }
    }
}

impl HandlerOptions {
    /// Whether the permission rules allow connecting to `host:port`.
    pub fn permitted(&self, host: &str, port: u16) -> bool {
        if let Some(whitelist) = &self.whitelist {
            if !whitelist.can("connect", host, port) {
                return false;
            }
        }
        if let Some(blacklist) = &self.blacklist {
            if blacklist.can("connect", host, port) {
                return false;
            }
        }
        true
    }

    /// Rewrite a `host:port` target through the static host table, then the
    /// resolver. Unresolvable names pass through for the chain to handle.
    pub async fn rewrite_target(&self, target: &str) -> String {
        let (host, port) = match target.rsplit_once(':') {
            Some((h, p)) => (h, p),
            None => return target.to_string(),
        };
        if host.parse::<std::net::IpAddr>().is_ok() {
            return target.to_string();
        }

        if let Some(hosts) = &self.hosts {
            if let Some(ip) = hosts.lookup(host) {
                return format_addr(ip, port);
            }
        }
        if let Some(resolver) = &self.resolver {
            if let Ok(ips) = resolver.resolve(host).await {
                if let Some(ip) = ips.first() {
                    return format_addr(*ip, port);
                }
            }
        }
        target.to_string()
    }

    /// Validate an inbound credential pair against the authenticator, or
    /// against nothing when no authentication is configured.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        match &self.authenticator {
            Some(authenticator) => authenticator.authenticate(username, password),
            None => true,
        }
    }

    pub fn auth_required(&self) -> bool {
        self.authenticator.is_some()
    }
}

/// Open the upstream leg for a handler: bypassed targets dial direct, the
/// rest walk the chain with the handler's retry override.
pub(crate) async fn dial_upstream(
    options: &HandlerOptions,
    target: &str,
) -> Result<TransportStream> {
    let bypassed = options
        .bypass
        .as_ref()
        .map(|b| b.contains(target))
        .unwrap_or(false);
    if bypassed {
        let stream =
            crate::dispatch::transport::tcp_dial(target, &options.chain.direct_dial_options())
                .await?;
        return Ok(Box::new(stream));
    }
    let retries = if options.retry > 0 {
        options.retry
    } else {
        options.chain.retries
    };
    options.chain.connect_retries(target, retries).await
}

fn format_addr(ip: std::net::IpAddr, port: &str) -> String {
    match ip {
        std::net::IpAddr::V4(v4) => format!("{}:{}", v4, port),
        std::net::IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

/// Options of the redirect second pass.
#[derive(Debug, Clone, Default)]
pub struct RedirectOptions {
    /// Preserve the original client source address on the outbound leg.
    pub preserve_src: bool,
    /// Network namespace the proxying sockets live in.
    pub proxy_netns: Option<String>,
}

/// Build the handler for a serve node's protocol key.
pub fn build_handler(node: &Node) -> Box<dyn Handler> {
    let remote = node.remote.clone();
    match node.protocol.as_str() {
        "socks" | "socks5" => Box::new(Socks5Handler::new()),
        "socks4" | "socks4a" => Box::new(Socks4Handler::new()),
        "http" => Box::new(HttpHandler::new()),
        "tcp" => Box::new(ForwardTcpHandler::new(remote)),
        "udp" => Box::new(ForwardUdpHandler::new(remote)),
        "sni" => Box::new(SniHandler::new()),
        "dns" => Box::new(DnsHandler::new(remote)),
        "http2" => Box::new(ExternalHandler::new("http2")),
        "ss" | "ssu" => Box::new(ExternalHandler::new("shadowsocks")),
        "rtcp" | "rudp" => Box::new(ExternalHandler::new("remote-forward")),
        "forward" => Box::new(ExternalHandler::new("ssh")),
        "red" | "redirect" | "redu" | "redirectu" => Box::new(RedirectHandler::new()),
        "tun" => Box::new(ExternalHandler::new("tun")),
        "tap" => Box::new(ExternalHandler::new("tap")),
        "relay" => Box::new(ExternalHandler::new("relay")),
        _ => {
            // Unclassified protocols: a remote target means a forward tunnel,
            // otherwise sniff the protocol per connection.
            if !remote.is_empty() {
                Box::new(ForwardTcpHandler::new(remote))
            } else {
                Box::new(AutoHandler::new())
            }
        }
    }
}

/// Transparent-redirect handler. Original-destination recovery is a kernel
/// facility outside this crate; the handler still records both init passes.
pub struct RedirectHandler {
    options: HandlerOptions,
    redirect: RedirectOptions,
}

impl RedirectHandler {
    pub fn new() -> Self {
        Self {
            options: HandlerOptions::default(),
            redirect: RedirectOptions::default(),
        }
    }

    pub fn redirect_options(&self) -> &RedirectOptions {
        &self.redirect
    }
}

impl Default for RedirectHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    fn init(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    fn init_redirect(&mut self, options: RedirectOptions) {
        self.redirect = options;
    }

    async fn handle(&self, _stream: TransportStream, peer: SocketAddr) -> Result<()> {
        warn!("dropping redirected connection from {}: tproxy backend unavailable", peer);
        Err(HopError::BackendUnavailable("tproxy"))
    }
}

/// Shim for protocols whose servers are not compiled into this crate.
struct ExternalHandler {
    kind: &'static str,
    _options: HandlerOptions,
}

impl ExternalHandler {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            _options: HandlerOptions::default(),
        }
    }
}

#[async_trait]
impl Handler for ExternalHandler {
    fn init(&mut self, options: HandlerOptions) {
        self._options = options;
    }

    async fn handle(&self, _stream: TransportStream, peer: SocketAddr) -> Result<()> {
        warn!(
            "dropping connection from {}: {} backend unavailable",
            peer, self.kind
        );
        Err(HopError::BackendUnavailable(self.kind))
    }
}
