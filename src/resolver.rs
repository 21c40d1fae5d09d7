//! Chain-aware name resolution
//!
//! A [`ChainResolver`] answers host lookups for handlers. Queries are sent to
//! the configured servers in order; TCP exchanges are dialed through the
//! chain so resolution itself rides the relay path (an empty chain dials
//! directly), UDP exchanges go direct. Answers are cached with a TTL that the
//! `ttl` option can override.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::error::{HopError, Result};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// One upstream DNS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServer {
    pub scheme: String,
    pub addr: String,
}

impl NameServer {
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        let (scheme, rest) = match entry.split_once("://") {
            Some((s, r)) => (s.to_string(), r),
            None => ("udp".to_string(), entry),
        };
        let default_port = match scheme.as_str() {
            "tls" => 853,
            "https" => 443,
            _ => 53,
        };
        let host = rest.split('/').next().unwrap_or(rest);
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:{}", host, default_port)
        };
        Some(Self { scheme, addr })
    }
}

/// Initialization options, applied once at router assembly.
#[derive(Default)]
pub struct ResolverOptions {
    pub chain: Option<Arc<Chain>>,
    pub timeout: Option<Duration>,
    pub ttl: Option<Duration>,
    /// Address-family preference: `ipv6` tries AAAA first.
    pub prefer: Option<String>,
    pub src_ip: Option<IpAddr>,
}

struct ResolverState {
    chain: Option<Arc<Chain>>,
    timeout: Duration,
    ttl: Option<Duration>,
    prefer_ipv6: bool,
    src_ip: Option<IpAddr>,
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires: Instant,
}

/// Resolver whose exchanges can ride the proxy chain.
pub struct ChainResolver {
    servers: Vec<NameServer>,
    state: RwLock<ResolverState>,
    cache: DashMap<String, CacheEntry>,
}

impl ChainResolver {
    /// Parse the `dns` option (comma-separated server list). Absent/empty
    /// option → no resolver.
    pub fn parse(s: Option<&str>) -> Option<Arc<Self>> {
        let s = s?.trim();
        if s.is_empty() {
            return None;
        }
        let servers: Vec<NameServer> = s.split(',').filter_map(NameServer::parse).collect();
        if servers.is_empty() {
            return None;
        }
        Some(Arc::new(Self {
            servers,
            state: RwLock::new(ResolverState {
                chain: None,
                timeout: DEFAULT_QUERY_TIMEOUT,
                ttl: None,
                prefer_ipv6: false,
                src_ip: None,
            }),
            cache: DashMap::new(),
        }))
    }

    /// Apply initialization options.
    pub fn init(&self, options: ResolverOptions) {
        let mut state = self.state.write();
        state.chain = options.chain;
        if let Some(t) = options.timeout.filter(|t| !t.is_zero()) {
            state.timeout = t;
        }
        state.ttl = options.ttl.filter(|t| !t.is_zero());
        state.prefer_ipv6 = options.prefer.as_deref() == Some("ipv6");
        state.src_ip = options.src_ip;
    }

    pub fn servers(&self) -> &[NameServer] {
        &self.servers
    }

    /// Resolve a host name to addresses. IP literals pass straight through.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if let Some(entry) = self.cache.get(host) {
            if entry.expires > Instant::now() {
                return Ok(entry.ips.clone());
            }
        }

        let (record_types, query_timeout, cache_ttl_override) = {
            let state = self.state.read();
            let types = if state.prefer_ipv6 {
                [RecordType::AAAA, RecordType::A]
            } else {
                [RecordType::A, RecordType::AAAA]
            };
            (types, state.timeout, state.ttl)
        };

        for record_type in record_types {
            match self.query(host, record_type, query_timeout).await {
                Ok((ips, record_ttl)) if !ips.is_empty() => {
                    let ttl = cache_ttl_override
                        .unwrap_or_else(|| record_ttl.unwrap_or(DEFAULT_CACHE_TTL));
                    self.cache.insert(
                        host.to_string(),
                        CacheEntry {
                            ips: ips.clone(),
                            expires: Instant::now() + ttl,
                        },
                    );
                    debug!("resolved {} to {:?}", host, ips);
                    return Ok(ips);
                }
                Ok(_) => {}
                Err(e) => debug!("{} query for {} failed: {}", record_type, host, e),
            }
        }

        Err(HopError::Resolve(host.to_string()))
    }

    async fn query(
        &self,
        host: &str,
        record_type: RecordType,
        query_timeout: Duration,
    ) -> Result<(Vec<IpAddr>, Option<Duration>)> {
        let request = build_query(host, record_type)?;

        let mut last_err = None;
        for server in &self.servers {
            let exchange = match server.scheme.as_str() {
                "udp" => self.exchange_udp(server, &request, query_timeout).await,
                "tcp" => self.exchange_tcp(server, &request, query_timeout).await,
                other => {
                    warn!("skipping {} resolver {} (unsupported scheme)", other, server.addr);
                    continue;
                }
            };
            match exchange {
                Ok(response) => return Ok(parse_answers(&response, record_type)),
                Err(e) => {
                    debug!("resolver {} failed: {}", server.addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| HopError::Resolve(host.to_string())))
    }

    /// Direct UDP exchange, bound to the configured source IP when present.
    async fn exchange_udp(
        &self,
        server: &NameServer,
        request: &[u8],
        query_timeout: Duration,
    ) -> Result<Message> {
        let (chain, src_ip) = {
            let state = self.state.read();
            (state.chain.clone(), state.src_ip)
        };

        // UDP cannot ride a stream chain; fall back to TCP when hops exist.
        if chain.as_ref().map(|c| !c.is_empty()).unwrap_or(false) {
            return self.exchange_tcp(server, request, query_timeout).await;
        }

        let bind_addr = match src_ip {
            Some(IpAddr::V4(ip)) => format!("{}:0", ip),
            Some(IpAddr::V6(ip)) => format!("[{}]:0", ip),
            None => "0.0.0.0:0".to_string(),
        };
        let socket = UdpSocket::bind(&bind_addr).await?;
        socket.connect(&server.addr).await?;
        socket.send(request).await?;

        let mut buf = vec![0u8; 4096];
        let n = timeout(query_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| HopError::Timeout)??;
        Message::from_vec(&buf[..n]).map_err(|e| HopError::Resolve(e.to_string()))
    }

    /// Length-framed TCP exchange, dialed through the chain.
    async fn exchange_tcp(
        &self,
        server: &NameServer,
        request: &[u8],
        query_timeout: Duration,
    ) -> Result<Message> {
        let chain = self.state.read().chain.clone();

        let exchange = async {
            let mut stream = match &chain {
                Some(chain) => chain.connect(&server.addr).await?,
                None => Chain::new().connect(&server.addr).await?,
            };

            let mut framed = Vec::with_capacity(request.len() + 2);
            framed.extend_from_slice(&(request.len() as u16).to_be_bytes());
            framed.extend_from_slice(request);
            stream.write_all(&framed).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            Message::from_vec(&body).map_err(|e| HopError::Resolve(e.to_string()))
        };

        timeout(query_timeout, exchange)
            .await
            .map_err(|_| HopError::Timeout)?
    }
}

impl std::fmt::Debug for ChainResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainResolver")
            .field("servers", &self.servers)
            .finish()
    }
}

fn build_query(host: &str, record_type: RecordType) -> Result<Vec<u8>> {
    let name = Name::from_str(host).map_err(|e| HopError::Resolve(format!("{}: {}", host, e)))?;
    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    message
        .to_vec()
        .map_err(|e| HopError::Resolve(e.to_string()))
}

fn parse_answers(message: &Message, record_type: RecordType) -> (Vec<IpAddr>, Option<Duration>) {
    let mut ips = Vec::new();
    let mut min_ttl: Option<u32> = None;
    for record in message.answers() {
        let ip = match record.data() {
            Some(RData::A(a)) if record_type == RecordType::A => IpAddr::V4(a.0),
            Some(RData::AAAA(aaaa)) if record_type == RecordType::AAAA => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        ips.push(ip);
        min_ttl = Some(min_ttl.map_or(record.ttl(), |t| t.min(record.ttl())));
    }
    let ttl = min_ttl.map(|t| Duration::from_secs(t.clamp(1, 3600) as u64));
    (ips, ttl)
}
