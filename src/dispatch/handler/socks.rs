//! SOCKS server handlers
//!
//! SOCKS5 (RFC 1928/1929, CONNECT command, no-auth or username/password) and
//! SOCKS4/4A (CONNECT). UDP-associate and BIND belong to external backends.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::dispatch::handler::{dial_upstream, Handler, HandlerOptions};
use crate::dispatch::{relay_bidirectional, TransportStream};
use crate::error::{HopError, Result};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_CMD_UNSUPPORTED: u8 = 0x07;
const REP_ATYP_UNSUPPORTED: u8 = 0x08;

/// SOCKS5 proxy handler.
pub struct Socks5Handler {
    options: HandlerOptions,
}

impl Socks5Handler {
    pub fn new() -> Self {
        Self {
            options: HandlerOptions::default(),
        }
    }

    async fn negotiate(&self, stream: &mut TransportStream) -> Result<()> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(HopError::Protocol(format!(
                "unexpected SOCKS version {}",
                header[0]
            )));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;

        if self.options.auth_required() {
            if !methods.contains(&METHOD_USER_PASS) {
                stream
                    .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
                    .await?;
                return Err(HopError::AuthenticationFailed);
            }
            stream.write_all(&[SOCKS5_VERSION, METHOD_USER_PASS]).await?;
            self.sub_negotiate(stream).await
        } else {
            if !methods.contains(&METHOD_NO_AUTH) {
                stream
                    .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
                    .await?;
                return Err(HopError::Protocol("no acceptable method".to_string()));
            }
            stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
            Ok(())
        }
    }

    /// RFC 1929 username/password sub-negotiation.
    async fn sub_negotiate(&self, stream: &mut TransportStream) -> Result<()> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        let mut username = vec![0u8; header[1] as usize];
        stream.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).await?;

        let username = String::from_utf8_lossy(&username).into_owned();
        let password = String::from_utf8_lossy(&password).into_owned();

        if self.options.authenticate(&username, &password) {
            stream.write_all(&[0x01, 0x00]).await?;
            Ok(())
        } else {
            stream.write_all(&[0x01, 0x01]).await?;
            Err(HopError::AuthenticationFailed)
        }
    }

    async fn read_request(&self, stream: &mut TransportStream) -> Result<(u8, String)> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(HopError::Protocol("bad request version".to_string()));
        }
        let cmd = header[1];

        let host = match header[3] {
            // IPv4
            0x01 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                Ipv4Addr::from(addr).to_string()
            }
            // Domain
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                stream.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).into_owned()
            }
            // IPv6
            0x04 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                format!("[{}]", std::net::Ipv6Addr::from(addr))
            }
            other => {
                reply(stream, REP_ATYP_UNSUPPORTED).await?;
                return Err(HopError::Protocol(format!("bad address type {}", other)));
            }
        };

        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;
        let port = u16::from_be_bytes(port);

        Ok((cmd, format!("{}:{}", host, port)))
    }
}

async fn reply(stream: &mut TransportStream, code: u8) -> Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

impl Default for Socks5Handler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Socks5Handler {
    fn init(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    async fn handle(&self, mut stream: TransportStream, peer: SocketAddr) -> Result<()> {
        let handshake_timeout = self
            .options
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(std::time::Duration::from_secs(30));

        let (cmd, target) = timeout(handshake_timeout, async {
            self.negotiate(&mut stream).await?;
            self.read_request(&mut stream).await
        })
        .await
        .map_err(|_| HopError::Timeout)??;

        if cmd != CMD_CONNECT {
            reply(&mut stream, REP_CMD_UNSUPPORTED).await?;
            return Err(HopError::Protocol(format!("unsupported command {}", cmd)));
        }

        let (host, port) = target
            .rsplit_once(':')
            .map(|(h, p)| (h.trim_matches(['[', ']']), p.parse::<u16>().unwrap_or(0)))
            .unwrap_or((target.as_str(), 0));
        if !self.options.permitted(host, port) {
            reply(&mut stream, REP_NOT_ALLOWED).await?;
            return Err(HopError::PermissionDenied(target));
        }

        let target = self.options.rewrite_target(&target).await;
        debug!("socks5 {} -> {}", peer, target);

        let upstream = match dial_upstream(&self.options, &target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                reply(&mut stream, REP_FAILURE).await?;
                return Err(e);
            }
        };
        reply(&mut stream, REP_SUCCESS).await?;

        relay_bidirectional(stream, upstream).await;
        Ok(())
    }
}

/// SOCKS4/SOCKS4A proxy handler.
pub struct Socks4Handler {
    options: HandlerOptions,
}

impl Socks4Handler {
    pub fn new() -> Self {
        Self {
            options: HandlerOptions::default(),
        }
    }

    async fn read_request(&self, stream: &mut TransportStream) -> Result<(u8, String)> {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS4_VERSION {
            return Err(HopError::Protocol(format!(
                "unexpected SOCKS version {}",
                header[0]
            )));
        }
        let cmd = header[1];
        let port = u16::from_be_bytes([header[2], header[3]]);
        let ip = Ipv4Addr::new(header[4], header[5], header[6], header[7]);

        // NUL-terminated user id, ignored.
        read_until_nul(stream).await?;

        // SOCKS4A: 0.0.0.x (x != 0) means a domain name follows.
        let octets = ip.octets();
        let host = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
            String::from_utf8_lossy(&read_until_nul(stream).await?).into_owned()
        } else {
            ip.to_string()
        };

        Ok((cmd, format!("{}:{}", host, port)))
    }
}

async fn read_until_nul(stream: &mut TransportStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(out);
        }
        if out.len() > 512 {
            return Err(HopError::Protocol("oversized SOCKS4 field".to_string()));
        }
        out.push(byte[0]);
    }
}

async fn socks4_reply(stream: &mut TransportStream, granted: bool) -> Result<()> {
    let code = if granted { 0x5A } else { 0x5B };
    stream.write_all(&[0x00, code, 0, 0, 0, 0, 0, 0]).await?;
    Ok(())
}

impl Default for Socks4Handler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Socks4Handler {
    fn init(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    async fn handle(&self, mut stream: TransportStream, peer: SocketAddr) -> Result<()> {
        let (cmd, target) = self.read_request(&mut stream).await?;
        if cmd != CMD_CONNECT {
            socks4_reply(&mut stream, false).await?;
            return Err(HopError::Protocol(format!("unsupported command {}", cmd)));
        }

        let (host, port) = target
            .rsplit_once(':')
            .map(|(h, p)| (h, p.parse::<u16>().unwrap_or(0)))
            .unwrap_or((target.as_str(), 0));
        if !self.options.permitted(host, port) {
            socks4_reply(&mut stream, false).await?;
            return Err(HopError::PermissionDenied(target));
        }

        let target = self.options.rewrite_target(&target).await;
        debug!("socks4 {} -> {}", peer, target);

        let upstream = match dial_upstream(&self.options, &target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                socks4_reply(&mut stream, false).await?;
                return Err(e);
            }
        };
        socks4_reply(&mut stream, true).await?;

        relay_bidirectional(stream, upstream).await;
        Ok(())
    }
}
