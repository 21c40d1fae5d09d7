//! HTTP proxy handler
//!
//! CONNECT tunneling plus absolute-form request forwarding, with Basic proxy
//! authentication, a probe-resist mode that masks the proxy behind a fixed
//! status code, a knock host for liveness, and an optional Proxy-Agent
//! response header.

use std::net::SocketAddr;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::dispatch::handler::{dial_upstream, Handler, HandlerOptions};
use crate::dispatch::{relay_bidirectional, TransportStream};
use crate::error::{HopError, Result};

/// A parsed request head.
#[derive(Debug)]
struct RequestHead {
    method: String,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP proxy handler.
pub struct HttpHandler {
    options: HandlerOptions,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            options: HandlerOptions::default(),
        }
    }

    fn proxy_agent_header(&self) -> String {
        match &self.options.proxy_agent {
            Some(agent) => format!("Proxy-Agent: {}\r\n", agent),
            None => String::new(),
        }
    }

    async fn respond(&self, stream: &mut TransportStream, status: &str) -> Result<()> {
        let response = format!(
            "HTTP/1.1 {}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
            status,
            self.proxy_agent_header()
        );
        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }

    /// Respond the way the probe-resist policy dictates: a bare status code
    /// for `code:<n>`, otherwise the standard 407 challenge.
    async fn reject_unauthorized(&self, stream: &mut TransportStream) -> Result<()> {
        if let Some(policy) = &self.options.probe_resist {
            if let Some(code) = policy.strip_prefix("code:") {
                let status = match code {
                    "400" => "400 Bad Request",
                    "403" => "403 Forbidden",
                    "404" => "404 Not Found",
                    "502" => "502 Bad Gateway",
                    _ => "400 Bad Request",
                };
                return self.respond(stream, status).await;
            }
        }
        let response = format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\n{}Proxy-Authenticate: Basic realm=\"proxy\"\r\nConnection: close\r\n\r\n",
            self.proxy_agent_header()
        );
        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }

    fn authorized(&self, head: &RequestHead) -> bool {
        if !self.options.auth_required() {
            return true;
        }
        let value = match head.header("Proxy-Authorization") {
            Some(v) => v,
            None => return false,
        };
        let encoded = match value.strip_prefix("Basic ") {
            Some(v) => v.trim(),
            None => return false,
        };
        let decoded = match BASE64.decode(encoded) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let credentials = String::from_utf8_lossy(&decoded).into_owned();
        match credentials.split_once(':') {
            Some((user, pass)) => self.options.authenticate(user, pass),
            None => false,
        }
    }

    /// Target `host:port` for a non-CONNECT request: absolute-form URI first,
    /// Host header as fallback.
    fn forward_target(&self, head: &RequestHead) -> Option<String> {
        let from_uri = head
            .uri
            .strip_prefix("http://")
            .map(|rest| rest.split('/').next().unwrap_or(rest));
        let authority = match from_uri {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => head.header("Host")?.to_string(),
        };
        Some(if authority.contains(':') {
            authority
        } else {
            format!("{}:80", authority)
        })
    }

    /// Rebuild the outgoing head for the origin server: origin-form request
    /// line (absolute-form when tunneling is forced) and hop-by-hop proxy
    /// headers stripped.
    fn rebuild_head(&self, head: &RequestHead) -> String {
        let uri = if self.options.http_tunnel {
            head.uri.clone()
        } else {
            head.uri
                .strip_prefix("http://")
                .and_then(|rest| rest.find('/').map(|i| rest[i..].to_string()))
                .unwrap_or_else(|| {
                    if head.uri.starts_with('/') {
                        head.uri.clone()
                    } else {
                        "/".to_string()
                    }
                })
        };

        let mut out = format!("{} {} {}\r\n", head.method, uri, head.version);
        for (name, value) in &head.headers {
            if name.eq_ignore_ascii_case("Proxy-Authorization")
                || name.eq_ignore_ascii_case("Proxy-Connection")
            {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("\r\n");
        out
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for HttpHandler {
    fn init(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    async fn handle(&self, mut stream: TransportStream, peer: SocketAddr) -> Result<()> {
        let head = read_request_head(&mut stream).await?;

        // A knock request proves liveness without exposing proxy semantics.
        if let Some(knock) = &self.options.knock {
            let host = head.header("Host").unwrap_or("");
            if !knock.is_empty() && host.split(':').next() == Some(knock.as_str()) {
                return self.respond(&mut stream, "200 OK").await;
            }
        }

        if !self.authorized(&head) {
            self.reject_unauthorized(&mut stream).await?;
            return Err(HopError::AuthenticationFailed);
        }

        let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
        let target = if is_connect {
            let authority = head.uri.clone();
            if authority.contains(':') {
                authority
            } else {
                format!("{}:443", authority)
            }
        } else {
            match self.forward_target(&head) {
                Some(target) => target,
                None => {
                    self.respond(&mut stream, "400 Bad Request").await?;
                    return Err(HopError::Protocol("request without target".to_string()));
                }
            }
        };

        let (host, port) = target
            .rsplit_once(':')
            .map(|(h, p)| (h, p.parse::<u16>().unwrap_or(0)))
            .unwrap_or((target.as_str(), 0));
        if !self.options.permitted(host, port) {
            self.respond(&mut stream, "403 Forbidden").await?;
            return Err(HopError::PermissionDenied(target));
        }

        let target = self.options.rewrite_target(&target).await;
        debug!("http {} {} -> {}", head.method, peer, target);

        let mut upstream = match dial_upstream(&self.options, &target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.respond(&mut stream, "502 Bad Gateway").await?;
                return Err(e);
            }
        };

        if is_connect {
            let response = format!(
                "HTTP/1.1 200 Connection established\r\n{}\r\n",
                self.proxy_agent_header()
            );
            stream.write_all(response.as_bytes()).await?;
        } else {
            upstream
                .write_all(self.rebuild_head(&head).as_bytes())
                .await?;
        }

        relay_bidirectional(stream, upstream).await;
        Ok(())
    }
}

/// Read a request head (through the blank line) without consuming body bytes.
async fn read_request_head(stream: &mut TransportStream) -> Result<RequestHead> {
    let mut raw = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        if raw.len() > 64 * 1024 {
            return Err(HopError::Protocol("oversized request head".to_string()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(HopError::Protocol("truncated request head".to_string()));
        }
        raw.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| HopError::Protocol("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m.to_string(), u.to_string(), v.to_string()),
        _ => {
            return Err(HopError::Protocol(format!(
                "malformed request line {}",
                request_line
            )))
        }
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalAuthenticator;
    use crate::node::Credential;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn peer() -> SocketAddr {
        "127.0.0.1:50001".parse().unwrap()
    }

    async fn start_echo_server() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_tunnel() {
        let echo = start_echo_server().await;
        let handler = HttpHandler::new();

        let (client, server) = duplex(4096);
        let task =
            tokio::spawn(async move { handler.handle(Box::new(server), peer()).await });

        let mut client = client;
        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", echo, echo).as_bytes())
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(response.starts_with("HTTP/1.1 200"));

        client.write_all(b"tunneled").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunneled");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_gets_407() {
        let mut handler = HttpHandler::new();
        handler.init(HandlerOptions {
            authenticator: Some(Arc::new(LocalAuthenticator::single(&Credential::new(
                "u",
                Some("p".to_string()),
            )))),
            ..Default::default()
        });

        let (client, server) = duplex(4096);
        let task =
            tokio::spawn(async move { handler.handle(Box::new(server), peer()).await });

        let mut client = client;
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 512];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(response.starts_with("HTTP/1.1 407"));
        assert!(response.contains("Proxy-Authenticate: Basic"));

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_probe_resist_masks_challenge() {
        let mut handler = HttpHandler::new();
        handler.init(HandlerOptions {
            authenticator: Some(Arc::new(LocalAuthenticator::single(&Credential::new(
                "u",
                Some("p".to_string()),
            )))),
            probe_resist: Some("code:404".to_string()),
            ..Default::default()
        });

        let (client, server) = duplex(4096);
        let task =
            tokio::spawn(async move { handler.handle(Box::new(server), peer()).await });

        let mut client = client;
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 512];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(!response.contains("Proxy-Authenticate"));

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_knock_host_liveness() {
        let mut handler = HttpHandler::new();
        handler.init(HandlerOptions {
            authenticator: Some(Arc::new(LocalAuthenticator::single(&Credential::new(
                "u",
                Some("p".to_string()),
            )))),
            probe_resist: Some("code:404".to_string()),
            knock: Some("knock.example".to_string()),
            ..Default::default()
        });

        let (client, server) = duplex(4096);
        let task =
            tokio::spawn(async move { handler.handle(Box::new(server), peer()).await });

        let mut client = client;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: knock.example\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 512];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(response.starts_with("HTTP/1.1 200"));

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_rewrites_to_origin_form() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let handler = HttpHandler::new();
        let (client, server) = duplex(4096);
        let task =
            tokio::spawn(async move { handler.handle(Box::new(server), peer()).await });

        let mut client = client;
        client
            .write_all(
                format!(
                    "GET http://{}/path/x HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
                    origin, origin
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let request = origin_task.await.unwrap();
        assert!(request.starts_with("GET /path/x HTTP/1.1\r\n"));
        assert!(!request.contains("Proxy-Connection"));

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 204"));

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_forward_target_parsing() {
        let handler = HttpHandler::new();
        let head = RequestHead {
            method: "GET".to_string(),
            uri: "http://example.com/x".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![],
        };
        assert_eq!(handler.forward_target(&head).unwrap(), "example.com:80");

        let head = RequestHead {
            method: "GET".to_string(),
            uri: "/x".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), "example.com:8080".to_string())],
        };
        assert_eq!(handler.forward_target(&head).unwrap(), "example.com:8080");
    }
}
