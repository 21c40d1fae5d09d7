//! DNS forwarding handler
//!
//! Accepts DNS queries (length-framed in TCP mode, one datagram per read
//! otherwise) and forwards them to the serve node's upstream server through
//! the chain, always as DNS-over-TCP on the upstream leg.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::dispatch::handler::{dial_upstream, Handler, HandlerOptions};
use crate::dispatch::TransportStream;
use crate::error::{HopError, Result};

const DEFAULT_UPSTREAM: &str = "8.8.8.8:53";
const MAX_MESSAGE: usize = 64 * 1024;

/// Handler forwarding DNS queries to an upstream resolver.
pub struct DnsHandler {
    upstream: String,
    options: HandlerOptions,
}

impl DnsHandler {
    pub fn new(upstream: impl Into<String>) -> Self {
        let upstream = upstream.into();
        Self {
            upstream: if upstream.is_empty() {
                DEFAULT_UPSTREAM.to_string()
            } else if upstream.contains(':') {
                upstream
            } else {
                format!("{}:53", upstream)
            },
            options: HandlerOptions::default(),
        }
    }

    async fn read_query(&self, stream: &mut TransportStream) -> Result<Option<Vec<u8>>> {
        if self.options.tcp_mode {
            let mut len_buf = [0u8; 2];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await?;
            Ok(Some(query))
        } else {
            let mut buf = vec![0u8; MAX_MESSAGE];
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some(buf))
        }
    }

    async fn write_reply(&self, stream: &mut TransportStream, reply: &[u8]) -> Result<()> {
        if self.options.tcp_mode {
            let mut framed = Vec::with_capacity(reply.len() + 2);
            framed.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            framed.extend_from_slice(reply);
            stream.write_all(&framed).await?;
        } else {
            stream.write_all(reply).await?;
        }
        Ok(())
    }

    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        if query.len() > u16::MAX as usize {
            return Err(HopError::Protocol("oversized DNS query".to_string()));
        }
        let mut upstream = dial_upstream(&self.options, &self.upstream).await?;

        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(query);
        upstream.write_all(&framed).await?;

        let mut len_buf = [0u8; 2];
        upstream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut reply = vec![0u8; len];
        upstream.read_exact(&mut reply).await?;
        Ok(reply)
    }
}

#[async_trait]
impl Handler for DnsHandler {
    fn init(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    async fn handle(&self, mut stream: TransportStream, peer: SocketAddr) -> Result<()> {
        while let Some(query) = self.read_query(&mut stream).await? {
            debug!("dns query from {} ({} bytes) -> {}", peer, query.len(), self.upstream);
            let reply = self.exchange(&query).await?;
            self.write_reply(&mut stream, &reply).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_upstream_defaults() {
        assert_eq!(DnsHandler::new("").upstream, "8.8.8.8:53");
        assert_eq!(DnsHandler::new("1.1.1.1").upstream, "1.1.1.1:53");
        assert_eq!(DnsHandler::new("1.1.1.1:5353").upstream, "1.1.1.1:5353");
    }

    #[tokio::test]
    async fn test_forwards_framed_query() {
        // Upstream DNS-over-TCP responder that doubles the payload back.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await.unwrap();

            let mut reply = query.clone();
            reply.extend_from_slice(&query);
            let mut framed = (reply.len() as u16).to_be_bytes().to_vec();
            framed.extend_from_slice(&reply);
            stream.write_all(&framed).await.unwrap();
        });

        let mut handler = DnsHandler::new(upstream_addr.to_string());
        handler.init(HandlerOptions {
            tcp_mode: true,
            ..Default::default()
        });

        let (client, server) = duplex(4096);
        let task = tokio::spawn(async move {
            handler
                .handle(Box::new(server), "127.0.0.1:50005".parse().unwrap())
                .await
        });

        let mut client = client;
        let query = b"\x12\x34fake-dns-query";
        let mut framed = (query.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(query);
        client.write_all(&framed).await.unwrap();

        let mut len_buf = [0u8; 2];
        client.read_exact(&mut len_buf).await.unwrap();
        let len = u16::from_be_bytes(len_buf) as usize;
        assert_eq!(len, query.len() * 2);
        let mut reply = vec![0u8; len];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..query.len()], query);

        drop(client);
        task.await.unwrap().unwrap();
    }
}
