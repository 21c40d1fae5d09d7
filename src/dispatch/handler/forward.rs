//! Port-forward handlers
//!
//! Every accepted connection (or UDP session) is piped to the serve node's
//! fixed remote target through the chain.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::dispatch::handler::{dial_upstream, Handler, HandlerOptions};
use crate::dispatch::stream::UdpConnStream;
use crate::dispatch::{relay_bidirectional, TransportStream};
use crate::error::{HopError, Result};

/// TCP direct forward: local connections piped to a fixed remote.
pub struct ForwardTcpHandler {
    remote: String,
    options: HandlerOptions,
}

impl ForwardTcpHandler {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            options: HandlerOptions::default(),
        }
    }
}

#[async_trait]
impl Handler for ForwardTcpHandler {
    fn init(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    async fn handle(&self, stream: TransportStream, peer: SocketAddr) -> Result<()> {
        if self.remote.is_empty() {
            return Err(HopError::InvalidConfig(
                "forward handler has no remote target".to_string(),
            ));
        }
        let target = self.options.rewrite_target(&self.remote).await;
        debug!("forward {} -> {}", peer, target);

        let upstream = dial_upstream(&self.options, &target).await?;
        relay_bidirectional(stream, upstream).await;
        Ok(())
    }
}

/// UDP direct forward: each local session piped to a fixed remote datagram
/// endpoint. Datagram relay over a multi-hop chain needs an external
/// backend; with hops configured the session is refused.
pub struct ForwardUdpHandler {
    remote: String,
    options: HandlerOptions,
}

impl ForwardUdpHandler {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            options: HandlerOptions::default(),
        }
    }
}

#[async_trait]
impl Handler for ForwardUdpHandler {
    fn init(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    async fn handle(&self, stream: TransportStream, peer: SocketAddr) -> Result<()> {
        if self.remote.is_empty() {
            return Err(HopError::InvalidConfig(
                "forward handler has no remote target".to_string(),
            ));
        }
        if !self.options.chain.is_empty() {
            return Err(HopError::BackendUnavailable("udp-relay"));
        }

        let target = self.options.rewrite_target(&self.remote).await;
        debug!("udp forward {} -> {}", peer, target);

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(&target)
            .await
            .map_err(|e| HopError::ConnectFailed(format!("{}: {}", target, e)))?;
        let upstream = UdpConnStream::new(Arc::new(socket));
        relay_bidirectional(stream, upstream).await;
        Ok(())
    }
}
