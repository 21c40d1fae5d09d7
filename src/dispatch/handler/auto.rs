//! Protocol auto-detection
//!
//! Sniffs the first byte of a connection and dispatches to the SOCKS5,
//! SOCKS4 or HTTP handler, replaying the consumed byte.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::dispatch::handler::{Handler, HandlerOptions, HttpHandler, Socks4Handler, Socks5Handler};
use crate::dispatch::stream::RewindStream;
use crate::dispatch::TransportStream;
use crate::error::{HopError, Result};

/// Handler that classifies inbound connections by their first byte.
pub struct AutoHandler {
    socks5: Socks5Handler,
    socks4: Socks4Handler,
    http: HttpHandler,
}

impl AutoHandler {
    pub fn new() -> Self {
        Self {
            socks5: Socks5Handler::new(),
            socks4: Socks4Handler::new(),
            http: HttpHandler::new(),
        }
    }
}

impl Default for AutoHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for AutoHandler {
    fn init(&mut self, options: HandlerOptions) {
        self.socks5.init(options.clone());
        self.socks4.init(options.clone());
        self.http.init(options);
    }

    async fn handle(&self, mut stream: TransportStream, peer: SocketAddr) -> Result<()> {
        let mut first = [0u8; 1];
        let n = stream.read(&mut first).await?;
        if n == 0 {
            return Err(HopError::Protocol("connection closed before any data".to_string()));
        }

        let rewound: TransportStream = Box::new(RewindStream::new(first.to_vec(), stream));
        match first[0] {
            0x05 => {
                debug!("auto: {} speaks SOCKS5", peer);
                self.socks5.handle(rewound, peer).await
            }
            0x04 => {
                debug!("auto: {} speaks SOCKS4", peer);
                self.socks4.handle(rewound, peer).await
            }
            _ => {
                debug!("auto: {} treated as HTTP", peer);
                self.http.handle(rewound, peer).await
            }
        }
    }
}
