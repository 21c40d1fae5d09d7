//! SNI sniffing handler
//!
//! Reads the first TLS record of an inbound connection, extracts the server
//! name from the ClientHello, dials `<sni>:443` through the chain and relays
//! the connection with the sniffed bytes replayed. Traffic stays end-to-end
//! encrypted; only the routing decision uses the name.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::dispatch::handler::{dial_upstream, Handler, HandlerOptions};
use crate::dispatch::stream::RewindStream;
use crate::dispatch::{relay_bidirectional, TransportStream};
use crate::error::{HopError, Result};

const TLS_RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Handler routing TLS connections by their ClientHello server name.
pub struct SniHandler {
    options: HandlerOptions,
}

impl SniHandler {
    pub fn new() -> Self {
        Self {
            options: HandlerOptions::default(),
        }
    }
}

impl Default for SniHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for SniHandler {
    fn init(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    async fn handle(&self, mut stream: TransportStream, peer: SocketAddr) -> Result<()> {
        // First record header + body is enough for any sane ClientHello.
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;
        if header[0] != TLS_RECORD_HANDSHAKE {
            return Err(HopError::Protocol("not a TLS handshake".to_string()));
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > 16 * 1024 {
            return Err(HopError::Protocol("bad TLS record length".to_string()));
        }
        let mut record = vec![0u8; record_len];
        stream.read_exact(&mut record).await?;

        let sni = extract_sni(&record)
            .ok_or_else(|| HopError::Protocol("no server name in ClientHello".to_string()))?;

        if !self.options.permitted(&sni, 443) {
            return Err(HopError::PermissionDenied(sni));
        }

        let target = self.options.rewrite_target(&format!("{}:443", sni)).await;
        debug!("sni {} -> {}", peer, target);

        let upstream = dial_upstream(&self.options, &target).await?;

        let mut sniffed = header.to_vec();
        sniffed.extend_from_slice(&record);
        let rewound: TransportStream = Box::new(RewindStream::new(sniffed, stream));
        relay_bidirectional(rewound, upstream).await;
        Ok(())
    }
}

/// Byte cursor over a handshake body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

/// Extract the host_name entry of the server_name extension from a
/// ClientHello handshake body (the TLS record payload, header stripped).
fn extract_sni(record: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(record);

    if cur.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    // Handshake length (24-bit), then client_version + random.
    cur.skip(3)?;
    cur.skip(2 + 32)?;

    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len)?;

    let cipher_suites_len = cur.u16()? as usize;
    cur.skip(cipher_suites_len)?;

    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    let extensions_len = cur.u16()? as usize;
    let mut ext = Cursor::new(cur.take(extensions_len)?);

    while let Some(ext_type) = ext.u16() {
        let ext_len = ext.u16()? as usize;
        let body = ext.take(ext_len)?;
        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut names = Cursor::new(body);
        let list_len = names.u16()? as usize;
        let mut list = Cursor::new(names.take(list_len)?);
        while let Some(name_type) = list.u8() {
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            // host_name
            if name_type == 0 {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
        return None;
    }
    None
}
