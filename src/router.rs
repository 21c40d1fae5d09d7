//! Router lifecycle
//!
//! One router per serve-node spec: a bound listener, its handler, the shared
//! chain, and optional resolver/hosts collaborators. `serve` accepts and
//! dispatches connections until `close`; closing one router never affects
//! its siblings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::chain::Chain;
use crate::dispatch::{Handler, Listener};
use crate::error::Result;
use crate::hosts::Hosts;
use crate::node::Node;
use crate::resolver::ChainResolver;

/// The runtime pairing of one listener, one handler, one chain.
pub struct Router {
    node: Node,
    listener: Arc<dyn Listener>,
    handler: Arc<dyn Handler>,
    chain: Arc<Chain>,
    resolver: Option<Arc<ChainResolver>>,
    hosts: Option<Arc<Hosts>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Router {
    pub fn new(
        node: Node,
        listener: Arc<dyn Listener>,
        handler: Arc<dyn Handler>,
        chain: Arc<Chain>,
        resolver: Option<Arc<ChainResolver>>,
        hosts: Option<Arc<Hosts>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node,
            listener,
            handler,
            chain,
            resolver,
            hosts,
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn local_addr(&self) -> String {
        self.listener.local_addr()
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn resolver(&self) -> Option<&Arc<ChainResolver>> {
        self.resolver.as_ref()
    }

    pub fn hosts(&self) -> Option<&Arc<Hosts>> {
        self.hosts.as_ref()
    }

    /// Accept and dispatch connections until closed or an unrecoverable
    /// listener error. Each connection runs on its own task; nothing here
    /// bounds per-connection concurrency.
    pub async fn serve(&self) -> Result<()> {
        info!("{} on {}", self.node, self.listener.local_addr());

        let mut shutdown = self.shutdown_tx.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handler.handle(stream, peer).await {
                                    debug!("connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept on {} failed: {}", self.listener.local_addr(), e);
                            return Err(e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("{} closing", self.node);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Close this router's listener exactly once; later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener.close();
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn assembly_with_echo_forward() -> (crate::route::Assembly, std::net::SocketAddr) {
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
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

        let route = Route {
            serve_nodes: vec![format!("tcp://127.0.0.1:0/{}", echo_addr)],
            ..Default::default()
        };
        (route.build().await.unwrap(), echo_addr)
    }

    #[tokio::test]
    async fn test_serve_forwards_and_close_unblocks() {
        let (assembly, _echo) = assembly_with_echo_forward().await;
        let router = Arc::new(assembly.routers.into_iter().next().unwrap());
        let addr = router.local_addr();

        let serve_router = router.clone();
        let serve = tokio::spawn(async move { serve_router.serve().await });

        let mut client = tokio::net::TcpStream::connect(&addr).await.unwrap();
        client.write_all(b"through the router").await.unwrap();
        let mut buf = [0u8; 18];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the router");
        drop(client);

        router.close();
        let result = tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("serve did not unblock on close")
            .unwrap();
        assert!(result.is_ok());

        // Closing again is a no-op.
        router.close();
    }

    #[tokio::test]
    async fn test_sibling_routers_close_independently() {
        let route = Route {
            serve_nodes: vec![
                "socks5://127.0.0.1:0".to_string(),
                "socks5://127.0.0.1:0".to_string(),
            ],
            ..Default::default()
        };
        let assembly = route.build().await.unwrap();
        let mut routers = assembly.routers.into_iter();
        let first = Arc::new(routers.next().unwrap());
        let second = Arc::new(routers.next().unwrap());

        let serve_first = first.clone();
        let first_task = tokio::spawn(async move { serve_first.serve().await });
        let serve_second = second.clone();
        let second_task = tokio::spawn(async move { serve_second.serve().await });

        first.close();
        tokio::time::timeout(Duration::from_secs(2), first_task)
            .await
            .expect("first router did not close")
            .unwrap()
            .unwrap();

        // The sibling keeps accepting.
        let addr = second.local_addr();
        tokio::net::TcpStream::connect(&addr).await.unwrap();

        second.close();
        tokio::time::timeout(Duration::from_secs(2), second_task)
            .await
            .expect("second router did not close")
            .unwrap()
            .unwrap();
    }
}
