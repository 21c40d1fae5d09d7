//! Multi-hop relay chains
//!
//! A [`Chain`] is an ordered sequence of [`NodeGroup`]s: the relay path from
//! the local process to the final destination. An empty chain dials the
//! destination directly. Connecting walks the groups in order, dialing the
//! first hop with its transporter and then negotiating each subsequent hop
//! over the previous one's connector.

pub mod filter;
pub mod group;
pub mod peer;
pub mod strategy;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatch::transport::tcp_dial;
use crate::dispatch::{Connector, DialOptions, Transporter, TransportStream};
use crate::error::{HopError, Result};
use crate::node::Node;

pub use group::NodeGroup;

/// An ordered multi-hop relay path.
pub struct Chain {
    groups: Vec<Arc<NodeGroup>>,
    /// Per-connect retry budget.
    pub retries: u32,
    /// Routing mark applied to outbound sockets.
    pub mark: u32,
    /// Outbound interface bound by direct dials and first hops.
    pub interface: String,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            retries: 1,
            mark: 0,
            interface: String::new(),
        }
    }

    pub fn add_node_group(&mut self, group: Arc<NodeGroup>) {
        self.groups.push(group);
    }

    pub fn groups(&self) -> &[Arc<NodeGroup>] {
        &self.groups
    }

    /// No relay hops: dial destinations directly.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Representative node of the last hop, for callers that special-case the
    /// final transport (SSH port-forwarding listeners).
    pub fn last_node(&self) -> Option<Node> {
        self.groups.last().and_then(|g| g.nodes().first().cloned())
    }

    /// Replace the last group's client capabilities in place. Used when a
    /// listener natively speaks the final hop's forwarding semantics instead
    /// of re-wrapping it.
    pub fn substitute_last_client(
        &self,
        connector: Arc<dyn Connector>,
        transporter: Arc<dyn Transporter>,
    ) {
        let group = match self.groups.last() {
            Some(g) => g,
            None => return,
        };
        let nodes: Vec<Node> = group
            .nodes()
            .iter()
            .map(|node| {
                let mut node = node.clone();
                node.client = Some(crate::dispatch::Client::new(
                    connector.clone(),
                    transporter.clone(),
                ));
                node
            })
            .collect();
        group.set_nodes(nodes);
    }

    /// Select one node per group for this attempt, honoring per-node bypass:
    /// once a selected node bypasses the target, the route ends before it.
    pub fn route_for(&self, target: &str) -> Result<Vec<Node>> {
        let mut route = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let node = group.select()?;
            if node
                .bypass
                .as_ref()
                .map(|b| b.contains(target))
                .unwrap_or(false)
            {
                debug!("{} bypasses {}", node, target);
                break;
            }
            route.push(node);
        }
        Ok(route)
    }

    /// Establish a stream to `target` through the chain, retrying alternate
    /// candidates up to the configured retry budget.
    pub async fn connect(&self, target: &str) -> Result<TransportStream> {
        self.connect_retries(target, self.retries).await
    }

    /// Like [`connect`](Self::connect) with an explicit retry budget, for
    /// handlers that override the chain's global setting.
    pub async fn connect_retries(&self, target: &str, retries: u32) -> Result<TransportStream> {
        let attempts = retries.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            match self.try_connect(target).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!("connect {} attempt {} failed: {}", target, attempt + 1, e);
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(HopError::ChainExhausted { attempts }))
    }

    async fn try_connect(&self, target: &str) -> Result<TransportStream> {
        let route = if self.is_empty() {
            Vec::new()
        } else {
            self.route_for(target)?
        };

        if route.is_empty() {
            let opts = DialOptions {
                timeout: None,
                host: String::new(),
                mark: self.mark,
                interface: self.interface.clone(),
            };
            let stream = tcp_dial(target, &opts).await?;
            return Ok(Box::new(stream));
        }

        // First hop: raw dial plus transport handshake.
        let first = &route[0];
        let client = first.client()?.clone();
        let stream = match client.transporter.dial(&first.addr, &first.dial_options).await {
            Ok(stream) => stream,
            Err(e) => {
                first.marker().mark_fail();
                return Err(e);
            }
        };
        let mut stream = match client
            .transporter
            .handshake(stream, &first.handshake_options)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                first.marker().mark_fail();
                return Err(e);
            }
        };
        first.marker().mark_success();

        // Intermediate hops: negotiate through the previous hop, then run the
        // next hop's transport handshake on top.
        let mut prev = first;
        for node in &route[1..] {
            let negotiated = prev
                .client()?
                .connector
                .connect(stream, &node.addr, &prev.connect_options)
                .await;
            let negotiated = match negotiated {
                Ok(s) => s,
                Err(e) => {
                    node.marker().mark_fail();
                    return Err(e);
                }
            };
            stream = match node
                .client()?
                .transporter
                .handshake(negotiated, &node.handshake_options)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    node.marker().mark_fail();
                    return Err(e);
                }
            };
            node.marker().mark_success();
            prev = node;
        }

        // Final leg: the last hop negotiates to the destination itself.
        prev.client()?
            .connector
            .connect(stream, target, &prev.connect_options)
            .await
    }

    /// Dial options a direct (chain-less) path would use; exposed for
    /// collaborators that dial on the chain's behalf.
    pub fn direct_dial_options(&self) -> DialOptions {
        DialOptions {
            timeout: Some(Duration::from_secs(10)),
            host: String::new(),
            mark: self.mark,
            interface: self.interface.clone(),
        }
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("groups", &self.groups.len())
            .field("retries", &self.retries)
            .field("mark", &self.mark)
            .field("interface", &self.interface)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::Bypass;

    fn group_of(id: usize, addrs: &[&str]) -> Arc<NodeGroup> {
        let nodes: Vec<Node> = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                let mut node = Node::parse(&format!("socks5://{}", addr)).unwrap();
                node.id = i + 1;
                node
            })
            .collect();
        Arc::new(NodeGroup::with_nodes(id, nodes))
    }

    #[test]
    fn test_empty_chain() {
        let chain = Chain::new();
        assert!(chain.is_empty());
        assert!(chain.last_node().is_none());
        assert!(chain.route_for("example.com:80").unwrap().is_empty());
    }

    #[test]
    fn test_hop_order_is_spec_order() {
        let mut chain = Chain::new();
        chain.add_node_group(group_of(1, &["10.0.0.1:1080"]));
        chain.add_node_group(group_of(2, &["10.0.1.1:1080"]));

        let route = chain.route_for("example.com:80").unwrap();
        assert_eq!(route.len(), 2);
        assert_eq!(route[0].addr, "10.0.0.1:1080");
        assert_eq!(route[1].addr, "10.0.1.1:1080");

        assert_eq!(chain.last_node().unwrap().addr, "10.0.1.1:1080");
    }

    #[test]
    fn test_route_stops_at_bypassing_node() {
        let mut chain = Chain::new();
        chain.add_node_group(group_of(1, &["10.0.0.1:1080"]));

        let bypassing = {
            let mut node = Node::parse("socks5://10.0.1.1:1080").unwrap();
            node.id = 1;
            node.bypass = Bypass::parse(Some("*.internal.example")).map(Arc::new);
            node
        };
        chain.add_node_group(Arc::new(NodeGroup::with_nodes(2, vec![bypassing])));

        let route = chain.route_for("db.internal.example:5432").unwrap();
        assert_eq!(route.len(), 1);

        let route = chain.route_for("example.com:80").unwrap();
        assert_eq!(route.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_chain_dials_direct() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let chain = Chain::new();
        let stream = chain.connect(&addr.to_string()).await;
        assert!(stream.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_dial_marks_node() {
        let mut chain = Chain::new();
        // Unroutable port on localhost fails fast.
        let group = group_of(1, &["127.0.0.1:1"]);
        // The group's nodes need a client to dial with.
        let nodes: Vec<Node> = group
            .nodes()
            .iter()
            .map(|n| {
                let mut n = n.clone();
                n.client = Some(crate::dispatch::Client::new(
                    crate::dispatch::connector::ssh_direct_forward_connector(),
                    Arc::new(crate::dispatch::transport::TcpTransporter),
                ));
                n
            })
            .collect();
        group.set_nodes(nodes);
        chain.add_node_group(group.clone());
        chain.retries = 2;

        let result = chain.connect("example.com:80").await;
        assert!(result.is_err());
        assert!(group.nodes()[0].marker().fail_count() >= 1);
    }
}
