//! Peer-list reload
//!
//! A group whose first node carries a `peer` option keeps its membership in
//! sync with an external file: a synchronous seed load at startup, then an
//! unsupervised periodic reload for the rest of the process lifetime. Reload
//! failures are logged and the previous snapshot stays untouched; they never
//! block the serving path.
//!
//! File format, line oriented:
//!
//! ```text
//! # comment
//! strategy     random
//! max_fails    3
//! fail_timeout 60
//! reload       10
//! peer         socks5://10.0.0.2:1080
//! peer         socks5://10.0.0.3:1080
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::chain::filter::{FailFilter, Filter, InvalidFilter};
use crate::chain::group::NodeGroup;
use crate::chain::strategy::new_strategy;
use crate::error::{HopError, Result};
use crate::node::Node;
use crate::route::parse_chain_node;

const DEFAULT_RELOAD_SECS: u64 = 30;

/// Parsed contents of one peer file.
#[derive(Debug, Default)]
struct PeerFile {
    specs: Vec<String>,
    strategy: Option<String>,
    max_fails: Option<u32>,
    fail_timeout: Option<Duration>,
    reload: Option<u64>,
}

fn parse_peer_file(content: &str) -> PeerFile {
    let mut parsed = PeerFile::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((k, v)) => (k, v.trim()),
            None => continue,
        };
        match key {
            "peer" => parsed.specs.push(value.to_string()),
            "strategy" => parsed.strategy = Some(value.to_string()),
            "max_fails" => parsed.max_fails = value.parse().ok(),
            "fail_timeout" => {
                parsed.fail_timeout = value.parse().ok().map(Duration::from_secs)
            }
            "reload" => parsed.reload = value.parse().ok(),
            _ => {}
        }
    }
    parsed
}

/// Keeps one group's membership in sync with its peer file.
pub struct PeerConfig {
    path: String,
    group: Arc<NodeGroup>,
    base_nodes: Vec<Node>,
    period_secs: AtomicU64,
}

impl PeerConfig {
    pub fn new(path: impl Into<String>, group: Arc<NodeGroup>, base_nodes: Vec<Node>) -> Self {
        Self {
            path: path.into(),
            group,
            base_nodes,
            period_secs: AtomicU64::new(DEFAULT_RELOAD_SECS),
        }
    }

    /// Load the file and atomically publish the merged membership.
    ///
    /// An unreadable file is an error (fatal at startup seed time, logged by
    /// the reload task afterwards); individual malformed peer specs are
    /// skipped so one bad line cannot empty a hop.
    pub fn load(&self) -> Result<()> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            HopError::InvalidConfig(format!("failed to read peer file {}: {}", self.path, e))
        })?;
        let parsed = parse_peer_file(&content);

        if let Some(reload) = parsed.reload {
            self.period_secs
                .store(reload.max(1), Ordering::Relaxed);
        }

        let mut nodes = self.base_nodes.clone();
        let base_dial = self.base_nodes.first().map(|n| n.dial_options.clone());
        for spec in &parsed.specs {
            match parse_chain_node(spec) {
                Ok(expanded) => nodes.extend(expanded.into_iter().map(|mut node| {
                    // Peer nodes inherit the chain-wide routing mark and
                    // bound interface from the base configuration.
                    if let Some(dial) = &base_dial {
                        node.dial_options.mark = dial.mark;
                        node.dial_options.interface = dial.interface.clone();
                    }
                    node
                })),
                Err(e) => warn!("skipping peer spec {}: {}", spec, e),
            }
        }
        for (i, node) in nodes.iter_mut().enumerate() {
            node.id = i + 1;
        }

        if parsed.strategy.is_some() || parsed.max_fails.is_some() || parsed.fail_timeout.is_some()
        {
            let filters: Vec<Arc<dyn Filter>> = vec![
                Arc::new(FailFilter::new(parsed.max_fails, parsed.fail_timeout)),
                Arc::new(InvalidFilter),
            ];
            self.group
                .set_selector(filters, new_strategy(parsed.strategy.as_deref()));
        }

        debug!(
            "peer reload from {}: {} nodes in group {}",
            self.path,
            nodes.len(),
            self.group.id
        );
        self.group.set_nodes(nodes);
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs.load(Ordering::Relaxed))
    }

    /// Run the periodic reload until shutdown. Errors are logged, never
    /// propagated.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.period()) => {
                        if let Err(e) = self.load() {
                            warn!("peer reload failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("peer reload for group {} shutting down", self.group.id);
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Shutdown handle for a group's reload task.
pub struct PeerReloadHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl PeerReloadHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, content: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("hopchain-peer-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn base_nodes() -> Vec<Node> {
        let mut node = Node::parse("socks5://10.0.0.1:1080").unwrap();
        node.id = 1;
        vec![node]
    }

    #[test]
    fn test_parse_peer_file() {
        let parsed = parse_peer_file(
            "# peers\nstrategy random\nmax_fails 3\nfail_timeout 60\nreload 10\npeer socks5://a:1080\npeer http://b:8080\nnoise\n",
        );
        assert_eq!(parsed.specs.len(), 2);
        assert_eq!(parsed.strategy.as_deref(), Some("random"));
        assert_eq!(parsed.max_fails, Some(3));
        assert_eq!(parsed.fail_timeout, Some(Duration::from_secs(60)));
        assert_eq!(parsed.reload, Some(10));
    }

    #[tokio::test]
    async fn test_seed_load_merges_peers_after_base() {
        let path = temp_file(
            "seed",
            "peer socks5://10.0.0.2:1080\npeer socks5://10.0.0.3:1080\n",
        );
        let group = Arc::new(NodeGroup::new(1));
        let config = PeerConfig::new(path.to_str().unwrap(), group.clone(), base_nodes());

        config.load().unwrap();
        let nodes = group.nodes();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].addr, "10.0.0.1:1080");
        assert_eq!(nodes[1].addr, "10.0.0.2:1080");
        assert_eq!(nodes[2].addr, "10.0.0.3:1080");
        // IDs renumbered sequentially across base + peers.
        assert_eq!(
            nodes.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_bad_specs_are_skipped_not_fatal() {
        let path = temp_file(
            "badspec",
            "peer socks5://10.0.0.2:1080\npeer socks5://bad:not-a-port\n",
        );
        let group = Arc::new(NodeGroup::new(1));
        let config = PeerConfig::new(path.to_str().unwrap(), group.clone(), base_nodes());

        config.load().unwrap();
        assert_eq!(group.nodes().len(), 2);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_error_and_retains_snapshot() {
        let group = Arc::new(NodeGroup::with_nodes(1, base_nodes()));
        let config = PeerConfig::new("/nonexistent/peers.txt", group.clone(), base_nodes());

        assert!(config.load().is_err());
        // Previous membership untouched.
        assert_eq!(group.nodes().len(), 1);
    }

    #[test]
    fn test_reload_period_from_file() {
        let path = temp_file("period", "reload 10\n");
        let group = Arc::new(NodeGroup::new(1));
        let config = PeerConfig::new(path.to_str().unwrap(), group, base_nodes());

        assert_eq!(config.period(), Duration::from_secs(DEFAULT_RELOAD_SECS));
        config.load().unwrap();
        assert_eq!(config.period(), Duration::from_secs(10));

        std::fs::remove_file(&path).unwrap();
    }
}
