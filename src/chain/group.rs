//! Node groups
//!
//! A group is one logical hop: a set of interchangeable candidate nodes, a
//! filter chain and a selection strategy. Membership lives behind an
//! atomically swappable snapshot so a reload never tears an in-flight
//! selection.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::chain::filter::Filter;
use crate::chain::strategy::{new_strategy, Strategy};
use crate::error::{HopError, Result};
use crate::node::Node;

struct Selector {
    filters: Vec<Arc<dyn Filter>>,
    strategy: Arc<dyn Strategy>,
}

/// A named hop: candidate nodes + selection policy.
pub struct NodeGroup {
    /// Sequential group ID (1-based position among chain-node specs).
    pub id: usize,
    nodes: ArcSwap<Vec<Node>>,
    selector: RwLock<Selector>,
}

impl NodeGroup {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            nodes: ArcSwap::from_pointee(Vec::new()),
            selector: RwLock::new(Selector {
                filters: Vec::new(),
                strategy: new_strategy(None),
            }),
        }
    }

    pub fn with_nodes(id: usize, nodes: Vec<Node>) -> Self {
        let group = Self::new(id);
        group.set_nodes(nodes);
        group
    }

    /// Atomically replace the whole membership snapshot.
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.nodes.store(Arc::new(nodes));
    }

    /// Current membership snapshot.
    pub fn nodes(&self) -> Arc<Vec<Node>> {
        self.nodes.load_full()
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }

    /// Install the filter chain and strategy.
    pub fn set_selector(&self, filters: Vec<Arc<dyn Filter>>, strategy: Arc<dyn Strategy>) {
        let mut selector = self.selector.write();
        selector.filters = filters;
        selector.strategy = strategy;
    }

    pub fn strategy_name(&self) -> &'static str {
        self.selector.read().strategy.name()
    }

    /// Pick one node for a dial attempt: filters narrow the snapshot, then
    /// the strategy selects.
    pub fn select(&self) -> Result<Node> {
        let snapshot = self.nodes.load_full();
        let selector = self.selector.read();

        let mut candidates: Vec<Node> = snapshot.as_ref().clone();
        for filter in &selector.filters {
            candidates = filter.filter(candidates);
        }

        selector
            .strategy
            .apply(&candidates)
            .ok_or(HopError::NoNodesAvailable)
    }
}

impl std::fmt::Debug for NodeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGroup")
            .field("id", &self.id)
            .field("nodes", &self.nodes.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::filter::FailFilter;
    use std::time::Duration;

    fn nodes(n: usize) -> Vec<Node> {
        (1..=n)
            .map(|i| {
                let mut node = Node::parse(&format!("socks5://10.0.0.{}:1080", i)).unwrap();
                node.id = i;
                node
            })
            .collect()
    }

    #[test]
    fn test_select_round_robin_default() {
        let group = NodeGroup::with_nodes(1, nodes(2));
        assert_eq!(group.select().unwrap().id, 1);
        assert_eq!(group.select().unwrap().id, 2);
        assert_eq!(group.select().unwrap().id, 1);
    }

    #[test]
    fn test_select_empty_group() {
        let group = NodeGroup::new(1);
        assert!(matches!(group.select(), Err(HopError::NoNodesAvailable)));
    }

    #[test]
    fn test_fail_filter_applies_to_selection() {
        let group = NodeGroup::with_nodes(1, nodes(2));
        group.set_selector(
            vec![Arc::new(FailFilter::new(
                Some(1),
                Some(Duration::from_secs(30)),
            ))],
            new_strategy(Some("fifo")),
        );

        // Kill the first node: fifo must now land on the second.
        group.nodes()[0].marker().mark_fail();
        assert_eq!(group.select().unwrap().id, 2);
    }

    #[test]
    fn test_snapshot_swap_does_not_disturb_old_reference() {
        let group = NodeGroup::with_nodes(1, nodes(2));
        let before = group.nodes();

        group.set_nodes(nodes(5));
        assert_eq!(before.len(), 2);
        assert_eq!(group.len(), 5);
    }

    #[test]
    fn test_selection_shares_health_with_snapshot() {
        let group = NodeGroup::with_nodes(1, nodes(1));
        let selected = group.select().unwrap();
        selected.marker().mark_fail();
        assert_eq!(group.nodes()[0].marker().fail_count(), 1);
    }
}
