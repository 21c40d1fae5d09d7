//! Node selection strategies
//!
//! A strategy picks one node from the filtered candidate set, once per
//! outbound dial attempt. Nothing is cached between attempts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::node::Node;

/// Selection policy over a filtered candidate set.
pub trait Strategy: Send + Sync {
    /// Select one node; `None` when the candidate set is empty.
    fn apply(&self, nodes: &[Node]) -> Option<Node>;

    fn name(&self) -> &'static str;
}

/// Create a strategy from a node's `strategy` option.
///
/// Unknown or absent names default to round-robin.
pub fn new_strategy(name: Option<&str>) -> Arc<dyn Strategy> {
    match name.unwrap_or("") {
        "random" => Arc::new(RandomStrategy),
        "fifo" => Arc::new(FifoStrategy),
        _ => Arc::new(RoundStrategy::new()),
    }
}

/// Cycles through candidates with an atomic counter.
pub struct RoundStrategy {
    counter: AtomicUsize,
}

impl RoundStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RoundStrategy {
    fn apply(&self, nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        nodes.get(idx).cloned()
    }

    fn name(&self) -> &'static str {
        "round"
    }
}

/// Uniformly random pick.
pub struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn apply(&self, nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..nodes.len());
        nodes.get(idx).cloned()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// First-alive order: always the first surviving candidate.
pub struct FifoStrategy;

impl Strategy for FifoStrategy {
    fn apply(&self, nodes: &[Node]) -> Option<Node> {
        nodes.first().cloned()
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}
