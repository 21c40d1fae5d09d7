//! Candidate filters
//!
//! Filters narrow a group's node set before the strategy picks. The fail
//! filter demotes nodes that keep failing without operator intervention; the
//! validity filter guards against structurally broken entries arriving via
//! peer-list reloads.

use std::time::Duration;

use crate::node::Node;

/// Default failure threshold before a node is excluded.
pub const DEFAULT_MAX_FAILS: u32 = 1;
/// Default exclusion window after the threshold is reached.
pub const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Narrows a candidate set.
pub trait Filter: Send + Sync {
    fn filter(&self, nodes: Vec<Node>) -> Vec<Node>;
}

/// Excludes nodes that recorded `max_fails` failures within the trailing
/// `fail_timeout` window. Once the window elapses with no further failures
/// the node re-enters candidacy.
pub struct FailFilter {
    max_fails: u32,
    fail_timeout: Duration,
}

impl FailFilter {
    pub fn new(max_fails: Option<u32>, fail_timeout: Option<Duration>) -> Self {
        Self {
            max_fails: match max_fails {
                Some(n) if n > 0 => n,
                _ => DEFAULT_MAX_FAILS,
            },
            fail_timeout: match fail_timeout {
                Some(t) if !t.is_zero() => t,
                _ => DEFAULT_FAIL_TIMEOUT,
            },
        }
    }
}

impl Filter for FailFilter {
    fn filter(&self, nodes: Vec<Node>) -> Vec<Node> {
        nodes
            .into_iter()
            .filter(|node| !node.marker().is_dead(self.max_fails, self.fail_timeout))
            .collect()
    }
}

/// Excludes structurally invalid nodes (missing address or unusable port).
pub struct InvalidFilter;

impl Filter for InvalidFilter {
    fn filter(&self, nodes: Vec<Node>) -> Vec<Node> {
        nodes.into_iter().filter(|node| node.is_valid()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(addr: &str) -> Node {
        Node::parse(&format!("socks5://{}", addr)).unwrap()
    }

    #[test]
    fn test_fail_filter_excludes_and_readmits() {
        let filter = FailFilter::new(Some(2), Some(Duration::from_millis(40)));
        let a = node("10.0.0.1:1080");
        let b = node("10.0.0.2:1080");

        // One failure: under the threshold, still a candidate.
        a.marker().mark_fail();
        let kept = filter.filter(vec![a.clone(), b.clone()]);
        assert_eq!(kept.len(), 2);

        // Second failure within the window: excluded.
        a.marker().mark_fail();
        let kept = filter.filter(vec![a.clone(), b.clone()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].addr, "10.0.0.2:1080");

        // Window elapses with no further failures: readmitted.
        std::thread::sleep(Duration::from_millis(60));
        let kept = filter.filter(vec![a.clone(), b.clone()]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_fail_filter_success_resets() {
        let filter = FailFilter::new(Some(1), Some(Duration::from_secs(30)));
        let a = node("10.0.0.1:1080");

        a.marker().mark_fail();
        assert!(filter.filter(vec![a.clone()]).is_empty());

        a.marker().mark_success();
        assert_eq!(filter.filter(vec![a.clone()]).len(), 1);
    }

    #[test]
    fn test_fail_filter_defaults() {
        // Zero/absent parameters fall back to the defaults.
        let filter = FailFilter::new(Some(0), Some(Duration::ZERO));
        let a = node("10.0.0.1:1080");
        a.marker().mark_fail();
        // DEFAULT_MAX_FAILS = 1, so one failure excludes.
        assert!(filter.filter(vec![a]).is_empty());
    }

    #[test]
    fn test_invalid_filter() {
        let valid = node("10.0.0.1:1080");
        let no_port = node("10.0.0.1");
        let no_host = node(":1080");

        let kept = InvalidFilter.filter(vec![valid, no_port, no_host]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].addr, "10.0.0.1:1080");
    }
}
