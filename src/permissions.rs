//! Whitelist/blacklist permission rules
//!
//! Grammar: whitespace-separated entries of `actions:hosts:ports`, each field
//! a comma list. `*` matches anything; ports accept `lo-hi` ranges; hosts
//! accept `*.suffix` wildcards.
//!
//! ```text
//! bind,connect:*.corp.example:80,443  connect:10.0.0.1:1000-2000
//! ```

use crate::error::{HopError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
    lo: u16,
    hi: u16,
}

impl PortRange {
    fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self { lo: 0, hi: u16::MAX });
        }
        if let Some((lo, hi)) = s.split_once('-') {
            let lo = lo
                .trim()
                .parse()
                .map_err(|_| HopError::InvalidConfig(format!("invalid port range {}", s)))?;
            let hi = hi
                .trim()
                .parse()
                .map_err(|_| HopError::InvalidConfig(format!("invalid port range {}", s)))?;
            if lo > hi {
                return Err(HopError::InvalidConfig(format!("invalid port range {}", s)));
            }
            return Ok(Self { lo, hi });
        }
        let port = s
            .parse()
            .map_err(|_| HopError::InvalidConfig(format!("invalid port {}", s)))?;
        Ok(Self { lo: port, hi: port })
    }

    fn contains(&self, port: u16) -> bool {
        (self.lo..=self.hi).contains(&port)
    }
}

#[derive(Debug, Clone)]
struct Permission {
    actions: Vec<String>,
    hosts: Vec<String>,
    ports: Vec<PortRange>,
}

impl Permission {
    fn parse(entry: &str) -> Result<Self> {
        let fields: Vec<&str> = entry.split(':').collect();
        let (actions, hosts, ports) = match fields.as_slice() {
            [actions, hosts, ports] => (*actions, *hosts, *ports),
            _ => {
                return Err(HopError::InvalidConfig(format!(
                    "invalid permission entry {} (want actions:hosts:ports)",
                    entry
                )))
            }
        };

        Ok(Self {
            actions: split_list(actions),
            hosts: split_list(hosts),
            ports: ports
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(PortRange::parse)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    fn grants(&self, action: &str, host: &str, port: u16) -> bool {
        let action_ok = self
            .actions
            .iter()
            .any(|a| a == "*" || a.eq_ignore_ascii_case(action));
        let host_ok = self.hosts.iter().any(|h| host_matches(h, host));
        let port_ok = self.ports.iter().any(|r| r.contains(port));
        action_ok && host_ok && port_ok
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let host = host.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{}", suffix));
    }
    host == *pattern
}

/// A parsed permission rule set. An empty set grants nothing; whether a set
/// acts as a whitelist or blacklist is up to the consulting handler.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    rules: Vec<Permission>,
}

impl Permissions {
    /// Parse a rule-set string; malformed entries abort construction.
    pub fn parse(s: &str) -> Result<Self> {
        let rules = s
            .split_whitespace()
            .map(Permission::parse)
            .collect::<Result<Vec<_>>>()?;
        if rules.is_empty() {
            return Err(HopError::InvalidConfig(
                "empty permission rule set".to_string(),
            ));
        }
        Ok(Self { rules })
    }

    /// Whether any rule grants `action` on `host:port`.
    pub fn can(&self, action: &str, host: &str, port: u16) -> bool {
        self.rules.iter().any(|r| r.grants(action, host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_permission() {
        let perms = Permissions::parse("*:*:*").unwrap();
        assert!(perms.can("connect", "anything.example", 12345));
        assert!(perms.can("bind", "10.0.0.1", 80));
    }

    #[test]
    fn test_scoped_permission() {
        let perms = Permissions::parse("connect:*.corp.example:80,443").unwrap();
        assert!(perms.can("connect", "git.corp.example", 443));
        assert!(perms.can("CONNECT", "corp.example", 80));
        assert!(!perms.can("connect", "git.corp.example", 8080));
        assert!(!perms.can("connect", "evil.example", 443));
        assert!(!perms.can("bind", "git.corp.example", 443));
    }

    #[test]
    fn test_port_ranges() {
        let perms = Permissions::parse("connect:10.0.0.1:1000-2000").unwrap();
        assert!(perms.can("connect", "10.0.0.1", 1000));
        assert!(perms.can("connect", "10.0.0.1", 1500));
        assert!(perms.can("connect", "10.0.0.1", 2000));
        assert!(!perms.can("connect", "10.0.0.1", 999));
        assert!(!perms.can("connect", "10.0.0.1", 2001));
    }

    #[test]
    fn test_multiple_entries() {
        let perms = Permissions::parse("connect:a.example:80 bind:b.example:81").unwrap();
        assert!(perms.can("connect", "a.example", 80));
        assert!(perms.can("bind", "b.example", 81));
        assert!(!perms.can("connect", "b.example", 81));
    }

    #[test]
    fn test_malformed_entries_abort() {
        assert!(Permissions::parse("").is_err());
        assert!(Permissions::parse("connect:host").is_err());
        assert!(Permissions::parse("connect:host:80:extra").is_err());
        assert!(Permissions::parse("connect:host:not-a-port").is_err());
        assert!(Permissions::parse("connect:host:9-1").is_err());
    }
}
