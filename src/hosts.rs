//! Static host-override table
//!
//! Parsed from a hosts-format file named by the `hosts` option: one
//! `ip name [aliases...]` mapping per line. Handlers consult the table
//! before asking the resolver.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::warn;

/// Host-to-IP override table.
#[derive(Debug, Clone, Default)]
pub struct Hosts {
    entries: HashMap<String, IpAddr>,
}

impl Hosts {
    /// Parse a hosts file named by the option. Returns `None` when the option
    /// is absent or the file is unreadable (overrides are best-effort; a bad
    /// table must not abort router construction).
    pub fn parse(path: Option<&str>) -> Option<Self> {
        let path = match path {
            Some(p) if !p.is_empty() => p,
            _ => return None,
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to read hosts file {}: {}", path, e);
                return None;
            }
        };
        Some(Self::from_content(&content))
    }

    fn from_content(content: &str) -> Self {
        let mut entries = HashMap::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let ip = match parts.next().and_then(|s| s.parse::<IpAddr>().ok()) {
                Some(ip) => ip,
                None => continue,
            };
            for name in parts {
                entries.insert(name.to_ascii_lowercase(), ip);
            }
        }
        Self { entries }
    }

    /// Look up an override for a host name.
    pub fn lookup(&self, name: &str) -> Option<IpAddr> {
        self.entries.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content() {
        let hosts = Hosts::from_content(
            "# comment\n10.0.0.1 router router.lan\n192.168.0.5 nas # trailing\nbadline\n",
        );
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts.lookup("router"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(hosts.lookup("ROUTER.LAN"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(hosts.lookup("nas"), Some("192.168.0.5".parse().unwrap()));
        assert_eq!(hosts.lookup("unknown"), None);
    }

    #[test]
    fn test_parse_absent_option() {
        assert!(Hosts::parse(None).is_none());
        assert!(Hosts::parse(Some("")).is_none());
        assert!(Hosts::parse(Some("/nonexistent/hosts")).is_none());
    }
}
