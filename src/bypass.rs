//! Bypass rules
//!
//! A bypass set decides which destinations should skip the proxy chain.
//! Rules are a comma-separated list of CIDR ranges, IP literals, exact host
//! names, or `*.`-style wildcard domains. A leading `~` reverses the set
//! (whitelist mode: only matching destinations go through).

use std::net::IpAddr;

use ipnet::IpNet;

/// One bypass matcher.
#[derive(Debug, Clone)]
enum Matcher {
    Cidr(IpNet),
    Ip(IpAddr),
    /// Wildcard domain suffix, stored without the leading `*.`.
    Wildcard(String),
    Exact(String),
}

impl Matcher {
    fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return None;
        }
        if let Ok(net) = pattern.parse::<IpNet>() {
            return Some(Matcher::Cidr(net));
        }
        if let Ok(ip) = pattern.parse::<IpAddr>() {
            return Some(Matcher::Ip(ip));
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            return Some(Matcher::Wildcard(suffix.to_ascii_lowercase()));
        }
        Some(Matcher::Exact(pattern.to_ascii_lowercase()))
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>) -> bool {
        match self {
            Matcher::Cidr(net) => ip.map(|ip| net.contains(&ip)).unwrap_or(false),
            Matcher::Ip(rule_ip) => ip.map(|ip| ip == *rule_ip).unwrap_or(false),
            Matcher::Wildcard(suffix) => {
                let host = host.to_ascii_lowercase();
                host == *suffix || host.ends_with(&format!(".{}", suffix))
            }
            Matcher::Exact(name) => host.eq_ignore_ascii_case(name),
        }
    }
}

/// A set of bypass rules with optional reversal.
#[derive(Debug, Clone, Default)]
pub struct Bypass {
    reversed: bool,
    matchers: Vec<Matcher>,
}

impl Bypass {
    /// Parse a bypass option string. Returns `None` for an absent/empty option.
    pub fn parse(s: Option<&str>) -> Option<Self> {
        let s = s?.trim();
        if s.is_empty() {
            return None;
        }
        let (reversed, body) = match s.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let matchers: Vec<Matcher> = body.split(',').filter_map(Matcher::parse).collect();
        if matchers.is_empty() {
            return None;
        }
        Some(Self { reversed, matchers })
    }

    /// Whether `addr` (a `host[:port]` string) is bypassed.
    pub fn contains(&self, addr: &str) -> bool {
        let host = strip_port(addr);
        if host.is_empty() {
            return false;
        }
        let ip = host.parse::<IpAddr>().ok();
        let matched = self.matchers.iter().any(|m| m.matches(host, ip));
        matched != self.reversed
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }
}

/// Strip a trailing `:port` while leaving IPv6 literals intact.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        // More than one colon and no brackets: bare IPv6 literal.
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => addr,
    }
}
