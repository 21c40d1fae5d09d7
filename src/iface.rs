//! Listen-interface resolution
//!
//! When a serve node names a `sourceInterface`, the listen address must be
//! replaced by that interface's first IPv4 address. Resolution failures abort
//! router construction instead of falling back: a supervisor is expected to
//! restart the process until the interface (e.g. a VPN device) is up, rather
//! than let the service silently bind a wrong address.

use std::net::Ipv4Addr;

use crate::error::{HopError, Result};

/// Resolve the first IPv4 address of a named network interface.
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    let addrs = if_addrs::get_if_addrs()
        .map_err(|e| HopError::Interface(format!("failed to enumerate interfaces: {}", e)))?;

    let mut found = false;
    for iface in addrs {
        if iface.name != name {
            continue;
        }
        found = true;
        if let std::net::IpAddr::V4(v4) = iface.ip() {
            return Ok(v4);
        }
    }

    if found {
        Err(HopError::Interface(format!(
            "interface {} has no IPv4 address",
            name
        )))
    } else {
        Err(HopError::Interface(format!(
            "interface {} does not exist or has no addresses",
            name
        )))
    }
}

/// Replace the host portion of a listen address with the interface's IPv4
/// address, preserving the port.
pub fn override_listen_addr(addr: &str, iface_name: &str) -> Result<String> {
    let ipv4 = interface_ipv4(iface_name)?;
    let port = addr
        .rsplit_once(':')
        .map(|(_, p)| p)
        .ok_or_else(|| HopError::Interface(format!("listen address {} has no port", addr)))?;
    Ok(format!("{}:{}", ipv4, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_fails() {
        let err = interface_ipv4("no-such-iface-xyz").unwrap_err();
        assert!(matches!(err, HopError::Interface(_)));
        assert!(err.to_string().contains("no-such-iface-xyz"));
    }

    #[test]
    fn test_override_listen_addr_unknown_interface() {
        assert!(override_listen_addr(":8080", "eth7-nonexistent").is_err());
    }

    #[test]
    fn test_loopback_resolves() {
        // Loopback exists on every test host; named "lo" on Linux.
        if let Ok(ip) = interface_ipv4("lo") {
            assert!(ip.is_loopback());
            let addr = override_listen_addr(":9000", "lo").unwrap();
            assert_eq!(addr, format!("{}:9000", ip));
        }
    }
}
