//! Address validation, parsing, and optional host name resolution.
//!
//! Accepted forms: `1.2.3.4`, `1.2.3.4:27020`, `::1`, `[::1]`, `[::1]:27020`.
//! A missing port parses as port 0.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use tracing::debug;

use crate::error::TransportError;

/// Parse an IP literal with an optional port.
pub fn parse_peer_address(address: &str) -> Result<SocketAddr, TransportError> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let bare = address
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(address);

    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 0))
        .map_err(|_| TransportError::InvalidAddress(format!("could not parse {address:?}")))
}

/// Whether `address` is an IPv4/IPv6 literal, optionally with a port.
pub fn is_valid_ip_address(address: &str) -> bool {
    parse_peer_address(address).is_ok()
}

/// Resolve a host name to its first IP address using the system resolver.
///
/// `None` is a normal outcome (unknown host, no resolver, offline machine).
/// Callers treat resolution as optional and never block a connection attempt on it.
pub fn resolve_domain_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }

    match (name, 0u16).to_socket_addrs() {
        Ok(mut addrs) => addrs.next().map(|addr| addr.ip().to_string()),
        Err(e) => {
            debug!("Could not resolve {name}: {e}");
            None
        }
    }
}
