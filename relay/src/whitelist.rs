//! Peer admission for the passthrough listener.
//!
//! The tunnel port is only meant for the handler node, so every accepted
//! connection is checked against a regular expression over the peer IP before
//! it can become the tunnel.

use std::net::{IpAddr, SocketAddr};

use chatops_shared::{Error, Result};
use regex::Regex;

/// Pattern admitting every peer.
pub const DEFAULT_WHITELIST: &str = ".+";

#[derive(Debug, Clone)]
pub struct Whitelist {
    pattern: Regex,
}

impl Whitelist {
    /// Compile a whitelist. The pattern matches anywhere in the address
    /// unless it carries its own `^`/`$` anchors.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| Error::Whitelist(e.to_string()))?;
        Ok(Self { pattern })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Check an IP, IPv4-mapped IPv6 addresses compare as plain IPv4.
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        self.pattern.is_match(&ip.to_string())
    }

    /// Check a peer address, discarding the port. Peers without an IP address
    /// never match.
    pub fn addr_allowed(&self, addr: Option<SocketAddr>) -> bool {
        match addr {
            Some(addr) => self.is_allowed(addr.ip()),
            None => false,
        }
    }
}
