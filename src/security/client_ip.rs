//! Client identity extraction.
//!
//! # Responsibilities
//! - Resolve the client IP: X-Forwarded-For first hop, then X-Real-IP, then the
//!   peer address, then "unknown"
//! - Honour forwarding headers only from trusted peers
//!
//! # Design Decisions
//! - Forwarding headers are ignored unless `trust_proxy_headers` is on
//! - With trust on and no proxy list, every peer is trusted
//! - Header values that do not parse as an IP are skipped, never used as keys

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use axum::http::HeaderMap;
use thiserror::Error;

use crate::config::RateLimitConfig;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Identity used when nothing else is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid trusted proxy '{0}': expected an IP address or CIDR block")]
pub struct InvalidProxy(String);

/// A peer allowed to set forwarding headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedProxy {
    network: IpAddr,
    prefix: u8,
}

impl TrustedProxy {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for TrustedProxy {
    type Err = InvalidProxy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidProxy(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }
}

impl fmt::Display for TrustedProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Resolves the client IP for a request.
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trust_headers: bool,
    trusted: Vec<TrustedProxy>,
}

impl ClientIpResolver {
    pub fn new(trust_headers: bool, trusted: Vec<TrustedProxy>) -> Self {
        Self {
            trust_headers,
            trusted,
        }
    }

    /// Build from config. Entries that fail to parse are dropped with a warning;
    /// validation rejects them before this point in normal startup.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let trusted = config
            .trusted_proxies
            .iter()
            .filter_map(|p| match p.parse::<TrustedProxy>() {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring trusted proxy entry");
                    None
                }
            })
            .collect();
        Self::new(config.trust_proxy_headers, trusted)
    }

    fn peer_is_trusted(&self, peer: Option<IpAddr>) -> bool {
        if !self.trust_headers {
            return false;
        }
        if self.trusted.is_empty() {
            return true;
        }
        peer.is_some_and(|ip| self.trusted.iter().any(|p| p.contains(ip)))
    }

    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let peer_ip = peer.map(|p| p.ip());

        if self.peer_is_trusted(peer_ip) {
            let forwarded = header_str(headers, X_FORWARDED_FOR)
                .and_then(|v| v.split(',').next())
                .and_then(parse_ip);
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
            if let Some(ip) = header_str(headers, X_REAL_IP).and_then(parse_ip) {
                return ip.to_string();
            }
        }

        match peer_ip {
            Some(ip) => ip.to_canonical().to_string(),
            None => UNKNOWN_CLIENT.to_string(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn peer(s: &str) -> Option<SocketAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_parse_trusted_proxy() {
        let net: TrustedProxy = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        assert!(net.contains("::ffff:10.9.9.9".parse().unwrap()));

        let single: TrustedProxy = "192.168.1.5".parse().unwrap();
        assert_eq!(single.to_string(), "192.168.1.5/32");

        let v6: TrustedProxy = "fd00::/8".parse().unwrap();
        assert!(v6.contains("fd12::1".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<TrustedProxy>().is_err());
        assert!("not-an-ip".parse::<TrustedProxy>().is_err());
        assert!("0.0.0.0/0".parse::<TrustedProxy>().unwrap().contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_resolution_order_when_trusted() {
        let resolver = ClientIpResolver::new(true, Vec::new());
        let h = headers(&[
            (X_FORWARDED_FOR, "203.0.113.7, 10.0.0.1"),
            (X_REAL_IP, "198.51.100.2"),
        ]);
        assert_eq!(resolver.resolve(&h, peer("10.0.0.1:4000")), "203.0.113.7");

        let h = headers(&[(X_REAL_IP, "198.51.100.2")]);
        assert_eq!(resolver.resolve(&h, peer("10.0.0.1:4000")), "198.51.100.2");

        let h = headers(&[(X_FORWARDED_FOR, "garbage")]);
        assert_eq!(resolver.resolve(&h, peer("10.0.0.1:4000")), "10.0.0.1");

        assert_eq!(resolver.resolve(&HeaderMap::new(), None), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_headers_ignored_from_untrusted_peers() {
        let h = headers(&[(X_FORWARDED_FOR, "203.0.113.7")]);

        let off = ClientIpResolver::new(false, Vec::new());
        assert_eq!(off.resolve(&h, peer("10.0.0.1:4000")), "10.0.0.1");

        let listed = ClientIpResolver::new(true, vec!["10.0.0.0/8".parse().unwrap()]);
        assert_eq!(listed.resolve(&h, peer("10.0.0.1:4000")), "203.0.113.7");
        assert_eq!(listed.resolve(&h, peer("172.16.0.1:4000")), "172.16.0.1");
    }
}
