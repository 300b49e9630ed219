//! Rate-limit bucket derivation and network range expansion.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::Result;

/// Compute the rate-limit bucket for a target string.
///
/// IPv4 addresses map to their containing /24, IPv6 addresses to their
/// containing /48, anything else (hostnames, CIDRs, junk) buckets verbatim.
/// Total and deterministic; equal buckets compare byte-equal.
pub fn hashval(value: &str) -> String {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => {
            if let Ok(net) = Ipv4Net::new(addr, 24) {
                return net.trunc().to_string();
            }
            value.to_string()
        }
        Ok(IpAddr::V6(addr)) => {
            if let Ok(net) = Ipv6Net::new(addr, 48) {
                return net.trunc().to_string();
            }
            value.to_string()
        }
        Err(_) => value.to_string(),
    }
}

/// Expand a CIDR or single address into the ordered list of host addresses.
///
/// Parses non-strict (host bits allowed; the enclosing network is used).
/// Prefixes shorter than a point-to-point link also yield the network
/// address and, for IPv4, the broadcast address.
pub fn enumerate_network(arg: &str) -> Result<Vec<String>> {
    let net = match arg.parse::<IpNet>() {
        Ok(net) => net.trunc(),
        Err(_) => IpNet::from(arg.parse::<IpAddr>()?),
    };

    match net {
        IpNet::V4(net) => {
            let mut hosts = Vec::new();
            if net.prefix_len() < 31 {
                hosts.push(net.network().to_string());
            }
            hosts.extend(net.hosts().map(|addr| addr.to_string()));
            if net.prefix_len() < 31 {
                hosts.push(net.broadcast().to_string());
            }
            Ok(hosts)
        }
        // no broadcast in v6; hosts() already covers the whole range
        IpNet::V6(net) => Ok(net.hosts().map(|addr| addr.to_string()).collect()),
    }
}
