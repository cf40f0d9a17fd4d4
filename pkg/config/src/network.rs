//! CIDR parsing and address derivation
//!
//! Pod and service ranges are given as `"IPv4CIDR[,IPv6CIDR]"`.

use crate::ConfigError;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Parse a comma separated list holding at most one IPv4 and one IPv6 CIDR.
pub fn parse_cidrs(cidrs: &str) -> Result<Vec<IpNetwork>, ConfigError> {
    let networks = cidrs
        .split(',')
        .map(str::trim)
        .filter(|cidr| !cidr.is_empty())
        .map(|cidr| {
            cidr.parse::<IpNetwork>().map_err(|e| {
                ConfigError::InvalidConfiguration(format!("invalid CIDR {cidr:?}: {e}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if networks.is_empty() {
        return Err(ConfigError::InvalidConfiguration(format!(
            "no CIDR in {cidrs:?}"
        )));
    }
    let v4 = networks.iter().filter(|n| n.is_ipv4()).count();
    let v6 = networks.len() - v4;
    if v4 > 1 || v6 > 1 {
        return Err(ConfigError::InvalidConfiguration(format!(
            "{cidrs:?} must contain at most one IPv4 and one IPv6 CIDR"
        )));
    }
    Ok(networks)
}

/// First address of each service range; the `kubernetes` service gets it.
///
/// `10.96.0.0/12` yields `10.96.0.1`.
pub fn service_ips_from_cidrs(cidrs: &str) -> Result<Vec<IpAddr>, ConfigError> {
    parse_cidrs(cidrs)?
        .into_iter()
        .map(|network| {
            first_host(network).ok_or_else(|| {
                ConfigError::InvalidConfiguration(format!(
                    "service CIDR {network} is too small"
                ))
            })
        })
        .collect()
}

fn first_host(network: IpNetwork) -> Option<IpAddr> {
    let ip = match network.network() {
        IpAddr::V4(base) => IpAddr::V4(Ipv4Addr::from(u32::from(base).checked_add(1)?)),
        IpAddr::V6(base) => IpAddr::V6(Ipv6Addr::from(u128::from(base).checked_add(1)?)),
    };
    network.contains(ip).then_some(ip)
}

/// Whether any range of `a` overlaps a range of `b`
pub fn cidrs_overlap(a: &[IpNetwork], b: &[IpNetwork]) -> bool {
    a.iter().any(|x| {
        b.iter().any(|y| {
            x.is_ipv4() == y.is_ipv4() && (x.contains(y.network()) || y.contains(x.network()))
        })
    })
}

/// Split subject alternative names into IP addresses and DNS names.
pub fn split_ip_and_dns_sans(sans: &[String]) -> (Vec<IpAddr>, Vec<String>) {
    let mut ips = Vec::new();
    let mut names = Vec::new();
    for san in sans.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        match san.parse::<IpAddr>() {
            Ok(ip) => ips.push(ip),
            Err(_) => names.push(san.to_string()),
        }
    }
    (ips, names)
}
