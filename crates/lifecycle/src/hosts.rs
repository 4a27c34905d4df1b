//! Host address helpers.
//!
//! Every host in a cluster is addressed as `ip:port`, where the port is the
//! SSH port. These helpers normalize user input into that shape, expand IPv4
//! ranges, and answer CIDR membership questions.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{ClusterError, Result};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Split `addr` into its host part and optional port.
///
/// Accepts `1.2.3.4`, `1.2.3.4:22`, `[::1]:22` and bare IPv6 literals.
#[must_use]
pub fn split_host_port(addr: &str) -> (&str, Option<u16>) {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    // More than one colon without brackets is a bare IPv6 literal.
    if addr.matches(':').count() == 1 {
        if let Some((host, port)) = addr.split_once(':') {
            return (host, port.parse().ok());
        }
    }
    (addr, None)
}

/// The IP part of an `ip:port` address.
#[must_use]
pub fn host_ip(addr: &str) -> &str {
    split_host_port(addr).0
}

/// Whether `addr` carries an explicit port.
#[must_use]
pub fn has_port(addr: &str) -> bool {
    split_host_port(addr).1.is_some()
}

/// Join an IP and port, bracketing IPv6 literals.
#[must_use]
pub fn join_host_port(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

/// Normalize `addr` into `ip:port`, appending `default_port` when absent.
#[must_use]
pub fn normalize(addr: &str, default_port: u16) -> String {
    let (ip, port) = split_host_port(addr);
    join_host_port(ip, port.unwrap_or(default_port))
}

/// Drop empty entries and duplicates, keeping first-seen order.
#[must_use]
pub fn dedup<I, S>(addrs: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    addrs
        .into_iter()
        .map(|a| a.as_ref().trim().to_string())
        .filter(|a| !a.is_empty())
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

/// Parse a comma separated address list that may contain IPv4 ranges.
///
/// `192.168.0.2-192.168.0.4` expands to three addresses. Ranges must not
/// carry ports and must be ascending.
///
/// # Errors
///
/// Returns [`ClusterError::Validation`] for malformed entries.
pub fn parse_address_list(input: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if let Some((start, end)) = entry.split_once('-') {
            if has_port(start) || has_port(end) {
                return Err(ClusterError::Validation(format!(
                    "address range {entry} must not contain ports"
                )));
            }
            out.extend(expand_range(start, end)?);
        } else {
            let ip = host_ip(entry);
            ip.parse::<IpAddr>().map_err(|_| {
                ClusterError::Validation(format!("{entry} is not a valid address"))
            })?;
            out.push(entry.to_string());
        }
    }
    Ok(dedup(out))
}

/// Expand an inclusive IPv4 range.
///
/// # Errors
///
/// Returns [`ClusterError::Validation`] when either bound is not IPv4 or the
/// range is descending.
pub fn expand_range(start: &str, end: &str) -> Result<Vec<String>> {
    let parse = |s: &str| {
        s.trim().parse::<Ipv4Addr>().map_err(|_| {
            ClusterError::Validation(format!("{s} is not a valid IPv4 range bound"))
        })
    };
    let (first, last) = (u32::from(parse(start)?), u32::from(parse(end)?));
    if first > last {
        return Err(ClusterError::Validation(format!(
            "address range {start}-{end} is descending"
        )));
    }
    Ok((first..=last).map(|n| Ipv4Addr::from(n).to_string()).collect())
}

/// Whether `ip` falls inside `cidr`. An empty CIDR contains nothing.
///
/// # Errors
///
/// Returns [`ClusterError::Validation`] when either value cannot be parsed.
pub fn cidr_contains(cidr: &str, ip: &str) -> Result<bool> {
    if cidr.trim().is_empty() {
        return Ok(false);
    }
    let invalid = || ClusterError::Validation(format!("{cidr} is not a valid CIDR"));
    let (net, bits) = cidr.trim().split_once('/').ok_or_else(invalid)?;
    let bits: u32 = bits.parse().map_err(|_| invalid())?;
    let net: IpAddr = net.parse().map_err(|_| invalid())?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ClusterError::Validation(format!("{ip} is not a valid IP")))?;

    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if bits > 32 {
                return Err(invalid());
            }
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            Ok(u32::from(net) & mask == u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if bits > 128 {
                return Err(invalid());
            }
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            Ok(u128::from(net) & mask == u128::from(ip) & mask)
        }
        _ => Ok(false),
    }
}
