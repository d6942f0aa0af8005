//! Outbound network policy for script `fetch`.
//!
//! Checks run in two stages: the URL's scheme and host name before any I/O,
//! then every address the name resolves to. Callers connect only to an
//! address that passed the second stage.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetDenial {
    InvalidUrl,
    Scheme(String),
    Localhost,
    LocalDomain,
    PrivateAddress(IpAddr),
    Unresolvable,
}

impl fmt::Display for NetDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetDenial::InvalidUrl => f.write_str("Invalid URL."),
            NetDenial::Scheme(scheme) => write!(f, "Protocol {}: not allowed.", scheme),
            NetDenial::Localhost => f.write_str("Localhost access denied."),
            NetDenial::LocalDomain => f.write_str("Local domain access denied."),
            NetDenial::PrivateAddress(_) => f.write_str("Private IP range denied."),
            NetDenial::Unresolvable => f.write_str("DNS lookup failed."),
        }
    }
}

impl std::error::Error for NetDenial {}

pub fn check_scheme(scheme: &str) -> Result<(), NetDenial> {
    match scheme {
        "http" | "https" => Ok(()),
        other => Err(NetDenial::Scheme(other.to_string())),
    }
}

/// Host-name stage. IP literals are checked directly.
pub fn check_host(host: &str) -> Result<(), NetDenial> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(NetDenial::InvalidUrl);
    }
    if host == "localhost" || host.ends_with(".localhost") {
        return Err(NetDenial::Localhost);
    }
    if host.ends_with(".local") || host.ends_with(".internal") {
        return Err(NetDenial::LocalDomain);
    }
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return check_ip(ip);
    }
    Ok(())
}

pub fn check_ip(ip: IpAddr) -> Result<(), NetDenial> {
    if is_private_ip(ip) {
        Err(NetDenial::PrivateAddress(ip))
    } else {
        Ok(())
    }
}

/// Resolution stage: an empty answer is a denial, and one bad address
/// poisons the whole answer.
pub fn check_resolved<I>(addrs: I) -> Result<IpAddr, NetDenial>
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut first = None;
    for ip in addrs {
        check_ip(ip)?;
        first.get_or_insert(ip);
    }
    first.ok_or(NetDenial::Unresolvable)
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}
