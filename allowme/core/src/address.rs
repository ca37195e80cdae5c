use ipnet::Ipv4Net;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};
use thiserror::Error;

/// A single IPv4 host, normalized to a full-length (`/32`) network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(Ipv4Net);

/// Describes why an address may not be added to an allow-list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("malformed")]
    Malformed,

    #[error("private")]
    Private,

    #[error("unsupported-family")]
    UnsupportedFamily,
}

/// Classifies a textual address as admissible or rejected.
///
/// Accepts a bare IPv4 address (`203.0.113.5`) or its single-host CIDR form
/// (`203.0.113.5/32`). IPv4-mapped IPv6 addresses are classified as the IPv4
/// address they carry.
pub fn classify(addr: &str) -> Result<Address, Rejection> {
    if let Some((ip, len)) = addr.split_once('/') {
        if len != "32" {
            return Err(Rejection::Malformed);
        }
        let ip = ip.parse::<Ipv4Addr>().map_err(|_| Rejection::Malformed)?;
        return classify_ip(ip.into());
    }

    if let Ok(ip) = addr.parse::<Ipv4Addr>() {
        return classify_ip(ip.into());
    }
    if let Ok(ip) = addr.parse::<Ipv6Addr>() {
        return classify_ip(ip.into());
    }
    Err(Rejection::Malformed)
}

/// Classifies a peer address as admissible or rejected.
pub fn classify_ip(ip: IpAddr) -> Result<Address, Rejection> {
    let ip = match ip {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().ok_or(Rejection::UnsupportedFamily)?,
    };

    if is_reserved(ip) {
        return Err(Rejection::Private);
    }
    Ok(Address(Ipv4Net::from(ip)))
}

fn is_reserved(ip: Ipv4Addr) -> bool {
    match ip.octets() {
        // 10.0.0.0/8, 127.0.0.0/8
        [10, ..] | [127, ..] => true,
        // 169.254.0.0/16, 192.168.0.0/16
        [169, 254, ..] | [192, 168, ..] => true,
        // 172.16.0.0/12
        [172, b, ..] => (16..=31).contains(&b),
        _ => false,
    }
}

// === impl Address ===

impl Address {
    pub fn ip(&self) -> Ipv4Addr {
        self.0.addr()
    }

    pub fn net(&self) -> Ipv4Net {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
