use anyhow::Result;
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::types::NetworkPrefix;

/// Interface name prefixes that belong to containers, bridges and VMs.
const VIRTUAL_PREFIXES: &[&str] = &["docker", "br-", "veth", "virbr"];

/// A local IPv4 address and the interface carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub ip: Ipv4Addr,
}

impl LocalInterface {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self { name: name.into(), ip }
    }
}

/// One entry of the local network listing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub interface: String,
    pub ip: Ipv4Addr,
    /// `a.b.c.0/24`
    pub network: String,
}

/// Whether an interface is loopback or container/VM plumbing.
pub fn is_virtual_interface(name: &str) -> bool {
    name == "lo" || VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Enumerate non-loopback IPv4 addresses on physical-looking interfaces.
pub fn local_ipv4_interfaces() -> Result<Vec<LocalInterface>> {
    let mut out = Vec::new();
    for iface in get_if_addrs()? {
        if is_virtual_interface(&iface.name) {
            continue;
        }
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            out.push(LocalInterface::new(iface.name, v4.ip));
        }
    }
    Ok(out)
}

/// Derive the /24 prefixes of all private addresses, deduplicated in interface order.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1`.
pub fn private_networks(ifaces: &[LocalInterface]) -> Vec<NetworkPrefix> {
    let mut seen = HashSet::new();
    ifaces
        .iter()
        .filter(|i| !is_virtual_interface(&i.name) && i.ip.is_private())
        .map(|i| NetworkPrefix::of(i.ip))
        .filter(|n| seen.insert(*n))
        .collect()
}

/// Local networks for display, one entry per distinct /24.
pub fn list_networks(ifaces: &[LocalInterface]) -> Vec<NetworkInfo> {
    let mut seen = HashSet::new();
    ifaces
        .iter()
        .filter(|i| !is_virtual_interface(&i.name) && !i.ip.is_loopback())
        .filter(|i| seen.insert(NetworkPrefix::of(i.ip)))
        .map(|i| NetworkInfo {
            interface: i.name.clone(),
            ip: i.ip,
            network: NetworkPrefix::of(i.ip).cidr().to_string(),
        })
        .collect()
}

/// Host addresses of a /24 in ascending order, network and broadcast excluded.
pub fn host_addresses(prefix: NetworkPrefix) -> Vec<Ipv4Addr> {
    expand_ipv4net_hosts(prefix.cidr())
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    // Use inclusive range of numeric IPs, then skip network and broadcast.
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end <= start + 1 {
        // Too small to have host addresses
        return Vec::new();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}
