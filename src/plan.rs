//! Expansion of a scan request into the ordered list of networks to sweep.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::error::DiscoveryError;
use crate::netdetect::{self, LocalInterface};
use crate::types::{NetworkPrefix, HOSTS_PER_NETWORK};

/// One address to probe and where it sits in the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTarget {
    pub address: Ipv4Addr,
    pub network: NetworkPrefix,
    /// Index of `network` within the plan.
    pub network_index: usize,
    /// Host suffix, 1..=254.
    pub ordinal: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub networks: Vec<NetworkPrefix>,
}

impl ScanPlan {
    pub fn total_targets(&self) -> u64 {
        self.networks.len() as u64 * HOSTS_PER_NETWORK
    }

    /// Targets in ascending network order, then ascending host suffix.
    pub fn targets(&self) -> Vec<ScanTarget> {
        let mut out = Vec::with_capacity(self.total_targets() as usize);
        for (network_index, &network) in self.networks.iter().enumerate() {
            out.extend(netdetect::host_addresses(network).into_iter().map(|address| ScanTarget {
                address,
                network,
                network_index,
                ordinal: address.octets()[3],
            }));
        }
        out
    }
}

/// Parse and dedupe requested networks, preserving first-seen order.
pub fn parse_networks<S: AsRef<str>>(requested: &[S]) -> Result<Vec<NetworkPrefix>, DiscoveryError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in requested {
        let net: NetworkPrefix = raw.as_ref().parse()?;
        if seen.insert(net) {
            out.push(net);
        }
    }
    Ok(out)
}

/// Build a plan from explicit networks, or from local interfaces when none were given.
///
/// Auto-detection never comes back empty: with no private interface the
/// `fallback` network is scanned.
pub fn build_plan<S, F>(
    requested: &[S],
    interfaces: F,
    fallback: NetworkPrefix,
) -> Result<ScanPlan, DiscoveryError>
where
    S: AsRef<str>,
    F: FnOnce() -> anyhow::Result<Vec<LocalInterface>>,
{
    let mut networks = parse_networks(requested)?;
    if networks.is_empty() {
        networks = match interfaces() {
            Ok(ifaces) => netdetect::private_networks(&ifaces),
            Err(e) => {
                warn!("interface enumeration failed, using fallback network: {e:#}");
                Vec::new()
            }
        };
        if networks.is_empty() {
            debug!("no private interface found, falling back to {fallback}");
            networks.push(fallback);
        }
    }
    Ok(ScanPlan { networks })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_interfaces() -> anyhow::Result<Vec<LocalInterface>> {
        Ok(Vec::new())
    }

    #[test]
    fn explicit_networks_are_deduped_in_order() {
        let plan = build_plan(
            &["10.0.1", "192.168.1", "10.0.1", "192.168.1.0/24"],
            no_interfaces,
            NetworkPrefix::new(192, 168, 1),
        )
        .unwrap();
        assert_eq!(
            plan.networks,
            vec![NetworkPrefix::new(10, 0, 1), NetworkPrefix::new(192, 168, 1)]
        );
        assert_eq!(plan.total_targets(), 508);
    }

    #[test]
    fn invalid_network_is_rejected() {
        let err = build_plan(&["10.0"], no_interfaces, NetworkPrefix::new(192, 168, 1)).unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidNetwork(_)));
    }

    #[test]
    fn targets_walk_networks_then_hosts() {
        let plan = ScanPlan {
            networks: vec![NetworkPrefix::new(10, 0, 0), NetworkPrefix::new(10, 0, 1)],
        };
        let targets = plan.targets();
        assert_eq!(targets.len(), 508);
        assert_eq!(targets[0].address, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(targets[253].address, Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(targets[253].ordinal, 254);
        assert_eq!(targets[254].address, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(targets[254].network_index, 1);
    }
}
