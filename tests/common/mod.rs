#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use nfs_discover_rs::config::{DiscoveryConfig, SweepConfig};
use nfs_discover_rs::probe::Prober;
use nfs_discover_rs::service::DiscoveryService;
use nfs_discover_rs::types::{NetworkPrefix, Resource, ScanKind, ScanSnapshot, StatusReport};

/// In-memory prober: listed servers export resources, `alive` hosts answer
/// without exports, `broken` networks fail every probe, the rest are down.
#[derive(Default)]
pub struct ScriptedProber {
    pub servers: HashMap<Ipv4Addr, Vec<Resource>>,
    pub alive: HashSet<Ipv4Addr>,
    pub broken: HashSet<NetworkPrefix>,
    pub delay: Duration,
}

impl ScriptedProber {
    pub fn with_server(mut self, ip: Ipv4Addr, export: &str) -> Self {
        self.servers.entry(ip).or_default().push(Resource {
            name: export.to_string(),
            access_policy: "*".to_string(),
        });
        self
    }

    pub fn with_alive(mut self, ip: Ipv4Addr) -> Self {
        self.alive.insert(ip);
        self
    }

    pub fn with_broken(mut self, net: NetworkPrefix) -> Self {
        self.broken.insert(net);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn is_alive(&self, address: Ipv4Addr) -> Result<bool> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.broken.contains(&NetworkPrefix::of(address)) {
            bail!("probe tool crashed on {address}");
        }
        Ok(self.servers.contains_key(&address) || self.alive.contains(&address))
    }

    async fn exports(&self, server: &str) -> Result<Vec<Resource>> {
        let ip: Ipv4Addr = server.parse()?;
        Ok(self.servers.get(&ip).cloned().unwrap_or_default())
    }

    async fn resolve_hostname(&self, address: Ipv4Addr) -> String {
        if address.octets()[3] == 5 {
            format!("nas-{}", address.octets()[2])
        } else {
            address.to_string()
        }
    }
}

/// Defaults without the politeness pause so sweeps finish quickly.
pub fn fast_config() -> DiscoveryConfig {
    let base = DiscoveryConfig::default();
    DiscoveryConfig {
        discover: SweepConfig { pause: Duration::ZERO, ..base.discover.clone() },
        network: SweepConfig { pause: Duration::ZERO, ..base.network.clone() },
        ..base
    }
}

pub fn service(prober: ScriptedProber) -> DiscoveryService {
    DiscoveryService::with_prober(fast_config(), Arc::new(prober)).with_interfaces(|| Ok(Vec::new()))
}

pub fn snapshot(report: StatusReport) -> ScanSnapshot {
    match report {
        StatusReport::Scan(s) => *s,
        StatusReport::Idle(_) => panic!("expected a scan snapshot, got idle"),
    }
}

/// Poll until the scan reaches a terminal state.
pub async fn wait_terminal(svc: &DiscoveryService, kind: ScanKind, scan_id: &str) -> ScanSnapshot {
    for _ in 0..1000 {
        let snap = snapshot(svc.status(kind, Some(scan_id), None).await);
        if snap.is_terminal() {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("scan {scan_id} did not finish in time");
}
