use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NetworkPrefix;

/// How the prober decides that an address is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LivenessMode {
    /// One ICMP echo through the system `ping` binary.
    Icmp,
    /// TCP connect to the portmapper/NFS ports; a refused connection still proves liveness.
    Tcp,
}

/// Timeouts and liveness strategy used by [`crate::probe::SystemProber`].
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub liveness: LivenessMode,
    pub ping_timeout: Duration,
    pub export_timeout: Duration,
    /// Ports tried by [`LivenessMode::Tcp`].
    pub tcp_ports: Vec<u16>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessMode::Icmp,
            ping_timeout: Duration::from_secs(1),
            export_timeout: Duration::from_secs(2),
            tcp_ports: vec![111, 2049],
        }
    }
}

impl ProbeConfig {
    /// Slightly more patient settings for one-off lookups of a single address.
    pub fn for_single_address(&self) -> Self {
        Self {
            ping_timeout: self.ping_timeout.max(Duration::from_secs(2)),
            export_timeout: self.export_timeout.max(Duration::from_secs(3)),
            ..self.clone()
        }
    }
}

/// Knobs of one sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Publish a snapshot every `publish_stride` addresses.
    pub publish_stride: u64,
    /// Sleep `pause` after every `pause_every` addresses.
    pub pause_every: u64,
    pub pause: Duration,
    /// Probes in flight at once within one sweep (1 = sequential).
    pub concurrency: usize,
    /// Soft limit on the whole sweep.
    pub timeout: Option<Duration>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            publish_stride: 5,
            pause_every: 10,
            pause: Duration::from_millis(5),
            concurrency: 1,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    /// How often the eviction pass runs.
    pub interval: Duration,
    /// Finished scans are dropped this long after `endedAt`.
    pub finished_ttl: Duration,
    /// Scans that never finished are dropped this long after `startedAt`.
    pub stuck_ttl: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            finished_ttl: Duration::from_secs(3600),
            stuck_ttl: Duration::from_secs(2 * 3600),
        }
    }
}

/// Everything the discovery service needs, independent of how it was parsed.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub probe: ProbeConfig,
    /// Multi-network sweeps.
    pub discover: SweepConfig,
    /// Single-network sweeps.
    pub network: SweepConfig,
    pub eviction: EvictionPolicy,
    /// Scanned when auto-detection finds no private network.
    pub fallback_network: NetworkPrefix,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            discover: SweepConfig::default(),
            network: SweepConfig { publish_stride: 1, ..SweepConfig::default() },
            eviction: EvictionPolicy::default(),
            fallback_network: NetworkPrefix::new(192, 168, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_publish_asymmetry() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(cfg.discover.publish_stride, 5);
        assert_eq!(cfg.network.publish_stride, 1);
        assert_eq!(cfg.fallback_network.to_string(), "192.168.1");
    }

    #[test]
    fn single_address_probe_is_more_patient() {
        let single = ProbeConfig::default().for_single_address();
        assert_eq!(single.ping_timeout, Duration::from_secs(2));
        assert_eq!(single.export_timeout, Duration::from_secs(3));
    }
}
