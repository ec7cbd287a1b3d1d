use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DiscoveryError;

/// Host suffixes probed in every /24 (network and broadcast excluded).
pub const HOSTS_PER_NETWORK: u64 = 254;

/// First three octets of an IPv4 /24, e.g. `192.168.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkPrefix([u8; 3]);

impl NetworkPrefix {
    pub const fn new(a: u8, b: u8, c: u8) -> Self {
        Self([a, b, c])
    }

    /// The /24 an address belongs to.
    pub fn of(ip: Ipv4Addr) -> Self {
        let o = ip.octets();
        Self([o[0], o[1], o[2]])
    }

    /// Address of host `suffix` (1..=254) within this network.
    pub fn host(&self, suffix: u8) -> Ipv4Addr {
        let [a, b, c] = self.0;
        Ipv4Addr::new(a, b, c, suffix)
    }

    pub fn octets(&self) -> [u8; 3] {
        self.0
    }

    pub fn cidr(&self) -> Ipv4Net {
        Ipv4Net::new(self.host(0), 24).expect("/24 is always valid")
    }
}

impl fmt::Display for NetworkPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}.{b}.{c}")
    }
}

impl FromStr for NetworkPrefix {
    type Err = DiscoveryError;

    /// Accepts `a.b.c`, `a.b.c.0` and `a.b.c.0/24`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || DiscoveryError::InvalidNetwork(raw.to_string());

        if raw.contains('/') {
            let net: Ipv4Net = raw.parse().map_err(|_| invalid())?;
            if net.prefix_len() != 24 || net.network() != net.addr() {
                return Err(invalid());
            }
            return Ok(Self::of(net.network()));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        let octets = match parts.as_slice() {
            [a, b, c] | [a, b, c, "0"] => [*a, *b, *c],
            _ => return Err(invalid()),
        };
        let mut out = [0u8; 3];
        for (slot, part) in out.iter_mut().zip(octets) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self(out))
    }
}

impl Serialize for NetworkPrefix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetworkPrefix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One exported path advertised by a host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: String,
    pub access_policy: String,
}

/// Outcome of probing a single address. Never an error for per-host failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub resources: Vec<Resource>,
}

impl ProbeResult {
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn reachable(resources: Vec<Resource>) -> Self {
        Self { reachable: true, resources }
    }

    /// Whether the address should be recorded as a discovered server.
    pub fn is_server(&self) -> bool {
        self.reachable && !self.resources.is_empty()
    }
}

/// A reachable host exporting at least one resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostResult {
    pub address: Ipv4Addr,
    pub hostname: String,
    pub resources: Vec<Resource>,
    pub network: NetworkPrefix,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Sweep over every requested (or detected) network.
    Discover,
    /// Sweep restricted to one network.
    Network,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanStats {
    pub total_scanned: u64,
    pub servers_found: u64,
    pub networks: u64,
}

/// Pollable state of one scan. Frozen once `status` is terminal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSnapshot {
    pub scan_id: String,
    pub kind: ScanKind,
    pub status: ScanStatus,
    pub progress_percent: u8,
    pub scanned_count: u64,
    pub total_count: u64,
    pub current_address: String,
    pub current_network: String,
    pub current_network_index: usize,
    pub discovered_hosts: Vec<HostResult>,
    pub networks: Vec<NetworkPrefix>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_at: OffsetDateTime,
    pub error_message: Option<String>,
    pub stats: Option<ScanStats>,
    pub complete: bool,
    pub active: bool,
}

impl ScanSnapshot {
    /// Fresh `Pending` snapshot covering `networks`.
    pub fn pending(scan_id: String, kind: ScanKind, networks: Vec<NetworkPrefix>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            scan_id,
            kind,
            status: ScanStatus::Pending,
            progress_percent: 0,
            scanned_count: 0,
            total_count: networks.len() as u64 * HOSTS_PER_NETWORK,
            current_address: String::new(),
            current_network: networks.first().map(ToString::to_string).unwrap_or_default(),
            current_network_index: 0,
            discovered_hosts: Vec::new(),
            networks,
            started_at: now,
            ended_at: None,
            last_updated_at: now,
            error_message: None,
            stats: None,
            complete: false,
            active: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record progress; `progress_percent` follows `scanned_count` and never decreases.
    pub fn record_progress(&mut self, scanned: u64) {
        self.scanned_count = self.scanned_count.max(scanned.min(self.total_count));
        self.progress_percent = progress_percent(self.scanned_count, self.total_count);
        self.last_updated_at = OffsetDateTime::now_utc();
    }

    pub fn mark_running(&mut self) {
        self.status = ScanStatus::Running;
        self.last_updated_at = OffsetDateTime::now_utc();
    }

    pub fn mark_completed(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.status = ScanStatus::Completed;
        self.progress_percent = 100;
        self.scanned_count = self.total_count;
        self.current_address.clear();
        self.current_network.clear();
        self.current_network_index = self.networks.len();
        self.stats = Some(ScanStats {
            total_scanned: self.total_count,
            servers_found: self.discovered_hosts.len() as u64,
            networks: self.networks.len() as u64,
        });
        self.finish(now);
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = ScanStatus::Failed;
        self.error_message = Some(message.into());
        self.finish(OffsetDateTime::now_utc());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = ScanStatus::Cancelled;
        self.current_address.clear();
        self.finish(OffsetDateTime::now_utc());
    }

    fn finish(&mut self, now: OffsetDateTime) {
        self.ended_at = Some(now);
        self.last_updated_at = now;
        self.complete = true;
        self.active = false;
    }
}

/// `floor(scanned / total * 100)` clamped to 0..=100.
pub fn progress_percent(scanned: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (scanned.saturating_mul(100) / total).min(100) as u8
}

/// Shape returned when no scan has ever run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IdleStatus {
    pub progress_percent: u8,
    pub scanned_count: u64,
    pub total_count: u64,
    pub discovered_hosts: Vec<HostResult>,
    pub complete: bool,
    pub active: bool,
}

/// Answer to a status poll: a real snapshot or the idle shape.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StatusReport {
    Scan(Box<ScanSnapshot>),
    Idle(IdleStatus),
}

impl StatusReport {
    pub fn snapshot(&self) -> Option<&ScanSnapshot> {
        match self {
            Self::Scan(s) => Some(s),
            Self::Idle(_) => None,
        }
    }
}

/// Returned immediately when a sweep is started.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScanTicket {
    pub scan_id: String,
    pub networks: Vec<NetworkPrefix>,
    pub total_targets: u64,
    pub status: ScanSnapshot,
}
