//! Public start/status operations tying the plan, sweep and registry together.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{DiscoveryConfig, SweepConfig};
use crate::error::DiscoveryError;
use crate::mounts::{self, NfsMount};
use crate::netdetect::{self, LocalInterface, NetworkInfo};
use crate::plan::{self, ScanPlan};
use crate::probe::{Prober, SystemProber};
use crate::registry::{self, ScanRegistry};
use crate::role::{self, NfsRole};
use crate::scanner::{self, Sweep};
use crate::types::{HostResult, IdleStatus, NetworkPrefix, ScanKind, ScanSnapshot, ScanTicket, StatusReport};

type InterfaceSource = Arc<dyn Fn() -> Result<Vec<LocalInterface>> + Send + Sync>;

static SCAN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Result of a one-off single address lookup.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AddressReport {
    /// Whether the liveness check succeeded.
    pub reachable: bool,
    /// Set when the host also exports something.
    pub server: Option<HostResult>,
}

/// One export of a remote server, flagged when it is mounted locally.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportEntry {
    pub path: String,
    pub permissions: String,
    pub mounted: bool,
}

#[derive(Clone)]
pub struct DiscoveryService {
    config: DiscoveryConfig,
    registry: Arc<ScanRegistry>,
    prober: Arc<dyn Prober>,
    single_prober: Arc<dyn Prober>,
    interfaces: InterfaceSource,
    mount_table: PathBuf,
}

impl DiscoveryService {
    /// Service probing through the system tools and real interfaces.
    pub fn new(config: DiscoveryConfig) -> Self {
        let prober: Arc<dyn Prober> = Arc::new(SystemProber::new(config.probe.clone()));
        let single: Arc<dyn Prober> = Arc::new(SystemProber::new(config.probe.for_single_address()));
        let mut svc = Self::with_prober(config, prober);
        svc.single_prober = single;
        svc
    }

    /// Service using `prober` for sweeps and single lookups alike.
    pub fn with_prober(config: DiscoveryConfig, prober: Arc<dyn Prober>) -> Self {
        Self {
            config,
            registry: Arc::new(ScanRegistry::new()),
            single_prober: Arc::clone(&prober),
            prober,
            interfaces: Arc::new(netdetect::local_ipv4_interfaces),
            mount_table: PathBuf::from(mounts::MOUNT_TABLE),
        }
    }

    /// Replace local interface enumeration (auto-detection input).
    pub fn with_interfaces<F>(mut self, source: F) -> Self
    where
        F: Fn() -> Result<Vec<LocalInterface>> + Send + Sync + 'static,
    {
        self.interfaces = Arc::new(source);
        self
    }

    /// Read NFS mounts from `path` instead of `/proc/mounts`.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    pub fn mount_table(&self) -> &Path {
        &self.mount_table
    }

    pub fn registry(&self) -> &Arc<ScanRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Start a sweep over `networks`, or over the detected local networks when empty.
    pub async fn start_discovery<S: AsRef<str>>(&self, networks: &[S]) -> Result<ScanTicket, DiscoveryError> {
        let source = Arc::clone(&self.interfaces);
        let plan = plan::build_plan(networks, move || source(), self.config.fallback_network)?;
        let id = next_scan_id(ScanKind::Discover, None);
        self.launch(id, ScanKind::Discover, plan, self.config.discover.clone()).await
    }

    /// Start a sweep of one network. An absent or blank network is rejected.
    pub async fn start_network_scan(&self, network: Option<&str>) -> Result<ScanTicket, DiscoveryError> {
        let raw = network
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(DiscoveryError::MissingParameter("network"))?;
        let network: NetworkPrefix = raw.parse()?;
        let id = next_scan_id(ScanKind::Network, Some(network));
        let plan = ScanPlan { networks: vec![network] };
        self.launch(id, ScanKind::Network, plan, self.config.network.clone()).await
    }

    async fn launch(
        &self,
        scan_id: String,
        kind: ScanKind,
        plan: ScanPlan,
        config: SweepConfig,
    ) -> Result<ScanTicket, DiscoveryError> {
        let snapshot = ScanSnapshot::pending(scan_id.clone(), kind, plan.networks.clone());
        let cancel = self.registry.create(snapshot.clone()).await?;
        info!("[{scan_id}] queued {} network(s), {} address(es)", plan.networks.len(), plan.total_targets());

        let ticket = ScanTicket {
            scan_id: scan_id.clone(),
            networks: plan.networks.clone(),
            total_targets: plan.total_targets(),
            status: snapshot,
        };
        let sweep = Sweep { scan_id, plan, config, cancel };
        tokio::spawn(scanner::run_sweep(sweep, Arc::clone(&self.prober), Arc::clone(&self.registry)));
        Ok(ticket)
    }

    /// Status of a scan of `kind`.
    ///
    /// Lookup order: `scan_id` (only if it names a scan of `kind`), then the latest scan covering `network`, then
    /// the latest active scan, then the latest scan of any status. With
    /// nothing to report the idle shape is returned; polling never fails.
    pub async fn status(&self, kind: ScanKind, scan_id: Option<&str>, network: Option<&str>) -> StatusReport {
        if let Some(snap) = self.find(kind, scan_id, network).await {
            return StatusReport::Scan(Box::new(snap));
        }
        StatusReport::Idle(IdleStatus::default())
    }

    async fn find(&self, kind: ScanKind, scan_id: Option<&str>, network: Option<&str>) -> Option<ScanSnapshot> {
        if let Some(id) = scan_id.filter(|id| !id.is_empty()) {
            match self.registry.get(id).await {
                Some(snap) if snap.kind == kind => return Some(snap),
                _ => {}
            }
        }
        if let Some(net) = network.and_then(|n| n.parse::<NetworkPrefix>().ok()) {
            if let Some(snap) = self.registry.latest_for_network(kind, net).await {
                return Some(snap);
            }
        }
        match self.registry.latest_active(Some(kind)).await {
            Some(snap) => Some(snap),
            None => self.registry.latest_any(Some(kind)).await,
        }
    }

    pub async fn cancel(&self, scan_id: &str) -> Result<ScanSnapshot, DiscoveryError> {
        let snap = self.registry.cancel(scan_id).await?;
        info!("[{scan_id}] cancellation requested");
        Ok(snap)
    }

    /// Probe one address outside of any sweep.
    pub async fn probe_single_address(&self, address: Ipv4Addr) -> Result<AddressReport> {
        if !self.single_prober.is_alive(address).await? {
            return Ok(AddressReport { reachable: false, server: None });
        }
        let resources = self.single_prober.exports(&address.to_string()).await?;
        if resources.is_empty() {
            return Ok(AddressReport { reachable: true, server: None });
        }
        let hostname = self.single_prober.resolve_hostname(address).await;
        let server = HostResult { address, hostname, resources, network: NetworkPrefix::of(address) };
        Ok(AddressReport { reachable: true, server: Some(server) })
    }

    /// Run a single-network sweep in the foreground and return its final snapshot.
    pub async fn scan_network_now(&self, network: &str) -> Result<Option<ScanSnapshot>, DiscoveryError> {
        let network: NetworkPrefix = network.parse()?;
        let id = next_scan_id(ScanKind::Network, Some(network));
        let plan = ScanPlan { networks: vec![network] };
        let snapshot = ScanSnapshot::pending(id.clone(), ScanKind::Network, plan.networks.clone());
        let cancel = self.registry.create(snapshot).await?;
        let sweep = Sweep { scan_id: id, plan, config: self.config.network.clone(), cancel };
        Ok(scanner::run_sweep(sweep, Arc::clone(&self.prober), Arc::clone(&self.registry)).await)
    }

    pub fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(netdetect::list_networks(&(self.interfaces)()?))
    }

    /// Exports of `server`, flagged with whether each is mounted here.
    pub async fn list_exports(&self, server: &str) -> Result<Vec<ExportEntry>> {
        if !is_valid_server_name(server) {
            return Err(DiscoveryError::InvalidAddress(server.to_string()).into());
        }
        let resources = self.single_prober.exports(server).await?;
        let mounted = mounts::read_nfs_mounts(&self.mount_table).await.unwrap_or_else(|e| {
            warn!("{e:#}");
            Vec::new()
        });
        Ok(resources
            .into_iter()
            .map(|r| ExportEntry {
                mounted: mounts::is_mounted(&mounted, server, &r.name),
                path: r.name,
                permissions: r.access_policy,
            })
            .collect())
    }

    pub async fn list_mounts(&self) -> Result<Vec<NfsMount>> {
        mounts::read_nfs_mounts(&self.mount_table).await
    }

    /// Server/client capability of this host and its active NFS mounts.
    pub async fn role(&self) -> NfsRole {
        role::detect(&self.mount_table).await
    }

    /// Start the periodic eviction pass; stops when `shutdown` fires.
    pub fn spawn_eviction(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        registry::spawn_eviction(Arc::clone(&self.registry), self.config.eviction, shutdown)
    }
}

/// Host names and IPv4 literals only; nothing that could read as a flag.
pub fn is_valid_server_name(server: &str) -> bool {
    !server.is_empty()
        && server.len() <= 253
        && !server.starts_with(['-', '.'])
        && server.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

/// `discover_<millis>_<seq>` or `network_<a>_<b>_<c>_<millis>_<seq>`.
fn next_scan_id(kind: ScanKind, network: Option<NetworkPrefix>) -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let seq = SCAN_SEQ.fetch_add(1, Ordering::Relaxed);
    match (kind, network) {
        (ScanKind::Network, Some(net)) => {
            let [a, b, c] = net.octets();
            format!("network_{a}_{b}_{c}_{millis}_{seq}")
        }
        _ => format!("discover_{millis}_{seq}"),
    }
}
