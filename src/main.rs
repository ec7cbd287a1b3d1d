use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use nfs_discover_rs::config::{DiscoveryConfig, EvictionPolicy, LivenessMode, ProbeConfig, SweepConfig};
use nfs_discover_rs::service::DiscoveryService;
use nfs_discover_rs::types::{NetworkPrefix, ScanSnapshot};
use nfs_discover_rs::server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// nfs-discover-rs — finds NFS servers on local /24 networks and serves scan progress as JSON.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "nfs-discover-rs",
    version,
    about = "Finds NFS servers on local /24 networks and serves scan progress as JSON.",
    long_about = None
)]
struct Cli {
    /// Address the HTTP API listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Sweep one network (a.b.c) in the foreground, print the servers found and exit.
    #[arg(long)]
    scan: Option<String>,

    /// Write the foreground scan result as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Liveness check used before querying exports.
    #[arg(long, value_enum, default_value_t = LivenessMode::Icmp)]
    liveness: LivenessMode,

    /// Liveness timeout in milliseconds.
    #[arg(long = "ping-timeout-ms", default_value_t = 1000)]
    ping_timeout_ms: u64,

    /// Export query timeout in milliseconds.
    #[arg(long = "export-timeout-ms", default_value_t = 2000)]
    export_timeout_ms: u64,

    /// Probes in flight at once within one sweep (1 = sequential).
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Publish multi-network progress every N addresses.
    #[arg(long = "discover-stride", default_value_t = 5)]
    discover_stride: u64,

    /// Publish single-network progress every N addresses.
    #[arg(long = "network-stride", default_value_t = 1)]
    network_stride: u64,

    /// Abort a sweep that runs longer than this many seconds.
    #[arg(long = "scan-timeout-secs")]
    scan_timeout_secs: Option<u64>,

    /// Network scanned when no private interface is detected.
    #[arg(long = "fallback-network", default_value = "192.168.1")]
    fallback_network: NetworkPrefix,

    /// Forget finished scans after this many seconds.
    #[arg(long = "finished-ttl-secs", default_value_t = 3600)]
    finished_ttl_secs: u64,

    /// Forget scans that never finished after this many seconds.
    #[arg(long = "stuck-ttl-secs", default_value_t = 7200)]
    stuck_ttl_secs: u64,
}

impl Cli {
    fn discovery_config(&self) -> DiscoveryConfig {
        let sweep = SweepConfig {
            concurrency: self.concurrency.max(1),
            timeout: self.scan_timeout_secs.map(Duration::from_secs),
            ..SweepConfig::default()
        };
        DiscoveryConfig {
            probe: ProbeConfig {
                liveness: self.liveness,
                ping_timeout: Duration::from_millis(self.ping_timeout_ms),
                export_timeout: Duration::from_millis(self.export_timeout_ms),
                ..ProbeConfig::default()
            },
            discover: SweepConfig { publish_stride: self.discover_stride, ..sweep.clone() },
            network: SweepConfig { publish_stride: self.network_stride, ..sweep },
            eviction: EvictionPolicy {
                finished_ttl: Duration::from_secs(self.finished_ttl_secs),
                stuck_ttl: Duration::from_secs(self.stuck_ttl_secs),
                ..EvictionPolicy::default()
            },
            fallback_network: self.fallback_network,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.discovery_config();
    info!(
        "liveness={:?} ping_timeout={:?} export_timeout={:?} concurrency={}",
        config.probe.liveness, config.probe.ping_timeout, config.probe.export_timeout, cli.concurrency
    );
    let service = DiscoveryService::new(config);

    if let Some(network) = cli.scan.as_deref() {
        let Some(result) = service.scan_network_now(network).await? else {
            anyhow::bail!("scan of {network} ended without a result");
        };
        print_results_table(&result);
        if let Some(path) = cli.output.as_deref() {
            if let Err(e) = write_results_json(path, &result) {
                error!("failed to write JSON to {}: {e}", path.display());
            } else {
                info!("wrote JSON results to {}", path.display());
            }
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let eviction = service.spawn_eviction(shutdown.clone());

    let ctrl_c = shutdown.clone();
    let registry = service.registry().clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        registry.cancel_all().await;
        ctrl_c.cancel();
    });

    server::spawn_server(&cli.bind, service, shutdown.clone()).await?;
    shutdown.cancel();
    let _ = eviction.await;
    Ok(())
}

fn print_results_table(result: &ScanSnapshot) {
    let mut ip_w = "ip".len();
    let mut host_w = "hostname".len();
    let mut export_w = "export".len();
    for h in &result.discovered_hosts {
        ip_w = ip_w.max(h.address.to_string().len());
        host_w = host_w.max(h.hostname.len().min(40));
        for r in &h.resources {
            export_w = export_w.max(r.name.len().min(60));
        }
    }

    println!(
        "\nNFS servers: {} (scanned: {}, status: {:?})",
        result.discovered_hosts.len(),
        result.scanned_count,
        result.status
    );
    if let Some(err) = &result.error_message {
        println!("error: {err}");
    }
    println!("{:<ip_w$}  {:<host_w$}  {:<export_w$}  access", "ip", "hostname", "export");
    println!("{:-<ip_w$}  {:-<host_w$}  {:-<export_w$}  ------", "", "", "");
    for h in &result.discovered_hosts {
        let mut host = h.hostname.clone();
        host.truncate(40);
        for (i, r) in h.resources.iter().enumerate() {
            let (ip, name) = if i == 0 { (h.address.to_string(), host.as_str()) } else { (String::new(), "") };
            println!(
                "{:<ip_w$}  {:<host_w$}  {:<export_w$}  {}",
                ip, name, r.name, r.access_policy
            );
        }
    }
}

fn write_results_json(path: &std::path::Path, result: &ScanSnapshot) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, result)?;
    Ok(())
}
