use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, trace};

use crate::config::{LivenessMode, ProbeConfig};
use crate::types::{ProbeResult, Resource};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);
/// Grace on top of the tool's own timeout before the child is killed.
const PROCESS_GRACE: Duration = Duration::from_millis(500);

/// Checks a single address for liveness and NFS exports.
///
/// Per-host trouble (timeouts, refusals, garbage output) is never an `Err`:
/// it degrades to "unreachable" or "no exports". An `Err` means the probing
/// machinery itself is unusable, which ends the whole sweep.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn is_alive(&self, address: Ipv4Addr) -> Result<bool>;

    /// Exports advertised by `server` (an address or a host name).
    async fn exports(&self, server: &str) -> Result<Vec<Resource>>;

    /// Best-effort reverse lookup; falls back to the address itself.
    async fn resolve_hostname(&self, address: Ipv4Addr) -> String;

    async fn probe(&self, address: Ipv4Addr) -> Result<ProbeResult> {
        if !self.is_alive(address).await? {
            return Ok(ProbeResult::unreachable());
        }
        let resources = self.exports(&address.to_string()).await?;
        Ok(ProbeResult::reachable(resources))
    }
}

/// Parse `showmount -e` output into resources.
///
/// The first line is a header. Lines that do not start with an absolute path
/// (RPC errors such as `clnt_create: ...`) are skipped. A missing client list
/// means everyone, reported as `*`.
pub fn parse_export_list(stdout: &str) -> Vec<Resource> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.contains("clnt_create") {
                return None;
            }
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            if !name.starts_with('/') {
                return None;
            }
            let access_policy = parts.next().unwrap_or("*");
            Some(Resource { name: name.to_string(), access_policy: access_policy.to_string() })
        })
        .collect()
}

/// Probes through the host's own tools: `ping`, `showmount` and the system resolver.
pub struct SystemProber {
    config: ProbeConfig,
    resolver: TokioAsyncResolver,
}

impl SystemProber {
    pub fn new(config: ProbeConfig) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!("system resolver config unavailable ({e}), using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { config, resolver }
    }

    async fn ping(&self, address: Ipv4Addr) -> Result<bool> {
        let wait = self.config.ping_timeout.as_secs().max(1).to_string();
        let ip = address.to_string();
        let child = Command::new("ping")
            .args(["-c", "1", "-W", wait.as_str(), ip.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match time::timeout(self.config.ping_timeout + PROCESS_GRACE, child).await {
            Ok(Ok(status)) => Ok(status.success()),
            Ok(Err(e)) => tool_error("ping", e).map(|_| false),
            Err(_) => Ok(false),
        }
    }

    async fn tcp_alive(&self, address: Ipv4Addr) -> bool {
        for &port in &self.config.tcp_ports {
            let addr = SocketAddr::new(IpAddr::V4(address), port);
            match time::timeout(self.config.ping_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => return true,
                // Something answered with RST, so the host is up.
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => return true,
                _ => {}
            }
        }
        false
    }
}

/// Spawn failures that will hit every probe are fatal; anything else counts as a miss.
fn tool_error(tool: &str, e: std::io::Error) -> Result<()> {
    match e.kind() {
        ErrorKind::NotFound => Err(anyhow!("{tool} executable not found")),
        ErrorKind::PermissionDenied => Err(anyhow!("permission denied running {tool}")),
        _ => {
            debug!("{tool} failed to start: {e}");
            Ok(())
        }
    }
}

#[async_trait]
impl Prober for SystemProber {
    async fn is_alive(&self, address: Ipv4Addr) -> Result<bool> {
        match self.config.liveness {
            LivenessMode::Icmp => self.ping(address).await,
            LivenessMode::Tcp => Ok(self.tcp_alive(address).await),
        }
    }

    async fn exports(&self, server: &str) -> Result<Vec<Resource>> {
        let child = Command::new("showmount")
            .arg("-e")
            .arg(server)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        match time::timeout(self.config.export_timeout, child).await {
            Ok(Ok(out)) if out.status.success() => {
                Ok(parse_export_list(&String::from_utf8_lossy(&out.stdout)))
            }
            Ok(Ok(out)) => {
                trace!("showmount {server} exited with {}", out.status);
                Ok(Vec::new())
            }
            Ok(Err(e)) => tool_error("showmount", e).map(|_| Vec::new()),
            Err(_) => {
                trace!("showmount {server} timed out");
                Ok(Vec::new())
            }
        }
    }

    async fn resolve_hostname(&self, address: Ipv4Addr) -> String {
        let lookup = time::timeout(RESOLVE_TIMEOUT, self.resolver.reverse_lookup(IpAddr::V4(address))).await;
        let name = match lookup {
            Ok(Ok(names)) => names.iter().next().map(|n| n.to_string()),
            _ => None,
        };
        name.map(|n| n.trim_end_matches('.').to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| address.to_string())
    }
}
