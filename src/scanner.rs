use std::future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::{stream, StreamExt};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SweepConfig;
use crate::error::DiscoveryError;
use crate::plan::{ScanPlan, ScanTarget};
use crate::probe::Prober;
use crate::registry::ScanRegistry;
use crate::types::{HostResult, ScanSnapshot};

const LOG_EVERY: u64 = 50;

/// One sweep ready to run: the registry entry it reports to and what it covers.
#[derive(Debug, Clone)]
pub struct Sweep {
    pub scan_id: String,
    pub plan: ScanPlan,
    pub config: SweepConfig,
    pub cancel: CancellationToken,
}

enum Outcome {
    Finished,
    Cancelled,
    /// The registry entry vanished (evicted) while the sweep was running.
    Abandoned,
}

/// Running tally of a sweep, written to the registry at publish points.
#[derive(Default)]
struct Tally {
    scanned: u64,
    hosts: Vec<HostResult>,
    last: Option<ScanTarget>,
}

impl Tally {
    fn apply(&self, snap: &mut ScanSnapshot) {
        snap.record_progress(self.scanned);
        snap.discovered_hosts.clone_from(&self.hosts);
        if let Some(t) = self.last {
            snap.current_address = t.address.to_string();
            snap.current_network = t.network.to_string();
            snap.current_network_index = t.network_index;
        }
    }
}

/// Probe every target of the plan and report through the registry.
///
/// - Probes run through an ordered buffered stream: at most
///   `config.concurrency` are in flight, results are consumed in address order.
/// - A snapshot is published on the first host of each network, on every
///   host suffix divisible by `publish_stride` and whenever a server is found.
/// - Cancellation and the optional soft timeout are checked between probes.
///
/// Returns the terminal snapshot, or `None` when the registry entry is gone.
pub async fn run_sweep(
    sweep: Sweep,
    prober: Arc<dyn Prober>,
    registry: Arc<ScanRegistry>,
) -> Option<ScanSnapshot> {
    let id = sweep.scan_id.as_str();
    let networks: Vec<String> = sweep.plan.networks.iter().map(ToString::to_string).collect();
    info!("[{id}] sweep started for networks {networks:?}");

    if let Err(e) = registry.update(id, ScanSnapshot::mark_running).await {
        warn!("[{id}] cannot start sweep: {e}");
        return None;
    }

    let mut tally = Tally::default();
    let outcome = sweep_targets(&sweep, &prober, &registry, &mut tally).await;

    let result = match outcome {
        Ok(Outcome::Finished) => {
            info!("[{id}] sweep completed, found {} server(s)", tally.hosts.len());
            registry
                .update(id, |s| {
                    s.discovered_hosts.clone_from(&tally.hosts);
                    s.mark_completed();
                })
                .await
        }
        Ok(Outcome::Cancelled) => {
            info!("[{id}] sweep cancelled after {} address(es)", tally.scanned);
            registry
                .update(id, |s| {
                    tally.apply(s);
                    s.mark_cancelled();
                })
                .await
        }
        Ok(Outcome::Abandoned) => {
            warn!("[{id}] scan entry disappeared, stopping sweep");
            return None;
        }
        Err(e) => {
            error!("[{id}] sweep failed: {e:#}");
            registry
                .update(id, |s| {
                    tally.apply(s);
                    s.mark_failed(format!("{e:#}"));
                })
                .await
        }
    };

    match result {
        Ok(snap) => Some(snap),
        Err(e) => {
            warn!("[{id}] could not record final state: {e}");
            None
        }
    }
}

async fn sweep_targets(
    sweep: &Sweep,
    prober: &Arc<dyn Prober>,
    registry: &ScanRegistry,
    tally: &mut Tally,
) -> Result<Outcome> {
    let id = sweep.scan_id.as_str();
    let cfg = &sweep.config;
    let total = sweep.plan.total_targets();
    let stride = cfg.publish_stride.max(1);
    let deadline = cfg.timeout.map(|t| Instant::now() + t);

    let shared = Arc::clone(prober);
    let probes = stream::iter(sweep.plan.targets())
        .map(move |target| {
            let prober = Arc::clone(&shared);
            async move { (target, prober.probe(target.address).await) }
        })
        .buffered(cfg.concurrency.max(1));
    tokio::pin!(probes);

    loop {
        let next = tokio::select! {
            biased;
            _ = sweep.cancel.cancelled() => return Ok(Outcome::Cancelled),
            _ = until(deadline) => {
                let limit = cfg.timeout.unwrap_or_default();
                return Err(anyhow!("scan exceeded time limit of {limit:?}"));
            }
            item = probes.next() => item,
        };
        let Some((target, result)) = next else {
            break;
        };

        if target.ordinal == 1 {
            info!(
                "[{id}] scanning network {} ({}/{})",
                target.network,
                target.network_index + 1,
                sweep.plan.networks.len()
            );
        }

        let probe = result.with_context(|| format!("probing {}", target.address))?;
        tally.scanned += 1;
        tally.last = Some(target);

        let found = probe.is_server();
        if found {
            let hostname = prober.resolve_hostname(target.address).await;
            info!(
                "[{id}] found server {} ({hostname}) with {} export(s)",
                target.address,
                probe.resources.len()
            );
            tally.hosts.push(HostResult {
                address: target.address,
                hostname,
                resources: probe.resources,
                network: target.network,
            });
        } else {
            debug!("[{id}] {} reachable={} no exports", target.address, probe.reachable);
        }

        if tally.scanned % LOG_EVERY == 0 {
            let pct = crate::types::progress_percent(tally.scanned, total);
            info!("[{id}] progress {pct}% - {}", target.address);
        }

        // Publish points follow the host suffix, so they line up with every network.
        if found || target.ordinal == 1 || u64::from(target.ordinal) % stride == 0 {
            match registry.update(id, |s| tally.apply(s)).await {
                Ok(_) => {}
                Err(DiscoveryError::ScanNotFound(_)) => return Ok(Outcome::Abandoned),
                Err(e) => return Err(e.into()),
            }
        }

        if cfg.pause_every > 0 && tally.scanned % cfg.pause_every == 0 {
            time::sleep(cfg.pause).await;
        }
    }

    Ok(Outcome::Finished)
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}
