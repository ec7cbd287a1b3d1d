use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EvictionPolicy;
use crate::error::DiscoveryError;
use crate::types::{NetworkPrefix, ScanKind, ScanSnapshot};

#[derive(Debug)]
struct Entry {
    /// Insertion order, breaks ties between equal start times.
    seq: u64,
    snapshot: ScanSnapshot,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<String, Entry>,
}

/// In-memory store of scan snapshots keyed by scan id.
///
/// Every operation is a short critical section that hands out clones; no
/// caller ever holds a reference into the map.
#[derive(Debug, Default)]
pub struct ScanRegistry {
    inner: RwLock<Inner>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new scan and return the token that cancels it.
    pub async fn create(&self, snapshot: ScanSnapshot) -> Result<CancellationToken, DiscoveryError> {
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(&snapshot.scan_id) {
            return Err(DiscoveryError::DuplicateScan(snapshot.scan_id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let cancel = CancellationToken::new();
        inner
            .entries
            .insert(snapshot.scan_id.clone(), Entry { seq, snapshot, cancel: cancel.clone() });
        Ok(cancel)
    }

    pub async fn get(&self, scan_id: &str) -> Option<ScanSnapshot> {
        self.inner.read().await.entries.get(scan_id).map(|e| e.snapshot.clone())
    }

    /// Most recently started scan that has not reached a terminal state.
    pub async fn latest_active(&self, kind: Option<ScanKind>) -> Option<ScanSnapshot> {
        self.latest_where(|s| !s.is_terminal() && kind.map_or(true, |k| s.kind == k)).await
    }

    /// Most recently started scan regardless of status.
    pub async fn latest_any(&self, kind: Option<ScanKind>) -> Option<ScanSnapshot> {
        self.latest_where(|s| kind.map_or(true, |k| s.kind == k)).await
    }

    /// Most recently started scan of `kind` covering `network`.
    pub async fn latest_for_network(&self, kind: ScanKind, network: NetworkPrefix) -> Option<ScanSnapshot> {
        self.latest_where(|s| s.kind == kind && s.networks.contains(&network)).await
    }

    async fn latest_where<F>(&self, pred: F) -> Option<ScanSnapshot>
    where
        F: Fn(&ScanSnapshot) -> bool,
    {
        let inner = self.inner.read().await;
        inner
            .entries
            .values()
            .filter(|e| pred(&e.snapshot))
            .max_by_key(|e| (e.snapshot.started_at, e.seq))
            .map(|e| e.snapshot.clone())
    }

    /// Apply `f` to a live scan and return the new snapshot.
    ///
    /// Terminal snapshots are frozen: updating one yields `ScanFinished`.
    pub async fn update<F>(&self, scan_id: &str, f: F) -> Result<ScanSnapshot, DiscoveryError>
    where
        F: FnOnce(&mut ScanSnapshot),
    {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(scan_id)
            .ok_or_else(|| DiscoveryError::ScanNotFound(scan_id.to_string()))?;
        if entry.snapshot.is_terminal() {
            return Err(DiscoveryError::ScanFinished(scan_id.to_string()));
        }
        let mut next = entry.snapshot.clone();
        f(&mut next);
        entry.snapshot = next.clone();
        Ok(next)
    }

    /// Signal cancellation; the sweep records the terminal state itself.
    pub async fn cancel(&self, scan_id: &str) -> Result<ScanSnapshot, DiscoveryError> {
        let inner = self.inner.read().await;
        let entry = inner
            .entries
            .get(scan_id)
            .ok_or_else(|| DiscoveryError::ScanNotFound(scan_id.to_string()))?;
        if !entry.snapshot.is_terminal() {
            entry.cancel.cancel();
        }
        Ok(entry.snapshot.clone())
    }

    /// Cancel every live scan, e.g. on shutdown.
    pub async fn cancel_all(&self) {
        for entry in self.inner.read().await.entries.values() {
            entry.cancel.cancel();
        }
    }

    /// Drop finished scans older than `finished_ttl` and unfinished ones older
    /// than `stuck_ttl`. Returns how many entries were removed.
    pub async fn evict_at(&self, now: OffsetDateTime, policy: &EvictionPolicy) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|id, e| {
            let expired = match e.snapshot.ended_at {
                Some(ended) => now - ended > policy.finished_ttl,
                None => now - e.snapshot.started_at > policy.stuck_ttl,
            };
            if expired {
                debug!("evicting scan {id} ({:?})", e.snapshot.status);
                e.cancel.cancel();
            }
            !expired
        });
        before - inner.entries.len()
    }

    pub async fn evict(&self, policy: &EvictionPolicy) -> usize {
        self.evict_at(OffsetDateTime::now_utc(), policy).await
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Run the eviction pass every `policy.interval` until `shutdown` fires.
pub fn spawn_eviction(
    registry: Arc<ScanRegistry>,
    policy: EvictionPolicy,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(policy.interval);
        // The first tick completes immediately.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let removed = registry.evict(&policy).await;
                    if removed > 0 {
                        info!("evicted {removed} stale scan(s)");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScanStatus;
    use std::time::Duration;

    fn snap(id: &str, kind: ScanKind, net: NetworkPrefix) -> ScanSnapshot {
        ScanSnapshot::pending(id.to_string(), kind, vec![net])
    }

    const NET: NetworkPrefix = NetworkPrefix::new(10, 0, 0);

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let reg = ScanRegistry::new();
        reg.create(snap("a", ScanKind::Discover, NET)).await.unwrap();
        let err = reg.create(snap("a", ScanKind::Discover, NET)).await.unwrap_err();
        assert_eq!(err, DiscoveryError::DuplicateScan("a".into()));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn latest_prefers_active_then_any() {
        let reg = ScanRegistry::new();
        reg.create(snap("old", ScanKind::Discover, NET)).await.unwrap();
        reg.create(snap("new", ScanKind::Discover, NET)).await.unwrap();
        reg.create(snap("net", ScanKind::Network, NET)).await.unwrap();

        assert_eq!(reg.latest_active(Some(ScanKind::Discover)).await.unwrap().scan_id, "new");
        assert_eq!(reg.latest_active(None).await.unwrap().scan_id, "net");

        reg.update("new", |s| s.mark_completed()).await.unwrap();
        assert_eq!(reg.latest_active(Some(ScanKind::Discover)).await.unwrap().scan_id, "old");
        reg.update("old", |s| s.mark_failed("boom")).await.unwrap();
        assert!(reg.latest_active(Some(ScanKind::Discover)).await.is_none());
        assert_eq!(reg.latest_any(Some(ScanKind::Discover)).await.unwrap().scan_id, "new");
    }

    #[tokio::test]
    async fn terminal_snapshots_are_frozen() {
        let reg = ScanRegistry::new();
        reg.create(snap("a", ScanKind::Network, NET)).await.unwrap();
        let done = reg.update("a", |s| s.mark_completed()).await.unwrap();
        let err = reg.update("a", |s| s.record_progress(1)).await.unwrap_err();
        assert_eq!(err, DiscoveryError::ScanFinished("a".into()));
        assert_eq!(reg.get("a").await.unwrap(), done);
        assert!(matches!(reg.update("zzz", |_| {}).await, Err(DiscoveryError::ScanNotFound(_))));
    }

    #[tokio::test]
    async fn cancel_fires_token_only_for_live_scans() {
        let reg = ScanRegistry::new();
        let token = reg.create(snap("a", ScanKind::Network, NET)).await.unwrap();
        let current = reg.cancel("a").await.unwrap();
        assert_eq!(current.status, ScanStatus::Pending);
        assert!(token.is_cancelled());
        assert!(matches!(reg.cancel("b").await, Err(DiscoveryError::ScanNotFound(_))));
    }

    #[tokio::test]
    async fn eviction_respects_both_thresholds() {
        let reg = ScanRegistry::new();
        let policy = EvictionPolicy::default();
        reg.create(snap("done", ScanKind::Discover, NET)).await.unwrap();
        reg.update("done", |s| s.mark_completed()).await.unwrap();
        let running = reg.create(snap("running", ScanKind::Discover, NET)).await.unwrap();
        reg.update("running", |s| s.mark_running()).await.unwrap();

        let now = OffsetDateTime::now_utc();
        assert_eq!(reg.evict_at(now, &policy).await, 0);

        // Past the finished TTL but not the stuck TTL.
        let later = now + Duration::from_secs(90 * 60);
        assert_eq!(reg.evict_at(later, &policy).await, 1);
        assert!(reg.get("done").await.is_none());
        assert!(reg.get("running").await.is_some());

        let much_later = now + Duration::from_secs(3 * 3600);
        assert_eq!(reg.evict_at(much_later, &policy).await, 1);
        assert!(reg.is_empty().await);
        assert!(running.is_cancelled());
    }
}
