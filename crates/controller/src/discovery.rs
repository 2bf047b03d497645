//! Discovery loop: keeps the watched kind set in step with the registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cfghist_core::source::{EventSource, MappingError, MappingResolver, RegistryError, TypeRegistry};
use cfghist_core::{Gvk, ResourceMatcher};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;
use crate::watches::WatchManager;

/// The single work item of the discovery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Bound on waiting for new watches to deliver their initial listing.
    pub sync_timeout: Duration,
    /// Periodic re-run independent of registry notifications.
    pub resync: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { sync_timeout: Duration::from_secs(5), resync: Duration::from_secs(300) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub started: Vec<Gvk>,
    /// Matched kinds without a mapping yet.
    pub pending: Vec<Gvk>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("timeout while waiting for watches to sync: {}", join_gvks(.0))]
    CacheSyncTimeout(Vec<Gvk>),
}

fn join_gvks(gvks: &[Gvk]) -> String {
    gvks.iter().map(Gvk::to_string).collect::<Vec<_>>().join(", ")
}

pub struct DiscoveryLoop<R, M, S> {
    registry: Arc<R>,
    resolver: Arc<M>,
    watches: WatchManager<S>,
    matcher: ResourceMatcher,
    cfg: DiscoveryConfig,
}

impl<R, M, S> DiscoveryLoop<R, M, S>
where
    R: TypeRegistry,
    M: MappingResolver,
    S: EventSource,
{
    pub fn new(
        registry: Arc<R>,
        resolver: Arc<M>,
        watches: WatchManager<S>,
        matcher: ResourceMatcher,
        cfg: DiscoveryConfig,
    ) -> Self {
        Self { registry, resolver, watches, matcher, cfg }
    }

    pub fn watches(&self) -> &WatchManager<S> {
        &self.watches
    }

    pub fn into_watches(self) -> WatchManager<S> {
        self.watches
    }

    /// Kinds the registry currently offers for tracking.
    pub fn current_kinds(&self) -> Result<BTreeSet<Gvk>, RegistryError> {
        let descriptors = self.registry.list()?;
        Ok(descriptors.iter().flat_map(|d| self.matcher.matches(d)).collect())
    }

    /// One discovery cycle. Kinds that disappear from the registry keep their
    /// watch; only additions, and kinds whose watch has ended, are acted on.
    pub async fn sync(&mut self) -> Result<SyncReport, DiscoveryError> {
        let current = self.current_kinds()?;
        let new: Vec<Gvk> = current.into_iter().filter(|g| !self.watches.is_watching(g)).collect();
        let mut report = SyncReport::default();
        if new.is_empty() {
            return Ok(report);
        }

        self.resolver.invalidate().await?;
        let mut waits = Vec::with_capacity(new.len());
        for gvk in new {
            match self.resolver.resolve(&gvk) {
                Ok(mapping) => {
                    waits.push(self.watches.start_watch(mapping).synced());
                    report.started.push(gvk);
                }
                Err(MappingError::NotFound(_)) => {
                    debug!(gvk = %gvk, "no mapping yet");
                    report.pending.push(gvk);
                }
                Err(e) => {
                    warn!(gvk = %gvk, error = %e, "mapping failed");
                    report.pending.push(gvk);
                }
            }
        }

        let all_synced = async {
            for mut rx in waits {
                let _ = rx.wait_for(|synced| *synced).await;
            }
        };
        let _ = tokio::time::timeout(self.cfg.sync_timeout, all_synced).await;
        let unsynced: Vec<Gvk> = report.started.iter().filter(|g| !self.watches.has_synced(g)).cloned().collect();
        if !unsynced.is_empty() {
            return Err(DiscoveryError::CacheSyncTimeout(unsynced));
        }
        Ok(report)
    }

    /// Single worker over `queue` until `shutdown` fires. Returns the watch
    /// manager so the caller can stop the watches.
    pub async fn run(mut self, queue: WorkQueue<SyncKey>, shutdown: CancellationToken) -> WatchManager<S> {
        info!(suffix = %self.matcher.suffix(), "discovery loop started");
        let resync = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            let period = self.cfg.resync;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(period) => queue.add(SyncKey),
                    }
                }
            })
        };

        loop {
            let key = tokio::select! {
                _ = shutdown.cancelled() => break,
                key = queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            counter!("discovery_syncs_total", 1u64);
            // A sync stuck on the API server must not hold up shutdown.
            let res = tokio::select! {
                _ = shutdown.cancelled() => {
                    queue.done(&key);
                    break;
                }
                res = self.sync() => res,
            };
            match res {
                Ok(report) if report.pending.is_empty() => {
                    queue.forget(&key);
                    if !report.started.is_empty() {
                        info!(started = report.started.len(), watched = self.watches.len(), "discovery sync done");
                    }
                }
                Ok(report) => {
                    let delay = queue.add_rate_limited(key);
                    info!(
                        started = report.started.len(),
                        pending = %join_gvks(&report.pending),
                        retry_ms = delay.as_millis() as u64,
                        "kinds waiting for a mapping"
                    );
                }
                Err(e) => {
                    counter!("discovery_sync_failures_total", 1u64);
                    let delay = queue.add_rate_limited(key);
                    warn!(error = %e, retry_ms = delay.as_millis() as u64, "discovery sync failed");
                }
            }
            queue.done(&key);
        }

        queue.shut_down();
        resync.abort();
        info!("discovery loop stopped");
        self.watches
    }
}
