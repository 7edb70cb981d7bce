//! Active host snapshot and the task that keeps it current.

use crate::metrics::MetricsRegistry;
use crate::registry::{HostRegistry, RegistryError};
use crate::types::{Host, HostId};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable set of hosts that should have a running worker
#[derive(Debug, Clone, Default)]
pub struct ActiveHostSnapshot {
    version: u64,
    hosts: HashMap<HostId, Host>,
}

impl ActiveHostSnapshot {
    /// Keep only active hosts from a full registry read
    pub fn from_hosts(version: u64, hosts: impl IntoIterator<Item = Host>) -> Self {
        Self {
            version,
            hosts: hosts
                .into_iter()
                .filter(Host::is_active)
                .map(|h| (h.id, h))
                .collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(&id)
    }

    pub fn contains(&self, id: HostId) -> bool {
        self.hosts.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = HostId> + '_ {
        self.hosts.keys().copied()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Shared handle to the current snapshot. Readers never block and always see
/// a complete snapshot.
#[derive(Clone, Default)]
pub struct SnapshotHandle {
    current: Arc<ArcSwap<ActiveHostSnapshot>>,
}

impl SnapshotHandle {
    pub fn new(initial: ActiveHostSnapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub fn load(&self) -> Arc<ActiveHostSnapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, snapshot: ActiveHostSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

/// Periodically re-reads the registry and republishes the active set
pub struct RegistryRefresher {
    registry: Arc<dyn HostRegistry>,
    snapshot: SnapshotHandle,
    interval: Duration,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RegistryRefresher {
    pub fn new(
        registry: Arc<dyn HostRegistry>,
        snapshot: SnapshotHandle,
        interval: Duration,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            registry,
            snapshot,
            interval,
            metrics,
        }
    }

    /// One refresh. On error the previous snapshot stays published.
    pub async fn refresh_once(&self) -> Result<Arc<ActiveHostSnapshot>, RegistryError> {
        let hosts = match self.registry.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                if let Some(ref m) = self.metrics {
                    m.record_registry_error();
                }
                return Err(e);
            }
        };

        let version = self.snapshot.load().version() + 1;
        let next = ActiveHostSnapshot::from_hosts(version, hosts);
        debug!(version, active = next.len(), "Publishing host snapshot");

        if let Some(ref m) = self.metrics {
            m.record_snapshot(version, next.len());
        }
        self.snapshot.publish(next);
        Ok(self.snapshot.load())
    }

    /// Refresh on every tick until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "Registry refresher started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!(error = %e, "Registry read failed, keeping previous snapshot");
                    }
                }
            }
        }

        info!("Registry refresher stopped");
    }
}
