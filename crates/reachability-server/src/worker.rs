//! Per-host polling loop.

use crate::gateway::PersistenceGateway;
use crate::metrics::MetricsRegistry;
use crate::registry::HostRegistry;
use crate::snapshot::{ActiveHostSnapshot, SnapshotHandle};
use crate::types::{EventLevel, Host, HostId, LogEvent, ProbeResult};
use reachability::{Diagnostics, Prober};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_CATEGORY: &str = "worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopped,
}

/// Why a worker exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Asked to stop by its owner
    Cancelled,
    /// The host is no longer active
    Inactive,
    /// The host no longer exists in the registry
    Removed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::Inactive => write!(f, "host deactivated"),
            StopReason::Removed => write!(f, "host removed"),
        }
    }
}

/// Everything a worker needs, shared by all workers
#[derive(Clone)]
pub struct WorkerContext {
    pub snapshot: SnapshotHandle,
    pub registry: Arc<dyn HostRegistry>,
    pub prober: Arc<dyn Prober>,
    pub diagnostics: Arc<dyn Diagnostics>,
    pub gateway: Arc<PersistenceGateway>,
    /// Packets per probe
    pub packet_count: u32,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

/// Polls one host until the host goes away or the worker is cancelled.
///
/// Every iteration starts by re-reading the host, so interval and status
/// changes apply on the next cycle.
pub struct HostWorker {
    host_id: HostId,
    ctx: WorkerContext,
    state: WorkerState,
    /// Snapshot version the last membership check ran against
    seen_version: u64,
}

impl HostWorker {
    pub fn new(host_id: HostId, ctx: WorkerContext) -> Self {
        Self {
            host_id,
            ctx,
            state: WorkerState::Running,
            seen_version: 0,
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Snapshot version seen by the most recent membership check
    pub fn seen_version(&self) -> u64 {
        self.seen_version
    }

    /// Current record for this worker's host, or the reason to stop.
    ///
    /// The snapshot decides membership; the registry supplies the freshest
    /// attributes. A failed registry read falls back to the snapshot copy.
    pub async fn resolve_host(&self) -> Result<Host, StopReason> {
        let snapshot = self.ctx.snapshot.load();
        self.resolve_against(&snapshot).await
    }

    async fn resolve_against(&self, snapshot: &ActiveHostSnapshot) -> Result<Host, StopReason> {
        let Some(cached) = snapshot.get(self.host_id) else {
            return Err(StopReason::Inactive);
        };

        match self.ctx.registry.get_host(self.host_id).await {
            Ok(Some(host)) if host.is_active() => Ok(host),
            Ok(Some(_)) => Err(StopReason::Inactive),
            Ok(None) => Err(StopReason::Removed),
            Err(e) => {
                warn!(host_id = self.host_id, error = %e, "Registry read failed, using snapshot copy");
                Ok(cached.clone())
            }
        }
    }

    /// Probe, classify, diagnose on failure, and hand the result to the gateway.
    ///
    /// Returns `None` when the probe could not run.
    pub async fn run_cycle(&self, host: &Host) -> Option<ProbeResult> {
        let timestamp = SystemTime::now();
        let measurement = match self.ctx.prober.probe(&host.address, self.ctx.packet_count).await {
            Ok(measurement) => measurement,
            Err(e) => {
                if let Some(ref m) = self.ctx.metrics {
                    m.record_probe_error(host.id);
                }
                self.event(
                    format!("Probe of {} ({}) failed: {}", host.name, host.address, e),
                    EventLevel::Error,
                );
                return None;
            }
        };

        let mut result = ProbeResult::new(host.id, timestamp, measurement);
        if let Some(ref m) = self.ctx.metrics {
            m.record_probe(
                host.id,
                result.status(),
                result.measurement().rtt_avg_ms,
                result.measurement().duration,
            );
        }

        if result.status().is_success() {
            debug!(
                host_id = host.id,
                address = %host.address,
                rtt_avg_ms = ?result.measurement().rtt_avg_ms,
                "Probe succeeded"
            );
        } else {
            let report = self.ctx.diagnostics.collect(&host.address).await;
            if let Some(ref m) = self.ctx.metrics {
                m.record_diagnostics();
            }
            result = result.with_diagnostics(report);

            let measurement = result.measurement();
            self.event(
                format!(
                    "{} ({}): {} ({}/{} received)",
                    host.name,
                    host.address,
                    result.status(),
                    measurement.received,
                    measurement.sent
                ),
                EventLevel::Warning,
            );
        }

        self.ctx.gateway.submit_probe_result(result.clone());
        Some(result)
    }

    /// Run until cancelled or the host is deactivated or removed
    pub async fn run(&mut self, cancel: CancellationToken) -> StopReason {
        self.state = WorkerState::Running;
        self.event(format!("Worker started for host {}", self.host_id), EventLevel::Info);

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let snapshot = self.ctx.snapshot.load();
            self.seen_version = snapshot.version();
            let host = match self.resolve_against(&snapshot).await {
                Ok(host) => host,
                Err(reason) => break reason,
            };

            self.run_cycle(&host).await;

            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep(host.interval) => {}
            }
        };

        self.state = WorkerState::Stopped;
        self.event(
            format!("Worker stopped for host {}: {}", self.host_id, reason),
            EventLevel::Info,
        );
        reason
    }

    fn event(&self, message: String, level: EventLevel) {
        self.ctx
            .gateway
            .log_event(LogEvent::new(EVENT_CATEGORY, message, level).for_host(self.host_id));
    }
}
