//! Keeps exactly one worker running per host in the active snapshot.

use crate::types::{EventLevel, HostId, LogEvent};
use crate::worker::{HostWorker, StopReason, WorkerContext};
use futures::FutureExt;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CATEGORY: &str = "reconciler";

/// A running worker as seen by the reconciler
pub struct WorkerHandle {
    pub host_id: HostId,
    cancel: CancellationToken,
    join: JoinHandle<WorkerExit>,
}

/// How a worker task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkerExit {
    reason: StopReason,
    /// Snapshot version the worker last checked membership against
    seen_version: u64,
}

impl WorkerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<HostId>,
    pub stopped: Vec<HostId>,
    /// Workers found already exited and removed from the table
    pub reaped: Vec<HostId>,
}

impl ReconcileReport {
    /// True when nothing was started or stopped
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

pub struct Reconciler {
    ctx: WorkerContext,
    interval: Duration,
    /// Parent of every worker's cancellation token
    root: CancellationToken,
    running: HashMap<HostId, WorkerHandle>,
    /// Cancelled workers that have not exited yet
    stopping: HashMap<HostId, WorkerHandle>,
    /// Hosts whose worker stopped on its own, keyed to the snapshot version
    /// it saw. Not restarted until a newer snapshot is published.
    retired: HashMap<HostId, u64>,
}

impl Reconciler {
    pub fn new(ctx: WorkerContext, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            root: CancellationToken::new(),
            running: HashMap::new(),
            stopping: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    /// Host IDs with a running worker
    pub fn running(&self) -> HashSet<HostId> {
        self.running.keys().copied().collect()
    }

    pub fn is_running(&self, host_id: HostId) -> bool {
        self.running.contains_key(&host_id)
    }

    /// Workers cancelled but not yet exited
    pub fn stopping_count(&self) -> usize {
        self.stopping.len()
    }

    /// Diff the snapshot against running workers and start or stop to match
    pub fn reconcile_once(&mut self) -> ReconcileReport {
        let snapshot = self.ctx.snapshot.load();
        let version = snapshot.version();
        let mut report = ReconcileReport::default();

        self.reap(version, &mut report);
        self.retired.retain(|_, seen| *seen == version);

        let to_stop: Vec<HostId> = self
            .running
            .keys()
            .copied()
            .filter(|id| !snapshot.contains(*id))
            .collect();
        for host_id in to_stop {
            if let Some(handle) = self.running.remove(&host_id) {
                handle.cancel();
                self.stopping.insert(host_id, handle);
                report.stopped.push(host_id);
            }
        }

        let mut to_start: Vec<HostId> = snapshot
            .ids()
            .filter(|id| {
                !self.running.contains_key(id)
                    && !self.stopping.contains_key(id)
                    && !self.retired.contains_key(id)
            })
            .collect();
        to_start.sort_unstable();
        for host_id in to_start {
            self.spawn(host_id);
            report.started.push(host_id);
        }

        if !report.is_noop() {
            self.event(
                format!(
                    "Reconciled snapshot {}: started {:?}, stopped {:?}",
                    version, report.started, report.stopped
                ),
                EventLevel::Info,
            );
        }
        if let Some(ref m) = self.ctx.metrics {
            m.record_reconcile(report.started.len(), report.stopped.len(), report.reaped.len());
            m.set_workers_active(self.running.len());
        }

        report
    }

    fn reap(&mut self, version: u64, report: &mut ReconcileReport) {
        let finished: Vec<HostId> = self
            .running
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for host_id in finished {
            let Some(mut handle) = self.running.remove(&host_id) else {
                continue;
            };
            match (&mut handle.join).now_or_never() {
                Some(Ok(WorkerExit {
                    reason: StopReason::Cancelled,
                    ..
                })) => {}
                Some(Ok(WorkerExit {
                    reason,
                    seen_version,
                })) => {
                    debug!(host_id, %reason, seen_version, version, "Worker exited on its own");
                    if seen_version == version {
                        self.retired.insert(host_id, seen_version);
                    }
                }
                Some(Err(e)) => {
                    error!(host_id, error = %e, "Worker task failed");
                }
                None => {
                    self.running.insert(host_id, handle);
                    continue;
                }
            }
            report.reaped.push(host_id);
        }

        self.stopping.retain(|host_id, handle| {
            if handle.is_finished() {
                report.reaped.push(*host_id);
                false
            } else {
                true
            }
        });

        if let Some(ref m) = self.ctx.metrics {
            for host_id in &report.reaped {
                m.forget_host(*host_id);
            }
        }
    }

    fn spawn(&mut self, host_id: HostId) {
        let cancel = self.root.child_token();
        let mut worker = HostWorker::new(host_id, self.ctx.clone());
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let reason = worker.run(token).await;
            WorkerExit {
                reason,
                seen_version: worker.seen_version(),
            }
        });

        self.running.insert(
            host_id,
            WorkerHandle {
                host_id,
                cancel,
                join,
            },
        );
    }

    /// Reconcile on every tick until cancelled, then shut every worker down
    pub async fn run(mut self, cancel: CancellationToken, shutdown_timeout: Duration) {
        info!(interval = ?self.interval, "Reconciler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reconcile_once();
                }
            }
        }

        self.shutdown(shutdown_timeout).await;
        info!("Reconciler stopped");
    }

    /// Cancel every worker and wait for them to exit. Workers still running
    /// after `timeout` are aborted.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.root.cancel();

        let handles: Vec<WorkerHandle> = self
            .running
            .drain()
            .chain(self.stopping.drain())
            .map(|(_, h)| h)
            .collect();
        if handles.is_empty() {
            return;
        }

        let count = handles.len();
        let aborts: Vec<_> = handles.iter().map(|h| h.join.abort_handle()).collect();
        let joins = handles.into_iter().map(|h| h.join);

        if tokio::time::timeout(timeout, join_all(joins)).await.is_err() {
            warn!(count, ?timeout, "Workers did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        if let Some(ref m) = self.ctx.metrics {
            m.set_workers_active(0);
        }
        info!(count, "All workers stopped");
    }

    fn event(&self, message: String, level: EventLevel) {
        self.ctx
            .gateway
            .log_event(LogEvent::new(EVENT_CATEGORY, message, level));
    }
}
