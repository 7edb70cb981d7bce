//! Wires the scheduler components together and runs them until shutdown.

use crate::gateway::PersistenceGateway;
use crate::http_server::MetricsServer;
use crate::metrics::MetricsRegistry;
use crate::reconciler::Reconciler;
use crate::registry::HostRegistry;
use crate::snapshot::{RegistryRefresher, SnapshotHandle};
use crate::store::StoreConnector;
use crate::supervisor::ConnectivitySupervisor;
use crate::types::{EventLevel, LogEvent, ServerConfig};
use crate::worker::WorkerContext;
use reachability::{CommandDiagnostics, Diagnostics, PingProber, Prober};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Adaptive host monitor
pub struct MonitorServer {
    config: ServerConfig,
    registry: Arc<dyn HostRegistry>,
    connector: Arc<dyn StoreConnector>,
    prober: Arc<dyn Prober>,
    diagnostics: Arc<dyn Diagnostics>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl MonitorServer {
    /// Create a server probing with the system `ping` and `traceroute`
    pub fn new(
        config: ServerConfig,
        registry: Arc<dyn HostRegistry>,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let prober = Arc::new(PingProber::with_program(
            config.ping_program.clone(),
            config.probe_timeout,
        ));
        let diagnostics = Arc::new(CommandDiagnostics::new(config.diagnostics.clone()));
        let metrics = config
            .metrics_enabled
            .then(|| Arc::new(MetricsRegistry::new()));

        Self {
            config,
            registry,
            connector,
            prober,
            diagnostics,
            metrics,
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Collect metrics into `metrics` regardless of `metrics_enabled`. The
    /// HTTP endpoint still only starts when enabled.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<Arc<MetricsRegistry>> {
        self.metrics.clone()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// On shutdown every worker is cancelled and awaited (bounded) before
    /// pending writes are drained and the store connection is released.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            prober = self.prober.name(),
            store = %self.connector.describe(),
            "Starting monitor server"
        );

        let gateway = Arc::new(
            PersistenceGateway::new(self.connector.clone(), self.config.retry.clone())
                .with_metrics(self.metrics.clone()),
        );
        if let Err(e) = gateway.connect().await {
            warn!(error = %e, "Initial store connection failed, supervisor will retry");
        }

        let snapshot = SnapshotHandle::default();
        let refresher = RegistryRefresher::new(
            self.registry.clone(),
            snapshot.clone(),
            self.config.refresh_interval,
            self.metrics.clone(),
        );
        match refresher.refresh_once().await {
            Ok(initial) => info!(active = initial.len(), "Loaded initial host snapshot"),
            Err(e) => warn!(error = %e, "Initial registry read failed"),
        }

        let reconciler = Reconciler::new(
            WorkerContext {
                snapshot,
                registry: self.registry.clone(),
                prober: self.prober.clone(),
                diagnostics: self.diagnostics.clone(),
                gateway: gateway.clone(),
                packet_count: self.config.packet_count,
                metrics: self.metrics.clone(),
            },
            self.config.reconcile_interval,
        );
        let supervisor = ConnectivitySupervisor::new(
            gateway.clone(),
            self.config.supervisor_interval,
            self.config.reconnect_attempts,
            self.metrics.clone(),
        );

        gateway.log_event(LogEvent::new("server", "Monitor server started", EventLevel::Info));

        let cancel = shutdown.child_token();
        let tasks = TaskTracker::new();
        tasks.spawn(refresher.run(cancel.clone()));
        tasks.spawn(reconciler.run(cancel.clone(), self.config.shutdown_timeout));
        tasks.spawn(supervisor.run(cancel.clone()));

        if let (true, Some(registry)) = (self.config.metrics_enabled, self.metrics.clone()) {
            let server = MetricsServer::new(registry, self.config.metrics_listen_addr.clone());
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = server.run(cancel).await {
                    warn!(error = %e, "Metrics server error");
                }
            });
        }
        tasks.close();

        info!("All tasks spawned, server running");
        cancel.cancelled().await;
        info!("Shutdown requested");

        // The reconciler bounds its own wait on workers; allow it that long plus slack
        let limit = self.config.shutdown_timeout * 2;
        if tokio::time::timeout(limit, tasks.wait()).await.is_err() {
            warn!(?limit, "Background tasks did not stop in time");
        }

        gateway.log_event(LogEvent::new("server", "Monitor server stopped", EventLevel::Info));
        gateway.close(self.config.shutdown_timeout).await;
        info!("Monitor server stopped");
    }
}
