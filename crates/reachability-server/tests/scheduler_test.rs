//! Integration tests for the reconciler, host workers, and the wired server

use async_trait::async_trait;
use reachability::{DiagnosticReport, Diagnostics, ProbeError, ProbeMeasurement, ProbeStatus, Prober};
use reachability_server::gateway::PersistenceGateway;
use reachability_server::metrics::MetricsRegistry;
use reachability_server::reconciler::Reconciler;
use reachability_server::registry::{HostRegistry, InMemoryRegistry};
use reachability_server::retry::RetryPolicy;
use reachability_server::server::MonitorServer;
use reachability_server::snapshot::{ActiveHostSnapshot, SnapshotHandle};
use reachability_server::store::MemoryStore;
use reachability_server::types::{Host, HostStatus, ServerConfig};
use reachability_server::worker::WorkerContext;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Prober returning a fixed number of replies, counting calls
#[derive(Default)]
struct FakeProber {
    received: AtomicU32,
    broken: AtomicBool,
    calls: AtomicU32,
}

impl FakeProber {
    fn answering(received: u32) -> Arc<Self> {
        let prober = Self::default();
        prober.received.store(received, Ordering::SeqCst);
        Arc::new(prober)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, address: &str, count: u32) -> Result<ProbeMeasurement, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(ProbeError::InvalidAddress(address.to_string()));
        }

        let received = self.received.load(Ordering::SeqCst).min(count);
        let mut measurement = ProbeMeasurement {
            sent: count,
            received,
            transcript: format!("PING {}\n{} packets transmitted, {} received", address, count, received),
            duration: Duration::from_millis(5),
            ..Default::default()
        };
        for slot in measurement.hops.iter_mut().take(received as usize) {
            *slot = Some(0.4);
        }
        if received > 0 {
            measurement.rtt_min_ms = Some(0.4);
            measurement.rtt_avg_ms = Some(0.4);
            measurement.rtt_max_ms = Some(0.4);
        }
        Ok(measurement)
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[derive(Default)]
struct FakeDiagnostics {
    calls: AtomicU32,
}

impl FakeDiagnostics {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Diagnostics for FakeDiagnostics {
    async fn collect(&self, address: &str) -> DiagnosticReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DiagnosticReport {
            resolution: format!("{} has no PTR record", address),
            trace: format!("traceroute to {}\n 1  *\nExit Code: 1", address),
            trace_hops: Vec::new(),
        }
    }
}

fn host(id: u64, interval: Duration) -> Host {
    Host::new(id, format!("host-{}", id), format!("10.0.0.{}", id), interval)
}

fn server_config() -> ServerConfig {
    ServerConfig {
        packet_count: 4,
        refresh_interval: Duration::from_secs(1),
        reconcile_interval: Duration::from_millis(500),
        shutdown_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

struct Harness {
    registry: Arc<InMemoryRegistry>,
    store: MemoryStore,
    prober: Arc<FakeProber>,
    diagnostics: Arc<FakeDiagnostics>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(hosts: Vec<Host>, prober: Arc<FakeProber>) -> Self {
        let registry = Arc::new(InMemoryRegistry::new(hosts));
        let store = MemoryStore::new();
        let diagnostics = Arc::new(FakeDiagnostics::default());
        let shutdown = CancellationToken::new();

        let server = MonitorServer::new(server_config(), registry.clone(), Arc::new(store.clone()))
            .with_prober(prober.clone())
            .with_diagnostics(diagnostics.clone());
        let task = tokio::spawn(server.run(shutdown.clone()));

        Self {
            registry,
            store,
            prober,
            diagnostics,
            shutdown,
            task,
        }
    }

    async fn stop(self) -> (MemoryStore, Arc<FakeProber>, Arc<FakeDiagnostics>) {
        self.shutdown.cancel();
        self.task.await.unwrap();
        (self.store, self.prober, self.diagnostics)
    }
}

async fn reconciler_with(hosts: Vec<Host>) -> (Reconciler, SnapshotHandle, Arc<FakeProber>) {
    let registry = Arc::new(InMemoryRegistry::new(hosts.clone()));
    let store = MemoryStore::new();
    let gateway = PersistenceGateway::new(Arc::new(store), RetryPolicy::default());
    gateway.connect().await.unwrap();

    let snapshot = SnapshotHandle::new(ActiveHostSnapshot::from_hosts(1, hosts));
    let prober = FakeProber::answering(4);
    let ctx = WorkerContext {
        snapshot: snapshot.clone(),
        registry: registry as Arc<dyn HostRegistry>,
        prober: prober.clone(),
        diagnostics: Arc::new(FakeDiagnostics::default()),
        gateway: Arc::new(gateway),
        packet_count: 4,
        metrics: None,
    };
    (Reconciler::new(ctx, Duration::from_millis(500)), snapshot, prober)
}

#[tokio::test(start_paused = true)]
async fn test_successful_probe_is_persisted_as_success() {
    let harness = Harness::start(
        vec![Host::new(1, "local", "127.0.0.1", Duration::from_secs(1))],
        FakeProber::answering(4),
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let (store, prober, diagnostics) = harness.stop().await;

    let results = store.probe_results();
    assert!(!results.is_empty());
    assert_eq!(results.len() as u32, prober.calls());
    for result in &results {
        assert_eq!(result.host_id, 1);
        assert_eq!(result.status(), ProbeStatus::Success);
        assert_eq!(result.measurement().sent, 4);
        assert_eq!(result.measurement().received, 4);
        assert!(result.diagnostics().is_none());
    }
    assert_eq!(diagnostics.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_collects_diagnostics_once() {
    let harness = Harness::start(
        vec![Host::new(1, "local", "127.0.0.1", Duration::from_secs(10))],
        FakeProber::answering(0),
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (store, prober, diagnostics) = harness.stop().await;

    assert_eq!(prober.calls(), 1);
    assert_eq!(diagnostics.calls(), 1);

    let results = store.probe_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status(), ProbeStatus::NoResponse);
    assert_eq!(results[0].color(), "#FF0000");
    let report = results[0].diagnostics().unwrap();
    assert!(!report.resolution.is_empty());
    assert!(!report.trace.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deactivated_host_stops_probing() {
    let harness = Harness::start(vec![host(1, Duration::from_secs(1))], FakeProber::answering(4));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let before = harness.prober.calls();
    assert!(before >= 2);

    harness.registry.set_status(1, HostStatus::Inactive).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(harness.prober.calls(), before);

    let (store, _, _) = harness.stop().await;
    let stopped = store
        .events()
        .into_iter()
        .filter(|e| e.host_id == Some(1) && e.message.contains("Worker stopped"))
        .count();
    assert_eq!(stopped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_host_picked_up_without_restart() {
    let harness = Harness::start(vec![host(1, Duration::from_secs(1))], FakeProber::answering(4));

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.registry.upsert(host(2, Duration::from_secs(1))).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let (store, _, _) = harness.stop().await;
    let results = store.probe_results();
    assert!(results.iter().any(|r| r.host_id == 1));
    assert!(results.iter().any(|r| r.host_id == 2));
}

#[tokio::test(start_paused = true)]
async fn test_probe_errors_do_not_stop_worker() {
    let prober = FakeProber::answering(4);
    prober.broken.store(true, Ordering::SeqCst);
    let harness = Harness::start(vec![host(1, Duration::from_secs(1))], prober);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(harness.prober.calls() >= 3);

    harness.prober.broken.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (store, _, _) = harness.stop().await;
    assert!(!store.probe_results().is_empty());
    assert!(
        store
            .events()
            .iter()
            .any(|e| e.host_id == Some(1) && e.message.contains("failed"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_registry_outage_keeps_polling() {
    let harness = Harness::start(vec![host(1, Duration::from_secs(1))], FakeProber::answering(4));

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.registry.set_unavailable(true);
    let before = harness.prober.calls();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(harness.prober.calls() > before);

    harness.stop().await;
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (mut reconciler, _, _) =
        reconciler_with(vec![host(1, Duration::from_secs(60)), host(2, Duration::from_secs(60))]).await;

    let first = reconciler.reconcile_once();
    assert_eq!(first.started, vec![1, 2]);
    assert!(first.stopped.is_empty());

    let second = reconciler.reconcile_once();
    assert!(second.is_noop());
    assert_eq!(reconciler.running().len(), 2);

    reconciler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_reconcile_converges_on_snapshot_changes() {
    let (mut reconciler, snapshot, _) = reconciler_with(vec![host(1, Duration::from_secs(60))]).await;
    reconciler.reconcile_once();

    // absent -> active
    snapshot.publish(ActiveHostSnapshot::from_hosts(
        2,
        vec![host(1, Duration::from_secs(60)), host(2, Duration::from_secs(60))],
    ));
    let report = reconciler.reconcile_once();
    assert_eq!(report.started, vec![2]);
    assert!(report.stopped.is_empty());

    // active -> inactive
    snapshot.publish(ActiveHostSnapshot::from_hosts(
        3,
        vec![
            host(1, Duration::from_secs(60)).with_status(HostStatus::Inactive),
            host(2, Duration::from_secs(60)),
        ],
    ));
    let report = reconciler.reconcile_once();
    assert_eq!(report.stopped, vec![1]);
    assert!(report.started.is_empty());
    assert!(!reconciler.is_running(1));
    assert!(reconciler.is_running(2));

    // attribute change on a running host leaves it alone
    snapshot.publish(ActiveHostSnapshot::from_hosts(4, vec![host(2, Duration::from_secs(5))]));
    assert!(reconciler.reconcile_once().is_noop());

    reconciler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_no_duplicate_worker_while_old_one_exits() {
    let (mut reconciler, snapshot, _) = reconciler_with(vec![host(1, Duration::from_secs(60))]).await;
    reconciler.reconcile_once();
    tokio::time::sleep(Duration::from_millis(10)).await;

    snapshot.publish(ActiveHostSnapshot::from_hosts(2, Vec::new()));
    assert_eq!(reconciler.reconcile_once().stopped, vec![1]);

    // Reactivated before the cancelled worker has had a chance to exit
    snapshot.publish(ActiveHostSnapshot::from_hosts(3, vec![host(1, Duration::from_secs(60))]));
    let report = reconciler.reconcile_once();
    assert!(report.started.is_empty());
    assert_eq!(reconciler.stopping_count(), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = reconciler.reconcile_once();
    assert_eq!(report.reaped, vec![1]);
    assert_eq!(report.started, vec![1]);
    assert_eq!(reconciler.running().len(), 1);

    reconciler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_self_stopped_worker_not_restarted_from_stale_snapshot() {
    let hosts = vec![host(1, Duration::from_secs(1))];
    let registry = Arc::new(InMemoryRegistry::new(hosts.clone()));
    let gateway = PersistenceGateway::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
    gateway.connect().await.unwrap();
    let snapshot = SnapshotHandle::new(ActiveHostSnapshot::from_hosts(1, hosts));
    let prober = FakeProber::answering(4);

    let mut reconciler = Reconciler::new(
        WorkerContext {
            snapshot: snapshot.clone(),
            registry: registry.clone(),
            prober: prober.clone(),
            diagnostics: Arc::new(FakeDiagnostics::default()),
            gateway: Arc::new(gateway),
            packet_count: 4,
            metrics: None,
        },
        Duration::from_millis(500),
    );
    reconciler.reconcile_once();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Registry flips before the snapshot catches up
    registry.set_status(1, HostStatus::Inactive).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let report = reconciler.reconcile_once();
    assert_eq!(report.reaped, vec![1]);
    assert!(report.started.is_empty());
    assert!(reconciler.reconcile_once().is_noop());
    assert_eq!(prober.calls(), 1);

    // Reactivated and republished: a fresh worker starts
    registry.set_status(1, HostStatus::Active).await;
    snapshot.publish(ActiveHostSnapshot::from_hosts(2, registry.list_hosts().await.unwrap()));
    assert_eq!(reconciler.reconcile_once().started, vec![1]);

    reconciler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_reactivation_between_ticks_restarts_self_stopped_worker() {
    let hosts = vec![host(1, Duration::from_secs(1))];
    let registry = Arc::new(InMemoryRegistry::new(hosts.clone()));
    let gateway = PersistenceGateway::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
    gateway.connect().await.unwrap();
    let snapshot = SnapshotHandle::new(ActiveHostSnapshot::from_hosts(1, hosts));
    let prober = FakeProber::answering(4);

    let mut reconciler = Reconciler::new(
        WorkerContext {
            snapshot: snapshot.clone(),
            registry: registry.clone(),
            prober: prober.clone(),
            diagnostics: Arc::new(FakeDiagnostics::default()),
            gateway: Arc::new(gateway),
            packet_count: 4,
            metrics: None,
        },
        Duration::from_millis(500),
    );
    assert_eq!(reconciler.reconcile_once().started, vec![1]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Worker sees the deactivation against version 1 and exits
    registry.set_status(1, HostStatus::Inactive).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(prober.calls(), 1);

    // Two refreshes land before the next reconcile tick
    snapshot.publish(ActiveHostSnapshot::from_hosts(2, registry.list_hosts().await.unwrap()));
    registry.set_status(1, HostStatus::Active).await;
    snapshot.publish(ActiveHostSnapshot::from_hosts(3, registry.list_hosts().await.unwrap()));

    let report = reconciler.reconcile_once();
    assert_eq!(report.reaped, vec![1]);
    assert_eq!(report.started, vec![1]);
    assert!(reconciler.is_running(1));
    assert!(reconciler.reconcile_once().is_noop());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(prober.calls(), 2);

    reconciler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_reaped_worker_series_removed_from_metrics() {
    let hosts = vec![host(1, Duration::from_secs(1)), host(2, Duration::from_secs(1))];
    let registry = Arc::new(InMemoryRegistry::new(hosts.clone()));
    let gateway = PersistenceGateway::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
    gateway.connect().await.unwrap();
    let snapshot = SnapshotHandle::new(ActiveHostSnapshot::from_hosts(1, hosts));
    let metrics = Arc::new(MetricsRegistry::new());

    let mut reconciler = Reconciler::new(
        WorkerContext {
            snapshot: snapshot.clone(),
            registry: registry.clone(),
            prober: FakeProber::answering(4),
            diagnostics: Arc::new(FakeDiagnostics::default()),
            gateway: Arc::new(gateway),
            packet_count: 4,
            metrics: Some(metrics.clone()),
        },
        Duration::from_millis(500),
    );
    reconciler.reconcile_once();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(metrics.encode().unwrap().contains(r#"host_id="1""#));

    snapshot.publish(ActiveHostSnapshot::from_hosts(2, vec![host(2, Duration::from_secs(1))]));
    assert_eq!(reconciler.reconcile_once().stopped, vec![1]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reconciler.reconcile_once().reaped, vec![1]);

    let text = metrics.encode().unwrap();
    assert!(!text.contains(r#"host_id="1""#));
    assert!(text.contains(r#"reachability_probes_total{host_id="2",status="success"}"#));

    reconciler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_every_worker() {
    let (mut reconciler, _, prober) = reconciler_with(vec![
        host(1, Duration::from_secs(1)),
        host(2, Duration::from_secs(1)),
        host(3, Duration::from_secs(1)),
    ])
    .await;
    reconciler.reconcile_once();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    reconciler.shutdown(Duration::from_secs(1)).await;
    assert!(reconciler.running().is_empty());
    assert_eq!(reconciler.stopping_count(), 0);

    let calls = prober.calls();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(prober.calls(), calls);
}
