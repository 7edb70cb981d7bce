//! Prometheus metrics for the monitor server.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use reachability::ProbeStatus;
use std::time::Duration;

/// Labels for probe outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    /// Host ID
    pub host_id: String,
    /// Classification (success, partial_loss, no_response, error)
    pub status: String,
}

/// Labels for per-host metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostLabels {
    pub host_id: String,
}

/// Labels for reconciler actions
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionLabels {
    /// started, stopped, reaped
    pub action: String,
}

/// Labels for anything with an ok/failed outcome
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

/// Metrics registry with all monitor server metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    probes: Family<ProbeLabels, Counter>,
    probe_rtt_seconds: Family<HostLabels, Histogram>,
    probe_duration_seconds: Histogram,
    diagnostics_runs: Counter,

    workers_active: Gauge,
    reconciler_actions: Family<ActionLabels, Counter>,

    snapshot_hosts: Gauge,
    snapshot_version: Gauge,
    registry_errors: Counter,

    persistence_writes: Family<OutcomeLabels, Counter>,
    persistence_retries: Counter,
    reconnects: Family<OutcomeLabels, Counter>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("reachability");

        let probes = Family::<ProbeLabels, Counter>::default();
        registry.register("probes", "Probes completed by host and status", probes.clone());

        let probe_rtt_seconds = Family::<HostLabels, Histogram>::new_with_constructor(|| {
            // 0.1ms to ~3s
            Histogram::new(exponential_buckets(0.0001, 2.0, 15))
        });
        registry.register(
            "probe_rtt_seconds",
            "Average round-trip time reported by the probe",
            probe_rtt_seconds.clone(),
        );

        let probe_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "probe_duration_seconds",
            "Wall-clock duration of one probe",
            probe_duration_seconds.clone(),
        );

        let diagnostics_runs = Counter::default();
        registry.register(
            "diagnostics_runs",
            "Failure diagnostics collected",
            diagnostics_runs.clone(),
        );

        let workers_active = Gauge::default();
        registry.register("workers_active", "Running host workers", workers_active.clone());

        let reconciler_actions = Family::<ActionLabels, Counter>::default();
        registry.register(
            "reconciler_actions",
            "Worker starts, stops and reaps",
            reconciler_actions.clone(),
        );

        let snapshot_hosts = Gauge::default();
        registry.register(
            "snapshot_hosts",
            "Hosts in the published active snapshot",
            snapshot_hosts.clone(),
        );

        let snapshot_version = Gauge::default();
        registry.register(
            "snapshot_version",
            "Version of the published active snapshot",
            snapshot_version.clone(),
        );

        let registry_errors = Counter::default();
        registry.register(
            "registry_errors",
            "Failed registry reads",
            registry_errors.clone(),
        );

        let persistence_writes = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "persistence_writes",
            "Record writes by outcome",
            persistence_writes.clone(),
        );

        let persistence_retries = Counter::default();
        registry.register(
            "persistence_retries",
            "Write attempts repeated after contention",
            persistence_retries.clone(),
        );

        let reconnects = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "store_reconnects",
            "Store reconnect attempts by outcome",
            reconnects.clone(),
        );

        Self {
            registry,
            probes,
            probe_rtt_seconds,
            probe_duration_seconds,
            diagnostics_runs,
            workers_active,
            reconciler_actions,
            snapshot_hosts,
            snapshot_version,
            registry_errors,
            persistence_writes,
            persistence_retries,
            reconnects,
        }
    }

    /// Record a classified probe
    pub fn record_probe(
        &self,
        host_id: u64,
        status: ProbeStatus,
        rtt_avg_ms: Option<f64>,
        duration: Duration,
    ) {
        self.probes
            .get_or_create(&ProbeLabels {
                host_id: host_id.to_string(),
                status: status.as_str().to_string(),
            })
            .inc();

        if let Some(rtt) = rtt_avg_ms {
            self.probe_rtt_seconds
                .get_or_create(&HostLabels {
                    host_id: host_id.to_string(),
                })
                .observe(rtt / 1000.0);
        }
        self.probe_duration_seconds.observe(duration.as_secs_f64());
    }

    /// Record a probe that could not run
    pub fn record_probe_error(&self, host_id: u64) {
        self.probes
            .get_or_create(&ProbeLabels {
                host_id: host_id.to_string(),
                status: "error".to_string(),
            })
            .inc();
    }

    /// Drop every series labelled with `host_id`, once its worker is gone
    pub fn forget_host(&self, host_id: u64) {
        let host_id = host_id.to_string();
        for status in ["success", "partial_loss", "no_response", "error"] {
            self.probes.remove(&ProbeLabels {
                host_id: host_id.clone(),
                status: status.to_string(),
            });
        }
        self.probe_rtt_seconds.remove(&HostLabels { host_id });
    }

    pub fn record_diagnostics(&self) {
        self.diagnostics_runs.inc();
    }

    pub fn set_workers_active(&self, count: usize) {
        self.workers_active.set(count as i64);
    }

    /// Record reconciler actions; zero counts are skipped
    pub fn record_reconcile(&self, started: usize, stopped: usize, reaped: usize) {
        for (action, count) in [("started", started), ("stopped", stopped), ("reaped", reaped)] {
            if count > 0 {
                self.reconciler_actions
                    .get_or_create(&ActionLabels {
                        action: action.to_string(),
                    })
                    .inc_by(count as u64);
            }
        }
    }

    pub fn record_snapshot(&self, version: u64, hosts: usize) {
        self.snapshot_version.set(version as i64);
        self.snapshot_hosts.set(hosts as i64);
    }

    pub fn record_registry_error(&self) {
        self.registry_errors.inc();
    }

    /// Record the outcome of one gateway write and how many attempts it took
    pub fn record_write(&self, ok: bool, attempts: u32) {
        self.persistence_writes
            .get_or_create(&OutcomeLabels {
                outcome: outcome(ok).to_string(),
            })
            .inc();
        if attempts > 1 {
            self.persistence_retries.inc_by(u64::from(attempts - 1));
        }
    }

    pub fn record_reconnect(&self, ok: bool) {
        self.reconnects
            .get_or_create(&OutcomeLabels {
                outcome: outcome(ok).to_string(),
            })
            .inc();
    }

    /// Render the registry in Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

fn outcome(ok: bool) -> &'static str {
    if ok { "ok" } else { "failed" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_metrics_encoded() {
        let registry = MetricsRegistry::new();
        registry.record_probe(1, ProbeStatus::Success, Some(0.05), Duration::from_millis(3));
        registry.record_probe(1, ProbeStatus::NoResponse, None, Duration::from_secs(3));
        registry.record_probe_error(2);

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"reachability_probes_total{host_id="1",status="success"} 1"#));
        assert!(text.contains(r#"reachability_probes_total{host_id="1",status="no_response"} 1"#));
        assert!(text.contains(r#"reachability_probes_total{host_id="2",status="error"} 1"#));
    }

    #[test]
    fn test_forget_host_drops_only_that_host() {
        let registry = MetricsRegistry::new();
        registry.record_probe(1, ProbeStatus::Success, Some(0.05), Duration::from_millis(3));
        registry.record_probe(1, ProbeStatus::PartialLoss, Some(0.07), Duration::from_millis(3));
        registry.record_probe_error(1);
        registry.record_probe(2, ProbeStatus::Success, Some(0.05), Duration::from_millis(3));

        registry.forget_host(1);

        let text = registry.encode().unwrap();
        assert!(!text.contains(r#"host_id="1""#));
        assert!(text.contains(r#"reachability_probes_total{host_id="2",status="success"} 1"#));
        assert!(text.contains(r#"reachability_probe_rtt_seconds_count{host_id="2"} 1"#));
    }

    #[test]
    fn test_reconcile_metrics_skip_zero() {
        let registry = MetricsRegistry::new();
        registry.record_reconcile(2, 0, 1);
        registry.set_workers_active(2);

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"reachability_reconciler_actions_total{action="started"} 2"#));
        assert!(text.contains(r#"reachability_reconciler_actions_total{action="reaped"} 1"#));
        assert!(!text.contains(r#"action="stopped""#));
        assert!(text.contains("reachability_workers_active 2"));
    }

    #[test]
    fn test_write_metrics_count_retries() {
        let registry = MetricsRegistry::new();
        registry.record_write(true, 1);
        registry.record_write(false, 5);
        registry.record_reconnect(false);

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"reachability_persistence_writes_total{outcome="ok"} 1"#));
        assert!(text.contains(r#"reachability_persistence_writes_total{outcome="failed"} 1"#));
        assert!(text.contains("reachability_persistence_retries_total 4"));
        assert!(text.contains(r#"reachability_store_reconnects_total{outcome="failed"} 1"#));
    }

    #[test]
    fn test_snapshot_gauges() {
        let registry = MetricsRegistry::new();
        registry.record_snapshot(7, 3);
        registry.record_registry_error();

        let text = registry.encode().unwrap();
        assert!(text.contains("reachability_snapshot_version 7"));
        assert!(text.contains("reachability_snapshot_hosts 3"));
        assert!(text.contains("reachability_registry_errors_total 1"));
    }
}
