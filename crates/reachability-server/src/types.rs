//! Host, result, and event types shared by the scheduler components.

use reachability::{
    DiagnosticReport, DiagnosticsConfig, ProbeMeasurement, ProbeStatus, Severity,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::retry::RetryPolicy;

/// Host identifier, stable across reconciliation cycles
pub type HostId = u64;

/// Lifecycle status of a host in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    #[default]
    Active,
    Inactive,
}

/// A monitored network endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,

    pub name: String,

    /// Address handed to the prober (IP literal or DNS name)
    pub address: String,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub status: HostStatus,

    /// Delay between two polls of this host
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Host {
    /// Create an active host with empty category and description
    pub fn new(
        id: HostId,
        name: impl Into<String>,
        address: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            category: String::new(),
            description: String::new(),
            status: HostStatus::Active,
            interval,
        }
    }

    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>, description: impl Into<String>) -> Self {
        self.category = category.into();
        self.description = description.into();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == HostStatus::Active
    }
}

/// Outcome of one poll of one host.
///
/// The status and severity are derived from the measurement when the result is
/// built and cannot be set any other way.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub host_id: HostId,

    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,

    #[serde(flatten)]
    measurement: ProbeMeasurement,

    diagnostics: Option<DiagnosticReport>,

    status: ProbeStatus,
    severity: Severity,
    color: &'static str,
}

impl ProbeResult {
    /// Build a result, classifying the measurement
    pub fn new(host_id: HostId, timestamp: SystemTime, measurement: ProbeMeasurement) -> Self {
        let classification = measurement.classify();
        Self {
            host_id,
            timestamp,
            measurement,
            diagnostics: None,
            status: classification.status,
            severity: classification.severity,
            color: classification.severity.color_hex(),
        }
    }

    /// Attach the transcripts of a failure diagnosis
    pub fn with_diagnostics(mut self, report: DiagnosticReport) -> Self {
        self.diagnostics = Some(report);
        self
    }

    pub fn measurement(&self) -> &ProbeMeasurement {
        &self.measurement
    }

    pub fn diagnostics(&self) -> Option<&DiagnosticReport> {
        self.diagnostics.as_ref()
    }

    pub fn status(&self) -> ProbeStatus {
        self.status
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn color(&self) -> &'static str {
        self.color
    }
}

/// Severity of an operational event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl EventLevel {
    pub fn color_hex(&self) -> &'static str {
        match self {
            EventLevel::Info => "#0000FF",
            EventLevel::Success => "#00FF00",
            EventLevel::Warning => "#FFA500",
            EventLevel::Error => "#FF0000",
        }
    }
}

/// Structured operational log entry, persisted next to probe results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    /// Host the event is about, `None` for process-wide events
    pub host_id: Option<HostId>,

    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,

    pub category: String,
    pub message: String,
    pub level: EventLevel,
}

impl LogEvent {
    pub fn new(category: impl Into<String>, message: impl Into<String>, level: EventLevel) -> Self {
        Self {
            host_id: None,
            timestamp: SystemTime::now(),
            category: category.into(),
            message: message.into(),
            level,
        }
    }

    pub fn for_host(mut self, host_id: HostId) -> Self {
        self.host_id = Some(host_id);
        self
    }
}

/// Anything the persistence gateway writes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    ProbeResult(ProbeResult),
    Event(LogEvent),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::ProbeResult(_) => "probe_result",
            Record::Event(_) => "event",
        }
    }
}

/// Runtime configuration for the monitor server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval between full registry reads
    pub refresh_interval: Duration,

    /// Interval between worker pool reconciliations
    pub reconcile_interval: Duration,

    /// Interval between store health checks
    pub supervisor_interval: Duration,

    /// Upper bound on waiting for workers and pending writes at shutdown
    pub shutdown_timeout: Duration,

    /// Packets per probe
    pub packet_count: u32,

    /// Upper bound on one probe subprocess
    pub probe_timeout: Duration,

    /// Ping binary
    pub ping_program: String,

    /// Failure diagnostics settings
    pub diagnostics: DiagnosticsConfig,

    /// Backoff for contended store writes
    pub retry: RetryPolicy,

    /// Immediate reconnect attempts per supervisor check
    pub reconnect_attempts: u32,

    /// YAML host list read by the file registry
    pub hosts_file: PathBuf,

    /// Create the host list with default hosts when missing
    pub seed_default_hosts: bool,

    /// JSON-lines file receiving results and events
    pub results_file: PathBuf,

    /// How long a write may wait for the results file
    pub store_lock_wait: Duration,

    /// Serve Prometheus metrics
    pub metrics_enabled: bool,

    /// Metrics listen address
    pub metrics_listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(2),
            supervisor_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            packet_count: 8,
            probe_timeout: Duration::from_secs(20),
            ping_program: "ping".to_string(),
            diagnostics: DiagnosticsConfig::default(),
            retry: RetryPolicy::default(),
            reconnect_attempts: 3,
            hosts_file: PathBuf::from("/var/lib/reachability/hosts.yaml"),
            seed_default_hosts: true,
            results_file: PathBuf::from("/var/lib/reachability/results.jsonl"),
            store_lock_wait: Duration::from_millis(50),
            metrics_enabled: false,
            metrics_listen_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(sent: u32, received: u32, samples: usize) -> ProbeMeasurement {
        let mut m = ProbeMeasurement {
            sent,
            received,
            ..Default::default()
        };
        for slot in 0..samples {
            m.hops[slot] = Some(0.5);
        }
        m
    }

    #[test]
    fn test_result_status_follows_measurement() {
        let ok = ProbeResult::new(1, SystemTime::now(), measurement(4, 4, 4));
        assert_eq!(ok.status(), ProbeStatus::Success);
        assert_eq!(ok.severity(), Severity::Ok);
        assert_eq!(ok.color(), "#00FF00");

        let lost = ProbeResult::new(1, SystemTime::now(), measurement(4, 0, 0));
        assert_eq!(lost.status(), ProbeStatus::NoResponse);
        assert_eq!(lost.color(), "#FF0000");
    }

    #[test]
    fn test_diagnostics_do_not_change_status() {
        let result = ProbeResult::new(7, SystemTime::now(), measurement(4, 2, 2)).with_diagnostics(
            DiagnosticReport {
                resolution: "; lookup".to_string(),
                trace: "Exit Code: 0".to_string(),
                trace_hops: Vec::new(),
            },
        );
        assert_eq!(result.status(), ProbeStatus::PartialLoss);
        assert!(result.diagnostics().is_some());
    }

    #[test]
    fn test_record_serializes_with_kind() {
        let record = Record::ProbeResult(ProbeResult::new(3, SystemTime::now(), measurement(4, 4, 4)));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "probe_result");
        assert_eq!(json["host_id"], 3);
        assert_eq!(json["sent"], 4);
        assert_eq!(json["status"], "success");
        assert_eq!(json["severity"], "ok");

        let event = Record::Event(LogEvent::new("worker", "started", EventLevel::Info).for_host(3));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "event");
        assert_eq!(json["level"], "info");
        assert_eq!(json["host_id"], 3);
    }

    #[test]
    fn test_host_yaml_defaults() {
        let yaml = r#"
id: 4
name: router
address: 192.168.1.1
interval: 15s
"#;
        let host: Host = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(host.status, HostStatus::Active);
        assert_eq!(host.interval, Duration::from_secs(15));
        assert!(host.category.is_empty());
    }
}
