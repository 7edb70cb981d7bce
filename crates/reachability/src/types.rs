//! Probe measurement and classification types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Maximum number of per-reply latency samples kept for one probe.
pub const MAX_HOP_SAMPLES: usize = 8;

/// Per-reply latency samples in milliseconds, in reply order. `None` marks a missing reply.
pub type HopSamples = [Option<f64>; MAX_HOP_SAMPLES];

/// Status category of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Every packet answered and every expected reply sample is present
    Success,
    /// Some packets lost, or per-reply data incomplete
    PartialLoss,
    /// Nothing answered
    NoResponse,
}

impl ProbeStatus {
    /// Stable lowercase name, used for metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Success => "success",
            ProbeStatus::PartialLoss => "partial_loss",
            ProbeStatus::NoResponse => "no_response",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ProbeStatus::Success
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Success => write!(f, "Success"),
            ProbeStatus::PartialLoss => write!(f, "Partial loss"),
            ProbeStatus::NoResponse => write!(f, "No response"),
        }
    }
}

/// Severity tag attached to a status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Medium,
    High,
}

impl Severity {
    /// Display colour used by reporting front ends.
    pub fn color_hex(&self) -> &'static str {
        match self {
            Severity::Ok => "#00FF00",
            Severity::Medium => "#FFA500",
            Severity::High => "#FF0000",
        }
    }
}

/// Output of the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub status: ProbeStatus,
    pub severity: Severity,
}

/// Raw data gathered by one reachability probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeMeasurement {
    /// Packets transmitted
    pub sent: u32,

    /// Packets answered
    pub received: u32,

    /// Reply latencies in milliseconds
    pub hops: HopSamples,

    /// Round-trip minimum in milliseconds
    pub rtt_min_ms: Option<f64>,

    /// Round-trip average in milliseconds
    pub rtt_avg_ms: Option<f64>,

    /// Round-trip maximum in milliseconds
    pub rtt_max_ms: Option<f64>,

    /// Verbatim tool output
    pub transcript: String,

    /// Wall-clock time the probe took
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl ProbeMeasurement {
    /// Number of reply samples expected for this probe.
    pub fn expected_hops(&self) -> usize {
        (self.sent as usize).min(MAX_HOP_SAMPLES)
    }

    /// Number of reply samples actually present.
    pub fn present_hops(&self) -> usize {
        self.hops.iter().filter(|h| h.is_some()).count()
    }

    /// True when every expected reply sample is present.
    pub fn hops_complete(&self) -> bool {
        self.hops[..self.expected_hops()].iter().all(Option::is_some)
    }

    /// Classify this measurement.
    pub fn classify(&self) -> Classification {
        crate::classifier::classify(self.sent, self.received, self.hops_complete())
    }
}

/// One line of a parsed path trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHop {
    /// 1-based hop number
    pub hop: u32,

    /// Reported name, `None` when the hop did not answer
    pub name: Option<String>,

    pub address: Option<IpAddr>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub avg_ms: Option<f64>,
}

impl TraceHop {
    /// A hop that did not answer within the wait time.
    pub fn unanswered(hop: u32) -> Self {
        Self {
            hop,
            name: None,
            address: None,
            min_ms: None,
            max_ms: None,
            avg_ms: None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.address.is_some()
    }
}

/// Transcripts gathered after a failed probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    /// Name resolution transcript, or an embedded failure message
    pub resolution: String,

    /// Path trace transcript, or an embedded failure message
    pub trace: String,

    /// Structured hops parsed from `trace`
    pub trace_hops: Vec<TraceHop>,
}
