//! Reachability probing for the host monitor.
//!
//! This crate holds the leaf pieces of the monitoring pipeline:
//! - ICMP probing through the system `ping` tool ([`ping`])
//! - Deterministic classification of probe counters ([`classifier`])
//! - Failure diagnostics: name resolution and path trace ([`diagnostics`])
//!
//! Nothing here schedules work; the server crate drives these per host.
//!
//! # Example
//!
//! ```no_run
//! use reachability::{PingProber, Prober};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let prober = PingProber::new(Duration::from_secs(20));
//! let measurement = prober.probe("127.0.0.1", 4).await?;
//!
//! let classification = measurement.classify();
//! println!("{} ({})", classification.status, classification.severity.color_hex());
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod diagnostics;
pub mod ping;
pub mod types;

pub use classifier::classify;
pub use diagnostics::{CommandDiagnostics, Diagnostics, DiagnosticsConfig, parse_traceroute};
pub use ping::{PingProber, ProbeError, Prober, parse_ping_output};
pub use types::{
    Classification, DiagnosticReport, HopSamples, MAX_HOP_SAMPLES, ProbeMeasurement, ProbeStatus,
    Severity, TraceHop,
};
