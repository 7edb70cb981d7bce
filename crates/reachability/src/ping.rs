//! Reachability probe built on the system `ping` tool.

use crate::types::{MAX_HOP_SAMPLES, ProbeMeasurement};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Errors that prevent a probe from producing a measurement.
///
/// An unreachable host is not an error: it yields a measurement with zero replies.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid probe address: {0:?}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProbeError> for common::Error {
    fn from(e: ProbeError) -> Self {
        common::Error::probe(e)
    }
}

/// Runs one reachability check against an address
#[async_trait]
pub trait Prober: Send + Sync {
    /// Send `count` packets to `address` and report what came back
    async fn probe(&self, address: &str, count: u32) -> Result<ProbeMeasurement, ProbeError>;

    /// Get the name of this prober
    fn name(&self) -> &str;
}

/// ICMP prober that shells out to `ping -c <count> -w <deadline> <address>`.
///
/// A ping that hangs past its deadline is killed and whatever it printed is
/// still parsed, so an unreachable host always yields a measurement.
pub struct PingProber {
    program: String,
    timeout_duration: Duration,
}

impl PingProber {
    /// Create a prober using the `ping` found on PATH
    pub fn new(timeout_duration: Duration) -> Self {
        Self::with_program("ping", timeout_duration)
    }

    /// Create a prober using a specific ping binary
    pub fn with_program(program: impl Into<String>, timeout_duration: Duration) -> Self {
        Self {
            program: program.into(),
            timeout_duration,
        }
    }
}

/// Extra time a ping gets past its own deadline before it is killed
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Flag giving ping an overall deadline in whole seconds
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
const DEADLINE_FLAG: &str = "-t";
#[cfg(not(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd")))]
const DEADLINE_FLAG: &str = "-w";

impl PingProber {
    /// Deadline handed to ping itself, rounded up to a whole second
    fn deadline_secs(&self) -> u64 {
        let secs = self.timeout_duration.as_secs();
        if self.timeout_duration.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str, count: u32) -> Result<ProbeMeasurement, ProbeError> {
        let address = address.trim();
        if address.is_empty() || address.starts_with('-') {
            return Err(ProbeError::InvalidAddress(address.to_string()));
        }

        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .arg("-c")
            .arg(count.to_string())
            .arg(DEADLINE_FLAG)
            .arg(self.deadline_secs().to_string())
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ProbeError::Io(std::io::Error::other("ping output not captured")));
        };

        // Bytes read before a timeout stay in the buffers
        let mut out = Vec::new();
        let mut err = Vec::new();
        let limit = Duration::from_secs(self.deadline_secs()) + KILL_GRACE;
        let finished = timeout(limit, async {
            let (read_out, read_err) =
                tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
            read_out?;
            read_err?;
            child.wait().await
        })
        .await;

        let exit_code = match finished {
            Ok(status) => status?.code(),
            Err(_) => {
                warn!(address, ?limit, "ping overran its deadline, keeping partial output");
                if let Err(e) = child.start_kill() {
                    debug!(address, error = %e, "failed to kill ping");
                }
                None
            }
        };

        let mut transcript = String::from_utf8_lossy(&out).into_owned();
        if !err.is_empty() {
            transcript.push_str(&String::from_utf8_lossy(&err));
        }

        let mut measurement = parse_ping_output(&transcript);
        if measurement.sent == 0 {
            // No summary line: the name did not resolve or ping was cut short.
            // Only replies seen in the transcript count as answered.
            measurement.sent = count;
            measurement.received = measurement.present_hops() as u32;
        }
        measurement.duration = start.elapsed();

        debug!(
            address,
            sent = measurement.sent,
            received = measurement.received,
            exit_code,
            duration_ms = measurement.duration.as_millis(),
            "ping finished"
        );

        Ok(measurement)
    }

    fn name(&self) -> &str {
        "ping"
    }
}

/// Parse ping output into a measurement.
///
/// Understands the Linux (`rtt min/avg/max/mdev`) and BSD (`round-trip min/avg/max/stddev`)
/// summaries. Reply samples fill slots in the order replies arrive.
pub fn parse_ping_output(output: &str) -> ProbeMeasurement {
    let mut measurement = ProbeMeasurement {
        transcript: output.to_string(),
        ..Default::default()
    };
    let mut next_slot = 0;

    for line in output.lines() {
        let line = line.trim();

        if line.contains("icmp_seq") {
            if line.contains("DUP!") || next_slot >= MAX_HOP_SAMPLES {
                continue;
            }
            if let Some(time) = reply_time(line) {
                measurement.hops[next_slot] = Some(time);
                next_slot += 1;
            }
        } else if line.contains("packets transmitted") {
            let (sent, received) = summary_counts(line);
            measurement.sent = sent.unwrap_or(0);
            measurement.received = received.unwrap_or(0);
        } else if line.starts_with("rtt") || line.starts_with("round-trip") {
            if let Some((min, avg, max)) = round_trip(line) {
                measurement.rtt_min_ms = Some(min);
                measurement.rtt_avg_ms = Some(avg);
                measurement.rtt_max_ms = Some(max);
            }
        }
    }

    measurement
}

/// `64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.3 ms` -> 12.3
fn reply_time(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once("time=")?;
    let value = rest.split_whitespace().next()?;
    value.trim_end_matches("ms").parse().ok()
}

/// `4 packets transmitted, 3 received, 25% packet loss` -> (4, 3)
fn summary_counts(line: &str) -> (Option<u32>, Option<u32>) {
    let mut parts = line.split(',');
    let sent = parts
        .next()
        .and_then(|p| p.split_whitespace().next())
        .and_then(|n| n.parse().ok());
    let received = parts
        .next()
        .and_then(|p| p.split_whitespace().next())
        .and_then(|n| n.parse().ok());
    (sent, received)
}

/// `rtt min/avg/max/mdev = 0.045/0.052/0.061/0.006 ms` -> (min, avg, max)
fn round_trip(line: &str) -> Option<(f64, f64, f64)> {
    let (_, values) = line.split_once('=')?;
    let values = values.split_whitespace().next()?;
    let mut fields = values.split('/').map(|v| v.parse::<f64>());
    let min = fields.next()?.ok()?;
    let avg = fields.next()?.ok()?;
    let max = fields.next()?.ok()?;
    Some((min, avg, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProbeStatus;

    const LINUX_OK: &str = "\
PING 127.0.0.1 (127.0.0.1) 56(84) bytes of data.
64 bytes from 127.0.0.1: icmp_seq=1 ttl=64 time=0.045 ms
64 bytes from 127.0.0.1: icmp_seq=2 ttl=64 time=0.052 ms
64 bytes from 127.0.0.1: icmp_seq=3 ttl=64 time=0.061 ms
64 bytes from 127.0.0.1: icmp_seq=4 ttl=64 time=0.050 ms

--- 127.0.0.1 ping statistics ---
4 packets transmitted, 4 received, 0% packet loss, time 3074ms
rtt min/avg/max/mdev = 0.045/0.052/0.061/0.006 ms
";

    const MACOS_LOSS: &str = "\
PING 10.0.0.9 (10.0.0.9): 56 data bytes
64 bytes from 10.0.0.9: icmp_seq=0 ttl=64 time=1.204 ms
Request timeout for icmp_seq 1
64 bytes from 10.0.0.9: icmp_seq=2 ttl=64 time=1.871 ms
Request timeout for icmp_seq 3

--- 10.0.0.9 ping statistics ---
4 packets transmitted, 2 packets received, 50.0% packet loss
round-trip min/avg/max/stddev = 1.204/1.537/1.871/0.333 ms
";

    const LINUX_UNREACHABLE: &str = "\
PING 192.0.2.1 (192.0.2.1) 56(84) bytes of data.
From 192.0.2.254 icmp_seq=1 Destination Host Unreachable
From 192.0.2.254 icmp_seq=2 Destination Host Unreachable

--- 192.0.2.1 ping statistics ---
4 packets transmitted, 0 received, +2 errors, 100% packet loss, time 3051ms
";

    #[test]
    fn test_parse_linux_success() {
        let m = parse_ping_output(LINUX_OK);
        assert_eq!(m.sent, 4);
        assert_eq!(m.received, 4);
        assert_eq!(m.hops[0], Some(0.045));
        assert_eq!(m.hops[3], Some(0.050));
        assert_eq!(m.hops[4], None);
        assert_eq!(m.rtt_min_ms, Some(0.045));
        assert_eq!(m.rtt_avg_ms, Some(0.052));
        assert_eq!(m.rtt_max_ms, Some(0.061));
        assert!(m.hops_complete());
        assert_eq!(m.classify().status, ProbeStatus::Success);
        assert_eq!(m.transcript, LINUX_OK);
    }

    #[test]
    fn test_parse_macos_partial_loss() {
        let m = parse_ping_output(MACOS_LOSS);
        assert_eq!(m.sent, 4);
        assert_eq!(m.received, 2);
        assert_eq!(m.present_hops(), 2);
        assert_eq!(m.rtt_max_ms, Some(1.871));
        assert!(!m.hops_complete());
        assert_eq!(m.classify().status, ProbeStatus::PartialLoss);
    }

    #[test]
    fn test_parse_unreachable() {
        let m = parse_ping_output(LINUX_UNREACHABLE);
        assert_eq!(m.sent, 4);
        assert_eq!(m.received, 0);
        assert_eq!(m.present_hops(), 0);
        assert_eq!(m.rtt_avg_ms, None);
        assert_eq!(m.classify().status, ProbeStatus::NoResponse);
    }

    #[test]
    fn test_parse_ignores_duplicates() {
        let output = "\
64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=1.0 ms
64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=1.1 ms (DUP!)
64 bytes from 10.0.0.1: icmp_seq=2 ttl=64 time=1.2 ms
";
        let m = parse_ping_output(output);
        assert_eq!(m.hops[0], Some(1.0));
        assert_eq!(m.hops[1], Some(1.2));
        assert_eq!(m.present_hops(), 2);
    }

    #[test]
    fn test_parse_caps_samples() {
        let mut output = String::new();
        for seq in 1..=12 {
            output.push_str(&format!("64 bytes from 10.0.0.1: icmp_seq={seq} ttl=64 time=2.0 ms\n"));
        }
        output.push_str("12 packets transmitted, 12 received, 0% packet loss, time 11000ms\n");

        let m = parse_ping_output(&output);
        assert_eq!(m.present_hops(), MAX_HOP_SAMPLES);
        assert!(m.hops_complete());
    }

    #[test]
    fn test_parse_garbage() {
        let m = parse_ping_output("ping: unknown host nowhere.invalid\n");
        assert_eq!(m.sent, 0);
        assert_eq!(m.received, 0);
        assert_eq!(m.present_hops(), 0);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let prober = PingProber::with_program("reachability-no-such-ping", Duration::from_secs(1));
        let err = prober.probe("127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }));
    }

    /// Write an executable stand-in for ping that prints `body` and then hangs
    #[cfg(unix)]
    fn hanging_ping(name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("{}-{}", name, std::process::id()));
        std::fs::write(&path, format!("#!/bin/sh\n{}\nsleep 30\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_ping_keeps_partial_transcript() {
        let script = hanging_ping(
            "reachability-hung-ping",
            "echo 'PING 192.0.2.1 (192.0.2.1) 56(84) bytes of data.'",
        );
        let prober = PingProber::with_program(script.to_string_lossy(), Duration::from_secs(1));

        let m = prober.probe("192.0.2.1", 4).await.unwrap();
        std::fs::remove_file(&script).ok();

        assert_eq!(m.sent, 4);
        assert_eq!(m.received, 0);
        assert!(m.transcript.starts_with("PING 192.0.2.1"));
        assert_eq!(m.classify().status, ProbeStatus::NoResponse);
        assert!(m.duration < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_ping_counts_replies_seen() {
        let script = hanging_ping(
            "reachability-slow-ping",
            "echo 'PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.'\n\
             echo '64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=3.1 ms'",
        );
        let prober = PingProber::with_program(script.to_string_lossy(), Duration::from_millis(200));

        let m = prober.probe("10.0.0.1", 4).await.unwrap();
        std::fs::remove_file(&script).ok();

        assert_eq!(m.sent, 4);
        assert_eq!(m.received, 1);
        assert_eq!(m.hops[0], Some(3.1));
        assert_eq!(m.classify().status, ProbeStatus::PartialLoss);
    }

    #[test]
    fn test_deadline_rounds_up_to_whole_seconds() {
        assert_eq!(PingProber::new(Duration::from_millis(100)).deadline_secs(), 1);
        assert_eq!(PingProber::new(Duration::from_secs(20)).deadline_secs(), 20);
        assert_eq!(PingProber::new(Duration::from_millis(2500)).deadline_secs(), 3);
        assert_eq!(PingProber::new(Duration::ZERO).deadline_secs(), 1);
    }

    #[tokio::test]
    async fn test_option_like_address_rejected() {
        let prober = PingProber::new(Duration::from_secs(1));
        let err = prober.probe("-f", 1).await.unwrap_err();
        assert!(matches!(err, ProbeError::InvalidAddress(_)));
    }
}
