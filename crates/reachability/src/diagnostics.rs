//! Failure diagnostics: name resolution and hop-by-hop path trace.

use crate::types::{DiagnosticReport, TraceHop};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use trust_dns_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

/// Collects supplementary transcripts for a host that failed its probe.
///
/// Never fails: a step that cannot run embeds its failure message in place of a transcript.
#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn collect(&self, address: &str) -> DiagnosticReport;
}

/// Settings for [`CommandDiagnostics`]
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsConfig {
    pub resolve_timeout: Duration,
    pub trace_timeout: Duration,
    pub trace_max_hops: u8,
    pub traceroute_program: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
            trace_timeout: Duration::from_secs(30),
            trace_max_hops: 10,
            traceroute_program: "traceroute".to_string(),
        }
    }
}

/// Resolver lookup plus a `traceroute` subprocess
pub struct CommandDiagnostics {
    config: DiagnosticsConfig,
}

impl CommandDiagnostics {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self { config }
    }

    /// Forward lookup for names, reverse lookup for IP literals.
    pub async fn resolve(&self, address: &str) -> String {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => return format!("Name resolution failed: {}\n", e),
        };
        let limit = self.config.resolve_timeout;

        match address.parse::<IpAddr>() {
            Ok(ip) => match timeout(limit, resolver.reverse_lookup(ip)).await {
                Ok(Ok(lookup)) => {
                    let mut out = format!("; reverse lookup for {}\n", ip);
                    for name in lookup.iter() {
                        let _ = writeln!(out, "{}\tPTR\t{}", ip, name.to_utf8());
                    }
                    out
                }
                Ok(Err(e)) => format!("Name resolution failed: {}\n", e),
                Err(_) => format!("Name resolution failed: timed out after {:?}\n", limit),
            },
            Err(_) => match timeout(limit, resolver.lookup_ip(address)).await {
                Ok(Ok(lookup)) => {
                    let mut out = format!("; lookup for {}\n", address);
                    for ip in lookup.iter() {
                        let kind = if ip.is_ipv4() { "A" } else { "AAAA" };
                        let _ = writeln!(out, "{}\t{}\t{}", address, kind, ip);
                    }
                    out
                }
                Ok(Err(e)) => format!("Name resolution failed: {}\n", e),
                Err(_) => format!("Name resolution failed: timed out after {:?}\n", limit),
            },
        }
    }

    /// Run `traceroute -m <max> -q 1 -w 2 <address>` and capture its output.
    pub async fn trace(&self, address: &str) -> String {
        let child = Command::new(&self.config.traceroute_program)
            .arg("-m")
            .arg(self.config.trace_max_hops.to_string())
            .args(["-q", "1", "-w", "2"])
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return format!("Traceroute failed: {}", e),
        };

        match timeout(self.config.trace_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut out = String::from_utf8_lossy(&output.stdout).into_owned();
                out.push_str(&String::from_utf8_lossy(&output.stderr));
                let code = output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                let _ = write!(out, "Exit Code: {}", code);
                out
            }
            Ok(Err(e)) => format!("Traceroute failed: {}", e),
            Err(_) => format!(
                "Traceroute failed: timed out after {:?}",
                self.config.trace_timeout
            ),
        }
    }
}

#[async_trait]
impl Diagnostics for CommandDiagnostics {
    async fn collect(&self, address: &str) -> DiagnosticReport {
        debug!(address, "collecting diagnostics");
        let (resolution, trace) = tokio::join!(self.resolve(address), self.trace(address));
        let trace_hops = parse_traceroute(&trace);

        if trace.starts_with("Traceroute failed") {
            warn!(address, trace = %trace, "path trace unavailable");
        }

        DiagnosticReport {
            resolution,
            trace,
            trace_hops,
        }
    }
}

/// Parse traceroute output into hops. Header and trailer lines are skipped.
pub fn parse_traceroute(output: &str) -> Vec<TraceHop> {
    output.lines().filter_map(parse_trace_line).collect()
}

fn parse_trace_line(line: &str) -> Option<TraceHop> {
    let mut tokens = line.split_whitespace().peekable();
    let hop: u32 = tokens.next()?.parse().ok()?;

    let first = tokens.next()?;
    if first == "*" {
        return Some(TraceHop::unanswered(hop));
    }

    let mut address = first.parse::<IpAddr>().ok();
    if let Some(paren) = tokens.next_if(|t| t.starts_with('(')) {
        address = paren
            .trim_matches(|c| c == '(' || c == ')')
            .parse()
            .ok()
            .or(address);
    }

    let mut samples = Vec::new();
    while let Some(token) = tokens.next() {
        if let Ok(value) = token.parse::<f64>() {
            if tokens.next_if_eq(&"ms").is_some() {
                samples.push(value);
            }
        }
    }

    let (min_ms, max_ms, avg_ms) = if samples.is_empty() {
        (None, None, None)
    } else {
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        (Some(min), Some(max), Some(avg))
    };

    Some(TraceHop {
        hop,
        name: Some(first.to_string()),
        address,
        min_ms,
        max_ms,
        avg_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
traceroute to 8.8.8.8 (8.8.8.8), 10 hops max, 60 byte packets
 1  _gateway (192.168.1.1)  0.512 ms
 2  *
 3  10.20.0.1 (10.20.0.1)  4.100 ms  3.900 ms  4.300 ms
 4  dns.google (8.8.8.8)  12.034 ms
Exit Code: 0";

    #[test]
    fn test_parse_traceroute() {
        let hops = parse_traceroute(TRACE);
        assert_eq!(hops.len(), 4);

        assert_eq!(hops[0].hop, 1);
        assert_eq!(hops[0].name.as_deref(), Some("_gateway"));
        assert_eq!(hops[0].address, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(hops[0].avg_ms, Some(0.512));

        assert_eq!(hops[1], TraceHop::unanswered(2));
        assert!(!hops[1].is_answered());

        assert_eq!(hops[2].min_ms, Some(3.9));
        assert_eq!(hops[2].max_ms, Some(4.3));
        let avg = hops[2].avg_ms.unwrap();
        assert!((avg - 4.1).abs() < 1e-9);

        assert_eq!(hops[3].address, Some("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_parse_traceroute_failure_message() {
        assert!(parse_traceroute("Traceroute failed: No such file or directory").is_empty());
    }

    #[test]
    fn test_parse_bare_ip_hop() {
        let hops = parse_traceroute(" 5  172.16.0.1  7.25 ms");
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].address, Some("172.16.0.1".parse().unwrap()));
        assert_eq!(hops[0].min_ms, Some(7.25));
    }

    #[tokio::test]
    async fn test_missing_traceroute_is_embedded() {
        let diagnostics = CommandDiagnostics::new(DiagnosticsConfig {
            traceroute_program: "reachability-no-such-traceroute".to_string(),
            ..Default::default()
        });

        let trace = diagnostics.trace("127.0.0.1").await;
        assert!(trace.starts_with("Traceroute failed:"));
    }

    #[tokio::test]
    async fn test_collect_never_fails() {
        let diagnostics = CommandDiagnostics::new(DiagnosticsConfig {
            resolve_timeout: Duration::from_millis(500),
            traceroute_program: "reachability-no-such-traceroute".to_string(),
            ..Default::default()
        });

        let report = diagnostics.collect("127.0.0.1").await;
        assert!(!report.resolution.is_empty());
        assert!(!report.trace.is_empty());
        assert!(report.trace_hops.is_empty());
    }
}
