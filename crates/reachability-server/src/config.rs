//! Configuration loading and validation for the monitor server

use crate::retry::RetryPolicy;
use crate::types::ServerConfig;
use reachability::DiagnosticsConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

impl From<ConfigError> for common::Error {
    fn from(e: ConfigError) -> Self {
        common::Error::config(e)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub diagnostics: DiagnosticsSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.registry.validate()?;
        self.store.validate()?;
        self.scheduler.validate()?;
        self.probe.validate()?;
        self.diagnostics.validate()?;
        self.retry.validate()?;
        self.supervisor.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

/// Host registry settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RegistrySettings {
    #[validate(custom = "validate_path")]
    pub hosts_file: PathBuf,

    /// Create the hosts file with the default hosts when missing
    pub seed_defaults: bool,
}

/// Result store settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StoreSettings {
    #[validate(custom = "validate_path")]
    pub results_file: PathBuf,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_lock_wait")]
    pub lock_wait: Duration,
}

/// Background loop intervals
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub refresh_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub reconcile_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_supervisor_interval")]
    pub supervisor_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProbeSettings {
    #[validate(range(min = 1, max = 8))]
    pub packet_count: u32,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_subprocess_timeout")]
    pub timeout: Duration,

    #[validate(length(min = 1))]
    pub program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DiagnosticsSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_subprocess_timeout")]
    pub resolve_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_subprocess_timeout")]
    pub trace_timeout: Duration,

    #[validate(range(min = 1, max = 64))]
    pub trace_max_hops: u8,

    #[validate(length(min = 1))]
    pub traceroute_program: String,
}

/// Backoff for contended store writes
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetrySettings {
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SupervisorSettings {
    #[validate(range(min = 1, max = 10))]
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub listen_addr: String,
}

/// OpenTelemetry export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: String,
    /// grpc or http
    pub protocol: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for RegistrySettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            hosts_file: defaults.hosts_file,
            seed_defaults: defaults.seed_default_hosts,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            results_file: defaults.results_file,
            lock_wait: defaults.store_lock_wait,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(2),
            supervisor_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            packet_count: 8,
            timeout: Duration::from_secs(20),
            program: "ping".to_string(),
        }
    }
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        let defaults = DiagnosticsConfig::default();
        Self {
            resolve_timeout: defaults.resolve_timeout,
            trace_timeout: defaults.trace_timeout,
            trace_max_hops: defaults.trace_max_hops,
            traceroute_program: defaults.traceroute_program,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            multiplier: defaults.multiplier,
            max_delay: defaults.max_delay,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "reachability-server".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            protocol: "grpc".to_string(),
        }
    }
}

// Custom validators

fn validate_path(path: &PathBuf) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::new("path_empty"));
    }
    Ok(())
}

fn validate_lock_wait(wait: &Duration) -> Result<(), ValidationError> {
    let millis = wait.as_millis();
    if !(1..=10_000).contains(&millis) {
        return Err(ValidationError::new("lock_wait_out_of_range"));
    }
    Ok(())
}

fn validate_loop_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if !(100..=3_600_000).contains(&millis) {
        return Err(ValidationError::new("loop_interval_out_of_range"));
    }
    Ok(())
}

fn validate_supervisor_interval(interval: &Duration) -> Result<(), ValidationError> {
    let secs = interval.as_secs();
    if !(1..=86_400).contains(&secs) {
        return Err(ValidationError::new("supervisor_interval_out_of_range"));
    }
    Ok(())
}

fn validate_subprocess_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if !(100..=600_000).contains(&millis) {
        return Err(ValidationError::new("subprocess_timeout_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::FileNotFound);
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/reachability/reachability-server.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./reachability-server.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/reachability/reachability-server.yaml"))
    }

    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            refresh_interval: self.scheduler.refresh_interval,
            reconcile_interval: self.scheduler.reconcile_interval,
            supervisor_interval: self.scheduler.supervisor_interval,
            shutdown_timeout: self.scheduler.shutdown_timeout,
            packet_count: self.probe.packet_count,
            probe_timeout: self.probe.timeout,
            ping_program: self.probe.program.clone(),
            diagnostics: DiagnosticsConfig {
                resolve_timeout: self.diagnostics.resolve_timeout,
                trace_timeout: self.diagnostics.trace_timeout,
                trace_max_hops: self.diagnostics.trace_max_hops,
                traceroute_program: self.diagnostics.traceroute_program.clone(),
            },
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: self.retry.base_delay,
                multiplier: self.retry.multiplier,
                max_delay: self.retry.max_delay,
            },
            reconnect_attempts: self.supervisor.reconnect_attempts,
            hosts_file: self.registry.hosts_file.clone(),
            seed_default_hosts: self.registry.seed_defaults,
            results_file: self.store.results_file.clone(),
            store_lock_wait: self.store.lock_wait,
            metrics_enabled: self.metrics.enabled,
            metrics_listen_addr: self.metrics.listen_addr.clone(),
        }
    }
}
