//! Adaptive host reachability monitor.
//!
//! Keeps one polling worker per active host in an external registry, probes
//! each host on its own interval, and persists classified results together
//! with an audit log of lifecycle events.
//!
//! # Components
//!
//! - **RegistryRefresher**: publishes the active host set as an immutable snapshot
//! - **Reconciler**: starts and stops host workers to match the snapshot
//! - **HostWorker**: probe, classify, diagnose on failure, persist, sleep
//! - **PersistenceGateway**: retried, non-blocking writes to the result store
//! - **ConnectivitySupervisor**: periodic store health check and reconnect

pub mod config;
pub mod gateway;
pub mod http_server;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use config::{Config, ConfigError};
pub use gateway::{PersistenceGateway, WriteOutcome};
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use reconciler::{ReconcileReport, Reconciler, WorkerHandle};
pub use registry::{FileRegistry, HostRegistry, InMemoryRegistry, RegistryError, default_hosts};
pub use retry::{RetryError, RetryPolicy};
pub use server::MonitorServer;
pub use snapshot::{ActiveHostSnapshot, RegistryRefresher, SnapshotHandle};
pub use store::{JsonLinesConnector, MemoryStore, StoreConnection, StoreConnector, StoreError};
pub use supervisor::{ConnectivitySupervisor, SupervisorCheck};
pub use telemetry::{TelemetryGuard, init_telemetry, setup_tracing};
pub use types::{EventLevel, Host, HostId, HostStatus, LogEvent, ProbeResult, Record, ServerConfig};
pub use worker::{HostWorker, StopReason, WorkerContext, WorkerState};
