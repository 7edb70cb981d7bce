//! Persistence gateway: retried writes of probe results and events.
//!
//! Writes are shared across workers against the current connection. Only a
//! reconnect takes the write side of the connection lock, and reconnects are
//! serialized among themselves.

use crate::metrics::MetricsRegistry;
use crate::retry::{RetryError, RetryPolicy};
use crate::store::{StoreConnection, StoreConnector, StoreError};
use crate::types::{EventLevel, LogEvent, ProbeResult, Record};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Result of one gateway write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok,
    Failed,
}

impl WriteOutcome {
    pub fn is_ok(&self) -> bool {
        *self == WriteOutcome::Ok
    }
}

pub struct PersistenceGateway {
    connector: Arc<dyn StoreConnector>,
    connection: RwLock<Option<Arc<dyn StoreConnection>>>,
    reconnect_lock: Mutex<()>,
    policy: RetryPolicy,
    retryable: fn(&StoreError) -> bool,
    tracker: TaskTracker,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl PersistenceGateway {
    /// Create an unconnected gateway. Call [`connect`](Self::connect) before writing.
    pub fn new(connector: Arc<dyn StoreConnector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            connection: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            policy,
            retryable: StoreError::is_contention,
            tracker: TaskTracker::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the predicate deciding which store errors are retried
    pub fn with_retryable(mut self, retryable: fn(&StoreError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open the first connection
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.reconnect().await
    }

    async fn current(&self) -> Option<Arc<dyn StoreConnection>> {
        self.connection.read().await.clone()
    }

    /// Write one record, retrying contention errors per the policy
    pub async fn write(&self, record: &Record) -> WriteOutcome {
        let Some(connection) = self.current().await else {
            warn!(kind = record.kind(), "No store connection, dropping record");
            self.record_metrics(false, 1);
            return WriteOutcome::Failed;
        };

        let result = self
            .policy
            .run(
                |_| {
                    let connection = Arc::clone(&connection);
                    async move { connection.write(record).await }
                },
                self.retryable,
            )
            .await;

        match result {
            Ok(()) => {
                self.record_metrics(true, 1);
                WriteOutcome::Ok
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(kind = record.kind(), attempts, error = %last, "Write failed after retries");
                self.record_metrics(false, attempts);
                WriteOutcome::Failed
            }
            Err(RetryError::Fatal { attempt, error }) => {
                error!(kind = record.kind(), attempt, error = %error, "Write failed");
                self.record_metrics(false, attempt);
                WriteOutcome::Failed
            }
        }
    }

    fn record_metrics(&self, ok: bool, attempts: u32) {
        if let Some(ref m) = self.metrics {
            m.record_write(ok, attempts);
        }
    }

    /// Persist a probe result in the background
    pub fn submit_probe_result(self: &Arc<Self>, result: ProbeResult) {
        let gateway = Arc::clone(self);
        self.tracker.spawn(async move {
            gateway.write(&Record::ProbeResult(result)).await;
        });
    }

    /// Mirror an event to tracing and persist it in the background
    pub fn log_event(self: &Arc<Self>, event: LogEvent) {
        match event.level {
            EventLevel::Info | EventLevel::Success => {
                info!(host_id = ?event.host_id, category = %event.category, "{}", event.message)
            }
            EventLevel::Warning => {
                warn!(host_id = ?event.host_id, category = %event.category, "{}", event.message)
            }
            EventLevel::Error => {
                error!(host_id = ?event.host_id, category = %event.category, "{}", event.message)
            }
        }

        let gateway = Arc::clone(self);
        self.tracker.spawn(async move {
            gateway.write(&Record::Event(event)).await;
        });
    }

    /// Background writes not finished yet
    pub fn pending_writes(&self) -> usize {
        self.tracker.len()
    }

    /// True when a connection exists and answers a ping
    pub async fn is_healthy(&self) -> bool {
        match self.current().await {
            Some(connection) => match connection.ping().await {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "Store ping failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Open a fresh connection and swap it in, closing the old one
    pub async fn reconnect(&self) -> Result<(), StoreError> {
        let _guard = self.reconnect_lock.lock().await;

        let fresh = self.connector.connect().await?;
        let old = self.connection.write().await.replace(fresh);
        info!(store = %self.connector.describe(), "Store connected");

        if let Some(old) = old {
            if let Err(e) = old.close().await {
                debug!(error = %e, "Closing replaced store connection failed");
            }
        }
        Ok(())
    }

    /// Wait (bounded) for background writes, then close the connection
    pub async fn close(&self, timeout: Duration) {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(pending = self.tracker.len(), "Timed out waiting for pending writes");
        }

        let _guard = self.reconnect_lock.lock().await;
        if let Some(connection) = self.connection.write().await.take() {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close store connection");
            }
        }
        info!("Persistence gateway closed");
    }
}
