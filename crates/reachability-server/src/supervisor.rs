//! Periodic store health check with bounded reconnects.

use crate::gateway::PersistenceGateway;
use crate::metrics::MetricsRegistry;
use crate::types::{EventLevel, LogEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const EVENT_CATEGORY: &str = "connectivity";

/// Outcome of one supervisor check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCheck {
    Healthy,
    Reconnected { attempts: u32 },
    Failed { attempts: u32 },
}

pub struct ConnectivitySupervisor {
    gateway: Arc<PersistenceGateway>,
    interval: Duration,
    reconnect_attempts: u32,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ConnectivitySupervisor {
    pub fn new(
        gateway: Arc<PersistenceGateway>,
        interval: Duration,
        reconnect_attempts: u32,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            gateway,
            interval,
            reconnect_attempts: reconnect_attempts.max(1),
            metrics,
        }
    }

    /// Ping the store; if it does not answer, try to reconnect a few times in a row
    pub async fn check_once(&self) -> SupervisorCheck {
        if self.gateway.is_healthy().await {
            debug!("Store connection healthy");
            return SupervisorCheck::Healthy;
        }

        self.event("Store connection unhealthy, reconnecting".to_string(), EventLevel::Warning);

        for attempt in 1..=self.reconnect_attempts {
            match self.gateway.reconnect().await {
                Ok(()) => {
                    self.record(true);
                    self.event(
                        format!("Store reconnected after {} attempt(s)", attempt),
                        EventLevel::Success,
                    );
                    return SupervisorCheck::Reconnected { attempts: attempt };
                }
                Err(e) => {
                    self.record(false);
                    debug!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        self.event(
            format!(
                "Store reconnect failed after {} attempts, retrying in {:?}",
                self.reconnect_attempts, self.interval
            ),
            EventLevel::Error,
        );
        SupervisorCheck::Failed {
            attempts: self.reconnect_attempts,
        }
    }

    fn record(&self, ok: bool) {
        if let Some(ref m) = self.metrics {
            m.record_reconnect(ok);
        }
    }

    fn event(&self, message: String, level: EventLevel) {
        self.gateway.log_event(LogEvent::new(EVENT_CATEGORY, message, level));
    }

    /// Check on every tick until cancelled. The first check happens one
    /// interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "Connectivity supervisor started");

        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }

        info!("Connectivity supervisor stopped");
    }
}
