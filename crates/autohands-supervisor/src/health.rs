//! Health monitor.
//!
//! Periodic liveness check over the registry. Flags `running` resources whose
//! heartbeat is older than their staleness threshold as `stuck` and hands them
//! to the escalation engine.

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::escalation::EscalationEngine;
use crate::registry::ResourceRegistry;
use crate::resource::ResourceState;

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Running resources examined.
    pub checked: usize,
    /// Resources flagged stuck on this tick.
    pub newly_stuck: Vec<String>,
    /// Escalations started on this tick.
    pub escalated: Vec<String>,
    /// Terminal resources purged.
    pub purged: Vec<String>,
    /// Per-resource failures, as `(id, error)`.
    pub errors: Vec<(String, String)>,
}

/// Periodic staleness check.
pub struct HealthMonitor {
    config: Arc<SupervisorConfig>,
    registry: Arc<ResourceRegistry>,
    engine: Arc<EscalationEngine>,
    tick_count: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<SupervisorConfig>,
        registry: Arc<ResourceRegistry>,
        engine: Arc<EscalationEngine>,
    ) -> Self {
        Self {
            config,
            registry,
            engine,
            tick_count: AtomicU64::new(0),
        }
    }

    /// Run one check. Never fails; per-resource errors are logged and reported.
    pub fn tick(&self) -> TickReport {
        let now = Instant::now();
        let mut report = TickReport::default();
        self.tick_count.fetch_add(1, Ordering::SeqCst);

        for id in self.registry.ids_in_state(ResourceState::Running) {
            report.checked += 1;
            match self.registry.mark_stuck_if_stale(&id, now) {
                Ok(Some(stale)) => {
                    warn!(
                        resource_id = %id,
                        resource_type = %stale.handle.resource_type,
                        stale_for_secs = stale.stale_for.as_secs(),
                        "Resource is stuck"
                    );
                    report.newly_stuck.push(id);
                }
                Ok(None) => {}
                // Removed between the scan and the check.
                Err(SupervisorError::ResourceNotFound(_)) => {}
                Err(e) => {
                    self.engine.report_error(&id, &e);
                    report.errors.push((id, e.to_string()));
                }
            }
        }

        // Newly stuck resources plus any left stuck without a recovery path,
        // e.g. restored after a restart or rebound after re-registration.
        for id in self.registry.ids_in_state(ResourceState::Stuck) {
            if self.engine.is_in_flight(&id) {
                continue;
            }
            match self.registry.capability(&id) {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => continue,
            }
            match self.engine.escalate(&id) {
                Ok(Some(_)) => report.escalated.push(id),
                // At the concurrency cap; retried next tick.
                Ok(None) => {}
                Err(SupervisorError::RecoveryInProgress(_)) => {}
                Err(e) => {
                    self.engine.report_error(&id, &e);
                    report.errors.push((id, e.to_string()));
                }
            }
        }

        for id in self.registry.purge_expired(now) {
            self.engine.forget(&id);
            report.purged.push(id);
        }

        if !report.newly_stuck.is_empty() || !report.purged.is_empty() || !report.errors.is_empty() {
            debug!(
                "Health tick: checked={}, stuck={}, escalated={}, purged={}, errors={}",
                report.checked,
                report.newly_stuck.len(),
                report.escalated.len(),
                report.purged.len(),
                report.errors.len()
            );
        }
        report
    }

    /// Ticks run so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    /// Start the periodic tick loop.
    pub async fn start_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.config.tick_interval();
        info!("Starting health monitor loop (interval: {:?})", period);

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown_rx.recv() => {
                    info!("Health monitor loop shutting down");
                    break;
                }
            }
        }
    }
}
