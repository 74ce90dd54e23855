//! Supervisor event feed and sinks.

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SupervisorError, SupervisorResult};
use crate::intervention::InterventionRequest;
use crate::resource::{ResourceHandle, ResourceState};

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A resource was registered.
    ResourceCreated { resource: ResourceHandle },

    /// A resource changed state. `resource` reflects the new state.
    ResourceStateChanged {
        resource: ResourceHandle,
        from: ResourceState,
        to: ResourceState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The health monitor found a resource without a fresh heartbeat.
    ResourceStuck {
        resource_id: String,
        resource_type: String,
        stale_for_secs: u64,
    },

    /// A tier the capability cannot run was skipped. `resource` carries the
    /// new tier.
    TierSkipped { resource: ResourceHandle, skipped: u32 },

    /// A tier attempt failed.
    RecoveryAttemptFailed {
        resource_id: String,
        tier: u32,
        error: String,
    },

    /// Automation is exhausted for a resource.
    InterventionRequested { request: InterventionRequest },

    /// An operator decision was dispatched.
    InterventionResolved {
        request_id: Uuid,
        resource_id: String,
        option_id: String,
    },

    /// An operator deferred a decision.
    InterventionDismissed { request: InterventionRequest },

    /// A request was dropped because the resource left intervention on its own.
    InterventionSuperseded { request_id: Uuid, resource_id: String },

    /// A resource was removed from the registry.
    ResourceRemoved { resource_id: String },

    /// Processing a resource failed inside the monitor or a recovery path.
    ResourceError {
        resource_id: String,
        code: String,
        error: String,
    },
}

impl EventKind {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ResourceCreated { .. } => "resource_created",
            EventKind::ResourceStateChanged { .. } => "resource_state_changed",
            EventKind::ResourceStuck { .. } => "resource_stuck",
            EventKind::TierSkipped { .. } => "tier_skipped",
            EventKind::RecoveryAttemptFailed { .. } => "recovery_attempt_failed",
            EventKind::InterventionRequested { .. } => "intervention_requested",
            EventKind::InterventionResolved { .. } => "intervention_resolved",
            EventKind::InterventionDismissed { .. } => "intervention_dismissed",
            EventKind::InterventionSuperseded { .. } => "intervention_superseded",
            EventKind::ResourceRemoved { .. } => "resource_removed",
            EventKind::ResourceError { .. } => "resource_error",
        }
    }

    /// Resource the event concerns.
    pub fn resource_id(&self) -> &str {
        match self {
            EventKind::ResourceCreated { resource }
            | EventKind::ResourceStateChanged { resource, .. }
            | EventKind::TierSkipped { resource, .. } => &resource.id,
            EventKind::InterventionRequested { request }
            | EventKind::InterventionDismissed { request } => &request.resource_id,
            EventKind::ResourceStuck { resource_id, .. }
            | EventKind::RecoveryAttemptFailed { resource_id, .. }
            | EventKind::InterventionResolved { resource_id, .. }
            | EventKind::InterventionSuperseded { resource_id, .. }
            | EventKind::ResourceRemoved { resource_id }
            | EventKind::ResourceError { resource_id, .. } => resource_id,
        }
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorEvent {
    /// Global publication order.
    pub sequence: u64,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub kind: EventKind,
}

/// Destination for supervisor events.
///
/// `publish` is called while the emitting resource is locked, so it must not
/// block and must not call back into the supervisor.
pub trait EventSink: Send + Sync {
    /// Sink name.
    fn name(&self) -> &str;

    /// Deliver one event.
    fn publish(&self, event: &SupervisorEvent) -> SupervisorResult<()>;
}

/// Log sink (writes to tracing).
pub struct LogSink;

impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&self, event: &SupervisorEvent) -> SupervisorResult<()> {
        let resource_id = event.kind.resource_id();
        match &event.kind {
            EventKind::ResourceStuck { stale_for_secs, .. } => {
                warn!(resource_id, stale_for_secs, "[EVENT] resource_stuck")
            }
            EventKind::RecoveryAttemptFailed { tier, error, .. } => {
                warn!(resource_id, tier, %error, "[EVENT] recovery_attempt_failed")
            }
            EventKind::ResourceError { code, error, .. } => {
                warn!(resource_id, %code, %error, "[EVENT] resource_error")
            }
            EventKind::InterventionRequested { request } => {
                warn!(resource_id, request_id = %request.id, "[EVENT] intervention_requested")
            }
            EventKind::ResourceStateChanged { from, to, .. } => {
                info!(resource_id, %from, %to, "[EVENT] resource_state_changed")
            }
            kind => debug!(resource_id, "[EVENT] {}", kind.name()),
        }
        Ok(())
    }
}

/// Broadcast sink feeding in-process observers.
pub struct BroadcastSink {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl BroadcastSink {
    /// Create a broadcast sink with the given buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn publish(&self, event: &SupervisorEvent) -> SupervisorResult<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Sink wrapping a caller supplied `publish` callback.
pub struct FnSink<F> {
    name: String,
    publish: F,
}

impl<F> FnSink<F>
where
    F: Fn(&SupervisorEvent) -> SupervisorResult<()> + Send + Sync,
{
    /// Wrap a callback.
    pub fn new(name: impl Into<String>, publish: F) -> Self {
        Self {
            name: name.into(),
            publish,
        }
    }
}

impl<F> EventSink for FnSink<F>
where
    F: Fn(&SupervisorEvent) -> SupervisorResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, event: &SupervisorEvent) -> SupervisorResult<()> {
        (self.publish)(event)
    }
}

/// Fans events out to every registered sink.
pub struct EventNotifier {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    sequence: AtomicU64,
}

impl EventNotifier {
    /// Create a notifier with the log sink installed.
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(vec![Arc::new(LogSink)]),
            sequence: AtomicU64::new(0),
        }
    }

    /// Create a notifier without any sink.
    pub fn silent() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Add a sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        debug!("Adding event sink: {}", sink.name());
        self.sinks.write().push(sink);
    }

    /// Get list of sink names.
    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.read().iter().map(|s| s.name().to_string()).collect()
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Publish an event to all sinks. Sink failures are logged, never raised.
    pub fn emit(&self, kind: EventKind) -> SupervisorEvent {
        let event = SupervisorEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            kind,
        };

        for sink in self.sinks.read().iter() {
            if let Err(e) = sink.publish(&event) {
                error!("Failed to publish {} via {}: {}", event.kind.name(), sink.name(), e);
            }
        }

        event
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a sink error.
pub fn sink_error(sink: &str, message: impl Into<String>) -> SupervisorError {
    SupervisorError::Sink {
        sink: sink.to_string(),
        message: message.into(),
    }
}
