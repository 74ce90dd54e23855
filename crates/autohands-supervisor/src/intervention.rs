//! Human decision queue for resources whose automated recovery is exhausted.

#[cfg(test)]
#[path = "intervention_tests.rs"]
mod tests;

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{SupervisorError, SupervisorResult};
use crate::events::{EventKind, EventNotifier};
use crate::resource::ResourceHandle;

/// Operator decisions the engine knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionOptionKind {
    /// Invoke `retry` and watch for a heartbeat.
    Retry,
    /// Apply new parameters, then retry.
    ChangeConfig,
    /// Invoke `kill` and fail the resource.
    Kill,
    /// Fail the resource without touching it.
    Abort,
}

impl InterventionOptionKind {
    /// Option id used on the wire.
    pub fn id(&self) -> &'static str {
        match self {
            InterventionOptionKind::Retry => "retry",
            InterventionOptionKind::ChangeConfig => "change_config",
            InterventionOptionKind::Kill => "kill",
            InterventionOptionKind::Abort => "abort",
        }
    }

    /// Whether the option cannot be undone.
    pub fn is_destructive(&self) -> bool {
        matches!(self, InterventionOptionKind::Kill | InterventionOptionKind::Abort)
    }

    /// Build the option offered to operators.
    pub fn to_option(self) -> InterventionOption {
        let (label, description) = match self {
            InterventionOptionKind::Retry => ("Retry", "Ask the resource to retry its work"),
            InterventionOptionKind::ChangeConfig => (
                "Change configuration",
                "Apply new parameters and retry",
            ),
            InterventionOptionKind::Kill => ("Kill", "Terminate the resource immediately"),
            InterventionOptionKind::Abort => ("Abort", "Mark the resource as failed"),
        };
        InterventionOption {
            id: self.id().to_string(),
            label: label.to_string(),
            description: description.to_string(),
            destructive: self.is_destructive(),
        }
    }
}

impl FromStr for InterventionOptionKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(InterventionOptionKind::Retry),
            "change_config" => Ok(InterventionOptionKind::ChangeConfig),
            "kill" => Ok(InterventionOptionKind::Kill),
            "abort" => Ok(InterventionOptionKind::Abort),
            _ => Err(()),
        }
    }
}

/// An option presented to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionOption {
    pub id: String,
    pub label: String,
    pub description: String,
    pub destructive: bool,
}

/// Why automation gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Human readable error.
    pub error: String,
    /// Attempts made so far.
    pub recovery_attempts: u32,
    /// Seconds since registration.
    pub running_duration_secs: u64,
}

impl FailureContext {
    /// Build the context from a handle.
    pub fn from_handle(handle: &ResourceHandle) -> Self {
        Self {
            error: handle
                .last_error
                .clone()
                .unwrap_or_else(|| "automated recovery exhausted".to_string()),
            recovery_attempts: handle.recovery_attempts,
            running_duration_secs: handle.running_duration_secs(),
        }
    }
}

/// A pending operator decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRequest {
    pub id: Uuid,
    pub resource_id: String,
    pub resource_type: String,
    pub failure_context: FailureContext,
    /// Tiers tried before giving up, ordered and deduplicated.
    pub attempted_tiers: Vec<u32>,
    pub options: Vec<InterventionOption>,
    pub created_at: DateTime<Utc>,
    /// Times an operator deferred this request.
    #[serde(default)]
    pub dismiss_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dismissed_at: Option<DateTime<Utc>>,
}

impl InterventionRequest {
    /// Create a request for an exhausted resource.
    pub fn new(handle: &ResourceHandle, failure_context: FailureContext, kill_supported: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id: handle.id.clone(),
            resource_type: handle.resource_type.clone(),
            failure_context,
            attempted_tiers: handle.attempted_tiers.clone(),
            options: default_options(kill_supported),
            created_at: Utc::now(),
            dismiss_count: 0,
            last_dismissed_at: None,
        }
    }

    /// Look up an offered option.
    pub fn option(&self, option_id: &str) -> Option<&InterventionOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

/// Options offered for every request. Always starts with a non-destructive path.
pub fn default_options(kill_supported: bool) -> Vec<InterventionOption> {
    let mut kinds = vec![InterventionOptionKind::Retry, InterventionOptionKind::ChangeConfig];
    if kill_supported {
        kinds.push(InterventionOptionKind::Kill);
    }
    kinds.push(InterventionOptionKind::Abort);
    kinds.into_iter().map(InterventionOptionKind::to_option).collect()
}

/// FIFO queue of open intervention requests, at most one per resource.
pub struct InterventionBroker {
    queue: Mutex<VecDeque<InterventionRequest>>,
    notifier: Arc<EventNotifier>,
}

impl InterventionBroker {
    /// Create an empty broker.
    pub fn new(notifier: Arc<EventNotifier>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notifier,
        }
    }

    /// Open a request for `handle` unless one is already open.
    pub fn on_tier_exhausted(
        &self,
        handle: &ResourceHandle,
        failure_context: FailureContext,
        kill_supported: bool,
    ) -> Option<InterventionRequest> {
        let mut queue = self.queue.lock();
        if queue.iter().any(|r| r.resource_id == handle.id) {
            debug!("Intervention already open for {}", handle.id);
            return None;
        }

        let request = InterventionRequest::new(handle, failure_context, kill_supported);
        info!(
            resource_id = %handle.id,
            request_id = %request.id,
            attempted_tiers = ?request.attempted_tiers,
            "Intervention requested"
        );
        queue.push_back(request.clone());
        self.notifier.emit(EventKind::InterventionRequested {
            request: request.clone(),
        });
        Some(request)
    }

    /// Get an open request by id.
    pub fn pending(&self, request_id: Uuid) -> SupervisorResult<InterventionRequest> {
        self.queue
            .lock()
            .iter()
            .find(|r| r.id == request_id)
            .cloned()
            .ok_or_else(|| SupervisorError::RequestNotFound(request_id.to_string()))
    }

    /// Remove a request for dispatch. Succeeds at most once per request.
    pub fn take(&self, request_id: Uuid) -> SupervisorResult<InterventionRequest> {
        let mut queue = self.queue.lock();
        let pos = queue
            .iter()
            .position(|r| r.id == request_id)
            .ok_or_else(|| SupervisorError::RequestNotFound(request_id.to_string()))?;
        queue
            .remove(pos)
            .ok_or_else(|| SupervisorError::RequestNotFound(request_id.to_string()))
    }

    /// Put back a request whose dispatch failed, keeping creation order.
    pub fn reinstate(&self, request: InterventionRequest) {
        let mut queue = self.queue.lock();
        if queue.iter().any(|r| r.resource_id == request.resource_id) {
            return;
        }
        let pos = queue
            .iter()
            .position(|r| r.created_at > request.created_at)
            .unwrap_or(queue.len());
        queue.insert(pos, request);
    }

    /// Defer the open request for a resource. No state changes.
    pub fn dismiss(&self, resource_id: &str) -> SupervisorResult<InterventionRequest> {
        let mut queue = self.queue.lock();
        let request = queue
            .iter_mut()
            .find(|r| r.resource_id == resource_id)
            .ok_or_else(|| SupervisorError::RequestNotFound(resource_id.to_string()))?;
        request.dismiss_count += 1;
        request.last_dismissed_at = Some(Utc::now());
        let request = request.clone();
        debug!("Intervention for {} dismissed ({} times)", resource_id, request.dismiss_count);
        self.notifier.emit(EventKind::InterventionDismissed {
            request: request.clone(),
        });
        Ok(request)
    }

    /// Drop the open request for a resource, if any.
    pub fn supersede(&self, resource_id: &str) -> Option<InterventionRequest> {
        let mut queue = self.queue.lock();
        let pos = queue.iter().position(|r| r.resource_id == resource_id)?;
        let request = queue.remove(pos)?;
        info!(resource_id, request_id = %request.id, "Intervention superseded");
        self.notifier.emit(EventKind::InterventionSuperseded {
            request_id: request.id,
            resource_id: resource_id.to_string(),
        });
        Some(request)
    }

    /// Open request for a resource.
    pub fn open_for(&self, resource_id: &str) -> Option<InterventionRequest> {
        self.queue
            .lock()
            .iter()
            .find(|r| r.resource_id == resource_id)
            .cloned()
    }

    /// Open requests, oldest first.
    pub fn queue(&self) -> Vec<InterventionRequest> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Number of open requests.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no request is open.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Reload persisted requests, oldest first. Returns how many were accepted.
    pub fn restore(&self, mut requests: Vec<InterventionRequest>) -> usize {
        requests.sort_by_key(|r| r.created_at);
        let mut restored = 0;
        for request in requests {
            let before = self.len();
            self.reinstate(request);
            if self.len() > before {
                restored += 1;
            }
        }
        restored
    }
}
