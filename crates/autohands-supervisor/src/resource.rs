//! Resource handles, lifecycle states and the legal edge table.

#[cfg(test)]
#[path = "resource_tests.rs"]
mod tests;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SupervisorError, SupervisorResult};

/// Lifecycle state of a supervised resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Registered, no heartbeat yet.
    Idle,
    /// Heartbeating normally.
    Running,
    /// No heartbeat within the staleness threshold.
    Stuck,
    /// A recovery attempt is in flight.
    Recovering,
    /// Automation exhausted; waiting on an operator.
    AwaitingIntervention,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl ResourceState {
    /// Every state, in lifecycle order.
    pub const ALL: [ResourceState; 7] = [
        ResourceState::Idle,
        ResourceState::Running,
        ResourceState::Stuck,
        ResourceState::Recovering,
        ResourceState::AwaitingIntervention,
        ResourceState::Completed,
        ResourceState::Failed,
    ];

    /// Terminal states have no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Completed | ResourceState::Failed)
    }

    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Idle => "idle",
            ResourceState::Running => "running",
            ResourceState::Stuck => "stuck",
            ResourceState::Recovering => "recovering",
            ResourceState::AwaitingIntervention => "awaiting_intervention",
            ResourceState::Completed => "completed",
            ResourceState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States reachable from `from` in one step.
///
/// Every non-terminal state may move to `completed` or `failed`: a resource
/// can finish on its own at any point, including mid-recovery.
pub fn allowed_transitions(from: ResourceState) -> &'static [ResourceState] {
    use ResourceState::*;
    match from {
        Idle => &[Running, Completed, Failed],
        Running => &[Stuck, Completed, Failed],
        Stuck => &[Recovering, AwaitingIntervention, Completed, Failed],
        Recovering => &[Running, Stuck, AwaitingIntervention, Completed, Failed],
        AwaitingIntervention => &[Recovering, Running, Completed, Failed],
        Completed | Failed => &[],
    }
}

/// Check a single edge against the table.
pub fn validate_transition(
    id: &str,
    from: ResourceState,
    to: ResourceState,
) -> SupervisorResult<()> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(SupervisorError::IllegalTransition {
            id: id.to_string(),
            from,
            to,
        })
    }
}

/// Registration message for a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Unique id chosen by the embedding system.
    pub id: String,
    /// Type tag, used to pick the staleness threshold.
    pub resource_type: String,
    /// Staleness threshold overriding the per-type value.
    #[serde(default, with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub staleness: Option<Duration>,
}

impl ResourceSpec {
    /// Create a spec using the configured staleness for its type.
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            staleness: None,
        }
    }

    /// Override the staleness threshold.
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = Some(staleness);
        self
    }

    /// Reject malformed registrations.
    pub fn validate(&self) -> SupervisorResult<()> {
        if self.id.trim().is_empty() {
            return Err(SupervisorError::Validation("resource id must not be empty".into()));
        }
        if self.resource_type.trim().is_empty() {
            return Err(SupervisorError::Validation(format!(
                "resource type for {} must not be empty",
                self.id
            )));
        }
        if self.staleness == Some(Duration::ZERO) {
            return Err(SupervisorError::Validation(format!(
                "staleness threshold for {} must be > 0",
                self.id
            )));
        }
        Ok(())
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Canonical state of one supervised resource.
///
/// Presentation-free: display concerns belong to whoever renders the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Unique id.
    pub id: String,
    /// Type tag.
    pub resource_type: String,
    /// Current lifecycle state.
    pub state: ResourceState,
    /// Current escalation tier; 0 outside a stuck episode.
    pub escalation_tier: u32,
    /// Last reported progress in `0.0..=1.0`.
    pub progress: Option<f64>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last heartbeat (registration time until the first one).
    pub last_heartbeat_at: DateTime<Utc>,
    /// Recovery attempts made, across all tiers and episodes.
    pub recovery_attempts: u32,
    /// Last error recorded by a transition.
    pub last_error: Option<String>,
    /// Tiers tried in the current episode, ordered and deduplicated.
    #[serde(default)]
    pub attempted_tiers: Vec<u32>,
    /// When the resource entered a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
}

impl ResourceHandle {
    /// Create an idle handle.
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            state: ResourceState::Idle,
            escalation_tier: 0,
            progress: None,
            created_at: now,
            last_heartbeat_at: now,
            recovery_attempts: 0,
            last_error: None,
            attempted_tiers: Vec::new(),
            terminal_at: None,
        }
    }

    /// Apply a transition, enforcing the edge table.
    ///
    /// Returns `false` when `to` equals the current state (no-op).
    ///
    /// Entering `stuck`, or falling from `recovering` into
    /// `awaiting_intervention`, advances the tier. Entering `recovering`
    /// counts an attempt at the current tier. Entering `running` or a
    /// terminal state ends the episode.
    pub fn apply_transition(
        &mut self,
        to: ResourceState,
        error: Option<String>,
    ) -> SupervisorResult<bool> {
        let from = self.state;
        if from == to {
            return Ok(false);
        }
        validate_transition(&self.id, from, to)?;

        match to {
            ResourceState::Stuck => self.escalation_tier = self.escalation_tier.saturating_add(1),
            ResourceState::AwaitingIntervention if from == ResourceState::Recovering => {
                self.escalation_tier = self.escalation_tier.saturating_add(1)
            }
            ResourceState::Recovering => {
                self.recovery_attempts = self.recovery_attempts.saturating_add(1);
                self.record_tier(self.escalation_tier);
            }
            ResourceState::Running => self.reset_episode(),
            ResourceState::Completed | ResourceState::Failed => {
                self.reset_episode();
                self.terminal_at = Some(Utc::now());
            }
            _ => {}
        }

        if error.is_some() {
            self.last_error = error;
        }
        self.state = to;
        Ok(true)
    }

    /// Advance the tier without a state change (skipped tier).
    pub fn skip_tier(&mut self) {
        self.escalation_tier = self.escalation_tier.saturating_add(1);
    }

    /// Record a heartbeat.
    pub fn record_heartbeat(&mut self, progress: Option<f64>) {
        self.last_heartbeat_at = Utc::now();
        if progress.is_some() {
            self.progress = progress;
        }
    }

    /// Whole seconds since registration.
    pub fn running_duration_secs(&self) -> u64 {
        (Utc::now() - self.created_at).num_seconds().max(0) as u64
    }

    fn record_tier(&mut self, tier: u32) {
        if tier > 0 && !self.attempted_tiers.contains(&tier) {
            self.attempted_tiers.push(tier);
        }
    }

    fn reset_episode(&mut self) {
        self.escalation_tier = 0;
        self.attempted_tiers.clear();
    }
}

/// Validate a heartbeat progress value.
pub fn validate_progress(id: &str, progress: Option<f64>) -> SupervisorResult<()> {
    match progress {
        Some(p) if !(0.0..=1.0).contains(&p) => Err(SupervisorError::Validation(format!(
            "progress for {} must be within 0..=1, got {}",
            id, p
        ))),
        _ => Ok(()),
    }
}
