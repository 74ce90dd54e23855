//! Aggregate resource counts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::intervention::InterventionBroker;
use crate::registry::ResourceRegistry;
use crate::resource::ResourceState;

/// Point-in-time counts. May lag concurrent mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: usize,
    pub idle: usize,
    pub running: usize,
    pub stuck: usize,
    pub recovering: usize,
    pub awaiting_intervention: usize,
    pub completed: usize,
    pub failed: usize,
    /// Open intervention requests.
    pub open_interventions: usize,
}

impl StatsSnapshot {
    fn count(&mut self, state: ResourceState) {
        self.total += 1;
        let slot = match state {
            ResourceState::Idle => &mut self.idle,
            ResourceState::Running => &mut self.running,
            ResourceState::Stuck => &mut self.stuck,
            ResourceState::Recovering => &mut self.recovering,
            ResourceState::AwaitingIntervention => &mut self.awaiting_intervention,
            ResourceState::Completed => &mut self.completed,
            ResourceState::Failed => &mut self.failed,
        };
        *slot += 1;
    }
}

/// Read-only view over the registry.
pub struct StatsAggregator {
    registry: Arc<ResourceRegistry>,
    broker: Arc<InterventionBroker>,
}

impl StatsAggregator {
    pub fn new(registry: Arc<ResourceRegistry>, broker: Arc<InterventionBroker>) -> Self {
        Self { registry, broker }
    }

    /// Count resources by state in one pass.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        self.registry.for_each_state(|state| snapshot.count(state));
        snapshot.open_interventions = self.broker.len();
        snapshot
    }
}
