//! Test helpers shared by unit tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::capability::{CapabilityError, RecoveryAction, RecoveryCapability};
use crate::config::SupervisorConfig;
use crate::events::EventNotifier;
use crate::registry::ResourceRegistry;

/// Capability that records calls and fails on demand.
#[derive(Default)]
pub(crate) struct ScriptedCapability {
    calls: Mutex<Vec<RecoveryAction>>,
    failing: Mutex<HashSet<RecoveryAction>>,
    hanging: Mutex<HashSet<RecoveryAction>>,
    unsupported: HashSet<RecoveryAction>,
}

impl ScriptedCapability {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn without(actions: &[RecoveryAction]) -> Arc<Self> {
        Arc::new(Self {
            unsupported: actions.iter().copied().collect(),
            ..Default::default()
        })
    }

    pub(crate) fn fail(&self, action: RecoveryAction) {
        self.failing.lock().insert(action);
    }

    pub(crate) fn succeed(&self, action: RecoveryAction) {
        self.failing.lock().remove(&action);
    }

    /// Make `action` never return.
    pub(crate) fn hang(&self, action: RecoveryAction) {
        self.hanging.lock().insert(action);
    }

    pub(crate) fn calls(&self) -> Vec<RecoveryAction> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, action: RecoveryAction) -> usize {
        self.calls.lock().iter().filter(|a| **a == action).count()
    }

    async fn record(&self, action: RecoveryAction) -> Result<(), CapabilityError> {
        self.calls.lock().push(action);
        let hangs = self.hanging.lock().contains(&action);
        if hangs {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().contains(&action) {
            return Err(CapabilityError::Failed(format!("{} failed", action)));
        }
        Ok(())
    }
}

#[async_trait]
impl RecoveryCapability for ScriptedCapability {
    fn supports(&self, action: RecoveryAction) -> bool {
        !self.unsupported.contains(&action)
    }

    async fn retry(&self) -> Result<(), CapabilityError> {
        self.record(RecoveryAction::Retry).await
    }

    async fn stop(&self) -> Result<(), CapabilityError> {
        self.record(RecoveryAction::Stop).await
    }

    async fn kill(&self) -> Result<(), CapabilityError> {
        self.record(RecoveryAction::Kill).await
    }

    async fn reconfigure(&self, _params: &serde_json::Value) -> Result<(), CapabilityError> {
        self.record(RecoveryAction::Reconfigure).await
    }
}

pub(crate) fn registry(config: SupervisorConfig) -> (Arc<ResourceRegistry>, Arc<EventNotifier>) {
    let notifier = Arc::new(EventNotifier::silent());
    let registry = Arc::new(ResourceRegistry::new(Arc::new(config), notifier.clone()));
    (registry, notifier)
}
