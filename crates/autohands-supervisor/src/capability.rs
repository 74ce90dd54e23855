//! Resource-supplied recovery callbacks.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::{SupervisorError, SupervisorResult};

/// A recovery callback a capability may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-run or resume the unit of work.
    Retry,
    /// Stop the unit of work gracefully.
    Stop,
    /// Terminate the unit of work. Destructive.
    Kill,
    /// Apply new parameters before the next retry.
    Reconfigure,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryAction::Retry => write!(f, "retry"),
            RecoveryAction::Stop => write!(f, "stop"),
            RecoveryAction::Kill => write!(f, "kill"),
            RecoveryAction::Reconfigure => write!(f, "reconfigure"),
        }
    }
}

/// Error returned by a capability callback.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The callback ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The capability does not offer this action.
    #[error("{0} is not supported")]
    Unsupported(RecoveryAction),
}

/// Recovery callbacks bound to a resource at registration.
///
/// Implementations must be idempotent: a duplicate invocation must not repeat
/// side effects. The engine never invokes two callbacks of one resource
/// concurrently, but a callback may be retried after a timeout.
#[async_trait]
pub trait RecoveryCapability: Send + Sync {
    /// Whether this capability offers `action`.
    fn supports(&self, _action: RecoveryAction) -> bool {
        true
    }

    /// Re-run or resume the unit of work.
    async fn retry(&self) -> Result<(), CapabilityError>;

    /// Stop the unit of work gracefully.
    async fn stop(&self) -> Result<(), CapabilityError>;

    /// Terminate the unit of work.
    async fn kill(&self) -> Result<(), CapabilityError>;

    /// Apply operator supplied parameters.
    async fn reconfigure(&self, _params: &serde_json::Value) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// Upgrade a weak capability reference, if the resource still holds it.
pub fn upgrade(
    capability: &Option<Weak<dyn RecoveryCapability>>,
) -> Option<Arc<dyn RecoveryCapability>> {
    capability.as_ref().and_then(Weak::upgrade)
}

/// Invoke one action, wrapping every failure as `CapabilityInvocation`.
pub async fn invoke(
    capability: &Option<Weak<dyn RecoveryCapability>>,
    action: RecoveryAction,
    params: Option<&serde_json::Value>,
) -> SupervisorResult<()> {
    let Some(capability) = upgrade(capability) else {
        return Err(SupervisorError::CapabilityInvocation {
            action,
            message: "capability is no longer available".to_string(),
        });
    };

    if !capability.supports(action) {
        return Err(SupervisorError::CapabilityInvocation {
            action,
            message: CapabilityError::Unsupported(action).to_string(),
        });
    }

    debug!("Invoking capability action: {}", action);
    let result = match action {
        RecoveryAction::Retry => capability.retry().await,
        RecoveryAction::Stop => capability.stop().await,
        RecoveryAction::Kill => capability.kill().await,
        RecoveryAction::Reconfigure => {
            let empty = serde_json::Value::Null;
            capability.reconfigure(params.unwrap_or(&empty)).await
        }
    };

    result.map_err(|e| SupervisorError::CapabilityInvocation {
        action,
        message: e.to_string(),
    })
}
