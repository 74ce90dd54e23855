//! Command/query boundary.
//!
//! Serializable request and response messages for embedding surfaces that
//! talk to the supervisor over a transport instead of calling it directly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confirmation::KillConfirmation;
use crate::error::SupervisorError;
use crate::escalation::{ManualAction, Resolution};
use crate::intervention::InterventionRequest;
use crate::resource::{ResourceHandle, ResourceState};
use crate::stats::StatsSnapshot;

/// State-changing requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Liveness signal from a resource.
    Heartbeat {
        resource_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },

    /// Resource-reported transition (`running`, `completed` or `failed`).
    Transition {
        resource_id: String,
        to: ResourceState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Operator action on one resource.
    ManualAction {
        resource_id: String,
        action: ManualAction,
    },

    /// First phase of a manual kill.
    RequestKill { resource_id: String },

    /// Dispatch an operator decision.
    ResolveIntervention {
        request_id: Uuid,
        option_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Defer the open request of a resource.
    DismissIntervention { resource_id: String },

    /// Drop a resource from supervision.
    Remove { resource_id: String },
}

/// Read-only requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    /// Resources in creation order, optionally of one type.
    ListResources {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_type: Option<String>,
    },

    GetResource { resource_id: String },

    GetStats,

    /// Open intervention requests, oldest first.
    GetInterventionQueue,
}

/// Reply to a [`Command`] or [`Query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    /// Accepted, nothing to return.
    Ok,
    Resource(ResourceHandle),
    Resources(Vec<ResourceHandle>),
    Stats(StatsSnapshot),
    Intervention(InterventionRequest),
    Interventions(Vec<InterventionRequest>),
    Resolution(Resolution),
    KillConfirmation(KillConfirmation),
    Error { code: String, message: String },
}

impl Response {
    /// Create an error response.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether this is an error response.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<SupervisorError> for Response {
    fn from(err: SupervisorError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}
