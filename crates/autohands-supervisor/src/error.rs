//! Supervisor errors.

use thiserror::Error;

use crate::capability::RecoveryAction;
use crate::resource::ResourceState;

/// Result alias used across the supervisor.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Supervisor error types.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Input rejected before any state was touched.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A resource with this id is already registered.
    #[error("Resource already registered: {0}")]
    DuplicateResource(String),

    /// No resource with this id.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Transition not present in the legal edge table.
    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: ResourceState,
        to: ResourceState,
    },

    /// Another recovery path holds the resource.
    #[error("Recovery already in progress for {0}")]
    RecoveryInProgress(String),

    /// Intervention request absent, resolved or superseded.
    #[error("Intervention request not found: {0}")]
    RequestNotFound(String),

    /// Option id not offered by the request.
    #[error("Unknown option '{option_id}' for request {request_id}")]
    UnknownOption {
        request_id: String,
        option_id: String,
    },

    /// A resource-supplied recovery callback failed.
    #[error("Capability {action} failed: {message}")]
    CapabilityInvocation {
        action: RecoveryAction,
        message: String,
    },

    /// Destructive action attempted without a live confirmation token.
    #[error("Destructive action on {0} requires a valid confirmation token")]
    ConfirmationRequired(String),

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Event sink failure.
    #[error("Event sink {sink} failed: {message}")]
    Sink { sink: String, message: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] autohands_config::ConfigError),
}

impl SupervisorError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Validation(_) => "validation",
            SupervisorError::DuplicateResource(_) => "duplicate_resource",
            SupervisorError::ResourceNotFound(_) => "resource_not_found",
            SupervisorError::IllegalTransition { .. } => "illegal_transition",
            SupervisorError::RecoveryInProgress(_) => "recovery_in_progress",
            SupervisorError::RequestNotFound(_) => "request_not_found",
            SupervisorError::UnknownOption { .. } => "unknown_option",
            SupervisorError::CapabilityInvocation { .. } => "capability_invocation",
            SupervisorError::ConfirmationRequired(_) => "confirmation_required",
            SupervisorError::Store(_) => "store",
            SupervisorError::Sink { .. } => "sink",
            SupervisorError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_transition_display() {
        let err = SupervisorError::IllegalTransition {
            id: "r1".to_string(),
            from: ResourceState::Completed,
            to: ResourceState::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("r1"));
        assert!(msg.contains("completed -> running"));
    }

    #[test]
    fn test_unknown_option_display() {
        let err = SupervisorError::UnknownOption {
            request_id: "req".to_string(),
            option_id: "reboot".to_string(),
        };
        assert!(err.to_string().contains("'reboot'"));
    }

    #[test]
    fn test_capability_invocation_display() {
        let err = SupervisorError::CapabilityInvocation {
            action: RecoveryAction::Stop,
            message: "connection reset".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("stop"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SupervisorError::RequestNotFound("x".into()).code(),
            "request_not_found"
        );
        assert_eq!(
            SupervisorError::ConfirmationRequired("r1".into()).code(),
            "confirmation_required"
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let config_err = autohands_config::ConfigError::NotFound("x.toml".to_string());
        let err: SupervisorError = config_err.into();
        assert!(err.to_string().contains("x.toml"));
    }
}
