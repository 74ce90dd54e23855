//! # AutoHands Supervisor
//!
//! Lifecycle supervision for long-running resources: agent sessions,
//! scheduled jobs, channel connections.
//!
//! ## Features
//!
//! - Heartbeat-based staleness detection per resource type
//! - Tiered automated recovery through resource-supplied callbacks
//! - FIFO intervention queue once automation is exhausted
//! - Two-phase confirmation for destructive operator actions
//! - Event feed with pluggable sinks and crash-safe persistence

pub mod capability;
pub mod command;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod escalation;
pub mod events;
pub mod health;
pub mod intervention;
pub mod registry;
pub mod resource;
pub mod stats;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use capability::{CapabilityError, RecoveryAction, RecoveryCapability};
pub use command::{Command, Query, Response};
pub use config::SupervisorConfig;
pub use confirmation::KillConfirmation;
pub use error::{SupervisorError, SupervisorResult};
pub use escalation::{EscalationEngine, ManualAction, Resolution};
pub use events::{
    BroadcastSink, EventKind, EventNotifier, EventSink, FnSink, LogSink, SupervisorEvent,
};
pub use health::{HealthMonitor, TickReport};
pub use intervention::{
    FailureContext, InterventionBroker, InterventionOption, InterventionOptionKind,
    InterventionRequest,
};
pub use registry::ResourceRegistry;
pub use resource::{ResourceHandle, ResourceSpec, ResourceState};
pub use stats::{StatsAggregator, StatsSnapshot};
pub use store::{
    FileSupervisorStore, MemorySupervisorStore, PersistenceSink, SupervisorStore,
    TransitionRecord,
};
pub use supervisor::{RestoreReport, Supervisor};
