//! Escalation engine.
//!
//! Drives stuck resources through the automated tiers and dispatches operator
//! decisions. Every recovery path, automated or manual, holds the resource's
//! lock for its whole duration, so at most one is active per resource.
//!
//! | tier | actions |
//! |------|---------|
//! | 1 | `retry` |
//! | 2 | `stop`, then `retry` |
//! | 3+ | none; handed to the intervention broker |
//!
//! An attempt succeeds when the resource heartbeats (leaves `recovering` for
//! `running`) before the tier deadline. A terminal state reached mid-attempt
//! wins: the attempt's late result is discarded.

#[cfg(test)]
#[path = "escalation_tests.rs"]
mod tests;

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::capability::{self, RecoveryAction, RecoveryCapability};
use crate::config::SupervisorConfig;
use crate::confirmation::{ConfirmationLedger, KillConfirmation};
use crate::error::{SupervisorError, SupervisorResult};
use crate::events::{EventKind, EventNotifier};
use crate::intervention::{FailureContext, InterventionBroker, InterventionOptionKind};
use crate::registry::ResourceRegistry;
use crate::resource::{ResourceHandle, ResourceState};

/// Operator action on a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManualAction {
    /// Invoke `retry`; from `stuck` or `awaiting_intervention` this starts a
    /// watched recovery attempt.
    Retry,
    /// Invoke `stop` and fail the resource.
    Stop,
    /// Invoke `kill` and fail the resource. Needs a token from `request_kill`.
    Kill { confirmation: Uuid },
}

/// Result of a dispatched intervention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub request_id: Uuid,
    pub resource_id: String,
    pub option_id: String,
    /// Resource state right after dispatch.
    pub state: ResourceState,
}

/// Actions run by an automated tier.
pub fn tier_actions(tier: u32) -> &'static [RecoveryAction] {
    match tier {
        1 => &[RecoveryAction::Retry],
        _ => &[RecoveryAction::Stop, RecoveryAction::Retry],
    }
}

/// An attempt whose actions ran and which now waits for a heartbeat.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    tier: u32,
    deadline: Instant,
}

enum AttemptOutcome {
    Recovered,
    /// The resource left `recovering` by another path.
    Superseded,
    Failed(String),
}

/// Tiered recovery state machine.
pub struct EscalationEngine {
    config: Arc<SupervisorConfig>,
    registry: Arc<ResourceRegistry>,
    broker: Arc<InterventionBroker>,
    notifier: Arc<EventNotifier>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    permits: Arc<Semaphore>,
    confirmations: ConfirmationLedger,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl EscalationEngine {
    pub fn new(
        config: Arc<SupervisorConfig>,
        registry: Arc<ResourceRegistry>,
        broker: Arc<InterventionBroker>,
        notifier: Arc<EventNotifier>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_recoveries)),
            confirmations: ConfirmationLedger::new(config.kill_confirmation_ttl()),
            config,
            registry,
            broker,
            notifier,
            locks: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn try_acquire(&self, id: &str) -> SupervisorResult<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(id.to_string()).or_default().clone();
        lock.try_lock_owned()
            .map_err(|_| SupervisorError::RecoveryInProgress(id.to_string()))
    }

    /// Whether a recovery path currently holds the resource.
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.locks
            .get(id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Hold the resource against every recovery path.
    ///
    /// Fails with `RecoveryInProgress` if one already holds it.
    pub fn hold(&self, id: &str) -> SupervisorResult<OwnedMutexGuard<()>> {
        self.try_acquire(id)
    }

    /// Drop the lock of a resource that left the registry.
    pub fn forget(&self, id: &str) {
        self.locks.remove_if(id, |_, lock| lock.try_lock().is_ok());
    }

    /// Start escalating a stuck resource in the background.
    ///
    /// Fails with `RecoveryInProgress` if another path holds the resource.
    /// Returns `None` while the concurrency cap is reached; the resource
    /// stays `stuck` and unlocked until a later tick.
    pub fn escalate(self: &Arc<Self>, id: &str) -> SupervisorResult<Option<JoinHandle<()>>> {
        let guard = self.try_acquire(id)?;
        let Some(permit) = self.try_permit(id) else {
            return Ok(None);
        };
        Ok(Some(self.spawn_drive(id, guard, Some(permit), None)))
    }

    fn try_permit(&self, id: &str) -> Option<OwnedSemaphorePermit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                debug!("No recovery permit for {}, deferring", id);
                None
            }
        }
    }

    fn spawn_drive(
        self: &Arc<Self>,
        id: &str,
        guard: OwnedMutexGuard<()>,
        permit: Option<OwnedSemaphorePermit>,
        in_flight: Option<InFlight>,
    ) -> JoinHandle<()> {
        let span = info_span!("escalation", resource_id = %id);
        self.tasks.spawn(
            Arc::clone(self)
                .drive(id.to_string(), guard, permit, in_flight)
                .instrument(span),
        )
    }

    /// Finish an operator attempt, if any, then run the automated tiers.
    ///
    /// Operator attempts run without a permit. Automated tiers need one and
    /// are left to a later tick when none is free.
    async fn drive(
        self: Arc<Self>,
        id: String,
        _guard: OwnedMutexGuard<()>,
        permit: Option<OwnedSemaphorePermit>,
        in_flight: Option<InFlight>,
    ) {
        let run = async {
            if let Some(in_flight) = in_flight {
                if !self.finish_attempt(&id, in_flight).await? {
                    return Ok(());
                }
            }
            let Some(_permit) = permit.or_else(|| self.try_permit(&id)) else {
                return Ok(());
            };
            while self.step(&id).await? {}
            Ok::<(), SupervisorError>(())
        };

        tokio::select! {
            result = run => {
                if let Err(e) = result {
                    self.report_error(&id, &e);
                }
            }
            _ = self.cancel.cancelled() => {
                debug!("Escalation of {} cancelled", id);
            }
        }
    }

    /// Log a per-resource failure and publish it as a `resource_error` event.
    pub fn report_error(&self, id: &str, error: &SupervisorError) {
        warn!(resource_id = %id, error = %error, "Recovery path failed");
        self.notifier.emit(EventKind::ResourceError {
            resource_id: id.to_string(),
            code: error.code().to_string(),
            error: error.to_string(),
        });
    }

    /// Invoke one capability action, bounded by `deadline`.
    async fn call(
        &self,
        capability: &Option<Weak<dyn RecoveryCapability>>,
        action: RecoveryAction,
        params: Option<&serde_json::Value>,
        deadline: Instant,
    ) -> SupervisorResult<()> {
        match tokio::time::timeout_at(deadline, capability::invoke(capability, action, params)).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::CapabilityInvocation {
                action,
                message: format!("timed out after {}s", self.config.tier_timeout_secs),
            }),
        }
    }

    /// Deadline for a capability call started now.
    fn tier_deadline(&self) -> Instant {
        Instant::now() + self.config.tier_timeout()
    }

    /// Run one escalation step. Returns `true` while the resource still needs
    /// driving.
    async fn step(&self, id: &str) -> SupervisorResult<bool> {
        let Some(handle) = self.registry.get(id) else {
            return Ok(false);
        };
        if handle.state != ResourceState::Stuck {
            return Ok(false);
        }

        let tier = handle.escalation_tier;
        if tier > self.config.max_automated_tier {
            let moved = self.registry.transition_if(
                id,
                ResourceState::Stuck,
                ResourceState::AwaitingIntervention,
                None,
            )?;
            if moved.is_some() {
                self.hand_off(id)?;
            }
            return Ok(false);
        }

        let actions = tier_actions(tier);
        let capability = self.registry.capability(id)?;
        if capability.is_none() {
            debug!("{} is detached, waiting for re-registration", id);
            return Ok(false);
        }
        if let Some(missing) = capability::upgrade(&capability)
            .and_then(|c| actions.iter().copied().find(|a| !c.supports(*a)))
        {
            info!(resource_id = %id, tier, %missing, "Skipping unsupported tier");
            self.registry.escalate_tier(id)?;
            return Ok(true);
        }

        match self
            .begin_attempt(id, ResourceState::Stuck, &capability, actions, None)
            .await
        {
            Ok(Some(in_flight)) => self.finish_attempt(id, in_flight).await,
            Ok(None) => Ok(false),
            // Already recorded as a failed attempt.
            Err(SupervisorError::CapabilityInvocation { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Move `from -> recovering` and run `actions` under the tier deadline.
    ///
    /// Returns `None` if the resource was no longer in `from`. A failing
    /// action is recorded as a failed attempt and returned.
    async fn begin_attempt(
        &self,
        id: &str,
        from: ResourceState,
        capability: &Option<Weak<dyn RecoveryCapability>>,
        actions: &[RecoveryAction],
        params: Option<&serde_json::Value>,
    ) -> SupervisorResult<Option<InFlight>> {
        let deadline = self.tier_deadline();
        let Some(handle) =
            self.registry
                .transition_if(id, from, ResourceState::Recovering, None)?
        else {
            return Ok(None);
        };
        let tier = handle.escalation_tier;
        info!(resource_id = %id, tier, attempt = handle.recovery_attempts, "Recovery attempt started");

        for action in actions.iter().copied() {
            if let Err(e) = self.call(capability, action, params, deadline).await {
                self.fail_attempt(id, tier, e.to_string())?;
                return Err(e);
            }
        }

        Ok(Some(InFlight { tier, deadline }))
    }

    /// Wait for the attempt's heartbeat. Returns `true` if escalation should
    /// continue.
    async fn finish_attempt(&self, id: &str, in_flight: InFlight) -> SupervisorResult<bool> {
        match self.await_recovery(id, in_flight).await {
            AttemptOutcome::Recovered => {
                info!(resource_id = %id, tier = in_flight.tier, "Resource recovered");
                Ok(false)
            }
            AttemptOutcome::Superseded => {
                debug!("Attempt for {} superseded", id);
                Ok(false)
            }
            AttemptOutcome::Failed(error) => {
                self.fail_attempt(id, in_flight.tier, error)?;
                Ok(true)
            }
        }
    }

    async fn await_recovery(&self, id: &str, in_flight: InFlight) -> AttemptOutcome {
        let Ok(mut rx) = self.registry.subscribe_state(id) else {
            return AttemptOutcome::Superseded;
        };

        let waited = tokio::time::timeout_at(
            in_flight.deadline,
            rx.wait_for(|state| *state != ResourceState::Recovering),
        )
        .await;

        match waited {
            Ok(Ok(state)) if *state == ResourceState::Running => AttemptOutcome::Recovered,
            Ok(_) => AttemptOutcome::Superseded,
            Err(_) => AttemptOutcome::Failed(format!(
                "no heartbeat within {}s of tier {} attempt",
                self.config.tier_timeout_secs, in_flight.tier
            )),
        }
    }

    /// Record a failed attempt: `recovering -> stuck`, or
    /// `-> awaiting_intervention` once the last automated tier failed.
    ///
    /// Discarded if the resource already left `recovering`.
    fn fail_attempt(&self, id: &str, tier: u32, error: String) -> SupervisorResult<()> {
        let exhausted = tier >= self.config.max_automated_tier;
        let to = if exhausted {
            ResourceState::AwaitingIntervention
        } else {
            ResourceState::Stuck
        };

        let moved = self
            .registry
            .transition_if(id, ResourceState::Recovering, to, Some(error.clone()))?;
        if moved.is_none() {
            debug!("Discarding failed tier {} result for {}", tier, id);
            return Ok(());
        }

        warn!(resource_id = %id, tier, %error, "Recovery attempt failed");
        self.notifier.emit(EventKind::RecoveryAttemptFailed {
            resource_id: id.to_string(),
            tier,
            error,
        });

        if exhausted {
            self.hand_off(id)?;
        }
        Ok(())
    }

    /// Open an intervention request for a resource in `awaiting_intervention`.
    fn hand_off(&self, id: &str) -> SupervisorResult<()> {
        let Some(handle) = self.registry.get(id) else {
            return Ok(());
        };
        if handle.state != ResourceState::AwaitingIntervention {
            return Ok(());
        }

        let kill_supported = capability::upgrade(&self.registry.capability(id)?)
            .is_some_and(|c| c.supports(RecoveryAction::Kill));
        self.broker
            .on_tier_exhausted(&handle, FailureContext::from_handle(&handle), kill_supported);

        // The resource may have finished between the read and the enqueue.
        if self
            .registry
            .get(id)
            .is_none_or(|h| h.state != ResourceState::AwaitingIntervention)
        {
            self.broker.supersede(id);
        }
        Ok(())
    }

    /// Apply an externally requested transition.
    ///
    /// Leaving `awaiting_intervention` supersedes the open request; entering
    /// it opens one.
    pub fn transition(
        &self,
        id: &str,
        to: ResourceState,
        error: Option<String>,
    ) -> SupervisorResult<ResourceHandle> {
        let handle = self.registry.transition(id, to, error)?;
        if handle.state == ResourceState::AwaitingIntervention {
            self.hand_off(id)?;
        } else {
            self.broker.supersede(id);
        }
        Ok(handle)
    }

    /// Dispatch an operator decision. Exactly once per request.
    ///
    /// Checked in order: request open, option offered, resource not held by
    /// another recovery path. `change_config` and `kill` fail closed: on a
    /// capability error the request is reinstated. A failed `retry` counts as
    /// a failed attempt and opens a fresh request.
    pub async fn resolve(
        self: &Arc<Self>,
        request_id: Uuid,
        option_id: &str,
        params: Option<serde_json::Value>,
    ) -> SupervisorResult<Resolution> {
        let request = self.broker.pending(request_id)?;
        let kind = request
            .option(option_id)
            .and_then(|o| o.id.parse::<InterventionOptionKind>().ok())
            .ok_or_else(|| SupervisorError::UnknownOption {
                request_id: request_id.to_string(),
                option_id: option_id.to_string(),
            })?;
        if kind == InterventionOptionKind::ChangeConfig && params.is_none() {
            return Err(SupervisorError::Validation(
                "change_config requires parameters".to_string(),
            ));
        }

        let id = request.resource_id.clone();
        let guard = self.try_acquire(&id)?;
        let request = self.broker.take(request_id)?;
        let capability = self.registry.capability(&id)?;

        let state = match kind {
            InterventionOptionKind::Retry => {
                let attempt = self
                    .begin_attempt(
                        &id,
                        ResourceState::AwaitingIntervention,
                        &capability,
                        &[RecoveryAction::Retry],
                        None,
                    )
                    .await;
                match attempt {
                    Ok(Some(in_flight)) => {
                        self.spawn_drive(&id, guard, None, Some(in_flight));
                        ResourceState::Recovering
                    }
                    Ok(None) => self.current_state(&id)?,
                    Err(e) => {
                        // The decision was consumed; the failure opened a new request.
                        self.emit_resolved(request_id, &id, option_id);
                        return Err(e);
                    }
                }
            }
            InterventionOptionKind::ChangeConfig => {
                let deadline = self.tier_deadline();
                let reconfigured = async {
                    self.call(&capability, RecoveryAction::Reconfigure, params.as_ref(), deadline)
                        .await?;
                    self.call(&capability, RecoveryAction::Retry, None, deadline).await
                }
                .await;
                if let Err(e) = reconfigured {
                    self.broker.reinstate(request);
                    return Err(e);
                }
                self.finish_operator(&id, ResourceState::Running, None)?
            }
            InterventionOptionKind::Kill => {
                let deadline = self.tier_deadline();
                if let Err(e) = self.call(&capability, RecoveryAction::Kill, None, deadline).await {
                    self.broker.reinstate(request);
                    return Err(e);
                }
                self.finish_operator(&id, ResourceState::Failed, Some("killed by operator"))?
            }
            InterventionOptionKind::Abort => {
                self.finish_operator(&id, ResourceState::Failed, Some("aborted by operator"))?
            }
        };

        info!(resource_id = %id, %request_id, option_id, %state, "Intervention resolved");
        self.emit_resolved(request_id, &id, option_id);
        Ok(Resolution {
            request_id,
            resource_id: id,
            option_id: option_id.to_string(),
            state,
        })
    }

    fn emit_resolved(&self, request_id: Uuid, resource_id: &str, option_id: &str) {
        self.notifier.emit(EventKind::InterventionResolved {
            request_id,
            resource_id: resource_id.to_string(),
            option_id: option_id.to_string(),
        });
    }

    /// Leave `awaiting_intervention` for `to`, unless the resource already moved.
    fn finish_operator(
        &self,
        id: &str,
        to: ResourceState,
        error: Option<&str>,
    ) -> SupervisorResult<ResourceState> {
        let moved = self.registry.transition_if(
            id,
            ResourceState::AwaitingIntervention,
            to,
            error.map(str::to_string),
        )?;
        match moved {
            Some(handle) => Ok(handle.state),
            None => self.current_state(id),
        }
    }

    fn current_state(&self, id: &str) -> SupervisorResult<ResourceState> {
        self.registry
            .get(id)
            .map(|h| h.state)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))
    }

    /// Issue a confirmation token for a later `kill`.
    pub fn request_kill(&self, id: &str) -> SupervisorResult<KillConfirmation> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))?;
        if handle.state.is_terminal() {
            return Err(SupervisorError::IllegalTransition {
                id: id.to_string(),
                from: handle.state,
                to: ResourceState::Failed,
            });
        }
        let supported = capability::upgrade(&self.registry.capability(id)?)
            .is_some_and(|c| c.supports(RecoveryAction::Kill));
        if !supported {
            return Err(SupervisorError::CapabilityInvocation {
                action: RecoveryAction::Kill,
                message: capability::CapabilityError::Unsupported(RecoveryAction::Kill).to_string(),
            });
        }
        Ok(self.confirmations.issue(id))
    }

    /// Run an operator action on one resource.
    ///
    /// Rejected with `RecoveryInProgress` while any other recovery path holds
    /// the resource. A kill token is only consumed once the lock is held.
    pub async fn manual_action(
        self: &Arc<Self>,
        id: &str,
        action: ManualAction,
    ) -> SupervisorResult<ResourceHandle> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))?;
        if handle.state.is_terminal() {
            let to = match action {
                ManualAction::Retry => ResourceState::Recovering,
                _ => ResourceState::Failed,
            };
            return Err(SupervisorError::IllegalTransition {
                id: id.to_string(),
                from: handle.state,
                to,
            });
        }

        let guard = self.try_acquire(id)?;
        let capability = self.registry.capability(id)?;
        info!(resource_id = %id, ?action, "Manual action");

        match action {
            ManualAction::Retry => self.manual_retry(id, handle.state, &capability, guard).await,
            ManualAction::Stop => {
                self.call(&capability, RecoveryAction::Stop, None, self.tier_deadline())
                    .await?;
                self.terminate(id, "stopped by operator")
            }
            ManualAction::Kill { confirmation } => {
                self.confirmations.consume(id, confirmation)?;
                self.call(&capability, RecoveryAction::Kill, None, self.tier_deadline())
                    .await?;
                self.terminate(id, "killed by operator")
            }
        }
    }

    async fn manual_retry(
        self: &Arc<Self>,
        id: &str,
        from: ResourceState,
        capability: &Option<Weak<dyn RecoveryCapability>>,
        guard: OwnedMutexGuard<()>,
    ) -> SupervisorResult<ResourceHandle> {
        if !matches!(
            from,
            ResourceState::Stuck | ResourceState::AwaitingIntervention
        ) {
            self.call(capability, RecoveryAction::Retry, None, self.tier_deadline())
                .await?;
            return self
                .registry
                .get(id)
                .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()));
        }

        self.broker.supersede(id);
        match self
            .begin_attempt(id, from, capability, &[RecoveryAction::Retry], None)
            .await
        {
            Ok(Some(in_flight)) => {
                self.spawn_drive(id, guard, None, Some(in_flight));
            }
            Ok(None) => {}
            Err(e) => {
                // A failed retry from `stuck` continues the automated tiers.
                self.spawn_drive(id, guard, None, None);
                return Err(e);
            }
        }
        self.registry
            .get(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))
    }

    fn terminate(&self, id: &str, reason: &str) -> SupervisorResult<ResourceHandle> {
        match self.transition(id, ResourceState::Failed, Some(reason.to_string())) {
            // Finished on its own while the capability ran.
            Err(SupervisorError::IllegalTransition { from, .. }) if from.is_terminal() => self
                .registry
                .get(id)
                .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string())),
            result => result,
        }
    }

    /// Cancel background escalations and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.permits.close();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Escalation engine stopped");
    }

    /// Background escalations still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }
}
