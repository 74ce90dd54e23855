//! End-to-end supervision scenarios against the public `Supervisor` API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autohands_supervisor::{
    CapabilityError, EventKind, RecoveryAction, RecoveryCapability, ResourceHandle, ResourceSpec,
    ResourceState, Supervisor, SupervisorConfig, SupervisorError,
};

/// Records every call; fails the first `failing_retries` retries.
#[derive(Default)]
struct Session {
    calls: Mutex<Vec<RecoveryAction>>,
    failing_retries: AtomicUsize,
}

impl Session {
    fn failing_retries(n: usize) -> Arc<Self> {
        Arc::new(Self {
            failing_retries: AtomicUsize::new(n),
            ..Default::default()
        })
    }

    fn calls(&self) -> Vec<RecoveryAction> {
        self.calls.lock().unwrap().clone()
    }

    fn retries(&self) -> usize {
        self.calls()
            .iter()
            .filter(|a| **a == RecoveryAction::Retry)
            .count()
    }
}

#[async_trait]
impl RecoveryCapability for Session {
    async fn retry(&self) -> Result<(), CapabilityError> {
        self.calls.lock().unwrap().push(RecoveryAction::Retry);
        let failing = self
            .failing_retries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CapabilityError::Failed("session did not resume".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), CapabilityError> {
        self.calls.lock().unwrap().push(RecoveryAction::Stop);
        Ok(())
    }

    async fn kill(&self) -> Result<(), CapabilityError> {
        self.calls.lock().unwrap().push(RecoveryAction::Kill);
        Ok(())
    }
}

fn start(session: &Arc<Session>) -> Supervisor {
    let supervisor = Supervisor::new(SupervisorConfig::default()).unwrap();
    let capability: Arc<dyn RecoveryCapability> = session.clone();
    let handle = supervisor
        .register(
            ResourceSpec::new("r1", "agent_session").with_staleness(Duration::from_secs(60)),
            &capability,
        )
        .unwrap();
    assert_eq!(handle.state, ResourceState::Idle);
    assert_eq!(handle.escalation_tier, 0);
    supervisor.heartbeat("r1", None).unwrap();
    supervisor
}

async fn wait_until(supervisor: &Supervisor, check: impl Fn(&ResourceHandle) -> bool) -> ResourceHandle {
    for _ in 0..1000 {
        if let Some(handle) = supervisor.get("r1") {
            if check(&handle) {
                return handle;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {:?}", supervisor.get("r1"));
}

/// Let 61s pass without a heartbeat, then run a monitor tick.
async fn go_silent(supervisor: &Supervisor) {
    tokio::time::advance(Duration::from_secs(61)).await;
    let report = supervisor.tick();
    assert_eq!(report.newly_stuck, vec!["r1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn scenario_a_silent_resource_is_retried_once() {
    let session = Session::failing_retries(0);
    let supervisor = start(&session);

    go_silent(&supervisor).await;
    let handle = supervisor.get("r1").unwrap();
    assert_eq!(handle.state, ResourceState::Stuck);
    assert_eq!(handle.escalation_tier, 1);

    let handle = wait_until(&supervisor, |h| h.state == ResourceState::Recovering).await;
    assert_eq!(handle.escalation_tier, 1);
    assert_eq!(session.calls(), vec![RecoveryAction::Retry]);

    // The resource resumes.
    let handle = supervisor.heartbeat("r1", Some(0.4)).unwrap();
    assert_eq!(handle.state, ResourceState::Running);
    assert_eq!(handle.escalation_tier, 0);
    assert_eq!(session.retries(), 1);
    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_b_exhausted_tiers_request_intervention() {
    let session = Session::failing_retries(usize::MAX);
    let supervisor = start(&session);
    let mut events = supervisor.subscribe();

    go_silent(&supervisor).await;
    wait_until(&supervisor, |h| h.state == ResourceState::AwaitingIntervention).await;

    assert_eq!(
        session.calls(),
        vec![RecoveryAction::Retry, RecoveryAction::Stop, RecoveryAction::Retry]
    );

    let queue = supervisor.intervention_queue();
    assert_eq!(queue.len(), 1);
    let request = &queue[0];
    assert_eq!(request.resource_id, "r1");
    assert_eq!(request.attempted_tiers, vec![1, 2]);
    let option_ids: Vec<_> = request.options.iter().map(|o| o.id.as_str()).collect();
    assert!(option_ids.contains(&"retry"));
    assert!(option_ids.contains(&"abort"));
    assert!(request.options.iter().any(|o| !o.destructive));
    assert_eq!(request.failure_context.recovery_attempts, 2);

    let mut failed_tiers = Vec::new();
    let mut requested = 0;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            EventKind::RecoveryAttemptFailed { tier, .. } => failed_tiers.push(tier),
            EventKind::InterventionRequested { .. } => requested += 1,
            _ => {}
        }
    }
    assert_eq!(failed_tiers, vec![1, 2]);
    assert_eq!(requested, 1);
    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_c_abort_resolves_exactly_once() {
    let session = Session::failing_retries(usize::MAX);
    let supervisor = start(&session);
    go_silent(&supervisor).await;
    wait_until(&supervisor, |h| h.state == ResourceState::AwaitingIntervention).await;
    let request_id = supervisor.intervention_queue()[0].id;

    let resolution = supervisor
        .resolve_intervention(request_id, "abort", None)
        .await
        .unwrap();
    assert_eq!(resolution.state, ResourceState::Failed);
    assert!(supervisor.intervention_queue().is_empty());

    let handle = supervisor.get("r1").unwrap();
    assert_eq!(handle.state, ResourceState::Failed);
    assert_eq!(handle.last_error.as_deref(), Some("aborted by operator"));

    let again = supervisor.resolve_intervention(request_id, "abort", None).await;
    assert!(matches!(again, Err(SupervisorError::RequestNotFound(_))));
    assert_eq!(supervisor.get("r1").unwrap(), handle);
    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_d_terminal_state_wins_over_late_recovery() {
    // Tier 1 fails; tier 2 runs and waits for a heartbeat.
    let session = Session::failing_retries(1);
    let supervisor = start(&session);
    go_silent(&supervisor).await;
    wait_until(&supervisor, |h| {
        h.state == ResourceState::Recovering && h.escalation_tier == 2
    })
    .await;
    assert_eq!(
        session.calls(),
        vec![RecoveryAction::Retry, RecoveryAction::Stop, RecoveryAction::Retry]
    );

    let handle = supervisor
        .transition("r1", ResourceState::Completed, None)
        .unwrap();
    assert_eq!(handle.state, ResourceState::Completed);

    // Well past the tier deadline.
    tokio::time::sleep(Duration::from_secs(45)).await;

    let handle = supervisor.get("r1").unwrap();
    assert_eq!(handle.state, ResourceState::Completed);
    assert_eq!(handle.escalation_tier, 0);
    assert!(supervisor.intervention_queue().is_empty());
    assert_eq!(session.calls().len(), 3);
    assert_eq!(supervisor.stats().completed, 1);
    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn manual_action_is_rejected_while_recovery_runs() {
    let session = Session::failing_retries(0);
    let supervisor = start(&session);
    go_silent(&supervisor).await;
    wait_until(&supervisor, |h| h.state == ResourceState::Recovering).await;

    let result = supervisor
        .manual_action("r1", autohands_supervisor::ManualAction::Stop)
        .await;
    assert!(matches!(result, Err(SupervisorError::RecoveryInProgress(_))));
    assert_eq!(supervisor.get("r1").unwrap().state, ResourceState::Recovering);
    supervisor.shutdown().await;
}
