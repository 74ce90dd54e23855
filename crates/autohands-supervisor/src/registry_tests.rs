use super::*;
use crate::events::{FnSink, SupervisorEvent};
use crate::testing::{self, ScriptedCapability};

use parking_lot::Mutex;

fn capability() -> Arc<dyn RecoveryCapability> {
    ScriptedCapability::new()
}

fn config() -> SupervisorConfig {
    SupervisorConfig::default().with_staleness("agent_session", 60)
}

#[tokio::test]
async fn test_register_starts_idle() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    let handle = registry
        .register(ResourceSpec::new("r1", "agent_session"), &cap)
        .unwrap();
    assert_eq!(handle.state, ResourceState::Idle);
    assert_eq!(handle.escalation_tier, 0);
    assert!(registry.contains("r1"));
}

#[tokio::test]
async fn test_register_duplicate_fails() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    let err = registry
        .register(ResourceSpec::new("r1", "job"), &cap)
        .unwrap_err();
    assert!(matches!(err, SupervisorError::DuplicateResource(_)));
}

#[tokio::test]
async fn test_register_invalid_spec() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    assert!(matches!(
        registry.register(ResourceSpec::new("", "job"), &cap),
        Err(SupervisorError::Validation(_))
    ));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_heartbeat_moves_idle_to_running() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();

    let handle = registry.heartbeat("r1", Some(0.25)).unwrap();
    assert_eq!(handle.state, ResourceState::Running);
    assert_eq!(handle.progress, Some(0.25));
}

#[tokio::test]
async fn test_heartbeat_rejects_bad_progress() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();

    assert!(registry.heartbeat("r1", Some(2.0)).is_err());
    assert_eq!(registry.get("r1").unwrap().state, ResourceState::Idle);
    assert!(matches!(
        registry.heartbeat("missing", None),
        Err(SupervisorError::ResourceNotFound(_))
    ));
}

#[tokio::test]
async fn test_heartbeat_ignored_when_terminal() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    registry.transition("r1", ResourceState::Completed, None).unwrap();

    let handle = registry.heartbeat("r1", Some(0.5)).unwrap();
    assert_eq!(handle.state, ResourceState::Completed);
    assert_eq!(handle.progress, None);
}

#[tokio::test]
async fn test_transition_enforces_table() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();

    let err = registry
        .transition("r1", ResourceState::Recovering, None)
        .unwrap_err();
    assert!(matches!(err, SupervisorError::IllegalTransition { .. }));
    assert_eq!(registry.get("r1").unwrap().state, ResourceState::Idle);
}

#[tokio::test]
async fn test_transition_if_discards_stale_view() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    registry.heartbeat("r1", None).unwrap();

    let moved = registry
        .transition_if("r1", ResourceState::Stuck, ResourceState::Recovering, None)
        .unwrap();
    assert!(moved.is_none());
    assert_eq!(registry.get("r1").unwrap().state, ResourceState::Running);
}

#[tokio::test]
async fn test_same_state_emits_nothing() {
    let (registry, notifier) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    registry.heartbeat("r1", None).unwrap();
    let before = notifier.published();

    registry.transition("r1", ResourceState::Running, None).unwrap();
    assert_eq!(notifier.published(), before);
}

#[tokio::test(start_paused = true)]
async fn test_mark_stuck_after_staleness() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry
        .register(ResourceSpec::new("r1", "agent_session"), &cap)
        .unwrap();
    registry.heartbeat("r1", None).unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(registry.mark_stuck_if_stale("r1", Instant::now()).unwrap().is_none());

    tokio::time::advance(Duration::from_secs(1)).await;
    let stale = registry
        .mark_stuck_if_stale("r1", Instant::now())
        .unwrap()
        .unwrap();
    assert_eq!(stale.stale_for, Duration::from_secs(61));
    assert_eq!(stale.handle.state, ResourceState::Stuck);
    assert_eq!(stale.handle.escalation_tier, 1);
}

#[tokio::test(start_paused = true)]
async fn test_spec_staleness_overrides_type() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry
        .register(
            ResourceSpec::new("r1", "agent_session").with_staleness(Duration::from_secs(5)),
            &cap,
        )
        .unwrap();
    registry.heartbeat("r1", None).unwrap();

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(registry.mark_stuck_if_stale("r1", Instant::now()).unwrap().is_some());
}

#[tokio::test]
async fn test_escalate_tier_requires_stuck() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    assert!(registry.escalate_tier("r1").is_err());

    registry.heartbeat("r1", None).unwrap();
    registry.transition("r1", ResourceState::Stuck, None).unwrap();
    assert_eq!(registry.escalate_tier("r1").unwrap().escalation_tier, 2);
}

#[tokio::test]
async fn test_escalate_tier_emits_tier_skipped() {
    let (registry, notifier) = testing::registry(config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    notifier.add_sink(Arc::new(FnSink::new("tiers", move |e: &SupervisorEvent| {
        if let EventKind::TierSkipped { resource, skipped } = &e.kind {
            sink_seen.lock().push((*skipped, resource.escalation_tier));
        }
        Ok(())
    })));

    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    registry.heartbeat("r1", None).unwrap();
    registry.transition("r1", ResourceState::Stuck, None).unwrap();
    registry.escalate_tier("r1").unwrap();

    assert_eq!(*seen.lock(), vec![(1, 2)]);
}

#[tokio::test]
async fn test_list_orders_by_registration_and_filters() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    for (id, kind) in [("c", "job"), ("a", "agent_session"), ("b", "job")] {
        registry.register(ResourceSpec::new(id, kind), &cap).unwrap();
    }

    let all: Vec<_> = registry.list(None).into_iter().map(|h| h.id).collect();
    assert_eq!(all, vec!["c", "a", "b"]);

    let jobs: Vec<_> = registry.list(Some("job")).into_iter().map(|h| h.id).collect();
    assert_eq!(jobs, vec!["c", "b"]);
}

#[tokio::test]
async fn test_state_watch_follows_transitions() {
    let (registry, _) = testing::registry(config());
    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    let mut rx = registry.subscribe_state("r1").unwrap();

    registry.heartbeat("r1", None).unwrap();
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), ResourceState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_purge_expired_terminal() {
    let (registry, _) = testing::registry(SupervisorConfig {
        terminal_retention_secs: 10,
        ..config()
    });
    let cap = capability();
    registry.register(ResourceSpec::new("done", "job"), &cap).unwrap();
    registry.register(ResourceSpec::new("live", "job"), &cap).unwrap();
    registry.transition("done", ResourceState::Failed, None).unwrap();

    assert!(registry.purge_expired(Instant::now()).is_empty());
    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(registry.purge_expired(Instant::now()), vec!["done".to_string()]);
    assert!(registry.get("done").is_none());
    assert!(registry.get("live").is_some());
}

#[tokio::test]
async fn test_remove_emits_event() {
    let (registry, notifier) = testing::registry(config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    notifier.add_sink(Arc::new(FnSink::new("names", move |e: &SupervisorEvent| {
        sink_seen.lock().push(e.kind.name());
        Ok(())
    })));

    let cap = capability();
    registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    registry.remove("r1").unwrap();
    assert!(registry.remove("r1").is_err());
    assert_eq!(*seen.lock(), vec!["resource_created", "resource_removed"]);
}

#[tokio::test]
async fn test_restore_then_rebind() {
    let (registry, _) = testing::registry(config());
    let mut handle = ResourceHandle::new("r1", "job");
    for to in [
        ResourceState::Running,
        ResourceState::Stuck,
        ResourceState::Recovering,
    ] {
        handle.apply_transition(to, None).unwrap();
    }

    let restored = registry.restore(handle).unwrap();
    assert_eq!(restored.state, ResourceState::Stuck);
    assert_eq!(restored.escalation_tier, 2);
    assert!(registry.capability("r1").unwrap().is_none());

    let cap = capability();
    let rebound = registry.register(ResourceSpec::new("r1", "job"), &cap).unwrap();
    assert_eq!(rebound.state, ResourceState::Stuck);
    assert!(registry.capability("r1").unwrap().is_some());

    assert!(matches!(
        registry.register(ResourceSpec::new("r1", "job"), &cap),
        Err(SupervisorError::DuplicateResource(_))
    ));
}
