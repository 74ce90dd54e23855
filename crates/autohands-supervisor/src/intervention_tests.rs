use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;

use crate::events::{FnSink, SupervisorEvent};
use crate::resource::ResourceState;

fn exhausted(id: &str) -> ResourceHandle {
    let mut handle = ResourceHandle::new(id, "agent_session");
    for to in [
        ResourceState::Running,
        ResourceState::Stuck,
        ResourceState::Recovering,
        ResourceState::Stuck,
        ResourceState::Recovering,
        ResourceState::AwaitingIntervention,
    ] {
        handle.apply_transition(to, Some("no heartbeat".into())).unwrap();
    }
    handle
}

fn broker() -> InterventionBroker {
    InterventionBroker::new(Arc::new(EventNotifier::silent()))
}

fn open(broker: &InterventionBroker, id: &str) -> InterventionRequest {
    let handle = exhausted(id);
    broker
        .on_tier_exhausted(&handle, FailureContext::from_handle(&handle), true)
        .unwrap()
}

#[test]
fn test_options_always_have_safe_path() {
    for kill_supported in [true, false] {
        let options = default_options(kill_supported);
        assert!(options.iter().any(|o| !o.destructive));
        assert_eq!(options.first().map(|o| o.id.as_str()), Some("retry"));
        assert_eq!(options.iter().any(|o| o.id == "kill"), kill_supported);
        assert!(options.iter().any(|o| o.id == "abort" && o.destructive));
    }
}

#[test]
fn test_option_kind_parse() {
    assert_eq!(
        "change_config".parse::<InterventionOptionKind>(),
        Ok(InterventionOptionKind::ChangeConfig)
    );
    assert!("reboot".parse::<InterventionOptionKind>().is_err());
}

#[test]
fn test_request_carries_failure_context() {
    let broker = broker();
    let request = open(&broker, "r1");
    assert_eq!(request.attempted_tiers, vec![1, 2]);
    assert_eq!(request.failure_context.error, "no heartbeat");
    assert_eq!(request.failure_context.recovery_attempts, 2);
    assert_eq!(request.resource_type, "agent_session");
}

#[test]
fn test_one_request_per_resource() {
    let broker = broker();
    open(&broker, "r1");
    let handle = exhausted("r1");
    assert!(broker
        .on_tier_exhausted(&handle, FailureContext::from_handle(&handle), true)
        .is_none());
    assert_eq!(broker.len(), 1);
}

#[test]
fn test_one_request_per_resource_under_contention() {
    let notifier = Arc::new(EventNotifier::silent());
    let requested = Arc::new(AtomicUsize::new(0));
    let counter = requested.clone();
    notifier.add_sink(Arc::new(FnSink::new("requested", move |e: &SupervisorEvent| {
        if matches!(e.kind, EventKind::InterventionRequested { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    })));
    let broker = InterventionBroker::new(notifier);
    let handle = exhausted("r1");
    let barrier = Barrier::new(16);

    let opened: usize = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..16)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    broker
                        .on_tier_exhausted(&handle, FailureContext::from_handle(&handle), true)
                        .is_some() as usize
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });

    assert_eq!(opened, 1);
    assert_eq!(broker.queue().len(), 1);
    assert_eq!(requested.load(Ordering::SeqCst), 1);
}

#[test]
fn test_queue_is_fifo() {
    let broker = broker();
    for id in ["r1", "r2", "r3"] {
        open(&broker, id);
    }
    let ids: Vec<_> = broker.queue().into_iter().map(|r| r.resource_id).collect();
    assert_eq!(ids, vec!["r1", "r2", "r3"]);
}

#[test]
fn test_take_is_exactly_once() {
    let broker = broker();
    let request = open(&broker, "r1");
    assert!(broker.take(request.id).is_ok());
    assert!(matches!(
        broker.take(request.id),
        Err(SupervisorError::RequestNotFound(_))
    ));
    assert!(broker.is_empty());
}

#[test]
fn test_reinstate_keeps_creation_order() {
    let broker = broker();
    let first = open(&broker, "r1");
    open(&broker, "r2");

    let taken = broker.take(first.id).unwrap();
    broker.reinstate(taken);
    assert_eq!(broker.queue()[0].id, first.id);
}

#[test]
fn test_dismiss_keeps_request_open() {
    let broker = broker();
    let request = open(&broker, "r1");

    let dismissed = broker.dismiss("r1").unwrap();
    assert_eq!(dismissed.id, request.id);
    assert_eq!(dismissed.dismiss_count, 1);
    assert!(dismissed.last_dismissed_at.is_some());
    assert_eq!(broker.pending(request.id).unwrap().dismiss_count, 1);

    assert!(matches!(
        broker.dismiss("missing"),
        Err(SupervisorError::RequestNotFound(_))
    ));
}

#[test]
fn test_supersede_removes_request() {
    let notifier = Arc::new(EventNotifier::silent());
    let broker = InterventionBroker::new(notifier.clone());
    let request = open(&broker, "r1");

    let superseded = broker.supersede("r1").unwrap();
    assert_eq!(superseded.id, request.id);
    assert!(broker.open_for("r1").is_none());
    assert!(broker.supersede("r1").is_none());
    // requested + superseded
    assert_eq!(notifier.published(), 2);
}

#[test]
fn test_restore_skips_duplicates() {
    let source = broker();
    let a = open(&source, "r1");
    let b = open(&source, "r2");
    let mut dup = a.clone();
    dup.id = Uuid::new_v4();

    let broker = broker();
    let restored = broker.restore(vec![b.clone(), a.clone(), dup]);
    assert_eq!(restored, 2);
    let ids: Vec<_> = broker.queue().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
}
