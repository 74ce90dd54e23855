//! Supervisor facade.
//!
//! Wires the registry, health monitor, escalation engine, intervention broker
//! and stats into one handle, and dispatches the command/query boundary.

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capability::RecoveryCapability;
use crate::command::{Command, Query, Response};
use crate::config::SupervisorConfig;
use crate::confirmation::KillConfirmation;
use crate::error::{SupervisorError, SupervisorResult};
use crate::escalation::{EscalationEngine, ManualAction, Resolution};
use crate::events::{BroadcastSink, EventNotifier, EventSink, SupervisorEvent};
use crate::health::{HealthMonitor, TickReport};
use crate::intervention::{FailureContext, InterventionBroker, InterventionRequest};
use crate::registry::ResourceRegistry;
use crate::resource::{ResourceHandle, ResourceSpec, ResourceState};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::store::{FileSupervisorStore, PersistenceSink, SupervisorStore};

/// What `restore` loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub resources: usize,
    pub requests: usize,
}

/// Resource lifecycle supervisor.
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    notifier: Arc<EventNotifier>,
    events: Arc<BroadcastSink>,
    registry: Arc<ResourceRegistry>,
    broker: Arc<InterventionBroker>,
    engine: Arc<EscalationEngine>,
    monitor: Arc<HealthMonitor>,
    stats: StatsAggregator,
    persistence: Mutex<Option<(Arc<PersistenceSink>, JoinHandle<()>)>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    /// Create an in-memory supervisor. The monitor loop is not started.
    pub fn new(config: SupervisorConfig) -> SupervisorResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let notifier = Arc::new(EventNotifier::new());
        let events = Arc::new(BroadcastSink::new(config.event_buffer));
        notifier.add_sink(events.clone());

        let registry = Arc::new(ResourceRegistry::new(config.clone(), notifier.clone()));
        let broker = Arc::new(InterventionBroker::new(notifier.clone()));
        let engine = Arc::new(EscalationEngine::new(
            config.clone(),
            registry.clone(),
            broker.clone(),
            notifier.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            config.clone(),
            registry.clone(),
            engine.clone(),
        ));
        let stats = StatsAggregator::new(registry.clone(), broker.clone());
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            notifier,
            events,
            registry,
            broker,
            engine,
            monitor,
            stats,
            persistence: Mutex::new(None),
            monitor_task: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// Create a supervisor, restoring from and persisting to `store_dir` when
    /// one is configured.
    pub async fn open(config: SupervisorConfig) -> SupervisorResult<Self> {
        let store_dir = config.store_dir.clone();
        let supervisor = Self::new(config)?;

        if let Some(dir) = store_dir {
            let store: Arc<dyn SupervisorStore> = Arc::new(FileSupervisorStore::new(&dir).await?);
            let report = supervisor.restore(store.as_ref()).await?;
            info!(
                "Restored {} resources and {} intervention requests from {:?}",
                report.resources, report.requests, dir
            );
            supervisor.attach_store(store);
        }
        Ok(supervisor)
    }

    /// Persist every subsequent event to `store`.
    pub fn attach_store(&self, store: Arc<dyn SupervisorStore>) {
        let mut persistence = self.persistence.lock();
        if persistence.is_some() {
            warn!("Store already attached");
            return;
        }
        let (sink, writer) = PersistenceSink::spawn(store);
        let sink = Arc::new(sink);
        self.notifier.add_sink(sink.clone());
        *persistence = Some((sink, writer));
    }

    /// Reload persisted state.
    ///
    /// Resources come back detached until re-registered. Requests are
    /// re-enqueued only for resources still awaiting intervention; one that
    /// lost its request is given a fresh one.
    pub async fn restore(&self, store: &dyn SupervisorStore) -> SupervisorResult<RestoreReport> {
        let mut report = RestoreReport::default();

        for handle in store.load_resources().await? {
            let id = handle.id.clone();
            match self.registry.restore(handle) {
                Ok(_) => report.resources += 1,
                Err(e) => warn!(resource_id = %id, error = %e, "Skipping persisted resource"),
            }
        }

        let awaiting: Vec<ResourceHandle> = self
            .registry
            .list(None)
            .into_iter()
            .filter(|h| h.state == ResourceState::AwaitingIntervention)
            .collect();
        let requests: Vec<InterventionRequest> = store
            .load_requests()
            .await?
            .into_iter()
            .filter(|r| awaiting.iter().any(|h| h.id == r.resource_id))
            .collect();
        report.requests = self.broker.restore(requests);

        for handle in &awaiting {
            // Kill support is unknown until the capability is rebound.
            if self
                .broker
                .on_tier_exhausted(handle, FailureContext::from_handle(handle), false)
                .is_some()
            {
                report.requests += 1;
            }
        }

        Ok(report)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Add an event sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.notifier.add_sink(sink);
    }

    /// Subscribe to the event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Register a resource with its recovery callbacks.
    ///
    /// The supervisor keeps a weak reference; the caller owns `capability`.
    pub fn register(
        &self,
        spec: ResourceSpec,
        capability: &Arc<dyn RecoveryCapability>,
    ) -> SupervisorResult<ResourceHandle> {
        self.registry.register(spec, capability)
    }

    /// Record a heartbeat.
    pub fn heartbeat(&self, id: &str, progress: Option<f64>) -> SupervisorResult<ResourceHandle> {
        self.registry.heartbeat(id, progress)
    }

    /// Apply a resource-reported transition.
    ///
    /// Only `running`, `completed` and `failed` may be requested; the other
    /// states are entered by the supervisor itself.
    pub fn transition(
        &self,
        id: &str,
        to: ResourceState,
        error: Option<String>,
    ) -> SupervisorResult<ResourceHandle> {
        if !matches!(
            to,
            ResourceState::Running | ResourceState::Completed | ResourceState::Failed
        ) {
            return Err(SupervisorError::Validation(format!(
                "{} is entered by the supervisor, not requested",
                to
            )));
        }
        self.engine.transition(id, to, error)
    }

    /// Run an operator action on one resource.
    pub async fn manual_action(
        &self,
        id: &str,
        action: ManualAction,
    ) -> SupervisorResult<ResourceHandle> {
        self.engine.manual_action(id, action).await
    }

    /// Issue a confirmation token for a manual kill.
    pub fn request_kill(&self, id: &str) -> SupervisorResult<KillConfirmation> {
        self.engine.request_kill(id)
    }

    /// Dispatch an operator decision.
    pub async fn resolve_intervention(
        &self,
        request_id: Uuid,
        option_id: &str,
        params: Option<serde_json::Value>,
    ) -> SupervisorResult<Resolution> {
        self.engine.resolve(request_id, option_id, params).await
    }

    /// Defer the open request of a resource.
    pub fn dismiss_intervention(&self, resource_id: &str) -> SupervisorResult<InterventionRequest> {
        self.broker.dismiss(resource_id)
    }

    /// Drop a resource from supervision, superseding its open request.
    pub fn remove(&self, id: &str) -> SupervisorResult<ResourceHandle> {
        let guard = self.engine.hold(id)?;
        let handle = self.registry.remove(id)?;
        self.broker.supersede(id);
        drop(guard);
        self.engine.forget(id);
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<ResourceHandle> {
        self.registry.get(id)
    }

    /// Resources in creation order, optionally of one type.
    pub fn list_resources(&self, resource_type: Option<&str>) -> Vec<ResourceHandle> {
        self.registry.list(resource_type)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Open intervention requests, oldest first.
    pub fn intervention_queue(&self) -> Vec<InterventionRequest> {
        self.broker.queue()
    }

    /// Run one health check now.
    pub fn tick(&self) -> TickReport {
        self.monitor.tick()
    }

    /// Dispatch a command. Errors are returned as `Response::Error`.
    pub async fn execute(&self, command: Command) -> Response {
        let result = match command {
            Command::Heartbeat {
                resource_id,
                progress,
            } => self.heartbeat(&resource_id, progress).map(Response::Resource),
            Command::Transition {
                resource_id,
                to,
                error,
            } => self.transition(&resource_id, to, error).map(Response::Resource),
            Command::ManualAction {
                resource_id,
                action,
            } => self
                .manual_action(&resource_id, action)
                .await
                .map(Response::Resource),
            Command::RequestKill { resource_id } => self
                .request_kill(&resource_id)
                .map(Response::KillConfirmation),
            Command::ResolveIntervention {
                request_id,
                option_id,
                params,
            } => self
                .resolve_intervention(request_id, &option_id, params)
                .await
                .map(Response::Resolution),
            Command::DismissIntervention { resource_id } => self
                .dismiss_intervention(&resource_id)
                .map(Response::Intervention),
            Command::Remove { resource_id } => self.remove(&resource_id).map(|_| Response::Ok),
        };

        result.unwrap_or_else(|e| {
            debug!("Command rejected: {}", e);
            e.into()
        })
    }

    /// Answer a query.
    pub fn query(&self, query: Query) -> Response {
        match query {
            Query::ListResources { resource_type } => {
                Response::Resources(self.list_resources(resource_type.as_deref()))
            }
            Query::GetResource { resource_id } => match self.get(&resource_id) {
                Some(handle) => Response::Resource(handle),
                None => SupervisorError::ResourceNotFound(resource_id).into(),
            },
            Query::GetStats => Response::Stats(self.stats()),
            Query::GetInterventionQueue => Response::Interventions(self.intervention_queue()),
        }
    }

    /// Start the health monitor loop. Calling it twice has no effect.
    pub fn start(&self) {
        let mut task = self.monitor_task.lock();
        if task.is_some() {
            return;
        }
        let monitor = self.monitor.clone();
        *task = Some(tokio::spawn(monitor.start_loop(self.shutdown_tx.subscribe())));
        info!("Supervisor started");
    }

    /// Stop the monitor loop and background escalations, then flush the store.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.monitor_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Health monitor task failed: {}", e);
            }
        }

        self.engine.shutdown().await;

        let sink = self.persistence.lock().as_ref().map(|(sink, _)| sink.clone());
        if let Some(sink) = sink {
            if let Err(e) = sink.flush().await {
                error!("Failed to flush store: {}", e);
            }
        }
        info!("Supervisor stopped");
    }
}
