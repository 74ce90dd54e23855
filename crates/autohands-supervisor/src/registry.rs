//! Resource registry.
//!
//! Canonical store of resource state. Every mutation of one id happens under
//! that id's map entry lock, and the matching event is emitted before the lock
//! is released, so per-resource events are totally ordered.

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::capability::RecoveryCapability;
use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::events::{EventKind, EventNotifier};
use crate::resource::{validate_progress, ResourceHandle, ResourceSpec, ResourceState};

struct ResourceEntry {
    handle: ResourceHandle,
    /// `None` for entries restored from a store and not yet re-registered.
    capability: Option<Weak<dyn RecoveryCapability>>,
    staleness: Duration,
    last_beat: Instant,
    sequence: u64,
    terminal_since: Option<Instant>,
    state_tx: watch::Sender<ResourceState>,
}

impl ResourceEntry {
    fn new(handle: ResourceHandle, staleness: Duration, sequence: u64) -> Self {
        let (state_tx, _) = watch::channel(handle.state);
        let terminal_since = handle.state.is_terminal().then(Instant::now);
        Self {
            handle,
            capability: None,
            staleness,
            last_beat: Instant::now(),
            sequence,
            terminal_since,
            state_tx,
        }
    }
}

/// A running resource that missed its heartbeat window.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleResource {
    pub handle: ResourceHandle,
    pub stale_for: Duration,
}

/// Canonical, single-writer-per-id resource store.
pub struct ResourceRegistry {
    entries: DashMap<String, ResourceEntry>,
    config: Arc<SupervisorConfig>,
    notifier: Arc<EventNotifier>,
    next_sequence: AtomicU64,
}

impl ResourceRegistry {
    /// Create an empty registry.
    pub fn new(config: Arc<SupervisorConfig>, notifier: Arc<EventNotifier>) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            notifier,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Register a resource in `idle`.
    ///
    /// Re-registering an id restored from a store rebinds its capability
    /// instead of failing.
    pub fn register(
        &self,
        spec: ResourceSpec,
        capability: &Arc<dyn RecoveryCapability>,
    ) -> SupervisorResult<ResourceHandle> {
        spec.validate()?;
        let staleness = spec
            .staleness
            .unwrap_or_else(|| self.config.staleness_for(&spec.resource_type));

        match self.entries.entry(spec.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.capability.is_some() {
                    return Err(SupervisorError::DuplicateResource(spec.id));
                }
                info!(resource_id = %spec.id, state = %entry.handle.state, "Rebinding restored resource");
                entry.capability = Some(Arc::downgrade(capability));
                entry.staleness = staleness;
                entry.last_beat = Instant::now();
                Ok(entry.handle.clone())
            }
            Entry::Vacant(vacant) => {
                let handle = ResourceHandle::new(spec.id.clone(), spec.resource_type);
                let mut entry = ResourceEntry::new(handle, staleness, self.sequence());
                entry.capability = Some(Arc::downgrade(capability));
                let entry = vacant.insert(entry);

                info!(
                    resource_id = %spec.id,
                    resource_type = %entry.handle.resource_type,
                    staleness_secs = staleness.as_secs(),
                    "Resource registered"
                );
                self.notifier.emit(EventKind::ResourceCreated {
                    resource: entry.handle.clone(),
                });
                Ok(entry.handle.clone())
            }
        }
    }

    /// Record a heartbeat. `idle` and `recovering` resources move to `running`.
    ///
    /// Heartbeats on terminal resources are ignored.
    pub fn heartbeat(&self, id: &str, progress: Option<f64>) -> SupervisorResult<ResourceHandle> {
        validate_progress(id, progress)?;
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))?;

        if entry.handle.state.is_terminal() {
            debug!("Ignoring heartbeat for terminal resource {}", id);
            return Ok(entry.handle.clone());
        }

        entry.handle.record_heartbeat(progress);
        entry.last_beat = Instant::now();

        if matches!(
            entry.handle.state,
            ResourceState::Idle | ResourceState::Recovering
        ) {
            self.apply(&mut entry, ResourceState::Running, None)?;
        }
        Ok(entry.handle.clone())
    }

    /// Move a resource to `to`. A no-op when it is already there.
    pub fn transition(
        &self,
        id: &str,
        to: ResourceState,
        error: Option<String>,
    ) -> SupervisorResult<ResourceHandle> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))?;
        self.apply(&mut entry, to, error)?;
        Ok(entry.handle.clone())
    }

    /// Move a resource to `to` only if it is currently in `expected`.
    ///
    /// Returns `None` when the state moved on; the caller's view is stale and
    /// its result must be discarded.
    pub fn transition_if(
        &self,
        id: &str,
        expected: ResourceState,
        to: ResourceState,
        error: Option<String>,
    ) -> SupervisorResult<Option<ResourceHandle>> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))?;
        if entry.handle.state != expected {
            debug!(
                "Discarding {} -> {} for {}: state is now {}",
                expected, to, id, entry.handle.state
            );
            return Ok(None);
        }
        self.apply(&mut entry, to, error)?;
        Ok(Some(entry.handle.clone()))
    }

    /// Flag a running resource as stuck if its heartbeat window has elapsed.
    ///
    /// Re-checked under the entry lock, so a heartbeat arriving after the
    /// monitor's scan wins.
    pub fn mark_stuck_if_stale(
        &self,
        id: &str,
        now: Instant,
    ) -> SupervisorResult<Option<StaleResource>> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))?;
        if entry.handle.state != ResourceState::Running {
            return Ok(None);
        }

        let stale_for = now.saturating_duration_since(entry.last_beat);
        if stale_for <= entry.staleness {
            return Ok(None);
        }

        let error = format!("no heartbeat for {}s", stale_for.as_secs());
        self.apply(&mut entry, ResourceState::Stuck, Some(error))?;
        self.notifier.emit(EventKind::ResourceStuck {
            resource_id: id.to_string(),
            resource_type: entry.handle.resource_type.clone(),
            stale_for_secs: stale_for.as_secs(),
        });
        Ok(Some(StaleResource {
            handle: entry.handle.clone(),
            stale_for,
        }))
    }

    /// Skip the current tier of a stuck resource.
    pub fn escalate_tier(&self, id: &str) -> SupervisorResult<ResourceHandle> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))?;
        if entry.handle.state != ResourceState::Stuck {
            return Err(SupervisorError::IllegalTransition {
                id: id.to_string(),
                from: entry.handle.state,
                to: ResourceState::Stuck,
            });
        }
        let skipped = entry.handle.escalation_tier;
        entry.handle.skip_tier();
        debug!("Skipped to tier {} for {}", entry.handle.escalation_tier, id);
        self.notifier.emit(EventKind::TierSkipped {
            resource: entry.handle.clone(),
            skipped,
        });
        Ok(entry.handle.clone())
    }

    fn apply(
        &self,
        entry: &mut ResourceEntry,
        to: ResourceState,
        error: Option<String>,
    ) -> SupervisorResult<()> {
        let from = entry.handle.state;
        if !entry.handle.apply_transition(to, error.clone())? {
            return Ok(());
        }

        match to {
            ResourceState::Running => entry.last_beat = Instant::now(),
            ResourceState::Completed | ResourceState::Failed => {
                entry.terminal_since = Some(Instant::now())
            }
            _ => {}
        }
        entry.state_tx.send_replace(to);

        self.notifier.emit(EventKind::ResourceStateChanged {
            resource: entry.handle.clone(),
            from,
            to,
            error,
        });
        Ok(())
    }

    /// Get a snapshot of one resource.
    pub fn get(&self, id: &str) -> Option<ResourceHandle> {
        self.entries.get(id).map(|e| e.handle.clone())
    }

    /// Whether the id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// List resources ordered by registration, optionally by type.
    pub fn list(&self, resource_type: Option<&str>) -> Vec<ResourceHandle> {
        let mut found: Vec<(u64, ResourceHandle)> = self
            .entries
            .iter()
            .filter(|e| resource_type.is_none_or(|t| e.handle.resource_type == t))
            .map(|e| (e.sequence, e.handle.clone()))
            .collect();
        found.sort_by_key(|(sequence, _)| *sequence);
        found.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Ids of resources currently in `state`.
    pub fn ids_in_state(&self, state: ResourceState) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.handle.state == state)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Visit every resource state once.
    pub(crate) fn for_each_state(&self, mut f: impl FnMut(ResourceState)) {
        for entry in self.entries.iter() {
            f(entry.handle.state);
        }
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Weak capability of a resource; `None` while detached.
    pub fn capability(&self, id: &str) -> SupervisorResult<Option<Weak<dyn RecoveryCapability>>> {
        self.entries
            .get(id)
            .map(|e| e.capability.clone())
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))
    }

    /// Watch the state of a resource.
    pub fn subscribe_state(&self, id: &str) -> SupervisorResult<watch::Receiver<ResourceState>> {
        self.entries
            .get(id)
            .map(|e| e.state_tx.subscribe())
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))
    }

    /// Remove a resource regardless of state.
    pub fn remove(&self, id: &str) -> SupervisorResult<ResourceHandle> {
        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| SupervisorError::ResourceNotFound(id.to_string()))?;
        info!(resource_id = %id, state = %entry.handle.state, "Resource removed");
        self.notifier.emit(EventKind::ResourceRemoved {
            resource_id: id.to_string(),
        });
        Ok(entry.handle)
    }

    /// Remove terminal resources held past the retention window.
    pub fn purge_expired(&self, now: Instant) -> Vec<String> {
        let retention = self.config.terminal_retention();
        let expired = |entry: &ResourceEntry| {
            entry
                .terminal_since
                .is_some_and(|since| now.saturating_duration_since(since) >= retention)
        };

        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|e| expired(e.value()))
            .map(|e| e.key().clone())
            .collect();

        let mut purged = Vec::new();
        for id in candidates {
            if self.entries.remove_if(&id, |_, e| expired(e)).is_some() {
                debug!("Purged terminal resource {}", id);
                self.notifier.emit(EventKind::ResourceRemoved {
                    resource_id: id.clone(),
                });
                purged.push(id);
            }
        }
        purged
    }

    /// Insert a handle loaded from a store, detached from any capability.
    ///
    /// An interrupted `recovering` attempt counts as failed and is restored
    /// as `stuck`.
    pub fn restore(&self, mut handle: ResourceHandle) -> SupervisorResult<ResourceHandle> {
        if handle.state == ResourceState::Recovering {
            handle.apply_transition(
                ResourceState::Stuck,
                Some("recovery interrupted by restart".to_string()),
            )?;
        }

        match self.entries.entry(handle.id.clone()) {
            Entry::Occupied(_) => Err(SupervisorError::DuplicateResource(handle.id)),
            Entry::Vacant(vacant) => {
                let staleness = self.config.staleness_for(&handle.resource_type);
                let entry = vacant.insert(ResourceEntry::new(handle, staleness, self.sequence()));
                debug!("Restored {} in state {}", entry.handle.id, entry.handle.state);
                self.notifier.emit(EventKind::ResourceCreated {
                    resource: entry.handle.clone(),
                });
                Ok(entry.handle.clone())
            }
        }
    }

    fn sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }
}
