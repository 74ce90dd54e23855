//! Supervisor state persistence.
//!
//! A store keeps the current snapshot of every resource and open intervention
//! request plus an append-only transition log, enough to rebuild the
//! supervisor after a crash. [`PersistenceSink`] feeds a store from the event
//! stream without blocking the emitting resource.

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{SupervisorError, SupervisorResult};
use crate::events::{sink_error, EventKind, EventSink, SupervisorEvent};
use crate::intervention::InterventionRequest;
use crate::resource::{ResourceHandle, ResourceState};

/// One line of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Event sequence that carried the transition.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub resource_id: String,
    pub from: ResourceState,
    pub to: ResourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Supervisor storage trait.
#[async_trait]
pub trait SupervisorStore: Send + Sync {
    /// Append to the transition log.
    async fn append_transition(&self, record: &TransitionRecord) -> SupervisorResult<()>;

    /// Save the current snapshot of a resource.
    async fn save_resource(&self, handle: &ResourceHandle) -> SupervisorResult<()>;

    /// Delete a resource snapshot.
    async fn delete_resource(&self, id: &str) -> SupervisorResult<()>;

    /// Save an open intervention request.
    async fn save_request(&self, request: &InterventionRequest) -> SupervisorResult<()>;

    /// Delete a request once resolved or superseded.
    async fn delete_request(&self, id: &Uuid) -> SupervisorResult<()>;

    /// Load all resource snapshots, oldest first.
    async fn load_resources(&self) -> SupervisorResult<Vec<ResourceHandle>>;

    /// Load all open requests, oldest first.
    async fn load_requests(&self) -> SupervisorResult<Vec<InterventionRequest>>;

    /// Load the transition log in append order.
    async fn load_transitions(&self) -> SupervisorResult<Vec<TransitionRecord>>;
}

fn store_error(context: &str, e: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::Store(format!("{}: {}", context, e))
}

/// In-memory store.
#[derive(Default)]
pub struct MemorySupervisorStore {
    resources: RwLock<HashMap<String, ResourceHandle>>,
    requests: RwLock<HashMap<Uuid, InterventionRequest>>,
    transitions: RwLock<Vec<TransitionRecord>>,
}

impl MemorySupervisorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SupervisorStore for MemorySupervisorStore {
    async fn append_transition(&self, record: &TransitionRecord) -> SupervisorResult<()> {
        self.transitions.write().await.push(record.clone());
        Ok(())
    }

    async fn save_resource(&self, handle: &ResourceHandle) -> SupervisorResult<()> {
        self.resources
            .write()
            .await
            .insert(handle.id.clone(), handle.clone());
        Ok(())
    }

    async fn delete_resource(&self, id: &str) -> SupervisorResult<()> {
        self.resources.write().await.remove(id);
        Ok(())
    }

    async fn save_request(&self, request: &InterventionRequest) -> SupervisorResult<()> {
        self.requests.write().await.insert(request.id, request.clone());
        Ok(())
    }

    async fn delete_request(&self, id: &Uuid) -> SupervisorResult<()> {
        self.requests.write().await.remove(id);
        Ok(())
    }

    async fn load_resources(&self) -> SupervisorResult<Vec<ResourceHandle>> {
        let mut resources: Vec<_> = self.resources.read().await.values().cloned().collect();
        resources.sort_by_key(|h| h.created_at);
        Ok(resources)
    }

    async fn load_requests(&self) -> SupervisorResult<Vec<InterventionRequest>> {
        let mut requests: Vec<_> = self.requests.read().await.values().cloned().collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn load_transitions(&self) -> SupervisorResult<Vec<TransitionRecord>> {
        Ok(self.transitions.read().await.clone())
    }
}

/// File system store.
///
/// ```text
/// {storage_path}/
/// ├── resources/{resource_id}.json
/// ├── requests/{request_id}.json
/// └── transitions.jsonl
/// ```
pub struct FileSupervisorStore {
    storage_path: PathBuf,
    /// Serializes appends to the transition log.
    log_lock: tokio::sync::Mutex<()>,
}

impl FileSupervisorStore {
    /// Open a store, creating its directories.
    pub async fn new(storage_path: impl Into<PathBuf>) -> SupervisorResult<Self> {
        let storage_path = storage_path.into();
        for dir in ["resources", "requests"] {
            fs::create_dir_all(storage_path.join(dir))
                .await
                .map_err(|e| store_error("create store directory", e))?;
        }
        debug!("FileSupervisorStore initialized at {:?}", storage_path);
        Ok(Self {
            storage_path,
            log_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn resource_path(&self, id: &str) -> PathBuf {
        self.storage_path
            .join("resources")
            .join(format!("{}.json", Self::sanitize_id(id)))
    }

    fn request_path(&self, id: &Uuid) -> PathBuf {
        self.storage_path.join("requests").join(format!("{}.json", id))
    }

    fn log_path(&self) -> PathBuf {
        self.storage_path.join("transitions.jsonl")
    }

    /// Sanitize a resource id for use as a file name.
    fn sanitize_id(id: &str) -> String {
        id.chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    async fn write_json<T: Serialize>(path: PathBuf, value: &T) -> SupervisorResult<()> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| store_error("serialize", e))?;
        // Replace atomically.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| store_error("write snapshot", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_error("rename snapshot", e))
    }

    async fn remove(path: PathBuf) -> SupervisorResult<()> {
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error("delete snapshot", e)),
        }
    }

    async fn read_dir_json<T: serde::de::DeserializeOwned>(&self, dir: &str) -> SupervisorResult<Vec<T>> {
        let mut items = Vec::new();
        let mut entries = fs::read_dir(self.storage_path.join(dir))
            .await
            .map_err(|e| store_error("read store directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_error("read store directory", e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<T>(&content) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!("Failed to deserialize {:?}: {}", path, e),
                },
                Err(e) => warn!("Failed to read {:?}: {}", path, e),
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl SupervisorStore for FileSupervisorStore {
    async fn append_transition(&self, record: &TransitionRecord) -> SupervisorResult<()> {
        let mut line = serde_json::to_vec(record).map_err(|e| store_error("serialize", e))?;
        line.push(b'\n');

        let _guard = self.log_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await
            .map_err(|e| store_error("open transition log", e))?;
        file.write_all(&line)
            .await
            .map_err(|e| store_error("append transition", e))?;
        file.flush()
            .await
            .map_err(|e| store_error("flush transition log", e))
    }

    async fn save_resource(&self, handle: &ResourceHandle) -> SupervisorResult<()> {
        Self::write_json(self.resource_path(&handle.id), handle).await
    }

    async fn delete_resource(&self, id: &str) -> SupervisorResult<()> {
        Self::remove(self.resource_path(id)).await
    }

    async fn save_request(&self, request: &InterventionRequest) -> SupervisorResult<()> {
        Self::write_json(self.request_path(&request.id), request).await
    }

    async fn delete_request(&self, id: &Uuid) -> SupervisorResult<()> {
        Self::remove(self.request_path(id)).await
    }

    async fn load_resources(&self) -> SupervisorResult<Vec<ResourceHandle>> {
        let mut resources: Vec<ResourceHandle> = self.read_dir_json("resources").await?;
        resources.sort_by_key(|h| h.created_at);
        Ok(resources)
    }

    async fn load_requests(&self) -> SupervisorResult<Vec<InterventionRequest>> {
        let mut requests: Vec<InterventionRequest> = self.read_dir_json("requests").await?;
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn load_transitions(&self) -> SupervisorResult<Vec<TransitionRecord>> {
        let content = match fs::read_to_string(self.log_path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error("read transition log", e)),
        };

        let mut records = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A torn final line after a crash is skipped.
                Err(e) => warn!("Skipping transition log line {}: {}", n + 1, e),
            }
        }
        Ok(records)
    }
}

enum PersistMessage {
    Event(SupervisorEvent),
    Flush(oneshot::Sender<()>),
}

/// Event sink writing supervisor state to a store on a background task.
pub struct PersistenceSink {
    tx: mpsc::UnboundedSender<PersistMessage>,
}

impl PersistenceSink {
    /// Create the sink and spawn its writer task.
    pub fn spawn(store: Arc<dyn SupervisorStore>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(Self::run(store, rx));
        (Self { tx }, writer)
    }

    /// Wait until every event published so far is written.
    pub async fn flush(&self) -> SupervisorResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(PersistMessage::Flush(ack_tx))
            .map_err(|_| sink_error("persistence", "writer task stopped"))?;
        ack_rx
            .await
            .map_err(|_| sink_error("persistence", "writer task stopped"))
    }

    async fn run(store: Arc<dyn SupervisorStore>, mut rx: mpsc::UnboundedReceiver<PersistMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                PersistMessage::Event(event) => {
                    if let Err(e) = Self::apply(store.as_ref(), &event).await {
                        error!("Failed to persist {} #{}: {}", event.kind.name(), event.sequence, e);
                    }
                }
                PersistMessage::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("Persistence writer stopped");
    }

    async fn apply(store: &dyn SupervisorStore, event: &SupervisorEvent) -> SupervisorResult<()> {
        match &event.kind {
            EventKind::ResourceCreated { resource } | EventKind::TierSkipped { resource, .. } => {
                store.save_resource(resource).await
            }
            EventKind::ResourceStateChanged {
                resource,
                from,
                to,
                error,
            } => {
                store
                    .append_transition(&TransitionRecord {
                        sequence: event.sequence,
                        timestamp: event.timestamp,
                        resource_id: resource.id.clone(),
                        from: *from,
                        to: *to,
                        error: error.clone(),
                    })
                    .await?;
                store.save_resource(resource).await
            }
            EventKind::ResourceRemoved { resource_id } => store.delete_resource(resource_id).await,
            EventKind::InterventionRequested { request }
            | EventKind::InterventionDismissed { request } => store.save_request(request).await,
            EventKind::InterventionResolved { request_id, .. }
            | EventKind::InterventionSuperseded { request_id, .. } => {
                store.delete_request(request_id).await
            }
            EventKind::ResourceStuck { .. }
            | EventKind::RecoveryAttemptFailed { .. }
            | EventKind::ResourceError { .. } => Ok(()),
        }
    }
}

impl EventSink for PersistenceSink {
    fn name(&self) -> &str {
        "persistence"
    }

    fn publish(&self, event: &SupervisorEvent) -> SupervisorResult<()> {
        self.tx
            .send(PersistMessage::Event(event.clone()))
            .map_err(|_| sink_error("persistence", "writer task stopped"))
    }
}
