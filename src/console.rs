//! JSON-lines console.
//!
//! Each stdin line is a registration, a command or a query; each stdout line
//! is a response, a pushed event, or a recovery callback for the resource
//! owner to act on.
//!
//! ```text
//! > {"register":{"id":"r1","resource_type":"agent_session"}}
//! > {"command":"heartbeat","resource_id":"r1","progress":0.1}
//! > {"query":"get_stats"}
//! < {"stream":"capability","payload":{"resource_id":"r1","action":"retry"}}
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use autohands_supervisor::{
    CapabilityError, Command, Query, RecoveryAction, RecoveryCapability, ResourceSpec, Response,
    Supervisor, SupervisorConfig, SupervisorEvent,
};

/// One input line.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Register { register: ResourceSpec },
    Command(Command),
    Query(Query),
}

/// A recovery callback forwarded to the resource owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct CapabilityCall {
    resource_id: String,
    action: RecoveryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

/// One output line.
#[derive(Debug, Serialize)]
#[serde(tag = "stream", content = "payload", rename_all = "snake_case")]
enum Outbound {
    Response(Response),
    Event(SupervisorEvent),
    Capability(CapabilityCall),
}

/// Capability that hands each callback to the console's owner.
struct ConsoleCapability {
    resource_id: String,
    out: mpsc::UnboundedSender<Outbound>,
}

impl ConsoleCapability {
    fn forward(
        &self,
        action: RecoveryAction,
        params: Option<serde_json::Value>,
    ) -> Result<(), CapabilityError> {
        self.out
            .send(Outbound::Capability(CapabilityCall {
                resource_id: self.resource_id.clone(),
                action,
                params,
            }))
            .map_err(|_| CapabilityError::Failed("console closed".to_string()))
    }
}

#[async_trait]
impl RecoveryCapability for ConsoleCapability {
    async fn retry(&self) -> Result<(), CapabilityError> {
        self.forward(RecoveryAction::Retry, None)
    }

    async fn stop(&self) -> Result<(), CapabilityError> {
        self.forward(RecoveryAction::Stop, None)
    }

    async fn kill(&self) -> Result<(), CapabilityError> {
        self.forward(RecoveryAction::Kill, None)
    }

    async fn reconfigure(&self, params: &serde_json::Value) -> Result<(), CapabilityError> {
        self.forward(RecoveryAction::Reconfigure, Some(params.clone()))
    }
}

/// Console session state.
struct Console {
    supervisor: Supervisor,
    out: mpsc::UnboundedSender<Outbound>,
    /// Capabilities live here; the supervisor only holds weak references.
    capabilities: HashMap<String, Arc<dyn RecoveryCapability>>,
}

impl Console {
    fn new(supervisor: Supervisor, out: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            supervisor,
            out,
            capabilities: HashMap::new(),
        }
    }

    async fn handle_line(&mut self, line: &str) -> Response {
        let inbound: Inbound = match serde_json::from_str(line) {
            Ok(inbound) => inbound,
            Err(e) => return Response::error("parse", e.to_string()),
        };

        match inbound {
            Inbound::Register { register } => {
                let capability: Arc<dyn RecoveryCapability> = Arc::new(ConsoleCapability {
                    resource_id: register.id.clone(),
                    out: self.out.clone(),
                });
                let id = register.id.clone();
                match self.supervisor.register(register, &capability) {
                    Ok(handle) => {
                        self.capabilities.insert(id, capability);
                        Response::Resource(handle)
                    }
                    Err(e) => e.into(),
                }
            }
            Inbound::Command(command) => {
                let removed = match &command {
                    Command::Remove { resource_id } => Some(resource_id.clone()),
                    _ => None,
                };
                let response = self.supervisor.execute(command).await;
                if let (Some(id), false) = (removed, response.is_error()) {
                    self.capabilities.remove(&id);
                }
                response
            }
            Inbound::Query(query) => self.supervisor.query(query),
        }
    }
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<Outbound>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        let mut json = match serde_json::to_vec(&line) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize console output: {}", e);
                continue;
            }
        };
        json.push(b'\n');
        if let Err(e) = stdout.write_all(&json).await {
            warn!("Console output closed: {}", e);
            break;
        }
        let _ = stdout.flush().await;
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<SupervisorEvent>,
    out: mpsc::UnboundedSender<Outbound>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if out.send(Outbound::Event(event)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Console dropped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Run the console until stdin closes or Ctrl-C.
pub(crate) async fn run(config: SupervisorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor = Supervisor::open(config).await?;
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(write_lines(out_rx));
    let events = tokio::spawn(forward_events(supervisor.subscribe(), out_tx.clone()));

    supervisor.start();
    let mut console = Console::new(supervisor, out_tx.clone());
    info!("supervisord console ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => {
                        let response = console.handle_line(&line).await;
                        debug!("Console response: {:?}", response);
                        let _ = out_tx.send(Outbound::Response(response));
                    }
                    None => {
                        info!("stdin closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
        }
    }

    console.supervisor.shutdown().await;
    events.abort();
    drop(console);
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
