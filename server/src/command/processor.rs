use super::{CommandRegistry, CommandRequest, CommandResponse, CommandResult};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
enum ProcessorEvent {
    Command(CommandRequest),
    ClientGone(u32),
}

/// Non-blocking, cloneable handle the receive loops submit commands through.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    events: mpsc::UnboundedSender<ProcessorEvent>,
}

impl CommandQueue {
    /// Queues a command. Returns false once the processor has shut down.
    pub fn submit(&self, request: CommandRequest) -> bool {
        self.events.send(ProcessorEvent::Command(request)).is_ok()
    }

    /// Lets the processor drop the worker of a disconnected client.
    pub fn forget_client(&self, client_id: u32) {
        let _ = self.events.send(ProcessorEvent::ClientGone(client_id));
    }
}

/// Executes queued commands and emits exactly one [`CommandResponse`] per
/// submitted request.
///
/// Each client gets its own worker task, so responses keep the submission
/// order of that client while a slow command only delays its own client.
/// Handlers themselves run on tokio's blocking pool.
pub struct CommandProcessor {
    dispatcher: JoinHandle<()>,
}

impl CommandProcessor {
    pub fn start(
        registry: CommandRegistry,
    ) -> (Self, CommandQueue, mpsc::UnboundedReceiver<CommandResponse>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(dispatch(events_rx, Arc::new(registry), responses_tx));
        (
            Self { dispatcher },
            CommandQueue { events: events_tx },
            responses_rx,
        )
    }

    /// Stops accepting commands. Commands already executing finish on the
    /// blocking pool but their responses are discarded.
    pub fn shutdown(self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<ProcessorEvent>,
    registry: Arc<CommandRegistry>,
    responses: mpsc::UnboundedSender<CommandResponse>,
) {
    let mut workers: HashMap<u32, mpsc::UnboundedSender<CommandRequest>> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            ProcessorEvent::Command(request) => {
                let client_id = request.client_id;
                let worker = workers
                    .entry(client_id)
                    .or_insert_with(|| spawn_worker(Arc::clone(&registry), responses.clone()));
                if let Err(mpsc::error::SendError(request)) = worker.send(request) {
                    warn!("Command worker for client {} is gone, restarting", client_id);
                    let worker = spawn_worker(Arc::clone(&registry), responses.clone());
                    let _ = worker.send(request);
                    workers.insert(client_id, worker);
                }
            }
            ProcessorEvent::ClientGone(client_id) => {
                workers.remove(&client_id);
            }
        }
    }
}

fn spawn_worker(
    registry: Arc<CommandRegistry>,
    responses: mpsc::UnboundedSender<CommandResponse>,
) -> mpsc::UnboundedSender<CommandRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CommandRequest>();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let result = execute(&registry, &request).await;
            debug!(
                "Client {}: command {} (uid {}) finished, success={}",
                request.client_id, request.name, request.uid, result.success
            );
            if responses.send(CommandResponse { request, result }).is_err() {
                break;
            }
        }
    });
    tx
}

/// Runs one command to completion. Unknown names and panicking handlers are
/// turned into failure results.
pub async fn execute(registry: &CommandRegistry, request: &CommandRequest) -> CommandResult {
    let Some(handler) = registry.get(&request.name) else {
        warn!(
            "Client {}: unknown command '{}' (uid {})",
            request.client_id, request.name, request.uid
        );
        return CommandResult::failure(format!("Unknown command: '{}'", request.name));
    };

    let owned = request.clone();
    match tokio::task::spawn_blocking(move || handler.execute(&owned)).await {
        Ok(result) => result,
        Err(e) => {
            error!(
                "Client {}: command {} (uid {}) did not complete: {}",
                request.client_id, request.name, request.uid, e
            );
            CommandResult::failure(format!("Command '{}' did not complete", request.name))
        }
    }
}
