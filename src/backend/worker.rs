//! Sandbox running in its own task, reached only through messages.
//!
//! Every join bumps the worker's epoch and the resulting [`ListenerToken`] tags
//! each update produced for that join. A stream is stopped as soon as the epoch
//! moves on (another join, or a leave), and the receiving side drops anything
//! tagged with a token it no longer listens to.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxEvent, SandboxFactory};
use crate::net::protocol::{BotId, UpdateMessage};

/// Identifies the join an update belongs to; strictly increasing per worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerToken(pub u64);

impl fmt::Display for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Correlates a request with its response
pub type RequestId = u64;

#[derive(Debug)]
pub enum WorkerRequest {
    Init(SandboxConfig),
    Join { req: RequestId, bot: Option<BotId> },
    Leave,
    Listen { req: RequestId },
    Pause(bool),
    UploadBot { req: RequestId, src: Vec<u8> },
    SpawnPrefabBot { req: RequestId, kind: String },
    DestroyBot(BotId),
    RestartBot(BotId),
    SetSpawnPoint(Option<(u32, u32)>),
}

#[derive(Debug)]
pub enum WorkerMessage {
    JoinResponse {
        req: RequestId,
        result: Result<ListenerToken, SandboxError>,
    },
    JoinUpdate {
        listener: ListenerToken,
        update: UpdateMessage,
    },
    /// The sandbox stopped producing updates for this listener
    JoinEnded { listener: ListenerToken },
    BotResponse {
        req: RequestId,
        result: Result<BotId, SandboxError>,
    },
    ListenResponse {
        req: RequestId,
        result: Result<(), SandboxError>,
    },
    /// Simulation event for the subscription opened by `req`
    Event { req: RequestId, event: SandboxEvent },
}

/// Worker state; lives inside the task spawned by [`SandboxWorker::spawn`]
pub struct SandboxWorker {
    factory: SandboxFactory,
    sandbox: Option<Box<dyn Sandbox>>,
    epoch: Arc<AtomicU64>,
    stream: Option<JoinHandle<()>>,
    /// Event subscriptions; they outlive joins
    listeners: Vec<JoinHandle<()>>,
    out: mpsc::UnboundedSender<WorkerMessage>,
}

impl SandboxWorker {
    /// Start a worker; requests go in through the returned sender, responses
    /// and updates come out through `out`
    pub fn spawn(
        factory: SandboxFactory,
        out: mpsc::UnboundedSender<WorkerMessage>,
    ) -> (mpsc::UnboundedSender<WorkerRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Self {
            factory,
            sandbox: None,
            epoch: Arc::new(AtomicU64::new(0)),
            stream: None,
            listeners: Vec::new(),
            out,
        };

        (tx, tokio::spawn(worker.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerRequest>) {
        while let Some(request) = rx.recv().await {
            debug!("[sandbox-worker] processing {:?}", RequestKind(&request));
            self.handle(request);
        }

        debug!("[sandbox-worker] request channel closed, exiting");
    }

    fn handle(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Init(config) => match (self.factory)(&config) {
                Ok(sandbox) => {
                    info!("[sandbox-worker] sandbox '{}' ready", config.name);
                    self.sandbox = Some(sandbox);
                }
                Err(e) => {
                    warn!("[sandbox-worker] failed to create sandbox: {}", e);
                }
            },

            WorkerRequest::Join { req, bot } => {
                let listener = self.next_listener();
                let result = self.sandbox().and_then(|s| s.join(bot.as_ref()));

                match result {
                    Ok(updates) => {
                        // Response first, so no update overtakes it
                        self.send(WorkerMessage::JoinResponse {
                            req,
                            result: Ok(listener),
                        });
                        self.stream = Some(tokio::spawn(forward(
                            listener,
                            updates,
                            self.epoch.clone(),
                            self.out.clone(),
                        )));
                    }
                    Err(e) => {
                        self.send(WorkerMessage::JoinResponse { req, result: Err(e) });
                    }
                }
            }

            WorkerRequest::Leave => {
                self.next_listener();
            }

            WorkerRequest::Listen { req } => match self.sandbox().and_then(|s| s.listen()) {
                Ok(events) => {
                    self.send(WorkerMessage::ListenResponse { req, result: Ok(()) });
                    self.listeners.retain(|l| !l.is_finished());
                    self.listeners
                        .push(tokio::spawn(forward_events(req, events, self.out.clone())));
                }
                Err(e) => {
                    self.send(WorkerMessage::ListenResponse { req, result: Err(e) });
                }
            },

            WorkerRequest::Pause(paused) => {
                if let Err(e) = self.sandbox().and_then(|s| s.pause(paused)) {
                    warn!("[sandbox-worker] pause failed: {}", e);
                }
            }

            WorkerRequest::UploadBot { req, src } => {
                let result = self.sandbox().and_then(|s| s.upload_bot(&src));
                self.send(WorkerMessage::BotResponse { req, result });
            }

            WorkerRequest::SpawnPrefabBot { req, kind } => {
                let result = self.sandbox().and_then(|s| s.spawn_prefab_bot(&kind));
                self.send(WorkerMessage::BotResponse { req, result });
            }

            WorkerRequest::DestroyBot(id) => {
                if let Err(e) = self.sandbox().and_then(|s| s.destroy_bot(&id)) {
                    warn!("[sandbox-worker] destroy {} failed: {}", id, e);
                }
            }

            WorkerRequest::RestartBot(id) => {
                if let Err(e) = self.sandbox().and_then(|s| s.restart_bot(&id)) {
                    warn!("[sandbox-worker] restart {} failed: {}", id, e);
                }
            }

            WorkerRequest::SetSpawnPoint(at) => {
                if let Err(e) = self.sandbox().and_then(|s| s.set_spawn_point(at)) {
                    warn!("[sandbox-worker] set spawn point failed: {}", e);
                }
            }
        }
    }

    /// Advance the epoch, stopping the current stream
    fn next_listener(&mut self) -> ListenerToken {
        self.stop_stream();
        ListenerToken(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
    }

    fn sandbox(&mut self) -> Result<&mut Box<dyn Sandbox>, SandboxError> {
        self.sandbox
            .as_mut()
            .ok_or_else(|| SandboxError::from("sandbox not initialized"))
    }

    fn send(&self, msg: WorkerMessage) {
        if self.out.send(msg).is_err() {
            debug!("[sandbox-worker] nobody is listening");
        }
    }
}

impl Drop for SandboxWorker {
    fn drop(&mut self) {
        self.stop_stream();

        for listener in self.listeners.drain(..) {
            listener.abort();
        }
    }
}

async fn forward_events(
    req: RequestId,
    mut events: mpsc::UnboundedReceiver<SandboxEvent>,
    out: mpsc::UnboundedSender<WorkerMessage>,
) {
    while let Some(event) = events.recv().await {
        if out.send(WorkerMessage::Event { req, event }).is_err() {
            return;
        }
    }
}

async fn forward(
    listener: ListenerToken,
    mut updates: mpsc::UnboundedReceiver<UpdateMessage>,
    epoch: Arc<AtomicU64>,
    out: mpsc::UnboundedSender<WorkerMessage>,
) {
    while let Some(update) = updates.recv().await {
        if epoch.load(Ordering::SeqCst) != listener.0 {
            return;
        }

        if out.send(WorkerMessage::JoinUpdate { listener, update }).is_err() {
            return;
        }
    }

    if epoch.load(Ordering::SeqCst) == listener.0 {
        let _ = out.send(WorkerMessage::JoinEnded { listener });
    }
}

// Requests can carry whole bot binaries; log only their kind
struct RequestKind<'a>(&'a WorkerRequest);

impl fmt::Debug for RequestKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.0 {
            WorkerRequest::Init(_) => "init",
            WorkerRequest::Join { .. } => "join",
            WorkerRequest::Leave => "leave",
            WorkerRequest::Listen { .. } => "listen",
            WorkerRequest::Pause(_) => "pause",
            WorkerRequest::UploadBot { .. } => "uploadBot",
            WorkerRequest::SpawnPrefabBot { .. } => "spawnPrefabBot",
            WorkerRequest::DestroyBot(_) => "destroyBot",
            WorkerRequest::RestartBot(_) => "restartBot",
            WorkerRequest::SetSpawnPoint(_) => "setSpawnPoint",
        };

        f.write_str(kind)
    }
}
