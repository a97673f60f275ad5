use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxEvent, SandboxFactory};
use super::worker::{ListenerToken, RequestId, SandboxWorker, WorkerMessage, WorkerRequest};
use super::{BackendError, ObserverSlot, TransportEvent, UpdateStream};
use crate::metrics::ClientMetrics;
use crate::net::protocol::{BotId, UpdateMessage};

/// Backend running the simulation in this process.
///
/// Two strategies: [`LocalBackend::direct`] drives the sandbox straight from
/// the caller, [`LocalBackend::worker`] isolates it in a [`SandboxWorker`]
/// task. Either way a join only ever forwards updates produced for itself.
pub struct LocalBackend {
    strategy: Strategy,
    observer: ObserverSlot,
    metrics: Arc<ClientMetrics>,
}

enum Strategy {
    Direct(Direct),
    Worker(WorkerClient),
}

impl LocalBackend {
    pub fn direct(sandbox: Box<dyn Sandbox>) -> Self {
        Self {
            strategy: Strategy::Direct(Direct {
                sandbox: Arc::new(Mutex::new(sandbox)),
                epoch: Arc::new(AtomicU64::new(0)),
            }),
            observer: ObserverSlot::default(),
            metrics: Arc::new(ClientMetrics::new()),
        }
    }

    pub fn worker(factory: SandboxFactory, config: SandboxConfig) -> Self {
        let metrics = Arc::new(ClientMetrics::new());
        let observer = ObserverSlot::default();
        let client = WorkerClient::start(factory, config, observer.clone(), metrics.clone());

        Self {
            strategy: Strategy::Worker(client),
            observer,
            metrics,
        }
    }

    pub async fn join(&mut self, bot: Option<&BotId>) -> Result<UpdateStream, BackendError> {
        let result = match &mut self.strategy {
            Strategy::Direct(direct) => direct.join(bot, &self.observer, &self.metrics),
            Strategy::Worker(client) => client.join(bot).await,
        };

        let stream = result.map_err(|e| match (e, bot) {
            (JoinError::Sandbox(_), Some(bot)) => BackendError::NotFound(bot.clone()),
            (JoinError::Sandbox(e), None) => BackendError::Connect(e.0),
            (JoinError::WorkerGone, _) => BackendError::WorkerGone,
        })?;

        self.observer.notify(TransportEvent::Opened);
        Ok(stream)
    }

    pub fn leave(&mut self) {
        match &mut self.strategy {
            Strategy::Direct(direct) => {
                direct.epoch.fetch_add(1, Ordering::SeqCst);
            }
            Strategy::Worker(client) => client.leave(),
        }
    }

    pub fn close(&mut self) {
        match &mut self.strategy {
            Strategy::Direct(direct) => {
                direct.epoch.fetch_add(1, Ordering::SeqCst);
            }
            Strategy::Worker(client) => client.terminate(),
        }
    }

    /// Throw the worker away and start a fresh one with `config`. The current
    /// stream ends, which observers see as a lost transport.
    pub fn recreate(&mut self, config: SandboxConfig) -> Result<(), BackendError> {
        match &mut self.strategy {
            Strategy::Direct(_) => Err(BackendError::Protocol(
                "a directly driven sandbox cannot be recreated".to_string(),
            )),
            Strategy::Worker(client) => {
                let factory = client.factory.clone();
                client.terminate();
                *client = WorkerClient::start(factory, config, self.observer.clone(), self.metrics.clone());
                Ok(())
            }
        }
    }

    pub async fn upload_bot(&self, src: Vec<u8>) -> Result<BotId, BackendError> {
        let result = match &self.strategy {
            Strategy::Direct(direct) => {
                let result = direct.sandbox.lock().upload_bot(&src);
                Ok(result)
            }
            Strategy::Worker(client) => {
                client
                    .bot_request(|req| WorkerRequest::UploadBot { req, src })
                    .await
            }
        };

        match result {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(e)) => {
                ClientMetrics::incr(&self.metrics.uploads_rejected);
                Err(BackendError::Rejected(e.0))
            }
            Err(_) => Err(BackendError::WorkerGone),
        }
    }

    pub async fn spawn_prefab_bot(&self, kind: &str) -> Result<BotId, BackendError> {
        let result = match &self.strategy {
            Strategy::Direct(direct) => {
                let result = direct.sandbox.lock().spawn_prefab_bot(kind);
                Ok(result)
            }
            Strategy::Worker(client) => {
                let kind = kind.to_string();
                client
                    .bot_request(|req| WorkerRequest::SpawnPrefabBot { req, kind })
                    .await
            }
        };

        match result {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(e)) => Err(BackendError::Rejected(e.0)),
            Err(_) => Err(BackendError::WorkerGone),
        }
    }

    /// Subscribe to simulation events such as bots being killed. The
    /// subscription is independent of joins and ends with the sandbox.
    pub async fn listen(&self) -> Result<mpsc::UnboundedReceiver<SandboxEvent>, BackendError> {
        let result = match &self.strategy {
            Strategy::Direct(direct) => Ok(direct.sandbox.lock().listen()),
            Strategy::Worker(client) => client.listen().await,
        };

        match result {
            Ok(Ok(events)) => Ok(events),
            Ok(Err(e)) => Err(BackendError::Rejected(e.0)),
            Err(_) => Err(BackendError::WorkerGone),
        }
    }

    pub fn pause(&self, paused: bool) -> Result<(), BackendError> {
        self.command(|s| s.pause(paused), || WorkerRequest::Pause(paused))
    }

    pub fn destroy_bot(&self, id: &BotId) -> Result<(), BackendError> {
        self.command(|s| s.destroy_bot(id), || WorkerRequest::DestroyBot(id.clone()))
    }

    pub fn restart_bot(&self, id: &BotId) -> Result<(), BackendError> {
        self.command(|s| s.restart_bot(id), || WorkerRequest::RestartBot(id.clone()))
    }

    pub fn set_spawn_point(&self, at: Option<(u32, u32)>) -> Result<(), BackendError> {
        self.command(|s| s.set_spawn_point(at), || WorkerRequest::SetSpawnPoint(at))
    }

    pub fn observe(&mut self, observer: mpsc::UnboundedSender<TransportEvent>) {
        self.observer.set(observer);
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    // Fire-and-forget operations; the worker only logs their failures
    fn command(
        &self,
        direct: impl FnOnce(&mut dyn Sandbox) -> Result<(), SandboxError>,
        request: impl FnOnce() -> WorkerRequest,
    ) -> Result<(), BackendError> {
        match &self.strategy {
            Strategy::Direct(d) => {
                let mut sandbox = d.sandbox.lock();
                direct(&mut **sandbox).map_err(|e| BackendError::Rejected(e.0))
            }
            Strategy::Worker(client) => client.send(request()),
        }
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.close();
    }
}

enum JoinError {
    Sandbox(SandboxError),
    WorkerGone,
}

struct Direct {
    sandbox: Arc<Mutex<Box<dyn Sandbox>>>,
    epoch: Arc<AtomicU64>,
}

impl Direct {
    fn join(
        &mut self,
        bot: Option<&BotId>,
        observer: &ObserverSlot,
        metrics: &Arc<ClientMetrics>,
    ) -> Result<UpdateStream, JoinError> {
        // Invalidate the previous listener before the sandbox is touched
        let listener = ListenerToken(self.epoch.fetch_add(1, Ordering::SeqCst) + 1);
        let updates = self.sandbox.lock().join(bot).map_err(JoinError::Sandbox)?;

        let (sink, stream) = mpsc::unbounded_channel();

        tokio::spawn(forward_direct(
            listener,
            updates,
            self.epoch.clone(),
            sink,
            observer.clone(),
            metrics.clone(),
        ));

        debug!("Joined local sandbox as listener {}", listener);
        Ok(stream)
    }
}

async fn forward_direct(
    listener: ListenerToken,
    mut updates: mpsc::UnboundedReceiver<UpdateMessage>,
    epoch: Arc<AtomicU64>,
    sink: mpsc::UnboundedSender<UpdateMessage>,
    observer: ObserverSlot,
    metrics: Arc<ClientMetrics>,
) {
    while let Some(update) = updates.recv().await {
        if epoch.load(Ordering::SeqCst) != listener.0 {
            debug!("Dropping update for stale listener {}", listener);
            ClientMetrics::incr(&metrics.stale_updates_dropped);
            return;
        }

        if sink.send(update).is_err() {
            return;
        }
    }

    if epoch.load(Ordering::SeqCst) == listener.0 {
        observer.notify(TransportEvent::Lost);
    }
}

/// Client half of the worker protocol
struct WorkerClient {
    factory: SandboxFactory,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    dispatch: Arc<Mutex<Dispatch>>,
    next_req: AtomicU64,
    worker: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    terminated: bool,
}

#[derive(Default)]
struct Dispatch {
    /// Bumped on every join and leave
    generation: u64,
    current: Option<ListenerToken>,
    sink: Option<mpsc::UnboundedSender<UpdateMessage>>,
    joins: HashMap<RequestId, PendingJoin>,
    bots: HashMap<RequestId, oneshot::Sender<Result<BotId, SandboxError>>>,
    listens: HashMap<RequestId, PendingListen>,
    /// Open event subscriptions by the request that opened them
    events: HashMap<RequestId, mpsc::UnboundedSender<SandboxEvent>>,
}

struct PendingListen {
    sink: mpsc::UnboundedSender<SandboxEvent>,
    reply: oneshot::Sender<Result<(), SandboxError>>,
}

struct PendingJoin {
    generation: u64,
    sink: mpsc::UnboundedSender<UpdateMessage>,
    reply: oneshot::Sender<Result<ListenerToken, SandboxError>>,
}

impl Dispatch {
    fn invalidate(&mut self) -> u64 {
        self.generation += 1;
        self.current = None;
        self.sink = None;
        self.generation
    }

    /// Fail every outstanding request and end every subscription
    fn abandon(&mut self) {
        self.joins.clear();
        self.bots.clear();
        self.listens.clear();
        self.events.clear();
    }
}

impl WorkerClient {
    fn start(
        factory: SandboxFactory,
        config: SandboxConfig,
        observer: ObserverSlot,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (requests, worker) = SandboxWorker::spawn(factory.clone(), out_tx);
        let dispatch = Arc::new(Mutex::new(Dispatch::default()));

        info!("Starting sandbox worker for '{}'", config.name);
        let _ = requests.send(WorkerRequest::Init(config));

        let dispatcher = tokio::spawn(dispatch_messages(out_rx, dispatch.clone(), observer, metrics));

        Self {
            factory,
            requests,
            dispatch,
            next_req: AtomicU64::new(1),
            worker,
            dispatcher,
            terminated: false,
        }
    }

    async fn join(&mut self, bot: Option<&BotId>) -> Result<UpdateStream, JoinError> {
        if self.terminated {
            return Err(JoinError::WorkerGone);
        }

        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (sink, stream) = mpsc::unbounded_channel();
        let (reply, response) = oneshot::channel();

        {
            let mut dispatch = self.dispatch.lock();
            let generation = dispatch.invalidate();
            dispatch.joins.insert(req, PendingJoin { generation, sink, reply });
        }

        self.requests
            .send(WorkerRequest::Join { req, bot: bot.cloned() })
            .map_err(|_| JoinError::WorkerGone)?;

        match response.await {
            Ok(Ok(listener)) => {
                debug!("Joined sandbox worker as listener {}", listener);
                Ok(stream)
            }
            Ok(Err(e)) => Err(JoinError::Sandbox(e)),
            Err(_) => Err(JoinError::WorkerGone),
        }
    }

    fn leave(&mut self) {
        self.dispatch.lock().invalidate();
        let _ = self.requests.send(WorkerRequest::Leave);
    }

    async fn bot_request(
        &self,
        request: impl FnOnce(RequestId) -> WorkerRequest,
    ) -> Result<Result<BotId, SandboxError>, oneshot::error::RecvError> {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();

        self.dispatch.lock().bots.insert(req, reply);

        if self.terminated || self.requests.send(request(req)).is_err() {
            // Dropping the pending slot makes `response` fail below
            self.dispatch.lock().bots.remove(&req);
        }

        response.await
    }

    async fn listen(
        &self,
    ) -> Result<Result<mpsc::UnboundedReceiver<SandboxEvent>, SandboxError>, oneshot::error::RecvError> {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (sink, events) = mpsc::unbounded_channel();
        let (reply, response) = oneshot::channel();

        self.dispatch.lock().listens.insert(req, PendingListen { sink, reply });

        if self.terminated || self.requests.send(WorkerRequest::Listen { req }).is_err() {
            self.dispatch.lock().listens.remove(&req);
        }

        Ok(response.await?.map(|()| events))
    }

    fn send(&self, request: WorkerRequest) -> Result<(), BackendError> {
        if self.terminated {
            return Err(BackendError::WorkerGone);
        }

        self.requests.send(request).map_err(|_| BackendError::WorkerGone)
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.worker.abort();
        self.dispatcher.abort();

        let mut dispatch = self.dispatch.lock();
        dispatch.invalidate();
        dispatch.abandon();
    }
}

async fn dispatch_messages(
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    dispatch: Arc<Mutex<Dispatch>>,
    observer: ObserverSlot,
    metrics: Arc<ClientMetrics>,
) {
    while let Some(msg) = rx.recv().await {
        let mut d = dispatch.lock();

        match msg {
            WorkerMessage::JoinResponse { req, result } => {
                let Some(pending) = d.joins.remove(&req) else {
                    continue;
                };

                // A join or leave issued meanwhile superseded this one
                if let Ok(listener) = &result {
                    if pending.generation == d.generation {
                        d.current = Some(*listener);
                        d.sink = Some(pending.sink);
                    }
                }

                let _ = pending.reply.send(result);
            }

            WorkerMessage::JoinUpdate { listener, update } => {
                if d.current != Some(listener) {
                    debug!("Dropping update for stale listener {}", listener);
                    ClientMetrics::incr(&metrics.stale_updates_dropped);
                    continue;
                }

                if let Some(sink) = &d.sink {
                    let _ = sink.send(update);
                }
            }

            WorkerMessage::JoinEnded { listener } => {
                if d.current == Some(listener) {
                    d.current = None;
                    d.sink = None;
                    observer.notify(TransportEvent::Lost);
                }
            }

            WorkerMessage::BotResponse { req, result } => {
                if let Some(reply) = d.bots.remove(&req) {
                    let _ = reply.send(result);
                }
            }

            WorkerMessage::ListenResponse { req, result } => {
                let Some(pending) = d.listens.remove(&req) else {
                    continue;
                };

                if result.is_ok() {
                    d.events.insert(req, pending.sink);
                }

                let _ = pending.reply.send(result);
            }

            WorkerMessage::Event { req, event } => {
                let closed = match d.events.get(&req) {
                    Some(sink) => sink.send(event).is_err(),
                    None => false,
                };

                if closed {
                    d.events.remove(&req);
                }
            }
        }
    }

    warn!("Sandbox worker went away");

    let mut d = dispatch.lock();
    let was_listening = d.current.is_some();
    d.invalidate();
    d.abandon();

    if was_listening {
        observer.notify(TransportEvent::Lost);
    }
}
