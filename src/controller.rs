//! Keeps a session alive across transport failures.
//!
//! The controller remembers what the caller asked to join and replays that
//! intent whenever the stream behind it goes away. Transport errors never reach
//! the caller; only a missing bot does, once, as [`ControllerEvent::BotNotFound`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, TransportEvent, UpdateStream, Uploader};
use crate::metrics::ClientMetrics;
use crate::net::protocol::{BotId, TrackedBotUpdate, UpdateMessage};
use crate::store::session::{store_session, Session};
use crate::store::Storage;
use crate::world::World;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Reconnecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Reconnecting => "reconnecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The bot the session was joined for does not exist; the session fell
    /// back to watching the whole world
    BotNotFound(BotId),
}

#[derive(Clone)]
pub struct ControllerConfig {
    /// Fixed delay between reconnection attempts
    pub retry_delay: Duration,
    /// Where successful joins are remembered
    pub storage: Option<Arc<dyn Storage>>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            storage: None,
        }
    }
}

pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    backend: tokio::sync::Mutex<Backend>,
    /// Uploads bypass `backend`, which a join holds for its whole handshake
    uploader: Option<Uploader>,
    world: Arc<World>,
    config: ControllerConfig,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    metrics: Arc<ClientMetrics>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Bumped by every join and by close; tasks of older generations go quiet
    generation: u64,
    /// Bot to track on the next attempt
    intent: Option<BotId>,
    /// No attempt has been made for the current intent yet
    fresh: bool,
    was_connected: bool,
    closing: bool,
    task: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(
        backend: Backend,
        world: Arc<World>,
        config: ControllerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let metrics = backend.metrics();
        let uploader = backend.uploader();

        let inner = Inner {
            backend: tokio::sync::Mutex::new(backend),
            uploader,
            world,
            config,
            status,
            events,
            metrics,
            state: Mutex::new(State::default()),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Join the world, optionally tracking `bot`.
    ///
    /// Resolves with the outcome of the first attempt; whatever it is, the
    /// controller keeps retrying in the background until it is connected.
    pub async fn join(&self, bot: Option<BotId>) -> Result<(), BackendError> {
        let (first_tx, first_rx) = oneshot::channel();

        let generation = {
            let mut state = self.inner.state.lock();

            if state.closing {
                return Err(BackendError::Protocol("controller is closed".to_string()));
            }

            if let Some(task) = state.task.take() {
                task.abort();
            }

            state.generation += 1;
            state.intent = bot.clone();
            state.fresh = true;

            // Lock order is state, then world
            self.inner.world.reset_for_join(bot.as_ref());
            state.generation
        };

        let task = tokio::spawn(self.inner.clone().run(generation, first_tx));

        {
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.task = Some(task);
            } else {
                task.abort();
            }
        }

        first_rx
            .await
            .unwrap_or_else(|_| Err(BackendError::Connect("join superseded".to_string())))
    }

    /// Stop for good; failures reported afterwards are ignored
    pub async fn close(&self) {
        let task = {
            let mut state = self.inner.state.lock();
            state.closing = true;
            state.generation += 1;
            self.inner.publish(ConnectionStatus::Closing);
            state.task.take()
        };

        if let Some(task) = task {
            task.abort();
        }

        self.inner.backend.lock().await.close();
    }

    /// Upload a bot and remember it as ours
    pub async fn upload_bot(&self, src: Vec<u8>) -> Result<BotId, BackendError> {
        let id = match &self.inner.uploader {
            Some(uploader) => uploader.upload(src).await?,
            None => self.inner.backend.lock().await.upload_bot(src).await?,
        };

        if let Err(e) = self.inner.world.add_owned(id.clone()) {
            warn!("Failed to remember bot {}: {}", id, e);
        }

        Ok(id)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn world(&self) -> &Arc<World> {
        &self.inner.world
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.inner.metrics.clone()
    }

    /// Direct access to the backend, e.g. for sandbox-only operations
    pub async fn backend(&self) -> MutexGuard<'_, Backend> {
        self.inner.backend.lock().await
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        generation: u64,
        first: oneshot::Sender<Result<(), BackendError>>,
    ) {
        let mut first = Some(first);

        loop {
            let Some((stream, observer)) = self.connect(generation, &mut first).await else {
                return;
            };

            if !self.pump(generation, stream, observer).await {
                return;
            }

            ClientMetrics::incr(&self.metrics.reconnects);
            self.set_status(generation, ConnectionStatus::Reconnecting);
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Attempt joins until one succeeds; `None` once this generation is over
    async fn connect(
        &self,
        generation: u64,
        first: &mut Option<oneshot::Sender<Result<(), BackendError>>>,
    ) -> Option<(UpdateStream, mpsc::UnboundedReceiver<TransportEvent>)> {
        loop {
            let (bot, status) = {
                let state = self.state.lock();

                if !state.is_active(generation) {
                    return None;
                }

                let status = if state.was_connected {
                    ConnectionStatus::Reconnecting
                } else {
                    ConnectionStatus::Connecting
                };

                (state.intent.clone(), status)
            };

            self.set_status(generation, status);
            ClientMetrics::incr(&self.metrics.join_attempts);

            let (observer_tx, observer_rx) = mpsc::unbounded_channel();

            let result = {
                let mut backend = self.backend.lock().await;
                backend.observe(observer_tx);
                backend.join(bot.as_ref()).await
            };

            let fresh = {
                let mut state = self.state.lock();

                if !state.is_active(generation) {
                    return None;
                }

                std::mem::replace(&mut state.fresh, false)
            };

            match result {
                Ok(stream) => {
                    ClientMetrics::incr(&self.metrics.joins_succeeded);
                    self.state.lock().was_connected = true;
                    self.set_status(generation, ConnectionStatus::Connected);
                    self.remember(bot.as_ref());

                    if let Some(first) = first.take() {
                        let _ = first.send(Ok(()));
                    }

                    return Some((stream, observer_rx));
                }

                Err(e) => match bot {
                    Some(bot) if fresh => {
                        debug!("Join for bot {} failed: {}", bot, e);
                        {
                            let mut state = self.state.lock();
                            if !state.is_active(generation) {
                                return None;
                            }
                            self.bot_not_found(&mut state, bot);
                        }
                        tokio::task::yield_now().await;
                    }
                    _ => {
                        warn!("Join failed: {}, retrying in {:?}", e, self.config.retry_delay);

                        if let Some(first) = first.take() {
                            let _ = first.send(Err(e));
                        }

                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                },
            }
        }
    }

    /// Fold updates into the world until the transport goes away. Returns
    /// whether the session should be re-established.
    async fn pump(
        &self,
        generation: u64,
        mut stream: UpdateStream,
        mut observer: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> bool {
        let mut first = true;
        let mut observing = true;

        loop {
            tokio::select! {
                biased;

                msg = stream.recv() => match msg {
                    Some(msg) => {
                        if !self.handle(generation, msg, first) {
                            return false;
                        }
                        first = false;
                    }
                    None => break,
                },

                event = observer.recv(), if observing => match event {
                    Some(TransportEvent::Lost) => {
                        // Whatever was delivered before the loss still counts
                        while let Ok(msg) = stream.try_recv() {
                            if !self.handle(generation, msg, first) {
                                return false;
                            }
                            first = false;
                        }
                        break;
                    }
                    Some(TransportEvent::Opened) => {}
                    None => observing = false,
                },
            }
        }

        let active = self.state.lock().is_active(generation);

        if active {
            info!("Transport lost, reconnecting");
        }

        active
    }

    /// Apply one message; the state lock is held throughout so a newer join
    /// or close cannot slip in between the generation check and the apply
    fn handle(&self, generation: u64, msg: UpdateMessage, first: bool) -> bool {
        let mut state = self.state.lock();

        if !state.is_active(generation) {
            return false;
        }

        if first && matches!(msg.bot, Some(TrackedBotUpdate::Unknown)) {
            if let Some(bot) = state.intent.clone() {
                self.bot_not_found(&mut state, bot);
            }
        }

        let started = Instant::now();
        self.world.apply(msg);
        self.metrics.record_apply_time(started.elapsed());

        true
    }

    fn bot_not_found(&self, state: &mut State, bot: BotId) {
        warn!("Bot {} not found, watching the whole world instead", bot);

        state.intent = None;
        self.world.clear_tracked();
        ClientMetrics::incr(&self.metrics.bots_not_found);

        let _ = self.events.send(ControllerEvent::BotNotFound(bot));
    }

    fn set_status(&self, generation: u64, status: ConnectionStatus) {
        let state = self.state.lock();

        if !state.is_active(generation) {
            return;
        }

        self.publish(status);
    }

    fn publish(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });

        if changed {
            info!("Status: {}", status);
            self.world.set_status(status);
            self.metrics.record_status(status);
        }
    }

    fn remember(&self, bot: Option<&BotId>) {
        let Some(storage) = &self.config.storage else {
            return;
        };

        let session = Session::new(self.world.id(), bot.cloned());

        if let Err(e) = store_session(storage.as_ref(), &session) {
            warn!("Failed to store session: {}", e);
        }
    }
}

impl State {
    fn is_active(&self, generation: u64) -> bool {
        !self.closing && self.generation == generation
    }
}
