//! Game-level control surface shared by the viewer and scripted flows
//! (tutorial, challenges): UI flags, pause state and the event bus.

pub mod bus;
pub mod ui;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, SandboxEvent};
use crate::controller::Controller;
use crate::net::protocol::BotId;

pub use bus::{EventBus, ListenerId};
pub use ui::UiFlags;

/// Emitted (postponed) right before a tutorial slide opens
pub const TUTORIAL_BEFORE_SLIDE: &str = "tutorial.before-slide";

pub struct GameCtrl {
    bus: EventBus,
    ui: watch::Sender<UiFlags>,
    paused: watch::Sender<bool>,
    tutorial_slide: watch::Sender<Option<u32>>,
}

impl GameCtrl {
    pub fn new() -> Self {
        Self {
            bus: EventBus::new(),
            ui: watch::Sender::new(UiFlags::default()),
            paused: watch::Sender::new(false),
            tutorial_slide: watch::Sender::new(None),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn ui(&self) -> UiFlags {
        *self.ui.borrow()
    }

    pub fn subscribe_ui(&self) -> watch::Receiver<UiFlags> {
        self.ui.subscribe()
    }

    pub fn alter_ui(&self, f: impl FnOnce(&mut UiFlags)) {
        self.ui.send_modify(f);
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    pub fn tutorial_slide(&self) -> Option<u32> {
        *self.tutorial_slide.borrow()
    }

    /// Switch to `slide` and announce it; the slide's own listener may
    /// register afterwards and still receive the announcement
    pub fn open_tutorial_slide(&self, slide: u32) {
        debug!("[ctrl] opening tutorial slide {}", slide);
        self.tutorial_slide.send_replace(Some(slide));
        self.bus.emit_postponed(TUTORIAL_BEFORE_SLIDE);
    }

    /// Forward pause changes to the local sandbox behind `controller`
    pub fn spawn_pause_sync(&self, controller: Arc<Controller>) -> JoinHandle<()> {
        let mut paused = self.paused.subscribe();

        tokio::spawn(async move {
            while paused.changed().await.is_ok() {
                let value = *paused.borrow_and_update();
                let mut backend = controller.backend().await;

                if let Some(local) = backend.as_local_mut() {
                    if let Err(e) = local.pause(value) {
                        warn!("[ctrl] failed to pause sandbox: {}", e);
                    }
                }
            }
        })
    }
}

impl Default for GameCtrl {
    fn default() -> Self {
        Self::new()
    }
}

/// Count `timer` down once per second; resolves on the first tick that
/// leaves it at zero, so a timer already at zero still takes one second
pub async fn once_timer_completed(timer: &watch::Sender<u32>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mut left = 0;
        timer.send_modify(|t| {
            *t = t.saturating_sub(1);
            left = *t;
        });

        if left == 0 {
            return;
        }
    }
}

/// Ids of bots killed in the local sandbox behind `controller`, in order
pub async fn listen_for_killed_bots(
    controller: &Controller,
) -> Result<mpsc::UnboundedReceiver<BotId>, BackendError> {
    let mut events = match &*controller.backend().await {
        Backend::Local(local) => local.listen().await?,
        Backend::Remote(_) => {
            return Err(BackendError::Protocol(
                "kill events are only reported by a local sandbox".to_string(),
            ))
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SandboxEvent::BotKilled { id } = event {
                if tx.send(id).is_err() {
                    return;
                }
            }
        }
    });

    Ok(rx)
}

/// Resolves with the first bot killed from now on
pub async fn once_any_bot_is_killed(controller: &Controller) -> Result<BotId, BackendError> {
    let mut killed = listen_for_killed_bots(controller).await?;

    killed.recv().await.ok_or(BackendError::WorkerGone)
}
