//! Where world updates come from.
//!
//! [`Backend`] is either a remote world reached over WebTransport or a local
//! sandbox. Both hand out an [`UpdateStream`] per join: updates arrive in
//! order, and the stream ending means the transport behind it is gone.

pub mod local;
pub mod remote;
pub mod sandbox;
pub mod worker;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::metrics::ClientMetrics;
use crate::net::protocol::{BotId, UpdateMessage};

pub use local::LocalBackend;
pub use remote::{RemoteBackend, RemoteConfig, Uploader};
pub use sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxEvent, SandboxFactory};
pub use worker::{ListenerToken, SandboxWorker, WorkerMessage, WorkerRequest};

/// Updates for one join
pub type UpdateStream = mpsc::UnboundedReceiver<UpdateMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Lost,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Bot {0} not found")]
    NotFound(BotId),
    #[error("Sandbox worker is gone")]
    WorkerGone,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub enum Backend {
    Remote(RemoteBackend),
    Local(LocalBackend),
}

impl Backend {
    /// Join the world, optionally tracking one bot. Any previous stream is
    /// invalidated first.
    pub async fn join(&mut self, bot: Option<&BotId>) -> Result<UpdateStream, BackendError> {
        match self {
            Self::Remote(backend) => backend.join(bot).await,
            Self::Local(backend) => backend.join(bot).await,
        }
    }

    /// Stop delivering updates of the current join
    pub fn leave(&mut self) {
        match self {
            Self::Remote(backend) => backend.leave(),
            Self::Local(backend) => backend.leave(),
        }
    }

    /// Release everything; calling it again is a no-op
    pub fn close(&mut self) {
        match self {
            Self::Remote(backend) => backend.close(),
            Self::Local(backend) => backend.close(),
        }
    }

    pub async fn upload_bot(&self, src: Vec<u8>) -> Result<BotId, BackendError> {
        match self {
            Self::Remote(backend) => backend.upload_bot(src).await,
            Self::Local(backend) => backend.upload_bot(src).await,
        }
    }

    /// Register the transport observer, replacing the previous one
    pub fn observe(&mut self, observer: mpsc::UnboundedSender<TransportEvent>) {
        match self {
            Self::Remote(backend) => backend.observe(observer),
            Self::Local(backend) => backend.observe(observer),
        }
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        match self {
            Self::Remote(backend) => backend.metrics(),
            Self::Local(backend) => backend.metrics(),
        }
    }

    pub fn as_local_mut(&mut self) -> Option<&mut LocalBackend> {
        match self {
            Self::Local(backend) => Some(backend),
            Self::Remote(_) => None,
        }
    }

    /// Upload handle usable without holding the backend, when the backend
    /// has one
    pub fn uploader(&self) -> Option<Uploader> {
        match self {
            Self::Remote(backend) => Some(backend.uploader()),
            Self::Local(_) => None,
        }
    }
}

impl From<RemoteBackend> for Backend {
    fn from(backend: RemoteBackend) -> Self {
        Self::Remote(backend)
    }
}

impl From<LocalBackend> for Backend {
    fn from(backend: LocalBackend) -> Self {
        Self::Local(backend)
    }
}

/// Single transport observer registration shared with forwarding tasks
#[derive(Clone, Default)]
pub(crate) struct ObserverSlot(Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>);

impl ObserverSlot {
    pub(crate) fn set(&self, observer: mpsc::UnboundedSender<TransportEvent>) {
        *self.0.lock() = Some(observer);
    }

    pub(crate) fn notify(&self, event: TransportEvent) {
        if let Some(observer) = self.0.lock().as_ref() {
            let _ = observer.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_replaced() {
        let slot = ObserverSlot::default();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        slot.set(first_tx);
        slot.notify(TransportEvent::Opened);
        slot.set(second_tx);
        slot.notify(TransportEvent::Lost);

        assert_eq!(first_rx.try_recv().unwrap(), TransportEvent::Opened);
        assert!(first_rx.try_recv().is_err());
        assert_eq!(second_rx.try_recv().unwrap(), TransportEvent::Lost);
    }

    #[test]
    fn test_notify_without_observer() {
        ObserverSlot::default().notify(TransportEvent::Lost);
    }
}
