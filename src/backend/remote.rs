use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::Url;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::worker::ListenerToken;
use super::{BackendError, ObserverSlot, TransportEvent, UpdateStream};
use crate::metrics::ClientMetrics;
use crate::net::connection::{Connection, ConnectionEvent};
use crate::net::protocol::{BotId, ControlPacket, UpdateMessage};
use crate::net::tls::TlsConfig;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// WebTransport base, e.g. `https://localhost:4433`
    pub server_url: String,
    /// HTTP base for uploads, e.g. `https://localhost:4433`
    pub http_url: String,
    pub world_id: String,
    pub tls: TlsConfig,
}

impl RemoteConfig {
    pub fn join_url(&self, bot: Option<&BotId>) -> Result<Url, BackendError> {
        match bot {
            Some(bot) => world_url(&self.server_url, &self.world_id, &["bots", bot.as_str()]),
            None => world_url(&self.server_url, &self.world_id, &[]),
        }
    }

    pub fn upload_url(&self) -> Result<Url, BackendError> {
        world_url(&self.http_url, &self.world_id, &["bots"])
    }
}

/// `{base}/worlds/{world}/{tail..}` with every segment percent-encoded
fn world_url(base: &str, world: &str, tail: &[&str]) -> Result<Url, BackendError> {
    let mut url = Url::parse(base)
        .map_err(|e| BackendError::Connect(format!("invalid url '{}': {}", base, e)))?;

    url.path_segments_mut()
        .map_err(|_| BackendError::Connect(format!("'{}' cannot be a base url", base)))?
        .pop_if_empty()
        .push("worlds")
        .push(world)
        .extend(tail);

    Ok(url)
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: BotId,
}

/// Posts bot sources to the world's HTTP endpoint.
///
/// Cloned out of [`RemoteBackend::uploader`] so uploads never wait behind a
/// join that is still handshaking.
#[derive(Clone)]
pub struct Uploader {
    http: reqwest::Client,
    config: RemoteConfig,
    metrics: Arc<ClientMetrics>,
}

impl Uploader {
    pub async fn upload(&self, src: Vec<u8>) -> Result<BotId, BackendError> {
        let response = self
            .http
            .post(self.config.upload_url()?)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(src)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::OK {
            let body: UploadResponse = response.json().await?;
            info!("Uploaded bot {}", body.id);
            Ok(body.id)
        } else {
            let reason = response.text().await?;
            warn!("Upload rejected ({}): {}", status, reason);
            ClientMetrics::incr(&self.metrics.uploads_rejected);
            Err(BackendError::Rejected(reason))
        }
    }
}

/// World hosted by a server; one [`Connection`] per join
pub struct RemoteBackend {
    config: RemoteConfig,
    uploader: Uploader,
    conn: Option<Connection>,
    forwarder: Option<JoinHandle<()>>,
    epoch: Arc<AtomicU64>,
    observer: ObserverSlot,
    metrics: Arc<ClientMetrics>,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Self {
        let metrics = Arc::new(ClientMetrics::new());
        let uploader = Uploader {
            http: reqwest::Client::new(),
            config: config.clone(),
            metrics: metrics.clone(),
        };

        Self {
            config,
            uploader,
            conn: None,
            forwarder: None,
            epoch: Arc::new(AtomicU64::new(0)),
            observer: ObserverSlot::default(),
            metrics,
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn world_id(&self) -> &str {
        &self.config.world_id
    }

    pub async fn join(&mut self, bot: Option<&BotId>) -> Result<UpdateStream, BackendError> {
        let listener = self.invalidate();
        let url = self.config.join_url(bot)?;

        info!("Joining {}", url);

        let mut conn = Connection::new(url.as_str(), self.config.tls.clone());
        let events = conn
            .connect()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        let (sink, stream) = mpsc::unbounded_channel();

        self.forwarder = Some(tokio::spawn(forward(
            listener,
            events,
            self.epoch.clone(),
            sink,
            self.observer.clone(),
            self.metrics.clone(),
        )));
        self.conn = Some(conn);
        self.observer.notify(TransportEvent::Opened);

        Ok(stream)
    }

    pub fn leave(&mut self) {
        self.invalidate();
    }

    pub fn close(&mut self) {
        if self.conn.is_some() || self.forwarder.is_some() {
            debug!("Closing remote backend for {}", self.config.world_id);
        }

        self.invalidate();
    }

    /// Send the viewport size to the server
    pub fn resize(&self, cols: i64, rows: i64) -> Result<(), BackendError> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| BackendError::Connect("not connected".to_string()))?;

        conn.send_control(ControlPacket::resize(cols, rows))
            .map_err(|e| BackendError::Connect(e.to_string()))
    }

    pub async fn upload_bot(&self, src: Vec<u8>) -> Result<BotId, BackendError> {
        self.uploader.upload(src).await
    }

    pub fn uploader(&self) -> Uploader {
        self.uploader.clone()
    }

    pub fn observe(&mut self, observer: mpsc::UnboundedSender<TransportEvent>) {
        self.observer.set(observer);
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    /// Retire the current connection; returns the token of the next join
    fn invalidate(&mut self) -> ListenerToken {
        let listener = ListenerToken(self.epoch.fetch_add(1, Ordering::SeqCst) + 1);

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }

        listener
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        self.invalidate();
    }
}

async fn forward(
    listener: ListenerToken,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    epoch: Arc<AtomicU64>,
    sink: mpsc::UnboundedSender<UpdateMessage>,
    observer: ObserverSlot,
    metrics: Arc<ClientMetrics>,
) {
    while let Some(event) = events.recv().await {
        let current = epoch.load(Ordering::SeqCst) == listener.0;

        match event {
            ConnectionEvent::Message(msg) => {
                if !current {
                    debug!("Dropping update for stale listener {}", listener);
                    ClientMetrics::incr(&metrics.stale_updates_dropped);
                    return;
                }

                if sink.send(msg).is_err() {
                    return;
                }
            }
            ConnectionEvent::Closed => {
                if current {
                    info!("Server closed the session");
                    observer.notify(TransportEvent::Lost);
                }
                return;
            }
            ConnectionEvent::Failed(reason) => {
                if current {
                    warn!("Session failed: {}", reason);
                    observer.notify(TransportEvent::Lost);
                }
                return;
            }
        }
    }
}
