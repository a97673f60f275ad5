//! Client side of one WebTransport session.
//!
//! A [`Connection`] owns exactly one session. `connect()` succeeds at most once
//! per instance; retrying means building a new instance, which the backend and
//! the reconnection controller do.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wtransport::endpoint::endpoint_side::Client;
use wtransport::{Endpoint, SendStream, VarInt};

use crate::net::framing::{read_message, validate_datagram_size, write_message, FramingError};
use crate::net::protocol::{decode, encode, ClientMessage, ControlPacket, EncodeError, UpdateMessage};
use crate::net::tls::TlsConfig;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `connect()` not called yet
    Idle,
    /// Session handshake in progress
    Connecting,
    /// Session open, updates flowing
    Connected,
    /// Operator requested close
    Disconnecting,
    /// Closed or failed; the instance cannot be reused
    Disconnected,
}

/// Deliveries from a connection to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Message(UpdateMessage),
    /// Peer closed the stream or the session
    Closed,
    /// Transport error
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connect() already called on this connection")]
    AlreadyUsed,
    #[error("Not connected")]
    NotConnected,
    #[error("Failed to connect: {0}")]
    Connecting(String),
    #[error("Failed to open stream: {0}")]
    Stream(String),
    #[error("Failed to send datagram: {0}")]
    Datagram(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Terminal-signal arbitration shared by the reader and the session watcher.
///
/// Both "stream closed" and "session errored" may fire for a single loss; the
/// first one wins and the other is suppressed. After an operator close neither
/// fires, so a deliberate close never looks like a failure.
#[derive(Debug, Default)]
pub(crate) struct Signals {
    closing: AtomicBool,
    terminated: AtomicBool,
}

impl Signals {
    pub(crate) fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Claim the right to report the terminal event
    pub(crate) fn fire_terminal(&self) -> bool {
        if self.is_closing() {
            return false;
        }
        !self.terminated.swap(true, Ordering::SeqCst)
    }
}

/// One WebTransport session to a world
pub struct Connection {
    pub id: u64,
    url: String,
    tls: TlsConfig,
    state: ConnectionState,
    signals: Arc<Signals>,
    endpoint: Option<Endpoint<Client>>,
    session: Option<Arc<wtransport::Connection>>,
    writer: Option<Arc<Mutex<SendStream>>>,
    tasks: Vec<JoinHandle<()>>,
    pub created_at: Instant,
}

impl Connection {
    pub fn new(url: impl Into<String>, tls: TlsConfig) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            url: url.into(),
            tls,
            state: ConnectionState::Idle,
            signals: Arc::new(Signals::default()),
            endpoint: None,
            session: None,
            writer: None,
            tasks: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Open the session and start delivering messages.
    ///
    /// Resolves once the session and its stream are open. The returned channel
    /// yields decoded updates followed by at most one terminal event.
    pub async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, ConnectionError> {
        if self.state != ConnectionState::Idle {
            return Err(ConnectionError::AlreadyUsed);
        }

        self.state = ConnectionState::Connecting;
        debug!("Connecting to {} (conn_id: {})", self.url, self.id);

        match self.open().await {
            Ok(rx) => {
                self.state = ConnectionState::Connected;
                info!("Connected to {} (conn_id: {})", self.url, self.id);
                Ok(rx)
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                debug!("Connection to {} failed: {}", self.url, e);
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, ConnectionError> {
        let endpoint = Endpoint::client(self.tls.client_config())?;

        let session = endpoint
            .connect(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Connecting(e.to_string()))?;

        let (mut send, recv) = session
            .open_bi()
            .await
            .map_err(|e| ConnectionError::Stream(e.to_string()))?
            .await
            .map_err(|e| ConnectionError::Stream(e.to_string()))?;

        write_message(&mut send, &encode(&ClientMessage::hello())?).await?;

        let session = Arc::new(session);
        let (tx, rx) = mpsc::unbounded_channel();

        self.tasks.push(tokio::spawn(pump(
            recv,
            tx.clone(),
            self.signals.clone(),
        )));

        self.tasks.push(tokio::spawn(watch_session(
            session.clone(),
            tx,
            self.signals.clone(),
        )));

        self.endpoint = Some(endpoint);
        self.session = Some(session);
        self.writer = Some(Arc::new(Mutex::new(send)));

        Ok(rx)
    }

    /// Send a length-prefixed frame on the update stream
    pub async fn send_frame(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let writer = self.writer.as_ref().ok_or(ConnectionError::NotConnected)?;
        let mut writer = writer.lock().await;
        write_message(&mut *writer, data).await?;
        Ok(())
    }

    /// Send an out-of-band control packet as a datagram
    pub fn send_control(&self, packet: ControlPacket) -> Result<(), ConnectionError> {
        let session = self.session.as_ref().ok_or(ConnectionError::NotConnected)?;
        let bytes = packet.encode();
        validate_datagram_size(&bytes)?;

        session
            .send_datagram(bytes)
            .map_err(|e| ConnectionError::Datagram(e.to_string()))
    }

    /// Close the session; no deliveries happen afterwards. Idempotent.
    pub fn close(&mut self) {
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Disconnecting)
            && self.tasks.is_empty()
        {
            self.state = ConnectionState::Disconnected;
            return;
        }

        self.state = ConnectionState::Disconnecting;
        self.signals.request_close();

        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(session) = self.session.take() {
            session.close(VarInt::from_u32(0), b"closing");
        }

        self.writer = None;
        self.endpoint = None;
        self.state = ConnectionState::Disconnected;

        debug!("Connection closed (conn_id: {})", self.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read frames from the update stream until it ends
pub(crate) async fn pump<R: AsyncRead + Unpin>(
    mut recv: R,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    signals: Arc<Signals>,
) {
    loop {
        match read_message(&mut recv).await {
            Ok(frame) => {
                if signals.is_closing() {
                    return;
                }

                match decode::<UpdateMessage>(&frame) {
                    Ok(msg) => {
                        if events.send(ConnectionEvent::Message(msg)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping undecodable frame ({} bytes): {}", frame.len(), e);
                    }
                }
            }
            Err(FramingError::ConnectionClosed) => {
                if signals.fire_terminal() {
                    let _ = events.send(ConnectionEvent::Closed);
                }
                return;
            }
            Err(e) => {
                if signals.fire_terminal() {
                    let _ = events.send(ConnectionEvent::Failed(e.to_string()));
                }
                return;
            }
        }
    }
}

async fn watch_session(
    session: Arc<wtransport::Connection>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    signals: Arc<Signals>,
) {
    let reason = session.closed().await;

    if signals.fire_terminal() {
        debug!("Session ended: {}", reason);
        let _ = events.send(ConnectionEvent::Failed(reason.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn frame(json: &str) -> Vec<u8> {
        let mut out = (json.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(json.as_bytes());
        out
    }

    #[test]
    fn test_connection_new() {
        let conn = Connection::new("https://localhost:4433/worlds/w", TlsConfig::native());
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.url(), "https://localhost:4433/worlds/w");
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = Connection::new("https://a", TlsConfig::native());
        let b = Connection::new("https://a", TlsConfig::native());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_close_before_connect_is_idempotent() {
        let mut conn = Connection::new("https://a", TlsConfig::native());
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let mut conn = Connection::new("https://a", TlsConfig::native());
        conn.close();
        assert!(matches!(conn.connect().await, Err(ConnectionError::AlreadyUsed)));
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let conn = Connection::new("https://a", TlsConfig::native());
        assert!(matches!(conn.send_frame(b"{}").await, Err(ConnectionError::NotConnected)));
        assert!(matches!(
            conn.send_control(ControlPacket::resize(10, 10)),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn test_first_terminal_signal_wins() {
        let signals = Signals::default();
        assert!(signals.fire_terminal());
        assert!(!signals.fire_terminal());
    }

    #[test]
    fn test_close_suppresses_terminal_signal() {
        let signals = Signals::default();
        signals.request_close();
        assert!(!signals.fire_terminal());
    }

    #[tokio::test]
    async fn test_pump_delivers_in_order_then_closes_once() {
        use tokio::io::AsyncWriteExt;

        let (mut server, client) = duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let signals = Arc::new(Signals::default());

        let task = tokio::spawn(pump(client, tx, signals.clone()));

        server.write_all(&frame(r#"{"mode":{}}"#)).await.unwrap();
        server.write_all(&frame("not json")).await.unwrap();
        server.write_all(&frame(r#"{"bots":{}}"#)).await.unwrap();
        drop(server);

        task.await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ConnectionEvent::Message(ref m) if m.mode.is_some()));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ConnectionEvent::Message(ref m) if m.bots.is_some()));

        assert_eq!(rx.recv().await, Some(ConnectionEvent::Closed));
        assert_eq!(rx.recv().await, None);

        // The watcher losing the race must stay silent
        assert!(!signals.fire_terminal());
    }

    #[tokio::test]
    async fn test_pump_after_close_is_silent() {
        use tokio::io::AsyncWriteExt;

        let (mut server, client) = duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let signals = Arc::new(Signals::default());
        signals.request_close();

        let task = tokio::spawn(pump(client, tx, signals));

        server.write_all(&frame(r#"{"mode":{}}"#)).await.unwrap();
        drop(server);
        task.await.unwrap();

        assert_eq!(rx.recv().await, None);
    }
}
