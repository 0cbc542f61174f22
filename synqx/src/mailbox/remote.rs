//! WebSocket client for the `synqx-mailbox` service.
//!
//! Requests are multiplexed over one connection: each carries a fresh id and
//! its reply is routed back through a oneshot channel. Watch notifications
//! are routed by the id of the `watch` request that created them.
//!
//! A supervisor task owns the socket. When the connection drops it fails
//! every outstanding request, reports the link as down, and redials with
//! exponential backoff. After a successful redial it re-sends every live
//! watch under its original id, so subscriptions survive the outage. Changes
//! made while the link was down are not replayed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use synqx_proto::codec;
use synqx_proto::mailbox::{
    ChildEntry, ClientFrame, MailboxEvent, MailboxValue, PathChange, ServerFrame,
};
use synqx_proto::path::MailboxPath;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Mailbox, MailboxError, Subscription};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Default timeout for connecting to the mailbox service.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Redial backoff after the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first redial.
    pub initial_delay: Duration,
    /// Upper bound for the doubling delay.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Delay before redial number `attempt` (1-based): doubles from
    /// `initial_delay` and is capped at `max_delay`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// A live watch, kept so it can be re-sent after a reconnect.
struct WatchRoute {
    path: MailboxPath,
    tx: mpsc::UnboundedSender<MailboxEvent>,
}

/// State shared between the mailbox handle and its supervisor.
struct Shared {
    url: String,
    /// Write channel of the current connection; `None` while down.
    out: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>,
    watches: Mutex<HashMap<u64, WatchRoute>>,
    link: watch::Sender<bool>,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.out.lock().clone()
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), MailboxError> {
        let text = codec::encode(frame)?;
        let out = self.sender().ok_or(MailboxError::ConnectionClosed)?;
        out.send(Message::Text(text.into()))
            .map_err(|_| MailboxError::ConnectionClosed)
    }

    /// Installs the write channel of a fresh connection and re-sends every
    /// live watch on it.
    fn attach(&self, out: mpsc::UnboundedSender<Message>) {
        let watches = self.watches.lock();
        for (id, route) in watches.iter() {
            let frame = ClientFrame::Watch {
                id: *id,
                path: route.path.clone(),
            };
            match codec::encode(&frame) {
                Ok(text) => {
                    let _ = out.send(Message::Text(text.into()));
                }
                Err(e) => tracing::warn!(watch = id, err = %e, "cannot re-send watch"),
            }
        }
        *self.out.lock() = Some(out);
        drop(watches);
        self.link.send_replace(true);
    }

    /// Marks the link down and fails every request still waiting for a
    /// reply. Watches are kept for the next connection.
    fn detach(&self) {
        *self.out.lock() = None;
        self.pending.lock().clear();
        self.link.send_replace(false);
    }
}

/// Mailbox backed by a WebSocket connection to the mailbox service.
pub struct RemoteMailbox {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout: Duration,
    supervisor: tokio::task::JoinHandle<()>,
}

impl RemoteMailbox {
    /// Connect to the mailbox service at `url` (`ws://` or `wss://`) with
    /// the default reconnect backoff.
    ///
    /// # Errors
    ///
    /// - [`MailboxError::InvalidUrl`] if `url` is not a WebSocket URL.
    /// - [`MailboxError::Timeout`] if the connection is not established
    ///   within 10 seconds.
    /// - [`MailboxError::Unreachable`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, MailboxError> {
        Self::connect_with(url, ReconnectConfig::default()).await
    }

    /// Like [`RemoteMailbox::connect`], redialing with `reconnect` after the
    /// connection drops.
    ///
    /// # Errors
    ///
    /// Same as [`RemoteMailbox::connect`]. Only the first dial can fail;
    /// later outages are retried in the background.
    pub async fn connect_with(url: &str, reconnect: ReconnectConfig) -> Result<Self, MailboxError> {
        let parsed = url::Url::parse(url).map_err(|e| MailboxError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(MailboxError::InvalidUrl(format!(
                "unsupported scheme `{}`",
                parsed.scheme()
            )));
        }

        let stream = dial(url).await?;
        let (link, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            url: url.to_string(),
            out: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            link,
        });
        let (out, rx) = mpsc::unbounded_channel();
        shared.attach(out);
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), stream, rx, reconnect));

        tracing::info!(url, "connected to mailbox service");

        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            request_timeout: REQUEST_TIMEOUT,
            supervisor,
        })
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The service URL this mailbox is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Whether the WebSocket connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.shared.link.borrow()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `frame` (whose id is `id`) and waits for its reply.
    async fn request(&self, id: u64, frame: &ClientFrame) -> Result<ServerFrame, MailboxError> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        if let Err(e) = self.shared.send(frame) {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(MailboxError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                tracing::warn!(id, "mailbox request timed out");
                return Err(MailboxError::Timeout);
            }
        };

        match reply {
            ServerFrame::Error { reason, .. } => Err(MailboxError::Rejected(reason)),
            other => Ok(other),
        }
    }

    async fn expect_ack(&self, id: u64, frame: &ClientFrame) -> Result<(), MailboxError> {
        match self.request(id, frame).await? {
            ServerFrame::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(frame: &ServerFrame) -> MailboxError {
    tracing::warn!(?frame, "unexpected mailbox reply");
    MailboxError::Rejected("unexpected reply".to_string())
}

impl Mailbox for RemoteMailbox {
    async fn write(&self, path: &MailboxPath, value: MailboxValue) -> Result<(), MailboxError> {
        let id = self.next_id();
        let frame = ClientFrame::Write {
            id,
            path: path.clone(),
            value,
        };
        self.expect_ack(id, &frame).await
    }

    async fn update(&self, changes: Vec<PathChange>) -> Result<(), MailboxError> {
        let id = self.next_id();
        self.expect_ack(id, &ClientFrame::Update { id, changes })
            .await
    }

    async fn remove(&self, path: &MailboxPath) -> Result<(), MailboxError> {
        let id = self.next_id();
        let frame = ClientFrame::Remove {
            id,
            path: path.clone(),
        };
        self.expect_ack(id, &frame).await
    }

    async fn read_once(&self, path: &MailboxPath) -> Result<Option<MailboxValue>, MailboxError> {
        let id = self.next_id();
        let frame = ClientFrame::Read {
            id,
            path: path.clone(),
        };
        match self.request(id, &frame).await? {
            ServerFrame::Value { value, .. } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn list(&self, path: &MailboxPath) -> Result<Vec<ChildEntry>, MailboxError> {
        let id = self.next_id();
        let frame = ClientFrame::List {
            id,
            path: path.clone(),
        };
        match self.request(id, &frame).await? {
            ServerFrame::Children { entries, .. } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    async fn watch(&self, path: &MailboxPath) -> Result<Subscription, MailboxError> {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // Route before sending so a change racing the ack is not lost.
        self.shared.watches.lock().insert(
            id,
            WatchRoute {
                path: path.clone(),
                tx,
            },
        );

        let frame = ClientFrame::Watch {
            id,
            path: path.clone(),
        };
        if let Err(e) = self.expect_ack(id, &frame).await {
            self.shared.watches.lock().remove(&id);
            return Err(e);
        }

        let shared = Arc::clone(&self.shared);
        Ok(Subscription::new(path.clone(), rx, move || {
            shared.watches.lock().remove(&id);
            let _ = shared.send(&ClientFrame::Unwatch { watch: id });
        }))
    }

    async fn ping(&self) -> Result<(), MailboxError> {
        let id = self.next_id();
        match self.request(id, &ClientFrame::Ping { id }).await? {
            ServerFrame::Pong { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn link_state(&self) -> Option<watch::Receiver<bool>> {
        Some(self.shared.link.subscribe())
    }
}

impl Drop for RemoteMailbox {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn dial(url: &str) -> Result<WsStream, MailboxError> {
    let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| {
            tracing::warn!(url, "mailbox WebSocket connect timed out");
            MailboxError::Timeout
        })?
        .map_err(|e| {
            tracing::warn!(url, err = %e, "mailbox WebSocket connect failed");
            MailboxError::Unreachable(e.to_string())
        })?;
    Ok(stream)
}

/// Owns the socket for the lifetime of the mailbox: runs one connection
/// until it drops, then redials with backoff and runs the next.
async fn supervise(
    shared: Arc<Shared>,
    mut stream: WsStream,
    mut rx: mpsc::UnboundedReceiver<Message>,
    reconnect: ReconnectConfig,
) {
    loop {
        run_connection(&shared, stream, rx).await;
        shared.detach();
        tracing::warn!(url = %shared.url, "mailbox connection lost, reconnecting");

        let mut attempt = 0u32;
        stream = loop {
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(reconnect.delay(attempt)).await;
            match dial(&shared.url).await {
                Ok(stream) => break stream,
                Err(e) => tracing::debug!(attempt, err = %e, "mailbox redial failed"),
            }
        };

        let (out, next_rx) = mpsc::unbounded_channel();
        rx = next_rx;
        shared.attach(out);
        tracing::info!(url = %shared.url, attempt, "reconnected to mailbox service");
    }
}

/// Pumps one connection until either direction fails.
async fn run_connection(
    shared: &Shared,
    stream: WsStream,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let (mut ws_sender, ws_reader) = stream.split();
    let writer = async {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                tracing::warn!(err = %e, "mailbox send failed");
                break;
            }
        }
    };
    tokio::select! {
        () = writer => {}
        () = reader_loop(ws_reader, shared) => {}
    }
}

/// Reads server frames and routes them.
///
/// A reply that cannot be decoded fails its request instead of leaving it to
/// time out. Other malformed frames are logged and skipped.
async fn reader_loop(mut ws_reader: WsReader, shared: &Shared) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match codec::decode::<ServerFrame>(text.as_str()) {
                Ok(ServerFrame::Changed { watch, path, value }) => {
                    let routes = shared.watches.lock();
                    if let Some(route) = routes.get(&watch) {
                        let _ = route.tx.send(MailboxEvent { path, value });
                    }
                }
                Ok(frame) => match frame.request_id() {
                    Some(id) => {
                        if let Some(reply) = shared.pending.lock().remove(&id) {
                            let _ = reply.send(frame);
                        }
                    }
                    None => {
                        tracing::warn!(?frame, "mailbox error without request id");
                    }
                },
                Err(e) => {
                    tracing::warn!(err = %e, "malformed mailbox frame, skipping");
                    if let Some(id) = frame_id(text.as_str())
                        && let Some(reply) = shared.pending.lock().remove(&id)
                    {
                        let _ = reply.send(ServerFrame::Error {
                            id: Some(id),
                            reason: "malformed reply".to_string(),
                        });
                    }
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("mailbox WebSocket closed by server");
                break;
            }
            Ok(_) => {
                // Ignore ping/pong/binary frames.
            }
            Err(e) => {
                tracing::warn!(err = %e, "mailbox WebSocket read error");
                break;
            }
        }
    }
}

/// The request id of a frame that failed to decode, if it has one.
fn frame_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("id")?
        .as_u64()
}
