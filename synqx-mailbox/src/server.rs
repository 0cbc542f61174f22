//! Mailbox server core: shared state, WebSocket handler, and request
//! dispatch.
//!
//! Each connection is split into a writer task fed by an unbounded channel
//! and a reader task that decodes [`ClientFrame`]s and answers them. A
//! `watch` request spawns a forwarder that relays matching store events to
//! the connection until the client sends `unwatch` or disconnects. A
//! forwarder that falls behind the store's change feed is handled by the
//! configured [`LagPolicy`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use synqx_proto::codec::{self, MAX_FRAME_SIZE};
use synqx_proto::mailbox::{ClientFrame, MailboxEvent, ServerFrame};
use synqx_proto::path::MailboxPath;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

use crate::config::MailboxConfig;
use crate::store::MailboxStore;

/// What to do when a watcher misses changes because it fell behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LagPolicy {
    /// Log the gap and keep forwarding newer changes.
    #[default]
    Skip,
    /// Close the connection so the client reconnects and re-reads state.
    Disconnect,
}

/// Shared server state holding the store and connection limits.
pub struct ServerState {
    /// The keyed store all connections share.
    pub store: MailboxStore,
    max_frame_size: usize,
    lag_policy: LagPolicy,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Creates a server state with an empty store and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: MailboxStore::new(),
            max_frame_size: MAX_FRAME_SIZE,
            lag_policy: LagPolicy::default(),
        }
    }

    /// Creates a server state with an empty store sized by `config`.
    #[must_use]
    pub fn from_config(config: &MailboxConfig) -> Self {
        Self {
            store: MailboxStore::with_limits(config.store),
            max_frame_size: config.max_frame_size,
            lag_policy: config.lag_policy,
        }
    }
}

/// Watch forwarders owned by one connection. Dropping the set stops them.
#[derive(Default)]
struct WatchSet(HashMap<u64, AbortHandle>);

impl WatchSet {
    fn insert(&mut self, id: u64, handle: AbortHandle) {
        if let Some(old) = self.0.insert(id, handle) {
            old.abort();
        }
    }

    fn cancel(&mut self, id: u64) -> bool {
        match self.0.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for WatchSet {
    fn drop(&mut self) {
        for handle in self.0.values() {
            handle.abort();
        }
    }
}

/// Handles an upgraded WebSocket connection for a single client.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    tracing::debug!("mailbox client connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!("WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        let mut watches = WatchSet::default();
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text(text.as_str(), &reader_state, &tx, &mut watches).await;
                }
                Message::Binary(_) => {
                    send_frame(
                        &tx,
                        &ServerFrame::Error {
                            id: None,
                            reason: "binary frames are not supported".to_string(),
                        },
                    );
                }
                Message::Close(_) => {
                    tracing::debug!("received close frame");
                    break;
                }
                _ => {
                    // Ping/pong are answered by the WebSocket layer.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    tracing::debug!("mailbox client disconnected");
}

/// Decodes one text frame and dispatches it.
async fn handle_text(
    text: &str,
    state: &Arc<ServerState>,
    out: &mpsc::UnboundedSender<Message>,
    watches: &mut WatchSet,
) {
    let frame: ClientFrame = match codec::decode_with_limit(text, state.max_frame_size) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode client frame");
            send_frame(
                out,
                &ServerFrame::Error {
                    id: None,
                    reason: e.to_string(),
                },
            );
            return;
        }
    };

    match frame {
        ClientFrame::Write { id, path, value } => {
            tracing::debug!(path = %path, "write");
            state.store.write(path, value).await;
            send_frame(out, &ServerFrame::Ack { id });
        }
        ClientFrame::Update { id, changes } => {
            tracing::debug!(changes = changes.len(), "update");
            state.store.update(changes).await;
            send_frame(out, &ServerFrame::Ack { id });
        }
        ClientFrame::Remove { id, path } => {
            tracing::debug!(path = %path, "remove");
            state.store.remove(path).await;
            send_frame(out, &ServerFrame::Ack { id });
        }
        ClientFrame::Read { id, path } => {
            let value = state.store.read(&path).await;
            send_frame(out, &ServerFrame::Value { id, value });
        }
        ClientFrame::List { id, path } => {
            let entries = state.store.list(&path).await;
            send_frame(out, &ServerFrame::Children { id, entries });
        }
        ClientFrame::Watch { id, path } => {
            // Subscribe before acking so no change after the ack is missed.
            let events = state.store.subscribe();
            tracing::debug!(watch = id, path = %path, "watch registered");
            send_frame(out, &ServerFrame::Ack { id });
            let handle = tokio::spawn(forward_events(
                id,
                path,
                events,
                out.clone(),
                state.lag_policy,
            ));
            watches.insert(id, handle.abort_handle());
        }
        ClientFrame::Unwatch { watch } => {
            if !watches.cancel(watch) {
                tracing::debug!(watch, "unwatch for unknown subscription");
            }
        }
        ClientFrame::Ping { id } => {
            send_frame(out, &ServerFrame::Pong { id });
        }
    }
}

/// Relays store events at or beneath `path` to one connection.
async fn forward_events(
    watch: u64,
    path: MailboxPath,
    mut events: broadcast::Receiver<MailboxEvent>,
    out: mpsc::UnboundedSender<Message>,
    lag_policy: LagPolicy,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if !path.contains(&event.path) {
                    continue;
                }
                let frame = ServerFrame::Changed {
                    watch,
                    path: event.path,
                    value: event.value,
                };
                if !send_frame(&out, &frame) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => match lag_policy {
                LagPolicy::Skip => {
                    tracing::warn!(watch, skipped, "watcher lagged, changes dropped");
                }
                LagPolicy::Disconnect => {
                    tracing::warn!(watch, skipped, "watcher lagged, closing connection");
                    let _ = out.send(Message::Close(None));
                    break;
                }
            },
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Encodes a frame and queues it on the connection's writer. Returns `false`
/// once the writer has gone away.
fn send_frame(out: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) -> bool {
    match codec::encode(frame) {
        Ok(text) => out.send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server frame");
            true
        }
    }
}

/// Starts the mailbox server on the given address and returns the bound
/// address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the mailbox server with a pre-configured [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "mailbox server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
