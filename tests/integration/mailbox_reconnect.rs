// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Reconnect behavior of the WebSocket mailbox client.
//!
//! A TCP proxy sits between the client and the mailbox service. Killing the
//! proxy severs the connection without stopping the service, and starting a
//! new proxy on the same port lets the client's backoff redial succeed.
//!
//! These tests validate:
//! - the link state drops and recovers, and requests fail fast while down
//! - watches registered before the outage keep delivering after it
//! - `MailboxConnectivity` reports the outage as offline/online
//! - a message queued during the outage is sent after the reconnect

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use synqx::client::{ClientOptions, SynqxClient};
use synqx::clock::SystemClock;
use synqx::connection::{ConnectivityEvent, ConnectivitySource, MailboxConnectivity};
use synqx::event::ChatEvent;
use synqx::mailbox::remote::{ReconnectConfig, RemoteMailbox};
use synqx::mailbox::{Mailbox, MailboxError};
use synqx::storage::persistence::MemoryPersistence;
use synqx_proto::mailbox::MailboxValue;
use synqx_proto::message::{DeliveryStatus, MessageBody, UserId};
use synqx_proto::path::MailboxPath;
use tokio::sync::{mpsc, watch};

// =============================================================================
// TCP proxy
// =============================================================================

/// Forwards TCP traffic to the mailbox service. `kill()` aborts every
/// connection task, which drops both streams and looks like a network
/// failure to the client.
struct TcpProxy {
    port: u16,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    /// Listens on `port` (0 for any) and forwards to `backend`.
    async fn new(port: u16, backend: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {port}: {e}"));
        let port = listener.local_addr().unwrap().port();
        let backend = backend.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let backend = backend.clone();
                let conn = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    let _ =
                        tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                            .await;
                });
                tracked.lock().push(conn);
            }
        });

        Self {
            port,
            accept_handle,
            conn_handles,
        }
    }

    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Severs every proxied connection and stops accepting new ones.
    async fn kill(self) -> u16 {
        self.accept_handle.abort();
        for handle in self.conn_handles.lock().iter() {
            handle.abort();
        }
        // Let the aborted listener release the port.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.port
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn start_mailbox() -> String {
    let (addr, _handle) = synqx_mailbox::server::start_server("127.0.0.1:0")
        .await
        .expect("failed to start mailbox service");
    addr.to_string()
}

const FAST_RECONNECT: ReconnectConfig = ReconnectConfig {
    initial_delay: Duration::from_millis(50),
    max_delay: Duration::from_millis(200),
};

async fn wait_link(link: &mut watch::Receiver<bool>, up: bool) {
    tokio::time::timeout(Duration::from_secs(10), link.wait_for(|state| *state == up))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for link up={up}"))
        .expect("mailbox dropped");
}

fn path(raw: &str) -> MailboxPath {
    MailboxPath::parse(raw).unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn link_recovers_and_watches_survive() {
    let backend = start_mailbox().await;
    let proxy = TcpProxy::new(0, &backend).await;
    let mailbox = RemoteMailbox::connect_with(&proxy.url(), FAST_RECONNECT)
        .await
        .unwrap();
    let mut link = mailbox.link_state().unwrap();
    assert!(*link.borrow());

    let entry = path("pending_messages/bob/alice/k1");
    let mut sub = mailbox.watch(&entry).await.unwrap();

    let port = proxy.kill().await;
    wait_link(&mut link, false).await;
    assert!(!mailbox.is_connected());
    assert!(matches!(
        mailbox.ping().await,
        Err(MailboxError::ConnectionClosed)
    ));

    let _proxy = TcpProxy::new(port, &backend).await;
    wait_link(&mut link, true).await;
    mailbox.ping().await.unwrap();

    mailbox
        .write(&entry, MailboxValue::Flag(true))
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("watch silent after reconnect")
        .unwrap();
    assert_eq!(event.path, entry);
    assert_eq!(event.value, Some(MailboxValue::Flag(true)));
}

#[tokio::test]
async fn outage_is_reported_as_offline_then_online() {
    let backend = start_mailbox().await;
    let proxy = TcpProxy::new(0, &backend).await;
    let mailbox = Arc::new(
        RemoteMailbox::connect_with(&proxy.url(), FAST_RECONNECT)
            .await
            .unwrap(),
    );
    let source = MailboxConnectivity::new(Arc::clone(&mailbox), true);
    let mut signals = source.subscribe();

    let port = proxy.kill().await;
    let event = tokio::time::timeout(Duration::from_secs(10), signals.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ConnectivityEvent::Offline);
    assert!(!source.is_online());

    let _proxy = TcpProxy::new(port, &backend).await;
    let event = tokio::time::timeout(Duration::from_secs(10), signals.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ConnectivityEvent::Online);
    assert!(source.is_online());
}

#[tokio::test]
async fn message_queued_during_outage_is_sent_after_reconnect() {
    let backend = start_mailbox().await;
    let proxy = TcpProxy::new(0, &backend).await;
    let mailbox = Arc::new(
        RemoteMailbox::connect_with(&proxy.url(), FAST_RECONNECT)
            .await
            .unwrap(),
    );
    let mut link = mailbox.link_state().unwrap();
    let source = Arc::new(MailboxConnectivity::new(Arc::clone(&mailbox), true));
    let (alice, mut events) = SynqxClient::start(
        UserId::new("alice"),
        mailbox,
        Arc::new(MemoryPersistence::new()),
        source,
        Arc::new(SystemClock),
        ClientOptions::default(),
    )
    .await;

    let port = proxy.kill().await;
    wait_link(&mut link, false).await;
    alice.enqueue(UserId::new("bob"), MessageBody::text("sent later").unwrap());

    let _proxy = TcpProxy::new(port, &backend).await;
    wait_for_sent(&mut events).await;

    let direct = RemoteMailbox::connect(&format!("ws://{backend}/ws"))
        .await
        .unwrap();
    let inbox = direct
        .list(&path("pending_messages/bob/alice"))
        .await
        .unwrap();
    assert_eq!(inbox.len(), 1);
}

async fn wait_for_sent(events: &mut mpsc::Receiver<ChatEvent>) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches!(
                event,
                ChatEvent::StatusChanged {
                    status: DeliveryStatus::Sent,
                    ..
                }
            ) {
                return;
            }
        }
    })
    .await
    .expect("queued message never sent");
}
