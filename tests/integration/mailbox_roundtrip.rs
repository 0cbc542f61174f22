//! End-to-end message flow between two clients through a real mailbox
//! service over WebSocket.
//!
//! Covers the offline-recipient path (pending inbox drained on open), the
//! live-listener path (confirmation while viewing), and permanent history
//! when both users keep backups.

use std::sync::Arc;
use std::time::Duration;

use synqx::client::{ClientOptions, SynqxClient};
use synqx::clock::SystemClock;
use synqx::connection::MailboxConnectivity;
use synqx::delivery::DeliveryConfig;
use synqx::event::{ChatEvent, Direction};
use synqx::mailbox::remote::RemoteMailbox;
use synqx::storage::persistence::MemoryPersistence;
use synqx_proto::message::{DeliveryStatus, MessageBody, UserId};
use tokio::sync::mpsc;

type Client =
    SynqxClient<RemoteMailbox, MemoryPersistence, MailboxConnectivity<RemoteMailbox>, SystemClock>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_mailbox() -> String {
    let (addr, _handle) = synqx_mailbox::server::start_server("127.0.0.1:0")
        .await
        .unwrap();
    format!("ws://{addr}/ws")
}

async fn client(url: &str, name: &str, chat_backup: bool) -> (Client, mpsc::Receiver<ChatEvent>) {
    let mailbox = Arc::new(RemoteMailbox::connect(url).await.unwrap());
    let source = Arc::new(MailboxConnectivity::new(Arc::clone(&mailbox), true));
    let options = ClientOptions {
        delivery: DeliveryConfig {
            settle_delay: Duration::from_millis(50),
            watch_timeout: Duration::from_secs(5),
        },
        chat_backup,
        ..ClientOptions::default()
    };
    SynqxClient::start(
        UserId::new(name),
        mailbox,
        Arc::new(MemoryPersistence::new()),
        source,
        Arc::new(SystemClock),
        options,
    )
    .await
}

/// Waits up to five seconds for an event matching `pred`.
async fn wait_for(
    events: &mut mpsc::Receiver<ChatEvent>,
    pred: impl Fn(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_status(status: DeliveryStatus) -> impl Fn(&ChatEvent) -> bool {
    move |event| matches!(event, ChatEvent::StatusChanged { status: s, .. } if *s == status)
}

fn text(s: &str) -> MessageBody {
    MessageBody::text(s).unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_recipient_receives_on_open() {
    let url = start_mailbox().await;
    let (alice, mut alice_events) = client(&url, "alice", false).await;

    alice.enqueue(UserId::new("bob"), text("are you there?"));
    wait_for(&mut alice_events, is_status(DeliveryStatus::Sent)).await;

    let (bob, _bob_events) = client(&url, "bob", false).await;
    let history = bob.open_conversation(&UserId::new("alice")).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].body.as_text(), Some("are you there?"));
    assert_eq!(history[0].sender_id, UserId::new("alice"));
    assert!(history[0].delivered);

    wait_for(&mut alice_events, is_status(DeliveryStatus::Delivered)).await;
    let cached = alice.router().cache().load(&UserId::new("bob"));
    assert!(cached[0].delivered);
}

#[tokio::test]
async fn viewing_recipient_confirms_live() {
    let url = start_mailbox().await;
    let (alice, mut alice_events) = client(&url, "alice", false).await;
    let (bob, mut bob_events) = client(&url, "bob", false).await;

    assert!(bob.open_conversation(&UserId::new("alice")).await.is_empty());

    alice.enqueue(UserId::new("bob"), text("live one"));

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageRendered { direction: Direction::Received, .. })
    })
    .await;
    let ChatEvent::MessageRendered { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message.body.as_text(), Some("live one"));

    wait_for(&mut alice_events, is_status(DeliveryStatus::Delivered)).await;
    let history = bob.get_history(&UserId::new("alice"), 50).await;
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn backups_survive_a_fresh_install() {
    let url = start_mailbox().await;
    let (alice, mut alice_events) = client(&url, "alice", true).await;
    let (bob, _bob_events) = client(&url, "bob", true).await;

    alice.enqueue(UserId::new("bob"), text("keep me"));
    wait_for(&mut alice_events, is_status(DeliveryStatus::Sent)).await;
    bob.open_conversation(&UserId::new("alice")).await;

    // Empty local cache; history comes from the permanent copy alone.
    let (fresh, _events) = client(&url, "alice", true).await;
    let history = fresh.get_history(&UserId::new("bob"), 50).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].body.as_text(), Some("keep me"));
    drop(alice);
}

#[tokio::test]
async fn history_merges_sources_in_order() {
    let url = start_mailbox().await;
    let (alice, mut alice_events) = client(&url, "alice", false).await;
    let (bob, mut bob_events) = client(&url, "bob", false).await;

    alice.enqueue(UserId::new("bob"), text("first"));
    wait_for(&mut alice_events, is_status(DeliveryStatus::Sent)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.enqueue(UserId::new("alice"), text("second"));
    wait_for(&mut bob_events, is_status(DeliveryStatus::Sent)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    alice.enqueue(UserId::new("bob"), text("third"));
    wait_for(&mut alice_events, is_status(DeliveryStatus::Sent)).await;

    let history = bob.open_conversation(&UserId::new("alice")).await;
    let texts: Vec<_> = history.iter().filter_map(|m| m.body.as_text()).collect();
    assert_eq!(texts, ["first", "second", "third"]);
}
