//! Offline behavior of the send queue through the full client: messages
//! queued while offline survive a restart, flush on reconnect, and exhaust
//! their retry budget against a failing mailbox.

use std::sync::Arc;
use std::time::Duration;

use synqx::client::{ClientOptions, SynqxClient};
use synqx::clock::ManualClock;
use synqx::connection::{ConnectionQuality, MailboxConnectivity};
use synqx::event::ChatEvent;
use synqx::mailbox::memory::MemoryMailbox;
use synqx::queue::PENDING_STORAGE_KEY;
use synqx::storage::persistence::{MemoryPersistence, Persistence};
use synqx_proto::message::{DeliveryStatus, MessageBody, Timestamp, UserId};
use synqx_proto::path::MailboxPath;
use tokio::sync::mpsc;

type Client =
    SynqxClient<MemoryMailbox, MemoryPersistence, MailboxConnectivity<MemoryMailbox>, ManualClock>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Device {
    client: Client,
    events: mpsc::Receiver<ChatEvent>,
    source: Arc<MailboxConnectivity<MemoryMailbox>>,
}

async fn boot(
    mailbox: &MemoryMailbox,
    storage: &Arc<MemoryPersistence>,
    clock: &Arc<ManualClock>,
    online: bool,
) -> Device {
    let shared = Arc::new(mailbox.clone());
    let source = Arc::new(MailboxConnectivity::new(Arc::clone(&shared), online));
    let (client, events) = SynqxClient::start(
        UserId::new("alice"),
        shared,
        Arc::clone(storage),
        Arc::clone(&source),
        Arc::clone(clock),
        ClientOptions::default(),
    )
    .await;
    Device {
        client,
        events,
        source,
    }
}

fn text(s: &str) -> MessageBody {
    MessageBody::text(s).unwrap()
}

fn bob_inbox() -> MailboxPath {
    MailboxPath::parse("pending_messages/bob/alice").unwrap()
}

fn drain(events: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn statuses(events: &[ChatEvent]) -> Vec<DeliveryStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::StatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn queued_offline_survives_restart_and_flushes_online() {
    let mailbox = MemoryMailbox::new();
    let storage = Arc::new(MemoryPersistence::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));

    let first = boot(&mailbox, &storage, &clock, false).await;
    first.client.enqueue(UserId::new("bob"), text("one"));
    first.client.enqueue(UserId::new("bob"), text("two"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(first.client.get_connection_quality().pending_count, 2);
    assert!(storage.load(PENDING_STORAGE_KEY).unwrap().is_some());
    drop(first);

    clock.advance(Duration::from_secs(3600));
    let mut second = boot(&mailbox, &storage, &clock, false).await;
    assert_eq!(second.client.queue().pending_count(), 2);
    assert!(mailbox.children(&bob_inbox()).is_empty());

    second.source.set_online(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(second.client.queue().pending_count(), 0);
    let mut texts: Vec<_> = mailbox
        .children(&bob_inbox())
        .into_iter()
        .filter_map(|c| c.value.into_message())
        .map(|r| r.body.as_text().unwrap_or_default().to_string())
        .collect();
    texts.sort();
    assert_eq!(texts, ["one", "two"]);
    assert_eq!(
        statuses(&drain(&mut second.events)),
        [DeliveryStatus::Sent, DeliveryStatus::Sent]
    );
}

#[tokio::test(start_paused = true)]
async fn stale_items_are_not_restored() {
    let mailbox = MemoryMailbox::new();
    let storage = Arc::new(MemoryPersistence::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));

    let first = boot(&mailbox, &storage, &clock, false).await;
    first.client.enqueue(UserId::new("bob"), text("old"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(first);

    clock.advance(Duration::from_secs(25 * 3600));
    let second = boot(&mailbox, &storage, &clock, true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(second.client.queue().pending_count(), 0);
    assert!(mailbox.children(&bob_inbox()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failing_mailbox_exhausts_retries_then_manual_retry_succeeds() {
    let mailbox = MemoryMailbox::new();
    let storage = Arc::new(MemoryPersistence::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(5_000)));
    let mut device = boot(&mailbox, &storage, &clock, true).await;
    drain(&mut device.events);

    mailbox.fail_next_writes(5);
    let start = tokio::time::Instant::now();
    let id = device.client.enqueue(UserId::new("bob"), text("stubborn"));

    // Backoff of 1 + 2 + 5 + 10 seconds between the five attempts.
    tokio::time::sleep(Duration::from_secs(19)).await;
    assert!(start.elapsed() >= Duration::from_secs(18));
    assert_eq!(device.client.queue().failed().len(), 1);
    assert_eq!(device.client.queue().pending_count(), 0);
    let seen = statuses(&drain(&mut device.events));
    assert_eq!(seen.first(), Some(&DeliveryStatus::Sending));
    assert_eq!(seen.last(), Some(&DeliveryStatus::Failed));

    assert!(device.client.retry_message(&id));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(device.client.queue().failed().is_empty());
    assert_eq!(mailbox.children(&bob_inbox()).len(), 1);
    assert_eq!(
        statuses(&drain(&mut device.events)),
        [DeliveryStatus::Sending, DeliveryStatus::Sent]
    );
}

#[tokio::test(start_paused = true)]
async fn slow_link_is_reported_in_snapshot() {
    let mailbox = MemoryMailbox::new();
    let storage = Arc::new(MemoryPersistence::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(5_000)));
    let device = boot(&mailbox, &storage, &clock, true).await;

    mailbox.set_latency(Duration::from_millis(900));
    let state = device.client.check_connectivity().await;
    assert!(state.online);
    assert_eq!(state.quality, ConnectionQuality::Slow);

    let snapshot = device.client.get_connection_quality();
    assert_eq!(snapshot.quality, ConnectionQuality::Slow);
    assert!(snapshot.is_online);
}

#[tokio::test(start_paused = true)]
async fn cancelled_message_is_never_sent() {
    let mailbox = MemoryMailbox::new();
    let storage = Arc::new(MemoryPersistence::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(5_000)));
    let device = boot(&mailbox, &storage, &clock, false).await;

    let id = device.client.enqueue(UserId::new("bob"), text("never mind"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(device.client.cancel(&id));

    device.source.set_online(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mailbox.children(&bob_inbox()).is_empty());
}
