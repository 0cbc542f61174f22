//! Delivery confirmation over the mailbox service: the sender's watch on
//! the pending entry resolves when a second connection drains it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use synqx::delivery::{DeliveryConfig, DeliveryOutcome, DeliveryTracker, await_delivery};
use synqx::mailbox::Mailbox;
use synqx::mailbox::remote::RemoteMailbox;
use synqx_proto::mailbox::{MailboxValue, PathChange};
use synqx_proto::path::MailboxPath;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn connected_pair() -> (RemoteMailbox, RemoteMailbox) {
    let (addr, _handle) = synqx_mailbox::server::start_server("127.0.0.1:0")
        .await
        .unwrap();
    let url = format!("ws://{addr}/ws");
    let sender = RemoteMailbox::connect(&url).await.unwrap();
    let recipient = RemoteMailbox::connect(&url).await.unwrap();
    (sender, recipient)
}

fn fast() -> DeliveryConfig {
    DeliveryConfig {
        settle_delay: Duration::from_millis(20),
        watch_timeout: Duration::from_secs(3),
    }
}

fn entry(key: &str) -> MailboxPath {
    MailboxPath::parse(&format!("pending_messages/bob/alice/{key}")).unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drain_from_other_connection_is_delivery() {
    let (sender, recipient) = connected_pair().await;
    sender
        .write(&entry("k1"), MailboxValue::Flag(true))
        .await
        .unwrap();

    let drain = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        recipient.remove(&entry("k1")).await.unwrap();
    });

    let outcome = await_delivery(&sender, &entry("k1"), fast()).await;
    assert_eq!(outcome, DeliveryOutcome::Delivered);
    drain.await.unwrap();
}

#[tokio::test]
async fn drain_before_watch_is_delivery() {
    let (sender, recipient) = connected_pair().await;
    sender
        .write(&entry("k1"), MailboxValue::Flag(true))
        .await
        .unwrap();
    recipient.remove(&entry("k1")).await.unwrap();

    let outcome = await_delivery(&sender, &entry("k1"), fast()).await;
    assert_eq!(outcome, DeliveryOutcome::Delivered);
}

#[tokio::test]
async fn undrained_entry_times_out() {
    let (sender, _recipient) = connected_pair().await;
    sender
        .write(&entry("k1"), MailboxValue::Flag(true))
        .await
        .unwrap();
    let config = DeliveryConfig {
        watch_timeout: Duration::from_millis(300),
        ..fast()
    };
    let outcome = await_delivery(&sender, &entry("k1"), config).await;
    assert_eq!(outcome, DeliveryOutcome::TimedOut);
    assert!(sender.read_once(&entry("k1")).await.unwrap().is_some());
}

#[tokio::test]
async fn batched_drain_resolves_every_watch() {
    let (sender, recipient) = connected_pair().await;
    let sender = Arc::new(sender);
    let tracker = DeliveryTracker::new(Arc::clone(&sender), fast());
    let delivered = Arc::new(AtomicUsize::new(0));

    for key in ["k1", "k2", "k3"] {
        sender
            .write(&entry(key), MailboxValue::Flag(true))
            .await
            .unwrap();
        let count = Arc::clone(&delivered);
        tracker.track(entry(key), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(tracker.active_count(), 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    recipient
        .update(vec![
            PathChange::remove(entry("k1")),
            PathChange::remove(entry("k2")),
            PathChange::remove(entry("k3")),
        ])
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(3), async {
        while delivered.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(tracker.active_count(), 0);
}

#[tokio::test]
async fn sibling_removal_does_not_confirm() {
    let (sender, recipient) = connected_pair().await;
    for key in ["k1", "k2"] {
        sender
            .write(&entry(key), MailboxValue::Flag(true))
            .await
            .unwrap();
    }
    let config = DeliveryConfig {
        watch_timeout: Duration::from_millis(500),
        ..fast()
    };

    let drain = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        recipient.remove(&entry("k2")).await.unwrap();
    });

    let outcome = await_delivery(&sender, &entry("k1"), config).await;
    assert_eq!(outcome, DeliveryOutcome::TimedOut);
    drain.await.unwrap();
}
