// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Data written by older clients stays readable.
//!
//! The fixtures hold records in the shapes earlier clients produced: voice
//! messages as inline data URLs with `"m:ss"` durations, forwarded messages
//! carrying extra keys and nulls, replies without a `replyToType`, and
//! entries of kinds this client does not know. Every known kind must come
//! through intact and the unknown ones must be left where they are.

use std::sync::Arc;
use std::time::Duration;

use synqx::client::{ClientOptions, SynqxClient};
use synqx::clock::SystemClock;
use synqx::connection::MailboxConnectivity;
use synqx::delivery::DeliveryConfig;
use synqx::mailbox::Mailbox;
use synqx::mailbox::memory::MemoryMailbox;
use synqx::mailbox::remote::RemoteMailbox;
use synqx::storage::persistence::{MemoryPersistence, Persistence};
use synqx_proto::mailbox::MailboxValue;
use synqx_proto::message::{AudioDuration, MessageBody, MessageKind, UserId};
use synqx_proto::path::MailboxPath;

const LEGACY_INBOX: &str = include_str!("../fixtures/legacy_inbox.json");
const LEGACY_HISTORY: &str = include_str!("../fixtures/legacy_history.json");

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn options() -> ClientOptions {
    ClientOptions {
        delivery: DeliveryConfig {
            settle_delay: Duration::from_millis(50),
            watch_timeout: Duration::from_secs(5),
        },
        ..ClientOptions::default()
    }
}

/// Writes every fixture entry into bob's pending inbox from alice.
async fn seed_inbox(mailbox: &impl Mailbox) {
    let entries: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(LEGACY_INBOX).unwrap();
    for (key, raw) in entries {
        let value: MailboxValue = serde_json::from_value(raw).unwrap();
        let path = MailboxPath::pending_entry(&bob(), &alice(), &key).unwrap();
        mailbox.write(&path, value).await.unwrap();
    }
}

#[tokio::test]
async fn legacy_inbox_drains_over_the_wire() {
    let (addr, _handle) = synqx_mailbox::server::start_server("127.0.0.1:0")
        .await
        .unwrap();
    let url = format!("ws://{addr}/ws");

    let seeder = RemoteMailbox::connect(&url).await.unwrap();
    seed_inbox(&seeder).await;

    let mailbox = Arc::new(RemoteMailbox::connect(&url).await.unwrap());
    let source = Arc::new(MailboxConnectivity::new(Arc::clone(&mailbox), true));
    let (bob_client, _events) = SynqxClient::start(
        bob(),
        mailbox,
        Arc::new(MemoryPersistence::new()),
        source,
        Arc::new(SystemClock),
        options(),
    )
    .await;

    let history = bob_client.open_conversation(&alice()).await;
    let kinds: Vec<MessageKind> = history.iter().map(|m| m.kind()).collect();
    assert_eq!(
        kinds,
        [
            MessageKind::Audio,
            MessageKind::Text,
            MessageKind::Text,
            MessageKind::Gif
        ]
    );
    assert!(history.iter().all(|m| m.delivered));

    let MessageBody::Audio { audio, duration } = &history[0].body else {
        unreachable!()
    };
    assert!(audio.starts_with("data:audio/webm"));
    assert_eq!(duration.as_ref().and_then(AudioDuration::as_secs), Some(7.0));
    assert_eq!(history[0].sender_name.as_deref(), Some("Alice"));

    assert_eq!(history[1].body.as_text(), Some("look at this"));

    let reply = history[2].reply_context.as_ref().unwrap();
    assert_eq!(reply.reply_to_type, MessageKind::Text);
    assert_eq!(reply.reply_to_text, "coming tonight?");

    // Only the entry of an unknown kind is left behind.
    let inbox = MailboxPath::pending_inbox(&bob(), &alice()).unwrap();
    let remaining = seeder.list(&inbox).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key, "-Nj5file");
    assert!(matches!(remaining[0].value, MailboxValue::Other(_)));
}

#[tokio::test]
async fn legacy_local_history_survives_new_messages() {
    let persistence = Arc::new(MemoryPersistence::new());
    persistence
        .store("synqx_history_bob_alice", LEGACY_HISTORY)
        .unwrap();
    let mailbox = Arc::new(MemoryMailbox::new());
    let source = Arc::new(MailboxConnectivity::new(Arc::clone(&mailbox), true));
    let (bob_client, _events) = SynqxClient::start(
        bob(),
        mailbox,
        Arc::clone(&persistence),
        source,
        Arc::new(SystemClock),
        options(),
    )
    .await;

    let cached = bob_client.router().cache().load(&alice());
    assert_eq!(cached.len(), 2);
    assert_eq!(cached[1].kind(), MessageKind::Audio);

    bob_client.enqueue(alice(), MessageBody::text("see you").unwrap());
    tokio::time::timeout(Duration::from_secs(5), async {
        while bob_client.queue().pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let cached = bob_client.router().cache().load(&alice());
    assert_eq!(cached.len(), 3);
    let raw: Vec<serde_json::Value> = serde_json::from_str(
        &persistence
            .load("synqx_history_bob_alice")
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(raw.len(), 4);
    assert!(raw.iter().any(|entry| entry["type"] == "file"));
}
