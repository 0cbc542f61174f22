//! The client service object.
//!
//! [`SynqxClient`] is constructed once per signed-in user with its
//! dependencies injected (mailbox, persistence, connectivity source, clock)
//! and wires the router, send queue, and connection monitor together. It is
//! the surface the UI talks to; everything the UI needs to render arrives on
//! the [`ChatEvent`] receiver returned by [`SynqxClient::start`].

use std::sync::Arc;

use synqx_proto::message::{MessageBody, StoredMessage, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::connection::{
    ConnectionMonitor, ConnectionSnapshot, ConnectionState, ConnectivitySource, MonitorConfig,
};
use crate::delivery::DeliveryConfig;
use crate::event::ChatEvent;
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::mailbox::Mailbox;
use crate::queue::{QueueConfig, QueuedId, SendQueue};
use crate::router::{DeleteTarget, MessageRouter, OutgoingMessage, RouterError};
use crate::storage::cache::{DEFAULT_CACHE_CAP, LocalCache};
use crate::storage::persistence::Persistence;

/// Pipeline settings for a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Retry budget, backoff, and send timeouts.
    pub queue: QueueConfig,
    /// Delivery handshake timing.
    pub delivery: DeliveryConfig,
    /// Connection probe cadence and thresholds.
    pub connection: MonitorConfig,
    /// Messages returned when a conversation is opened.
    pub history_limit: usize,
    /// Messages kept per conversation in the local cache.
    pub local_cache_cap: usize,
    /// Capacity of the UI event channel.
    pub event_buffer: usize,
    /// Whether the local user keeps a permanent backup.
    pub chat_backup: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            connection: MonitorConfig::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            local_cache_cap: DEFAULT_CACHE_CAP,
            event_buffer: 256,
            chat_backup: false,
        }
    }
}

type Router<M, P> = MessageRouter<M, P>;

/// One user's message delivery pipeline.
pub struct SynqxClient<M, P, S, C> {
    me: UserId,
    clock: Arc<C>,
    router: Arc<Router<M, P>>,
    queue: SendQueue<Router<M, P>, P, C>,
    monitor: Arc<ConnectionMonitor<S>>,
    history_limit: usize,
    tasks: Vec<JoinHandle<()>>,
    /// Publishes the offline status in the background; taken by
    /// [`SynqxClient::shutdown`], otherwise run on drop.
    retract_presence: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<M, P, S, C> SynqxClient<M, P, S, C>
where
    M: Mailbox,
    P: Persistence,
    S: ConnectivitySource,
    C: Clock,
{
    /// Builds the pipeline for `me`, restores any persisted outbound
    /// messages, and starts the background tasks.
    ///
    /// Returns the client and the receiver of UI events.
    pub async fn start(
        me: UserId,
        mailbox: Arc<M>,
        persistence: Arc<P>,
        source: Arc<S>,
        clock: Arc<C>,
        options: ClientOptions,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (events, events_rx) = mpsc::channel(options.event_buffer);

        let cache = Arc::new(LocalCache::new(
            Arc::clone(&persistence),
            me.clone(),
            options.local_cache_cap,
        ));
        let router = Arc::new(MessageRouter::new(
            me.clone(),
            mailbox,
            cache,
            options.delivery,
            events.clone(),
        ));
        if let Err(e) = router.set_backup_enabled(options.chat_backup).await {
            tracing::warn!(error = %e, "could not publish backup preference");
        }
        let retract_presence = match router.update_online_status(true, clock.now()).await {
            Ok(()) => Some(presence_retractor(&router, &clock)),
            Err(e) => {
                tracing::warn!(error = %e, "could not publish online status");
                None
            }
        };

        let monitor = Arc::new(ConnectionMonitor::new(source, options.connection));
        let queue = SendQueue::new(
            me.clone(),
            Arc::clone(&router),
            persistence,
            Arc::clone(&clock),
            options.queue,
            monitor.subscribe(),
            events.clone(),
        );

        let restored = queue.restore();
        let mut tasks = vec![
            monitor.spawn(events),
            queue.spawn_resume_on_reconnect(),
        ];
        if restored > 0 {
            let resumed = queue.clone();
            tasks.push(tokio::spawn(async move { resumed.process_queue().await }));
        }

        tracing::info!(user = %me, restored, "client started");
        let client = Self {
            me,
            clock,
            router,
            queue,
            monitor,
            history_limit: options.history_limit,
            tasks,
            retract_presence,
        };
        (client, events_rx)
    }

    /// The local user.
    #[must_use]
    pub const fn me(&self) -> &UserId {
        &self.me
    }

    /// The message router.
    #[must_use]
    pub const fn router(&self) -> &Arc<Router<M, P>> {
        &self.router
    }

    /// The send queue.
    #[must_use]
    pub const fn queue(&self) -> &SendQueue<Router<M, P>, P, C> {
        &self.queue
    }

    /// The connection monitor.
    #[must_use]
    pub const fn monitor(&self) -> &Arc<ConnectionMonitor<S>> {
        &self.monitor
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queues `body` for `recipient`, timestamped now.
    pub fn enqueue(&self, recipient: UserId, body: MessageBody) -> QueuedId {
        let message = OutgoingMessage::new(body, self.clock.now());
        self.queue.enqueue(recipient, message)
    }

    /// Queues a fully specified message (sender name, reply context).
    pub fn enqueue_message(&self, recipient: UserId, message: OutgoingMessage) -> QueuedId {
        self.queue.enqueue(recipient, message)
    }

    /// Requeues a failed message. Returns `false` if `id` is not failed.
    pub fn retry_message(&self, id: &QueuedId) -> bool {
        self.queue.retry_message(id)
    }

    /// Drops a queued message that is not currently being sent.
    pub fn cancel(&self, id: &QueuedId) -> bool {
        self.queue.cancel(id)
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// The `limit` most recent messages with `peer`.
    pub async fn get_history(&self, peer: &UserId, limit: usize) -> Vec<StoredMessage> {
        self.router.get_history(peer, limit).await
    }

    /// Makes `peer` the conversation being viewed: starts live listeners,
    /// drains and confirms pending messages, and returns the history.
    pub async fn open_conversation(&self, peer: &UserId) -> Vec<StoredMessage> {
        self.router.set_active_peer(Some(peer.clone()));
        if let Err(e) = self.router.listen_for_messages(peer).await {
            tracing::warn!(peer = %peer, error = %e, "could not attach live listeners");
        }
        self.router.fetch_pending(peer).await;
        self.router.get_history(peer, self.history_limit).await
    }

    /// Stops viewing `peer`; live listeners are detached.
    pub fn close_conversation(&self, peer: &UserId) {
        if self.router.is_viewing(peer) {
            self.router.set_active_peer(None);
        }
        self.router.detach_listener(peer);
    }

    /// Deletes a message. See [`MessageRouter::delete_message`].
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the mailbox cannot be read or updated.
    pub async fn delete_message(
        &self,
        peer: &UserId,
        target: DeleteTarget,
        for_everyone: bool,
    ) -> Result<usize, RouterError> {
        self.router.delete_message(peer, target, for_everyone).await
    }

    /// Clears the conversation with `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the mailbox update fails.
    pub async fn clear_conversation(&self, peer: &UserId) -> Result<(), RouterError> {
        self.router.clear_conversation(peer).await
    }

    /// Changes and publishes the local backup preference.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the preference could not be published.
    pub async fn set_backup_enabled(&self, enabled: bool) -> Result<(), RouterError> {
        self.router.set_backup_enabled(enabled).await
    }

    // -----------------------------------------------------------------------
    // Connectivity
    // -----------------------------------------------------------------------

    /// Current quality, reachability, and queue depth.
    #[must_use]
    pub fn get_connection_quality(&self) -> ConnectionSnapshot {
        let ConnectionState { online, quality } = self.monitor.state();
        ConnectionSnapshot {
            quality,
            is_online: online,
            pending_count: self.queue.pending_count(),
        }
    }

    /// Runs a connectivity check now instead of waiting for the next probe.
    pub async fn check_connectivity(&self) -> ConnectionState {
        self.monitor.check_connectivity().await;
        self.monitor.state()
    }

    /// Publishes the user as offline and stops the client.
    pub async fn shutdown(mut self) {
        if self.retract_presence.take().is_some()
            && let Err(e) = self.router.update_online_status(false, self.clock.now()).await
        {
            tracing::warn!(error = %e, "could not publish offline status");
        }
        tracing::info!(user = %self.me, "client stopped");
    }
}

/// Builds the drop-time fallback of [`SynqxClient::shutdown`]: marks the
/// user offline from a background task, if a runtime is still around.
fn presence_retractor<M, P, C>(
    router: &Arc<Router<M, P>>,
    clock: &Arc<C>,
) -> Box<dyn FnOnce() + Send + Sync>
where
    M: Mailbox,
    P: Persistence,
    C: Clock,
{
    let router = Arc::clone(router);
    let clock = Arc::clone(clock);
    Box::new(move || {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let last_seen = clock.now();
        runtime.spawn(async move {
            if let Err(e) = router.update_online_status(false, last_seen).await {
                tracing::debug!(error = %e, "could not publish offline status");
            }
        });
    })
}

impl<M, P, S, C> Drop for SynqxClient<M, P, S, C> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(retract) = self.retract_presence.take() {
            retract();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connection::{ConnectionQuality, MailboxConnectivity};
    use crate::mailbox::memory::MemoryMailbox;
    use crate::storage::persistence::MemoryPersistence;
    use std::time::Duration;
    use synqx_proto::message::{DeliveryStatus, Timestamp};

    type TestClient = SynqxClient<
        MemoryMailbox,
        MemoryPersistence,
        MailboxConnectivity<MemoryMailbox>,
        ManualClock,
    >;

    struct User {
        client: TestClient,
        events: mpsc::Receiver<ChatEvent>,
        source: Arc<MailboxConnectivity<MemoryMailbox>>,
    }

    async fn user(mailbox: &MemoryMailbox, name: &str, online: bool) -> User {
        let shared = Arc::new(mailbox.clone());
        let source = Arc::new(MailboxConnectivity::new(Arc::clone(&shared), online));
        let (client, events) = SynqxClient::start(
            UserId::new(name),
            shared,
            Arc::new(MemoryPersistence::new()),
            Arc::clone(&source),
            Arc::new(ManualClock::new(Timestamp::from_millis(1_000))),
            ClientOptions::default(),
        )
        .await;
        User {
            client,
            events,
            source,
        }
    }

    fn text(s: &str) -> MessageBody {
        MessageBody::text(s).unwrap()
    }

    fn drain(events: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_queue_depth() {
        let mailbox = MemoryMailbox::new();
        let alice = user(&mailbox, "alice", false).await;
        alice.client.enqueue(UserId::new("bob"), text("hi"));
        alice.client.enqueue(UserId::new("bob"), text("there"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = alice.client.get_connection_quality();
        assert_eq!(snapshot.pending_count, 2);
        assert!(!snapshot.is_online);
        assert_eq!(snapshot.quality, ConnectionQuality::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn coming_online_flushes_the_queue() {
        let mailbox = MemoryMailbox::new();
        let mut alice = user(&mailbox, "alice", false).await;
        alice.client.enqueue(UserId::new("bob"), text("hello"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drain(&mut alice.events);

        alice.source.set_online(true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(alice.client.queue().pending_count(), 0);
        let events = drain(&mut alice.events);
        assert!(events.contains(&ChatEvent::StatusChanged {
            timestamp: Timestamp::from_millis(1_000),
            status: DeliveryStatus::Sent,
        }));
        let inbox = synqx_proto::path::MailboxPath::parse("pending_messages/bob/alice").unwrap();
        assert_eq!(mailbox.children(&inbox).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_conversation_drains_and_returns_history() {
        let mailbox = MemoryMailbox::new();
        let alice = user(&mailbox, "alice", true).await;
        let bob = user(&mailbox, "bob", true).await;

        alice.client.enqueue(UserId::new("bob"), text("one"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let history = bob.client.open_conversation(&UserId::new("alice")).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body.as_text(), Some("one"));
        assert!(history[0].delivered);
        assert!(bob.client.router().is_viewing(&UserId::new("alice")));

        bob.client.close_conversation(&UserId::new("alice"));
        assert!(!bob.client.router().is_viewing(&UserId::new("alice")));
        assert_eq!(bob.client.router().listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_follows_client_lifetime() {
        let mailbox = MemoryMailbox::new();
        let status = synqx_proto::path::MailboxPath::parse("users/alice/status").unwrap();
        let alice = user(&mailbox, "alice", true).await;
        let online = mailbox.get(&status).unwrap();
        assert!(online.as_presence().unwrap().online);

        alice.client.shutdown().await;
        let offline = mailbox.get(&status).unwrap();
        let offline = offline.as_presence().unwrap();
        assert!(!offline.online);
        assert_eq!(offline.last_seen, Timestamp::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_client_retracts_presence() {
        let mailbox = MemoryMailbox::new();
        let status = synqx_proto::path::MailboxPath::parse("users/bob/status").unwrap();
        let bob = user(&mailbox, "bob", true).await;
        drop(bob);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!mailbox.get(&status).unwrap().as_presence().unwrap().online);
    }

    #[tokio::test(start_paused = true)]
    async fn backup_preference_is_published() {
        let mailbox = MemoryMailbox::new();
        let alice = user(&mailbox, "alice", true).await;
        alice.client.set_backup_enabled(true).await.unwrap();
        let path = synqx_proto::path::MailboxPath::parse("users/alice/settings/chatBackup").unwrap();
        assert_eq!(
            mailbox.get(&path).and_then(|v| v.as_flag()),
            Some(true)
        );
    }
}
