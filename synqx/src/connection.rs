//! Connection quality monitoring.
//!
//! The [`ConnectionMonitor`] keeps a last-writer-wins estimate of network
//! reachability and quality from three signals:
//!
//! - online/offline events from a [`ConnectivitySource`] (authoritative for
//!   the offline state)
//! - network hints (effective connection type and downlink)
//! - a periodic latency probe against the mailbox
//!
//! The current [`ConnectionState`] is published on a `watch` channel so the
//! send queue can gate processing and pick its timeout without polling.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::event::{self, ChatEvent};
use crate::mailbox::Mailbox;

/// Coarse network quality bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Low latency, high bandwidth.
    Good,
    /// Reachable but slow or unstable.
    Slow,
    /// Not reachable.
    Offline,
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Good => "good",
            Self::Slow => "slow",
            Self::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Process-wide connectivity estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Whether the network is reachable at all.
    pub online: bool,
    /// Current quality bucket.
    pub quality: ConnectionQuality,
}

impl ConnectionState {
    /// State for a client that starts online.
    #[must_use]
    pub const fn online() -> Self {
        Self {
            online: true,
            quality: ConnectionQuality::Good,
        }
    }

    /// State for a client that starts offline.
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            online: false,
            quality: ConnectionQuality::Offline,
        }
    }
}

/// What the UI sees from `get_connection_quality`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Current quality bucket.
    pub quality: ConnectionQuality,
    /// Whether the network is reachable.
    pub is_online: bool,
    /// Messages waiting in the send queue, including the one in flight.
    pub pending_count: usize,
}

/// Effective connection type reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveType {
    /// `slow-2g`.
    Slow2g,
    /// `2g`.
    TwoG,
    /// `3g`.
    ThreeG,
    /// `4g`.
    FourG,
}

/// Platform network-information hint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkHint {
    /// Effective connection type.
    pub effective_type: EffectiveType,
    /// Estimated downlink bandwidth in Mbit/s.
    pub downlink_mbps: f64,
}

impl NetworkHint {
    /// Downlink above which a 4g link counts as good.
    const GOOD_DOWNLINK_MBPS: f64 = 5.0;

    /// Quality bucket this hint implies.
    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        if self.effective_type == EffectiveType::FourG
            && self.downlink_mbps > Self::GOOD_DOWNLINK_MBPS
        {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Slow
        }
    }
}

/// A connectivity signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectivityEvent {
    /// The network came back.
    Online,
    /// The network went away.
    Offline,
    /// The platform reported new link characteristics.
    Hint(NetworkHint),
}

/// Errors from a latency probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The probe did not complete in time.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// The probe request failed.
    #[error("probe failed: {0}")]
    Failed(String),
}

/// Source of connectivity signals.
///
/// Dropping the receiver returned by [`ConnectivitySource::subscribe`]
/// unsubscribes.
pub trait ConnectivitySource: Send + Sync + 'static {
    /// Subscribes to connectivity events.
    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent>;

    /// Whether the platform currently reports the network as up.
    fn is_online(&self) -> bool;

    /// Measures one round trip to the backend.
    fn probe(&self) -> impl Future<Output = Result<Duration, ProbeError>> + Send;
}

// ---------------------------------------------------------------------------
// Mailbox-backed source
// ---------------------------------------------------------------------------

/// Connectivity source that probes by pinging a mailbox.
///
/// Online/offline state and hints are pushed in by the embedding
/// application via [`MailboxConnectivity::set_online`] and
/// [`MailboxConnectivity::report_hint`]. When the mailbox exposes a
/// transport link (see [`Mailbox::link_state`]), link drops and recoveries
/// are reported as offline and online transitions too.
pub struct MailboxConnectivity<M> {
    mailbox: Arc<M>,
    online: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectivityEvent>,
    link_follower: Option<tokio::task::JoinHandle<()>>,
}

impl<M: Mailbox> MailboxConnectivity<M> {
    /// Creates a source that reports `online` initially.
    ///
    /// Following the mailbox link needs a Tokio runtime; outside one only
    /// the pushed signals are reported.
    pub fn new(mailbox: Arc<M>, online: bool) -> Self {
        let (events, _) = broadcast::channel(32);
        let online = Arc::new(AtomicBool::new(online));
        let link_follower = mailbox.link_state().and_then(|link| {
            let runtime = tokio::runtime::Handle::try_current().ok()?;
            Some(runtime.spawn(follow_link(link, Arc::clone(&online), events.clone())))
        });
        Self {
            mailbox,
            online,
            events,
            link_follower,
        }
    }

    /// Records a platform online/offline transition.
    pub fn set_online(&self, online: bool) {
        transition(&self.online, &self.events, online);
    }

    /// Records a platform network hint.
    pub fn report_hint(&self, hint: NetworkHint) {
        let _ = self.events.send(ConnectivityEvent::Hint(hint));
    }
}

impl<M> Drop for MailboxConnectivity<M> {
    fn drop(&mut self) {
        if let Some(follower) = self.link_follower.take() {
            follower.abort();
        }
    }
}

/// Stores `online` and announces it if it differs from the previous value.
fn transition(flag: &AtomicBool, events: &broadcast::Sender<ConnectivityEvent>, online: bool) {
    let was = flag.swap(online, Ordering::SeqCst);
    if was != online {
        let event = if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        };
        let _ = events.send(event);
    }
}

async fn follow_link(
    mut link: watch::Receiver<bool>,
    online: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectivityEvent>,
) {
    while link.changed().await.is_ok() {
        let up = *link.borrow_and_update();
        tracing::debug!(up, "mailbox link changed");
        transition(&online, &events, up);
    }
}

impl<M: Mailbox> ConnectivitySource for MailboxConnectivity<M> {
    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        self.mailbox
            .ping()
            .await
            .map_err(|e| ProbeError::Failed(e.to_string()))?;
        Ok(start.elapsed())
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Probe cadence and latency thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between latency probes.
    pub probe_interval: Duration,
    /// Probe deadline; a probe that takes longer counts as failed.
    pub probe_timeout: Duration,
    /// Round trips below this are good; anything slower is slow.
    pub good_latency: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            good_latency: Duration::from_millis(500),
        }
    }
}

impl MonitorConfig {
    /// Quality bucket for a measured round trip.
    ///
    /// A long round trip is still slow, not offline: only the offline
    /// signal marks the connection offline.
    #[must_use]
    pub fn classify(&self, latency: Duration) -> ConnectionQuality {
        if latency < self.good_latency {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Slow
        }
    }
}

/// Tracks connectivity and publishes [`ConnectionState`] changes.
pub struct ConnectionMonitor<S> {
    source: Arc<S>,
    config: MonitorConfig,
    state: watch::Sender<ConnectionState>,
}

impl<S: ConnectivitySource> ConnectionMonitor<S> {
    /// Creates a monitor seeded from the source's current online flag.
    pub fn new(source: Arc<S>, config: MonitorConfig) -> Self {
        let initial = if source.is_online() {
            ConnectionState::online()
        } else {
            ConnectionState::offline()
        };
        let (state, _) = watch::channel(initial);
        Self {
            source,
            config,
            state,
        }
    }

    /// The current estimate.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Applies one connectivity event. Returns the new state if it changed.
    pub fn apply(&self, event: ConnectivityEvent) -> Option<ConnectionState> {
        self.modify(|state| match event {
            ConnectivityEvent::Online => state.online = true,
            ConnectivityEvent::Offline => {
                state.online = false;
                state.quality = ConnectionQuality::Offline;
            }
            ConnectivityEvent::Hint(hint) => state.quality = hint.quality(),
        })
    }

    /// Runs one connectivity check: offline if the platform says so,
    /// otherwise a timed probe whose latency picks the quality bucket.
    /// Returns the new state if it changed.
    pub async fn check_connectivity(&self) -> Option<ConnectionState> {
        if !self.source.is_online() {
            return self.modify(|state| *state = ConnectionState::offline());
        }

        let result = tokio::time::timeout(self.config.probe_timeout, self.source.probe())
            .await
            .map_err(|_| ProbeError::Timeout(self.config.probe_timeout))
            .and_then(|r| r);

        match result {
            Ok(latency) => {
                let quality = self.config.classify(latency);
                tracing::debug!(latency_ms = latency.as_millis(), %quality, "probe complete");
                self.modify(|state| {
                    state.online = true;
                    state.quality = quality;
                })
            }
            Err(e) => {
                tracing::debug!(error = %e, "connectivity probe failed");
                self.modify(|state| state.quality = ConnectionQuality::Slow)
            }
        }
    }

    fn modify(&self, edit: impl FnOnce(&mut ConnectionState)) -> Option<ConnectionState> {
        let mut changed = None;
        self.state.send_if_modified(|state| {
            let before = *state;
            edit(state);
            if *state == before {
                false
            } else {
                changed = Some(*state);
                true
            }
        });
        if let Some(state) = changed {
            tracing::info!(online = state.online, quality = %state.quality, "connection state changed");
        }
        changed
    }

    /// Spawns the monitoring loop: applies every source event, probes on
    /// each interval tick and right after coming back online, and reports
    /// changes as [`ChatEvent::ConnectionChanged`].
    pub fn spawn(self: &Arc<Self>, events: mpsc::Sender<ChatEvent>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut signals = self.source.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial state is
            // already seeded from the source.
            ticker.tick().await;

            loop {
                let changed = tokio::select! {
                    signal = signals.recv() => match signal {
                        Ok(event) => {
                            let mut changed = monitor.apply(event);
                            if event == ConnectivityEvent::Online {
                                changed = monitor.check_connectivity().await.or(changed);
                            }
                            changed
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "connectivity events lagged");
                            monitor.check_connectivity().await
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => monitor.check_connectivity().await,
                };
                if let Some(state) = changed {
                    event::emit(&events, ChatEvent::ConnectionChanged(state));
                }
            }
        })
    }
}
