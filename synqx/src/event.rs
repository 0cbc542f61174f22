//! Events emitted by the client core for the UI layer.

use synqx_proto::message::{DeliveryStatus, StoredMessage, Timestamp};
use tokio::sync::mpsc;

use crate::connection::ConnectionState;

/// Whether a rendered message was sent or received by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outgoing.
    Sent,
    /// Incoming.
    Received,
}

/// Notifications the UI should render.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A message should be displayed (optimistically for outgoing ones).
    MessageRendered {
        /// The message to display.
        message: StoredMessage,
        /// Which side of the conversation it belongs to.
        direction: Direction,
    },
    /// A displayed message's status icon changed.
    StatusChanged {
        /// Timestamp identifying the displayed message.
        timestamp: Timestamp,
        /// The new status.
        status: DeliveryStatus,
    },
    /// Connectivity or quality changed.
    ConnectionChanged(ConnectionState),
}

/// Hands `event` to the UI without blocking. A full or closed channel drops
/// the event.
pub(crate) fn emit(events: &mpsc::Sender<ChatEvent>, event: ChatEvent) {
    if let Err(e) = events.try_send(event) {
        tracing::debug!(error = %e, "event channel full or closed, dropping event");
    }
}
