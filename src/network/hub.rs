//! The transport hub: a room-oriented publish/subscribe bus between the
//! server and its connected browsers.
//!
//! Each browser has exactly one duplex connection, registered here under a
//! [`ConnectionId`]; rooms group connections for broadcast. The hub is
//! transport-agnostic: a websocket layer registers an outbound sender per
//! connection and forwards decoded inbound messages to the owning
//! subsystem, calling [`TransportHub::handle_ack`] for ack replies.
//!
//! Delivery is best-effort — a dropped message is tolerated everywhere
//! except the acked-emit path, which retries critical payloads (episode
//! exports) until acknowledged or retries exhaust.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::network::messages::{AckStatus, ClientMessage, ServerMessage};
use crate::ConnectionId;

/// An inbound message together with its originating connection, as handed
/// to the subsystem that owns its kind.
#[derive(Debug)]
pub struct InboundEvent {
    /// The connection the message arrived on.
    pub connection: ConnectionId,
    /// The decoded message.
    pub message: ClientMessage,
}

/// Errors raised by hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The connection is not registered (or its receiver was dropped).
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    /// An acked emit exhausted its retries without an acknowledgment.
    #[error("acked emit not acknowledged after {attempts} attempts")]
    AckTimeout {
        /// Number of send attempts made.
        attempts: u32,
    },
    /// The peer acknowledged with an error status.
    #[error("acked emit rejected by the peer")]
    AckRejected,
}

/// The room-oriented message bus.
#[derive(Debug, Default)]
pub struct TransportHub {
    connections: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>,
    rooms: Mutex<HashMap<String, HashSet<ConnectionId>>>,
    next_ack: AtomicU64,
    pending_acks: Mutex<HashMap<u64, mpsc::Sender<AckStatus>>>,
}

impl TransportHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns the receiver the transport layer
    /// pumps to the browser.
    pub fn register(&self, connection: ConnectionId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().insert(connection, tx);
        rx
    }

    /// Removes a connection and its room memberships.
    pub fn deregister(&self, connection: ConnectionId) {
        self.connections.lock().remove(&connection);
        let mut rooms = self.rooms.lock();
        for members in rooms.values_mut() {
            members.remove(&connection);
        }
        rooms.retain(|_, members| !members.is_empty());
    }

    /// Adds a connection to a room.
    pub fn join_room(&self, room: &str, connection: ConnectionId) {
        self.rooms
            .lock()
            .entry(room.to_owned())
            .or_default()
            .insert(connection);
    }

    /// Removes a connection from a room.
    pub fn leave_room(&self, room: &str, connection: ConnectionId) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&connection);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Dissolves a room entirely (session teardown).
    pub fn release_room(&self, room: &str) {
        self.rooms.lock().remove(room);
    }

    /// Current members of a room.
    #[must_use]
    pub fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .lock()
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Unicasts a message. Returns after the message is queued on the
    /// connection's outbound channel.
    ///
    /// # Errors
    /// [`HubError::UnknownConnection`] if the connection is gone; the dead
    /// entry is cleaned up.
    pub fn send(&self, connection: ConnectionId, message: ServerMessage) -> Result<(), HubError> {
        let mut connections = self.connections.lock();
        match connections.get(&connection) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    connections.remove(&connection);
                    return Err(HubError::UnknownConnection(connection));
                }
                Ok(())
            }
            None => Err(HubError::UnknownConnection(connection)),
        }
    }

    /// Fans a message out to every member of a room, optionally excluding
    /// one connection. Dead members are skipped silently.
    pub fn broadcast(&self, room: &str, message: &ServerMessage, exclude: Option<ConnectionId>) {
        for member in self.room_members(room) {
            if Some(member) == exclude {
                continue;
            }
            if let Err(err) = self.send(member, message.clone()) {
                debug!(%err, room, "broadcast skipped dead member");
            }
        }
    }

    /// Emits a message with an acknowledgment requirement, resending at
    /// `retry_timeout` cadence until the peer replies `ok` or
    /// `max_retries` resends are exhausted.
    ///
    /// Used for critical payloads (episode-data delivery). Failure is for
    /// the caller to log — it must never take the session down.
    ///
    /// # Errors
    /// [`HubError::AckTimeout`] after exhausting retries,
    /// [`HubError::AckRejected`] on an explicit error ack, or
    /// [`HubError::UnknownConnection`] if the connection disappears.
    pub async fn send_acked(
        &self,
        connection: ConnectionId,
        message: ServerMessage,
        retry_timeout: Duration,
        max_retries: u32,
    ) -> Result<(), HubError> {
        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel(1);
        self.pending_acks.lock().insert(ack_id, tx);

        let envelope = ServerMessage::Acked {
            ack_id,
            inner: Box::new(message),
        };
        let attempts = max_retries + 1;
        let result = async {
            for attempt in 0..attempts {
                if let Err(err) = self.send(connection, envelope.clone()) {
                    return Err(err);
                }
                match timeout(retry_timeout, rx.recv()).await {
                    Ok(Some(AckStatus::Ok)) => return Ok(()),
                    Ok(Some(AckStatus::Error)) => return Err(HubError::AckRejected),
                    Ok(None) | Err(_) => {
                        debug!(ack_id, attempt, "ack missing; resending");
                    }
                }
            }
            Err(HubError::AckTimeout { attempts })
        }
        .await;

        self.pending_acks.lock().remove(&ack_id);
        if let Err(err) = &result {
            warn!(%err, ack_id, "acked emit failed");
        }
        result
    }

    /// Pre-routes an inbound message: acknowledgments are consumed by the
    /// hub itself, everything else is handed back for dispatch to the
    /// subsystem registered for its kind.
    pub fn route_inbound(
        &self,
        connection: ConnectionId,
        message: ClientMessage,
    ) -> Option<InboundEvent> {
        match message {
            ClientMessage::Ack { ack_id, status } => {
                self.handle_ack(ack_id, status);
                None
            }
            message => Some(InboundEvent {
                connection,
                message,
            }),
        }
    }

    /// Routes an inbound acknowledgment to its waiting emit.
    pub fn handle_ack(&self, ack_id: u64, status: AckStatus) {
        let pending = self.pending_acks.lock().get(&ack_id).cloned();
        match pending {
            Some(tx) => {
                let _ = tx.try_send(status);
            }
            None => debug!(ack_id, "ack for unknown or completed emit"),
        }
    }
}

// #########
// # TESTS #
// #########
