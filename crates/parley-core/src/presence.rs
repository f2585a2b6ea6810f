//! Presence tracking for Parley.
//!
//! The registry maps each online user to the single connection that
//! currently represents them. Every mutation happens inside one critical
//! section, and presence changes are broadcast from inside that same
//! section so subscribers observe them in registry order.

use crate::ids::{ConnectionId, UserId};
use crate::message::now_millis;
use parley_protocol::ServerEvent;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

/// Default presence broadcast capacity.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Outbound queue of a single connection.
///
/// Enqueueing never blocks; the connection's handler drains the queue
/// onto the transport.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Outbox {
    /// Wrap an existing sender.
    #[must_use]
    pub fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { connection_id, tx }
    }

    /// Create an outbox and the receiver its handler drains.
    #[must_use]
    pub fn channel(connection_id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(connection_id, tx), rx)
    }

    /// The connection this outbox belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Enqueue an event.
    ///
    /// Returns `false` if the connection is already gone; the event is dropped.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(err) => {
                trace!(
                    connection = %self.connection_id,
                    event = err.0.name(),
                    "Dropped event for closed connection"
                );
                false
            }
        }
    }
}

/// A presence change, broadcast to every registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// User became reachable.
    Online(UserId),
    /// User is no longer reachable.
    Offline(UserId),
}

impl PresenceChange {
    /// The wire event for this change.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        match self {
            PresenceChange::Online(user) => ServerEvent::PresenceOnline {
                user_id: user.to_string(),
            },
            PresenceChange::Offline(user) => ServerEvent::PresenceOffline {
                user_id: user.to_string(),
            },
        }
    }
}

/// The connection currently representing a user.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// When the connection registered, Unix epoch milliseconds.
    pub connected_at: u64,
    outbox: Outbox,
}

impl PresenceEntry {
    fn new(outbox: Outbox) -> Self {
        Self {
            connection_id: outbox.connection_id().clone(),
            connected_at: now_millis(),
            outbox,
        }
    }

    /// The outbox of the registered connection.
    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}

/// Result of [`PresenceRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    /// Connection that was replaced, if the user was already present.
    pub superseded: Option<ConnectionId>,
    /// Presence changes from the moment of registration onwards.
    pub changes: broadcast::Receiver<PresenceChange>,
}

/// Shared map from user to active connection.
#[derive(Debug)]
pub struct PresenceRegistry {
    entries: Mutex<HashMap<UserId, PresenceEntry>>,
    changes: broadcast::Sender<PresenceChange>,
}

impl PresenceRegistry {
    /// Create a registry with the default broadcast capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a registry with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: Mutex::new(HashMap::new()),
            changes,
        }
    }

    // No critical section can panic half-way through a mutation, so a
    // poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, PresenceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `outbox` as the connection for `user_id`.
    ///
    /// Replaces any prior entry for the user. The previous connection is
    /// told it was superseded. The new connection first receives a
    /// `presence-sync` snapshot, then every change from this point on via
    /// the returned receiver, starting with its own `presence-online`.
    pub fn register(&self, user_id: UserId, outbox: Outbox) -> Registration {
        let mut entries = self.lock();

        let online = entries.keys().map(ToString::to_string).collect();
        outbox.deliver(ServerEvent::PresenceSync { online });
        let changes = self.changes.subscribe();

        let entry = PresenceEntry::new(outbox);
        let connection_id = entry.connection_id.clone();
        let superseded = entries
            .insert(user_id.clone(), entry)
            .map(|previous| {
                previous.outbox.deliver(ServerEvent::SessionSuperseded {
                    connection_id: previous.connection_id.to_string(),
                });
                previous.connection_id
            });

        let receivers = self
            .changes
            .send(PresenceChange::Online(user_id.clone()))
            .unwrap_or_default();
        drop(entries);

        debug!(
            user = %user_id,
            connection = %connection_id,
            superseded = ?superseded,
            receivers,
            "Presence: registered"
        );

        Registration { superseded, changes }
    }

    /// Look up the connection currently registered for a user.
    #[must_use]
    pub fn lookup(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.lock().get(user_id).map(|e| e.connection_id.clone())
    }

    /// Remove a user's entry regardless of which connection holds it.
    ///
    /// Returns the removed entry, if any. Broadcasts `presence-offline`
    /// when something was removed.
    pub fn unregister(&self, user_id: &UserId) -> Option<PresenceEntry> {
        let mut entries = self.lock();
        let removed = entries.remove(user_id);
        if removed.is_some() {
            let _ = self.changes.send(PresenceChange::Offline(user_id.clone()));
        }
        drop(entries);

        if let Some(entry) = &removed {
            debug!(user = %user_id, connection = %entry.connection_id, "Presence: unregistered");
        }
        removed
    }

    /// Remove a user's entry only if it still belongs to `connection_id`.
    ///
    /// A connection that was superseded must not evict its successor.
    /// Returns `true` if the entry was removed.
    pub fn unregister_connection(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        let mut entries = self.lock();
        let owned = entries
            .get(user_id)
            .is_some_and(|e| &e.connection_id == connection_id);
        if owned {
            entries.remove(user_id);
            let _ = self.changes.send(PresenceChange::Offline(user_id.clone()));
        }
        drop(entries);

        if owned {
            debug!(user = %user_id, connection = %connection_id, "Presence: unregistered");
        } else {
            trace!(
                user = %user_id,
                connection = %connection_id,
                "Presence: entry owned by another connection"
            );
        }
        owned
    }

    /// Deliver an event to a user's current connection.
    ///
    /// The lookup and the enqueue happen in the same critical section.
    /// Returns `false` if the user is absent or their connection is gone.
    pub fn deliver(&self, user_id: &UserId, event: ServerEvent) -> bool {
        self.lock()
            .get(user_id)
            .is_some_and(|entry| entry.outbox.deliver(event))
    }

    /// Subscribe to presence changes without registering.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    /// Check if a user is present.
    #[must_use]
    pub fn is_present(&self, user_id: &UserId) -> bool {
        self.lock().contains_key(user_id)
    }

    /// All users currently present.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.lock().keys().cloned().collect()
    }

    /// Number of users present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nobody is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
