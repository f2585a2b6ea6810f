//! Connection lifecycle.
//!
//! Every connection walks `Connecting → Authenticated → Closed` exactly
//! once. Authentication happens before the transport is upgraded
//! ([`ConnectionManager::authorize`]); registration in the presence
//! registry happens once the transport is ready
//! ([`PendingConnection::establish`]); closing or dropping the resulting
//! [`Session`] unregisters it.

use crate::auth::{AuthError, AuthGate};
use crate::ids::{ConnectionId, UserId};
use crate::message::now_millis;
use crate::presence::{Outbox, PresenceChange, PresenceRegistry, DEFAULT_BROADCAST_CAPACITY};
use crate::relay::{MessageRelay, SendOutcome, SendRequest};
use crate::signaling::SignalingRelay;
use dashmap::DashMap;
use parley_protocol::{
    codes, ClientEvent, ProtocolError, ServerEvent, SignalKind, PROTOCOL_VERSION,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport open, credential not yet accepted.
    Connecting,
    /// Identity bound and registered for presence.
    Authenticated,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Check whether `self → to` is a legal transition.
    #[must_use]
    pub fn can_transition(self, to: ConnectionState) -> bool {
        matches!(
            (self, to),
            (ConnectionState::Connecting, ConnectionState::Authenticated)
                | (ConnectionState::Connecting, ConnectionState::Closed)
                | (ConnectionState::Authenticated, ConnectionState::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection lifecycle errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Illegal state transition.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Identity already bound.
    #[error("Connection already bound to {0}")]
    AlreadyBound(UserId),
}

/// Reasons a connection is refused.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Credential missing or invalid.
    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    /// Connection limit reached.
    #[error("server at capacity")]
    AtCapacity,
}

impl ConnectError {
    /// Reason reported to the rejected client.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectError::Unauthorized(err) => err.reason(),
            ConnectError::AtCapacity => "server at capacity",
        }
    }
}

/// A single inbound event was rejected.
#[derive(Debug, Error)]
pub enum EventError {
    /// Event failed validation.
    #[error(transparent)]
    Invalid(#[from] ProtocolError),
}

/// Transport-level session state.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    user_id: Option<UserId>,
    state: ConnectionState,
    opened_at: u64,
}

impl Connection {
    /// Open a new connection in the `Connecting` state.
    #[must_use]
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            user_id: None,
            state: ConnectionState::Connecting,
            opened_at: now_millis(),
        }
    }

    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Bound identity, once authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// When the connection was opened, Unix epoch milliseconds.
    #[must_use]
    pub fn opened_at(&self) -> u64 {
        self.opened_at
    }

    /// Bind the authenticated identity. The binding never changes afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::AlreadyBound`] on a second call.
    pub fn bind(&mut self, user_id: UserId) -> Result<(), ConnectionError> {
        if let Some(existing) = &self.user_id {
            return Err(ConnectionError::AlreadyBound(existing.clone()));
        }
        self.user_id = Some(user_id);
        Ok(())
    }

    /// Move to another state.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidTransition`] if the move is illegal.
    pub fn transition(&mut self, to: ConnectionState) -> Result<(), ConnectionError> {
        if !self.state.can_transition(to) {
            return Err(ConnectionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(connection = %self.id, from = %self.state, to = %to, "Connection state change");
        self.state = to;
        Ok(())
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Presence broadcast capacity.
    pub broadcast_capacity: usize,
    /// Heartbeat interval advertised to clients, in milliseconds.
    pub heartbeat_interval_ms: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            heartbeat_interval_ms: 30_000,
        }
    }
}

/// Summary of a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Bound identity.
    pub user_id: UserId,
    /// Current state.
    pub state: ConnectionState,
    /// When the connection was opened, Unix epoch milliseconds.
    pub opened_at: u64,
}

/// Manager statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    /// Live connections, pending or authenticated.
    pub connections: usize,
    /// Users currently present.
    pub online_users: usize,
}

/// Owns connection lifecycles and routes their events.
#[derive(Debug)]
pub struct ConnectionManager {
    gate: AuthGate,
    registry: Arc<PresenceRegistry>,
    messages: MessageRelay,
    signaling: SignalingRelay,
    connections: DashMap<ConnectionId, ConnectionInfo>,
    admitted: AtomicUsize,
    config: ManagerConfig,
}

impl ConnectionManager {
    /// Create a manager with default configuration.
    #[must_use]
    pub fn new(gate: AuthGate) -> Self {
        Self::with_config(gate, ManagerConfig::default())
    }

    /// Create a manager with custom configuration.
    #[must_use]
    pub fn with_config(gate: AuthGate, config: ManagerConfig) -> Self {
        info!("Creating connection manager with config: {:?}", config);
        let registry = Arc::new(PresenceRegistry::with_capacity(config.broadcast_capacity));
        Self {
            gate,
            messages: MessageRelay::new(registry.clone()),
            signaling: SignalingRelay::new(registry.clone()),
            registry,
            connections: DashMap::new(),
            admitted: AtomicUsize::new(0),
            config,
        }
    }

    /// The presence registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// The credential gate.
    #[must_use]
    pub fn auth(&self) -> &AuthGate {
        &self.gate
    }

    /// Manager statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            connections: self.connections.len(),
            online_users: self.registry.len(),
        }
    }

    /// Current info for a live connection, pending or authenticated.
    #[must_use]
    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    /// Authenticate a new connection before its transport is upgraded.
    ///
    /// On failure the connection goes straight to `Closed` and nothing is
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Unauthorized`] for a missing or invalid
    /// credential and [`ConnectError::AtCapacity`] when the connection
    /// limit is reached.
    pub fn authorize(
        self: &Arc<Self>,
        token: Option<&str>,
    ) -> Result<PendingConnection, ConnectError> {
        if !self.try_admit() {
            warn!(limit = self.config.max_connections, "Connection refused: at capacity");
            return Err(ConnectError::AtCapacity);
        }

        let mut connection = Connection::new(ConnectionId::generate());

        let user_id = match self.gate.authenticate(token) {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(connection = %connection.id(), error = %err, "Authentication failed");
                // Connecting -> Closed is always legal.
                let _ = connection.transition(ConnectionState::Closed);
                self.release();
                return Err(err.into());
            }
        };

        // A fresh connection has no identity yet.
        let _ = connection.bind(user_id.clone());
        self.connections.insert(
            connection.id().clone(),
            ConnectionInfo {
                user_id,
                state: connection.state(),
                opened_at: connection.opened_at(),
            },
        );

        Ok(PendingConnection {
            manager: self.clone(),
            connection: Some(connection),
        })
    }

    // Check and increment happen in one atomic step so concurrent upgrades
    // cannot overshoot the limit.
    fn try_admit(&self) -> bool {
        let limit = self.config.max_connections;
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.admitted.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drop a connection from the live table, freeing its slot once.
    fn forget(&self, id: &ConnectionId) {
        if self.connections.remove(id).is_some() {
            self.release();
        }
    }

    fn set_state(&self, id: &ConnectionId, state: ConnectionState) {
        if let Some(mut info) = self.connections.get_mut(id) {
            info.state = state;
        }
    }
}

/// An authenticated connection whose transport is not ready yet.
///
/// Dropping it without calling [`establish`](Self::establish) closes the
/// connection without ever registering it.
#[derive(Debug)]
pub struct PendingConnection {
    manager: Arc<ConnectionManager>,
    connection: Option<Connection>,
}

impl PendingConnection {
    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> Option<&ConnectionId> {
        self.connection.as_ref().map(Connection::id)
    }

    /// The identity the credential was issued to.
    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        self.connection.as_ref().and_then(Connection::user_id)
    }

    /// Complete the handshake: `Connecting → Authenticated`.
    ///
    /// Sends `connected` on `outbox`, registers the connection for
    /// presence, and returns the session plus its presence feed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidTransition`] if the connection
    /// already left `Connecting`.
    pub fn establish(
        mut self,
        outbox: Outbox,
    ) -> Result<(Session, PresenceFeed), ConnectionError> {
        let Some(mut connection) = self.connection.take() else {
            return Err(ConnectionError::InvalidTransition {
                from: ConnectionState::Closed,
                to: ConnectionState::Authenticated,
            });
        };
        let Some(user_id) = connection.user_id().cloned() else {
            self.manager.forget(connection.id());
            return Err(ConnectionError::InvalidTransition {
                from: connection.state(),
                to: ConnectionState::Authenticated,
            });
        };
        if let Err(err) = connection.transition(ConnectionState::Authenticated) {
            self.manager.forget(connection.id());
            return Err(err);
        }

        let manager = self.manager.clone();
        manager.set_state(connection.id(), ConnectionState::Authenticated);

        outbox.deliver(ServerEvent::Connected {
            connection_id: connection.id().to_string(),
            user_id: user_id.to_string(),
            version: PROTOCOL_VERSION,
            heartbeat: manager.config.heartbeat_interval_ms,
        });
        let registration = manager.registry.register(user_id.clone(), outbox.clone());

        info!(connection = %connection.id(), user = %user_id, "Connection authenticated");

        let session = Session {
            manager,
            connection,
            user_id,
            outbox,
        };
        Ok((session, PresenceFeed::new(registration.changes)))
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.transition(ConnectionState::Closed);
            self.manager.forget(connection.id());
            debug!(connection = %connection.id(), "Connection abandoned before upgrade");
        }
    }
}

/// What an inbound event resulted in.
#[derive(Debug, Clone)]
pub enum Dispatched {
    /// A direct message was relayed.
    Message(SendOutcome),
    /// A call-negotiation envelope was forwarded or dropped.
    Signal { kind: SignalKind, delivered: bool },
    /// A ping was answered.
    Pong,
}

/// An authenticated, registered connection.
#[derive(Debug)]
pub struct Session {
    manager: Arc<ConnectionManager>,
    connection: Connection,
    user_id: UserId,
    outbox: Outbox,
}

impl Session {
    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Bound identity.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// This connection's outbox.
    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Handle one inbound event.
    ///
    /// Invalid events are answered with an `error` event on this
    /// connection and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Invalid`] if validation fails.
    pub fn handle(&self, event: ClientEvent) -> Result<Dispatched, EventError> {
        if let Err(err) = event.validate() {
            warn!(connection = %self.id(), event = event.name(), error = %err, "Rejected event");
            self.report_error(codes::INVALID_EVENT, err.to_string());
            return Err(err.into());
        }

        let dispatched = match event {
            ClientEvent::SendMessage {
                recipient_id,
                content,
                media_url,
                client_correlation_id,
            } => {
                let request = SendRequest {
                    recipient_id: recipient_id.into(),
                    content,
                    media_url,
                    client_correlation_id,
                };
                let outcome = self
                    .manager
                    .messages
                    .send(&self.user_id, &self.outbox, request);
                Dispatched::Message(outcome)
            }
            ClientEvent::CallOffer { recipient_id, sdp } => {
                self.signal(SignalKind::Offer, recipient_id, sdp)
            }
            ClientEvent::CallAnswer { recipient_id, sdp } => {
                self.signal(SignalKind::Answer, recipient_id, sdp)
            }
            ClientEvent::CallIce {
                recipient_id,
                candidate,
            } => self.signal(SignalKind::IceCandidate, recipient_id, candidate),
            ClientEvent::Ping { timestamp } => {
                self.outbox.deliver(ServerEvent::Pong { timestamp });
                Dispatched::Pong
            }
        };

        Ok(dispatched)
    }

    fn signal(
        &self,
        kind: SignalKind,
        recipient_id: String,
        payload: serde_json::Value,
    ) -> Dispatched {
        let recipient_id = UserId::from(recipient_id);
        let delivered = self
            .manager
            .signaling
            .forward(&self.user_id, kind, &recipient_id, payload);
        Dispatched::Signal { kind, delivered }
    }

    /// Send an `error` event to this connection.
    pub fn report_error(&self, code: u16, message: impl Into<String>) {
        self.outbox.deliver(ServerEvent::error(code, message));
    }

    /// Close the session: `Authenticated → Closed`, unregistering it.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.connection.transition(ConnectionState::Closed).is_err() {
            return;
        }

        let removed = self
            .manager
            .registry
            .unregister_connection(&self.user_id, self.connection.id());
        self.manager.forget(self.connection.id());

        info!(
            connection = %self.connection.id(),
            user = %self.user_id,
            unregistered = removed,
            "Connection closed"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Presence changes for one session.
#[derive(Debug)]
pub struct PresenceFeed {
    rx: broadcast::Receiver<PresenceChange>,
}

impl PresenceFeed {
    fn new(rx: broadcast::Receiver<PresenceChange>) -> Self {
        Self { rx }
    }

    /// Wait for the next presence event.
    ///
    /// Skips over notifications lost to lag. Returns `None` once the
    /// registry is gone.
    pub async fn next(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change.to_event()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Presence feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next presence event if one is ready.
    pub fn try_next(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change.to_event()),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Presence feed lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
