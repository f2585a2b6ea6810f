//! Event types for the Parley protocol.
//!
//! Events are the unit of communication between clients and the server.
//! Both directions are closed tagged unions: the `type` field selects the
//! variant and every other field is camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::version::Version;

/// Error codes carried by [`ServerEvent::Error`].
pub mod codes {
    /// The frame could not be decoded into a known event.
    pub const MALFORMED_EVENT: u16 = 4000;
    /// The event decoded but a required field is missing or empty.
    pub const INVALID_EVENT: u16 = 4001;
    /// The frame exceeds the configured message size limit.
    pub const MESSAGE_TOO_LARGE: u16 = 4002;
}

/// Kinds of call-negotiation envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// Connectivity candidate.
    IceCandidate,
}

impl SignalKind {
    /// Event name used on the wire for this kind.
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            SignalKind::Offer => "call-offer",
            SignalKind::Answer => "call-answer",
            SignalKind::IceCandidate => "call-ice",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Send a direct message to another user.
    SendMessage {
        /// Addressed user.
        recipient_id: String,
        /// Text body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Reference to media held by an external object store.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
        /// Client-chosen id echoed back in the acknowledgment.
        client_correlation_id: String,
    },

    /// Forward a session description offer.
    CallOffer { recipient_id: String, sdp: Value },

    /// Forward a session description answer.
    CallAnswer { recipient_id: String, sdp: Value },

    /// Forward an ICE candidate.
    CallIce { recipient_id: String, candidate: Value },

    /// Application-level keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::CallOffer { .. } => SignalKind::Offer.event_name(),
            ClientEvent::CallAnswer { .. } => SignalKind::Answer.event_name(),
            ClientEvent::CallIce { .. } => SignalKind::IceCandidate.event_name(),
            ClientEvent::Ping { .. } => "ping",
        }
    }

    /// Check required fields.
    ///
    /// Decoding already guarantees presence; this rejects values that are
    /// present but unusable.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            // content and mediaUrl are both optional; an empty message is relayed as-is.
            ClientEvent::SendMessage {
                recipient_id,
                client_correlation_id,
                ..
            } => {
                require("recipientId", recipient_id)?;
                require("clientCorrelationId", client_correlation_id)
            }
            ClientEvent::CallOffer { recipient_id, .. }
            | ClientEvent::CallAnswer { recipient_id, .. }
            | ClientEvent::CallIce { recipient_id, .. } => require("recipientId", recipient_id),
            ClientEvent::Ping { .. } => Ok(()),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        Err(ProtocolError::Invalid(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// First event on every authenticated connection.
    Connected {
        connection_id: String,
        user_id: String,
        version: Version,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Users online at the moment this connection registered.
    PresenceSync { online: Vec<String> },

    /// A user became reachable.
    PresenceOnline { user_id: String },

    /// A user is no longer reachable.
    PresenceOffline { user_id: String },

    /// A direct message relayed to its recipient.
    ReceiveMessage {
        id: String,
        sender_id: String,
        recipient_id: String,
        content: Option<String>,
        media_url: Option<String>,
        /// Unix epoch milliseconds.
        created_at: u64,
    },

    /// Server-assigned id for a message the client sent.
    MessageAcknowledged {
        client_correlation_id: String,
        server_message_id: String,
    },

    /// Offer from another user.
    CallOffer { sender_id: String, sdp: Value },

    /// Answer from another user.
    CallAnswer { sender_id: String, sdp: Value },

    /// ICE candidate from another user.
    CallIce { sender_id: String, candidate: Value },

    /// The user registered a newer connection; this one is about to close.
    SessionSuperseded { connection_id: String },

    /// A single inbound event was rejected.
    Error { code: u16, message: String },

    /// Reply to [`ClientEvent::Ping`].
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Build the recipient-side event for a call-negotiation envelope.
    #[must_use]
    pub fn signal(kind: SignalKind, sender_id: impl Into<String>, payload: Value) -> Self {
        let sender_id = sender_id.into();
        match kind {
            SignalKind::Offer => ServerEvent::CallOffer {
                sender_id,
                sdp: payload,
            },
            SignalKind::Answer => ServerEvent::CallAnswer {
                sender_id,
                sdp: payload,
            },
            SignalKind::IceCandidate => ServerEvent::CallIce {
                sender_id,
                candidate: payload,
            },
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::PresenceSync { .. } => "presence-sync",
            ServerEvent::PresenceOnline { .. } => "presence-online",
            ServerEvent::PresenceOffline { .. } => "presence-offline",
            ServerEvent::ReceiveMessage { .. } => "receive-message",
            ServerEvent::MessageAcknowledged { .. } => "message-acknowledged",
            ServerEvent::CallOffer { .. } => "call-offer",
            ServerEvent::CallAnswer { .. } => "call-answer",
            ServerEvent::CallIce { .. } => "call-ice",
            ServerEvent::SessionSuperseded { .. } => "session-superseded",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong { .. } => "pong",
        }
    }
}
