//! Call-negotiation relay.
//!
//! Offers, answers, and ICE candidates are forwarded to the addressed user
//! untouched. Envelopes for absent users are dropped without telling the
//! sender; negotiation timeouts belong to the clients.

use crate::ids::UserId;
use crate::presence::PresenceRegistry;
use parley_protocol::{ServerEvent, SignalKind};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

/// A call-negotiation envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEnvelope {
    /// Offer, answer, or ICE candidate.
    pub kind: SignalKind,
    /// Authenticated sender.
    pub sender_id: UserId,
    /// Addressed user.
    pub recipient_id: UserId,
    /// Session description or candidate, never inspected.
    pub payload: Value,
}

impl SignalingEnvelope {
    /// The event delivered to the recipient.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::signal(self.kind, self.sender_id.to_string(), self.payload.clone())
    }
}

/// Forwards call-negotiation envelopes between present users.
#[derive(Debug, Clone)]
pub struct SignalingRelay {
    registry: Arc<PresenceRegistry>,
}

impl SignalingRelay {
    /// Create a relay over the given registry.
    #[must_use]
    pub fn new(registry: Arc<PresenceRegistry>) -> Self {
        Self { registry }
    }

    /// Forward an envelope to `recipient_id`.
    ///
    /// Returns `true` if it was handed to the recipient's connection.
    pub fn forward(
        &self,
        sender_id: &UserId,
        kind: SignalKind,
        recipient_id: &UserId,
        payload: Value,
    ) -> bool {
        self.forward_envelope(SignalingEnvelope {
            kind,
            sender_id: sender_id.clone(),
            recipient_id: recipient_id.clone(),
            payload,
        })
    }

    /// Forward a prepared envelope.
    pub fn forward_envelope(&self, envelope: SignalingEnvelope) -> bool {
        let delivered = self
            .registry
            .deliver(&envelope.recipient_id, envelope.to_event());

        if delivered {
            trace!(
                kind = %envelope.kind,
                from = %envelope.sender_id,
                to = %envelope.recipient_id,
                "Signal forwarded"
            );
        } else {
            debug!(
                kind = %envelope.kind,
                from = %envelope.sender_id,
                to = %envelope.recipient_id,
                "Peer offline, signal dropped"
            );
        }
        delivered
    }
}
