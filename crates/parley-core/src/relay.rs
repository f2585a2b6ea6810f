//! Direct message relay.
//!
//! Messages go to the recipient's current connection if there is one and
//! are dropped otherwise. The sender is always acknowledged.

use crate::ids::UserId;
use crate::message::Message;
use crate::presence::{Outbox, PresenceRegistry};
use std::sync::Arc;
use tracing::{debug, trace};

/// A message submitted by an authenticated sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Addressed user.
    pub recipient_id: UserId,
    /// Text body.
    pub content: Option<String>,
    /// Media reference.
    pub media_url: Option<String>,
    /// Echoed back in the acknowledgment.
    pub client_correlation_id: String,
}

/// What happened to a relayed message.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// The message as relayed, with its server-assigned ID.
    pub message: Message,
    /// Whether it was handed to the recipient's connection.
    pub delivered: bool,
    /// Whether the acknowledgment reached the sender's queue.
    pub acknowledged: bool,
}

/// Forwards direct messages between present users.
#[derive(Debug, Clone)]
pub struct MessageRelay {
    registry: Arc<PresenceRegistry>,
}

impl MessageRelay {
    /// Create a relay over the given registry.
    #[must_use]
    pub fn new(registry: Arc<PresenceRegistry>) -> Self {
        Self { registry }
    }

    /// Relay a message from `sender_id`, acknowledging on `reply_to`.
    ///
    /// The acknowledgment is enqueued after the relay attempt, whether or
    /// not the recipient was present.
    pub fn send(&self, sender_id: &UserId, reply_to: &Outbox, request: SendRequest) -> SendOutcome {
        let message = Message::new(sender_id.clone(), request.recipient_id)
            .with_content(request.content)
            .with_media(request.media_url);

        let delivered = self
            .registry
            .deliver(&message.recipient_id, message.to_event());

        if delivered {
            trace!(
                id = %message.id,
                from = %sender_id,
                to = %message.recipient_id,
                "Message relayed"
            );
        } else {
            debug!(
                id = %message.id,
                from = %sender_id,
                to = %message.recipient_id,
                "Recipient offline, message dropped"
            );
        }

        let acknowledged = reply_to.deliver(message.ack(request.client_correlation_id));

        SendOutcome {
            message,
            delivered,
            acknowledged,
        }
    }
}
