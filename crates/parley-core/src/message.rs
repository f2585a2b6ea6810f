//! Relayed message records.
//!
//! Messages exist only while being relayed. Nothing here is persisted.

use crate::ids::UserId;
use parley_protocol::ServerEvent;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A unique message identifier.
pub type MessageId = Uuid;

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    Uuid::new_v4()
}

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A direct message between two users.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// Authenticated sender.
    pub sender_id: UserId,
    /// Addressed recipient.
    pub recipient_id: UserId,
    /// Text body.
    pub content: Option<String>,
    /// Opaque media reference (object store URL).
    pub media_url: Option<String>,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: u64,
}

impl Message {
    /// Create a new message with a fresh ID and timestamp.
    #[must_use]
    pub fn new(sender_id: UserId, recipient_id: UserId) -> Self {
        Self {
            id: generate_message_id(),
            sender_id,
            recipient_id,
            content: None,
            media_url: None,
            created_at: now_millis(),
        }
    }

    /// Attach a text body.
    #[must_use]
    pub fn with_content(mut self, content: Option<String>) -> Self {
        self.content = content;
        self
    }

    /// Attach a media reference.
    #[must_use]
    pub fn with_media(mut self, media_url: Option<String>) -> Self {
        self.media_url = media_url;
        self
    }

    /// The `receive-message` event delivered to the recipient.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::ReceiveMessage {
            id: self.id.to_string(),
            sender_id: self.sender_id.to_string(),
            recipient_id: self.recipient_id.to_string(),
            content: self.content.clone(),
            media_url: self.media_url.clone(),
            created_at: self.created_at,
        }
    }

    /// The `message-acknowledged` event returned to the sender.
    #[must_use]
    pub fn ack(&self, client_correlation_id: impl Into<String>) -> ServerEvent {
        ServerEvent::MessageAcknowledged {
            client_correlation_id: client_correlation_id.into(),
            server_message_id: self.id.to_string(),
        }
    }
}
