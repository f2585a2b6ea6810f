//! # parley-core
//!
//! Presence and relay core for the Parley realtime server.
//!
//! This crate provides the building blocks, independent of any transport:
//!
//! - **AuthGate** - Verify the credential presented at connection time
//! - **PresenceRegistry** - Track which connection represents each online user
//! - **MessageRelay** - Forward direct messages and acknowledge the sender
//! - **SignalingRelay** - Forward call-negotiation envelopes untouched
//! - **ConnectionManager** - Drive each connection through its lifecycle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────────────┐     ┌──────────────────┐
//! │  AuthGate   │────▶│ ConnectionManager │────▶│   MessageRelay   │
//! └─────────────┘     └───────────────────┘     │  SignalingRelay  │
//!                               │               └──────────────────┘
//!                               ▼                        │
//!                     ┌───────────────────┐              │
//!                     │ PresenceRegistry  │◀─────────────┘
//!                     └───────────────────┘
//! ```
//!
//! Delivery is best effort: events for users who are not present are
//! dropped, and nothing is persisted.

pub mod auth;
pub mod connection;
pub mod ids;
pub mod message;
pub mod presence;
pub mod relay;
pub mod signaling;

pub use auth::{AuthError, AuthGate, Claims};
pub use connection::{
    ConnectError, Connection, ConnectionError, ConnectionManager, ConnectionState, Dispatched,
    EventError, ManagerConfig, ManagerStats, PendingConnection, PresenceFeed, Session,
};
pub use ids::{ConnectionId, UserId};
pub use message::{Message, MessageId};
pub use presence::{Outbox, PresenceChange, PresenceEntry, PresenceRegistry};
pub use relay::{MessageRelay, SendOutcome, SendRequest};
pub use signaling::{SignalingEnvelope, SignalingRelay};
