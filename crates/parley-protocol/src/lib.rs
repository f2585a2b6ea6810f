//! # parley-protocol
//!
//! Wire protocol definitions for the Parley presence and relay server.
//!
//! ## Events
//!
//! - `send-message` / `receive-message` / `message-acknowledged` - Direct messages
//! - `call-offer` / `call-answer` / `call-ice` - Call negotiation, payload passed through untouched
//! - `presence-online` / `presence-offline` / `presence-sync` - Who is reachable
//! - `connected`, `session-superseded`, `error`, `ping` / `pong` - Connection housekeeping
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::SendMessage {
//!     recipient_id: "bob".into(),
//!     content: Some("hi".into()),
//!     media_url: None,
//!     client_correlation_id: "t1".into(),
//! };
//!
//! let text = codec::to_json(&event).unwrap();
//! let decoded: ClientEvent = codec::from_json(&text).unwrap();
//! assert_eq!(decoded, event);
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{Encoded, Encoding, FrameReader, ProtocolError};
pub use events::{codes, ClientEvent, ServerEvent, SignalKind};
pub use version::{Version, PROTOCOL_VERSION};
