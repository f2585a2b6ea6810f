//! Codecs for Parley events.
//!
//! Two encodings are supported:
//!
//! - JSON, one event per WebSocket text message.
//! - MessagePack with a 4-byte big-endian length prefix, for binary
//!   messages. Frames may be split across or packed into messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Event decoded but is not usable.
    #[error("Invalid event: {0}")]
    Invalid(String),
}

/// Outbound encoding for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON text messages.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary messages.
    MessagePack,
}

impl FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::MessagePack),
            other => Err(ProtocolError::Invalid(format!("unknown encoding '{other}'"))),
        }
    }
}

/// An encoded event, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    /// Goes out as a text message.
    Text(String),
    /// Goes out as a binary message.
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode an event with the given encoding.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_as<T: Serialize>(event: &T, encoding: Encoding) -> Result<Encoded, ProtocolError> {
    match encoding {
        Encoding::Json => Ok(Encoded::Text(to_json(event)?)),
        Encoding::MessagePack => Ok(Encoded::Binary(encode(event)?)),
    }
}

/// Encode an event as a JSON string.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_json<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an event from a JSON string.
///
/// # Errors
///
/// Returns an error if the text is not a valid event.
pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode an event to a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded event (named fields)
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an event into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(event: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len(), MAX_FRAME_SIZE));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let length = frame_length(data)?.ok_or(ProtocolError::Incomplete(
        LENGTH_PREFIX_SIZE.saturating_sub(data.len()),
    ))?;

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if a whole frame is present.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
/// A frame whose body fails to decode is still consumed, so the caller
/// can report the error and keep reading the following frames.
///
/// # Errors
///
/// Returns an error if the frame is too large or its body is invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    let Some(length) = frame_length(buf)? else {
        return Ok(None);
    };

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

fn frame_length(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    match declared_length(data) {
        Some(length) if length > MAX_FRAME_SIZE => {
            Err(ProtocolError::FrameTooLarge(length, MAX_FRAME_SIZE))
        }
        length => Ok(length),
    }
}

fn declared_length(data: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = data.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Incremental reader for length-prefixed frames with a per-frame limit.
///
/// The limit applies to the length each frame declares, however the frame
/// is split across transport messages. An oversized frame is reported once
/// and its body is discarded as it arrives, so the frames after it still
/// decode. A declared length above [`MAX_FRAME_SIZE`] cannot be trusted and
/// drops everything buffered.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    limit: usize,
    skip: usize,
}

impl FrameReader {
    /// Create a reader accepting frames of at most `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            limit: limit.min(MAX_FRAME_SIZE),
            skip: 0,
        }
    }

    /// Append received bytes, dropping any still owed to a rejected frame.
    pub fn extend(&mut self, data: &[u8]) {
        let skipped = self.skip.min(data.len());
        self.skip -= skipped;
        self.buf.extend_from_slice(&data[skipped..]);
    }

    /// Bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more data is needed. Every error consumes
    /// the offending frame, so callers can keep calling until `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] for a frame over the limit
    /// and a decoding error for a frame whose body is invalid.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        let Some(length) = declared_length(&self.buf) else {
            return Ok(None);
        };

        if length > self.limit {
            if length > MAX_FRAME_SIZE {
                self.buf.clear();
            } else {
                let total = LENGTH_PREFIX_SIZE + length;
                let available = self.buf.len().min(total);
                self.buf.advance(available);
                self.skip = total - available;
            }
            return Err(ProtocolError::FrameTooLarge(length, self.limit));
        }

        decode_from(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, ServerEvent, SignalKind};
    use serde_json::json;

    fn send_message(correlation: &str) -> ClientEvent {
        ClientEvent::SendMessage {
            recipient_id: "bob".into(),
            content: Some("hello".into()),
            media_url: None,
            client_correlation_id: correlation.into(),
        }
    }

    #[test]
    fn test_msgpack_roundtrip_tagged_events() {
        let events = vec![
            send_message("t1"),
            ClientEvent::CallOffer {
                recipient_id: "bob".into(),
                sdp: json!({"type": "offer", "sdp": "v=0"}),
            },
            ClientEvent::Ping { timestamp: Some(7) },
        ];

        for event in events {
            let encoded = encode(&event).unwrap();
            let decoded: ClientEvent = decode(&encoded).unwrap();
            assert_eq!(event, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&send_message("t1")).unwrap();

        match decode::<ClientEvent>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
        match decode::<ClientEvent>(&encoded[..2]) {
            Err(ProtocolError::Incomplete(2)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        assert!(matches!(
            decode_from::<ClientEvent>(&mut buf),
            Err(ProtocolError::FrameTooLarge(_, MAX_FRAME_SIZE))
        ));
    }

    #[test]
    fn test_frame_reader_skips_split_oversized_frame() {
        let big = ClientEvent::SendMessage {
            recipient_id: "bob".into(),
            content: Some("x".repeat(10_000)),
            media_url: None,
            client_correlation_id: "big".into(),
        };
        let mut wire = BytesMut::new();
        encode_into(&big, &mut wire).unwrap();
        encode_into(&send_message("t1"), &mut wire).unwrap();

        let mut reader = FrameReader::new(1024);
        let mut decoded = Vec::new();
        let mut too_large = 0;
        for chunk in wire.chunks(3000) {
            reader.extend(chunk);
            loop {
                match reader.next_frame::<ClientEvent>() {
                    Ok(Some(event)) => decoded.push(event),
                    Ok(None) => break,
                    Err(ProtocolError::FrameTooLarge(size, 1024)) => {
                        assert!(size > 10_000);
                        too_large += 1;
                    }
                    Err(other) => panic!("unexpected error {other:?}"),
                }
            }
        }

        assert_eq!(too_large, 1);
        assert_eq!(decoded, vec![send_message("t1")]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_frame_reader_drops_untrusted_prefix() {
        let mut reader = FrameReader::new(1024);
        let mut data = BytesMut::new();
        data.put_u32((MAX_FRAME_SIZE + 1) as u32);
        data.extend_from_slice(b"junk");
        reader.extend(&data);

        assert!(matches!(
            reader.next_frame::<ClientEvent>(),
            Err(ProtocolError::FrameTooLarge(_, 1024))
        ));
        assert_eq!(reader.buffered(), 0);
        assert!(reader.next_frame::<ClientEvent>().unwrap().is_none());
    }

    #[test]
    fn test_streaming_decode() {
        let first = send_message("t1");
        let second = send_message("t2");

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        // Split the second frame so only part of it is available.
        let tail = buf.split_off(buf.len() - 3);

        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), None);

        buf.extend_from_slice(&tail);
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bad_frame_body_is_consumed() {
        let mut buf = BytesMut::new();
        encode_into(&json!({"type": "nope"}), &mut buf).unwrap();
        encode_into(&send_message("t1"), &mut buf).unwrap();

        assert!(decode_from::<ClientEvent>(&mut buf).is_err());
        assert_eq!(
            decode_from::<ClientEvent>(&mut buf).unwrap(),
            Some(send_message("t1"))
        );
    }

    #[test]
    fn test_encode_as() {
        let event = ServerEvent::signal(SignalKind::Offer, "alice", json!("v=0"));

        match encode_as(&event, Encoding::Json).unwrap() {
            Encoded::Text(text) => {
                assert_eq!(from_json::<ServerEvent>(&text).unwrap(), event);
            }
            other => panic!("expected text, got {other:?}"),
        }
        match encode_as(&event, Encoding::MessagePack).unwrap() {
            Encoded::Binary(data) => assert_eq!(decode::<ServerEvent>(&data).unwrap(), event),
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("MsgPack".parse::<Encoding>().unwrap(), Encoding::MessagePack);
        assert!("xml".parse::<Encoding>().is_err());
    }
}
