//! Murmur wire protocol.
//!
//! This crate defines all messages gossiped between Murmur nodes:
//!
//! ## Membership intents
//! - [`LeaveIntent`] - Node → All: I am leaving (or X should be marked left)
//! - [`JoinIntent`] - Node → All: I (re)joined at this Lamport time
//!
//! ## Anti-entropy
//! - [`PushPull`] - Pairwise: full member/event clock state exchange
//!
//! ## Events & queries
//! - [`UserEventMessage`] - Node → All: named application event
//! - [`QueryMessage`] - Node → All: request with filters and deadline
//! - [`QueryResponseMessage`] - Responder → Originator: ack or payload
//! - [`RelayHeader`] - Responder → Peer → Originator: one-hop forward
//!
//! ## Management
//! - [`ConflictResponse`] - name-conflict disambiguation payload
//! - [`KeyRequestMessage`] / [`KeyResponseMessage`] - keyring rotation
//!
//! # Framing
//!
//! Every message is a single type byte ([`MessageType`]) followed by the
//! postcard-encoded body. Filters inside [`QueryMessage`] carry their own
//! one-byte type prefix ([`FilterType`]) so new filter kinds can be added
//! without a protocol bump; unknown filters fail closed at evaluation.
//! The probe-ack coordinate payload is versioned independently with
//! [`COORDINATE_PING_VERSION`].

mod filter;
mod message;

pub use filter::{Filter, FilterType, decode_filter, encode_filter};
pub use message::*;

use bytes::{BufMut, Bytes, BytesMut};
use murmur_coordinate::Coordinate;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Serialization failed (should only happen on exotic payloads).
    #[error("encode failed: {0}")]
    Encode(#[source] postcard::Error),

    /// The body bytes did not match the expected message shape.
    #[error("decode failed: {0}")]
    Decode(#[source] postcard::Error),

    /// The leading type byte is not a known [`MessageType`].
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A query filter carried an unrecognized type byte.
    #[error("unknown filter type {0}")]
    UnknownFilterType(u8),

    /// The buffer ended before a complete message was read.
    #[error("truncated message")]
    Truncated,

    /// The coordinate ping payload carried an unsupported version.
    #[error("unsupported coordinate payload version {0}")]
    UnsupportedCoordinateVersion(u8),
}

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Version byte prefixed to the coordinate probe-ack payload.
pub const COORDINATE_PING_VERSION: u8 = 1;

// ============================================================================
// Framing
// ============================================================================

/// Encodes a message as its type byte followed by the postcard body.
pub fn encode_message<T: Serialize>(ty: MessageType, body: &T) -> Result<Bytes> {
    let encoded = postcard::to_allocvec(body).map_err(WireError::Encode)?;
    let mut buf = BytesMut::with_capacity(1 + encoded.len());
    buf.put_u8(ty.as_u8());
    buf.put_slice(&encoded);
    Ok(buf.freeze())
}

/// Splits a raw gossip payload into its message type and body bytes.
pub fn peek_type(raw: &[u8]) -> Result<(MessageType, &[u8])> {
    let (&first, body) = raw.split_first().ok_or(WireError::Truncated)?;
    Ok((MessageType::try_from(first)?, body))
}

/// Decodes a message body (the bytes after the type byte).
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    postcard::from_bytes(body).map_err(WireError::Decode)
}

/// Wraps an already-encoded message for one-hop relaying through a peer.
///
/// The receiver strips the header and forwards the inner bytes verbatim
/// to `header.dest`; relays are never chained.
pub fn encode_relay(header: &RelayHeader, inner: &[u8]) -> Result<Bytes> {
    let encoded = postcard::to_allocvec(header).map_err(WireError::Encode)?;
    let mut buf = BytesMut::with_capacity(1 + encoded.len() + inner.len());
    buf.put_u8(MessageType::Relay.as_u8());
    buf.put_slice(&encoded);
    buf.put_slice(inner);
    Ok(buf.freeze())
}

/// Decodes a relay body into its header and the inner message bytes.
pub fn decode_relay(body: &[u8]) -> Result<(RelayHeader, &[u8])> {
    postcard::take_from_bytes(body).map_err(WireError::Decode)
}

/// Encodes the local coordinate as a probe-ack payload.
pub fn encode_coordinate_payload(coord: &Coordinate) -> Result<Bytes> {
    let encoded = postcard::to_allocvec(coord).map_err(WireError::Encode)?;
    let mut buf = BytesMut::with_capacity(1 + encoded.len());
    buf.put_u8(COORDINATE_PING_VERSION);
    buf.put_slice(&encoded);
    Ok(buf.freeze())
}

/// Decodes a probe-ack payload back into a coordinate.
pub fn decode_coordinate_payload(raw: &[u8]) -> Result<Coordinate> {
    let (&version, body) = raw.split_first().ok_or(WireError::Truncated)?;
    if version != COORDINATE_PING_VERSION {
        return Err(WireError::UnsupportedCoordinateVersion(version));
    }
    postcard::from_bytes(body).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    use murmur_coordinate::CoordinateConfig;
    use murmur_types::LamportTime;

    #[test]
    fn frame_round_trip() {
        let intent = JoinIntent {
            ltime: LamportTime::new(7),
            node: "node-a".into(),
        };
        let raw = encode_message(MessageType::Join, &intent).unwrap();

        let (ty, body) = peek_type(&raw).unwrap();
        assert_eq!(ty, MessageType::Join);
        let decoded: JoinIntent = decode_body(body).unwrap();
        assert_eq!(decoded, intent);
    }

    #[test]
    fn empty_payload_is_truncated() {
        assert!(matches!(peek_type(&[]), Err(WireError::Truncated)));
    }

    #[test]
    fn unknown_type_byte_rejected() {
        assert!(matches!(
            peek_type(&[0xAA, 1, 2]),
            Err(WireError::UnknownMessageType(0xAA))
        ));
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let raw = encode_message(
            MessageType::Leave,
            &LeaveIntent {
                ltime: LamportTime::new(1),
                node: "x".into(),
            },
        )
        .unwrap();
        let (_, body) = peek_type(&raw).unwrap();
        // A leave body is not a valid push/pull body.
        assert!(matches!(
            decode_body::<PushPull>(body),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn relay_wraps_and_unwraps() {
        let inner = encode_message(
            MessageType::Leave,
            &LeaveIntent {
                ltime: LamportTime::new(3),
                node: "gone".into(),
            },
        )
        .unwrap();
        let header = RelayHeader {
            dest: "10.0.0.9:7946".parse().unwrap(),
        };

        let relayed = encode_relay(&header, &inner).unwrap();
        let (ty, body) = peek_type(&relayed).unwrap();
        assert_eq!(ty, MessageType::Relay);

        let (decoded_header, forwarded) = decode_relay(body).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(forwarded, &inner[..]);
    }

    #[test]
    fn coordinate_payload_round_trip() {
        let coord = Coordinate::new(&CoordinateConfig::default());
        let raw = encode_coordinate_payload(&coord).unwrap();
        assert_eq!(raw[0], COORDINATE_PING_VERSION);
        assert_eq!(decode_coordinate_payload(&raw).unwrap(), coord);
    }

    #[test]
    fn coordinate_payload_future_version_rejected() {
        let coord = Coordinate::new(&CoordinateConfig::default());
        let mut raw = encode_coordinate_payload(&coord).unwrap().to_vec();
        raw[0] = 9;
        assert!(matches!(
            decode_coordinate_payload(&raw),
            Err(WireError::UnsupportedCoordinateVersion(9))
        ));
    }
}
