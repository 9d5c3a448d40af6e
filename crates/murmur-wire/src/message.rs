//! Message type enumeration and body structs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use murmur_types::{LamportTime, Member};
use serde::{Deserialize, Serialize};

use crate::WireError;

// ============================================================================
// Message Types
// ============================================================================

/// The leading type byte of every gossiped payload.
///
/// Values are wire-stable; new messages must be appended, never renumber
/// existing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// [`LeaveIntent`]
    Leave = 0,
    /// [`JoinIntent`]
    Join = 1,
    /// [`PushPull`]
    PushPull = 2,
    /// [`UserEventMessage`]
    UserEvent = 3,
    /// [`QueryMessage`]
    Query = 4,
    /// [`QueryResponseMessage`]
    QueryResponse = 5,
    /// [`ConflictResponse`]
    ConflictResponse = 6,
    /// [`KeyResponseMessage`]
    KeyResponse = 7,
    /// [`RelayHeader`] + inner message
    Relay = 8,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageType::Leave,
            1 => MessageType::Join,
            2 => MessageType::PushPull,
            3 => MessageType::UserEvent,
            4 => MessageType::Query,
            5 => MessageType::QueryResponse,
            6 => MessageType::ConflictResponse,
            7 => MessageType::KeyResponse,
            8 => MessageType::Relay,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

// ============================================================================
// Query Flags
// ============================================================================

/// The originator wants a zero-byte ack from every matching node.
pub const QUERY_FLAG_ACK: u32 = 1;

/// Receivers must not rebroadcast the query (single-hop delivery).
pub const QUERY_FLAG_NO_BROADCAST: u32 = 2;

// ============================================================================
// Membership Intents
// ============================================================================

/// Declares that `node` is departing (gracefully), stamped with the
/// originator's member clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveIntent {
    pub ltime: LamportTime,
    pub node: String,
}

/// Declares that `node` (re)joined the cluster at `ltime`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinIntent {
    pub ltime: LamportTime,
    pub node: String,
}

// ============================================================================
// Anti-Entropy
// ============================================================================

/// One user event stored in a ring slot and exchanged via push/pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEventRecord {
    pub name: String,
    pub payload: Vec<u8>,
}

/// A ring slot: all user events issued at one Lamport time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSlot {
    pub ltime: LamportTime,
    pub events: Vec<UserEventRecord>,
}

/// Full state exchanged pairwise for anti-entropy.
///
/// Empty ring slots are retained as `None` so the receiver can index the
/// ring positionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PushPull {
    /// Sender's member clock.
    pub ltime: LamportTime,

    /// Last observed status change per known member.
    pub status_ltimes: HashMap<String, LamportTime>,

    /// Members the sender currently holds in its left list.
    pub left_members: Vec<String>,

    /// Sender's event clock.
    pub event_ltime: LamportTime,

    /// The sender's full event ring.
    pub events: Vec<Option<EventSlot>>,

    /// Sender's query clock. Queries themselves are not replayed.
    pub query_ltime: LamportTime,
}

// ============================================================================
// User Events
// ============================================================================

/// A named application event broadcast cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEventMessage {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,

    /// Whether the embedder allowed coalescing for this event; also
    /// selects the broadcast invalidation class.
    pub coalesce: bool,
}

// ============================================================================
// Queries
// ============================================================================

/// A cluster-wide request expecting acks and/or payload responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMessage {
    /// Originator's query clock at issue time.
    pub ltime: LamportTime,

    /// Random 32-bit id disambiguating queries at the same `ltime`.
    pub id: u32,

    /// Where responses are unicast to.
    pub source_addr: SocketAddr,

    /// Originating node name, so responders can relay around it.
    pub source_node: String,

    /// Encoded filters (see [`crate::Filter`]); ANDed across entries.
    pub filters: Vec<Vec<u8>>,

    /// [`QUERY_FLAG_ACK`] | [`QUERY_FLAG_NO_BROADCAST`].
    pub flags: u32,

    /// How many extra peers each responder relays its response through.
    pub relay_factor: u8,

    /// Deadline relative to receipt; late responses are useless to the
    /// originator.
    pub timeout: Duration,

    pub name: String,
    pub payload: Vec<u8>,
}

impl QueryMessage {
    pub fn wants_ack(&self) -> bool {
        self.flags & QUERY_FLAG_ACK != 0
    }

    pub fn no_broadcast(&self) -> bool {
        self.flags & QUERY_FLAG_NO_BROADCAST != 0
    }
}

/// Response to a [`QueryMessage`], unicast back to the originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponseMessage {
    /// Echo of the query's `ltime`.
    pub ltime: LamportTime,

    /// Echo of the query's `id`.
    pub id: u32,

    /// Responding node name.
    pub from: String,

    /// [`QUERY_FLAG_ACK`] marks this as a zero-byte ack.
    pub flags: u32,

    pub payload: Vec<u8>,
}

impl QueryResponseMessage {
    pub fn is_ack(&self) -> bool {
        self.flags & QUERY_FLAG_ACK != 0
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Header prefixed to a relayed message; the first receiver forwards the
/// inner bytes to `dest` and consumes the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHeader {
    pub dest: SocketAddr,
}

// ============================================================================
// Management
// ============================================================================

/// Reply to an internal name-conflict query: the responder's view of the
/// contested member record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub member: Member,
}

/// Payload of the internal key-management queries (install/use/remove
/// carry a key; list carries none).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeyRequestMessage {
    /// Raw key material; empty for `list-keys`.
    pub key: Vec<u8>,
}

/// Per-node reply to a key-management query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeyResponseMessage {
    /// Whether the operation succeeded on this node.
    pub result: bool,

    /// Human-readable failure description, empty on success.
    pub message: String,

    /// Installed keys (base64), only populated for `list-keys`.
    pub keys: Vec<String>,
}
