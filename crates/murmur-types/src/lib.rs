//! # murmur-types: Core types for Murmur
//!
//! This crate contains shared types used across the Murmur system:
//! - Logical time ([`LamportTime`], [`LamportClock`])
//! - Member model ([`Member`], [`MemberStatus`], [`VersionRange`])
//! - Node metadata ([`Tags`])
//!
//! Murmur runs three independent Lamport clocks per node (member, event,
//! query); all of them are instances of [`LamportClock`]. The member model
//! here is the *external* view handed to embedders; the protocol crate
//! layers its own bookkeeping (status Lamport times, reap timestamps) on
//! top of it.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// Lamport Time
// ============================================================================

/// A point in Lamport logical time.
///
/// Cheap 8-byte value, totally ordered. Zero means "never observed".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LamportTime(u64);

impl LamportTime {
    pub const ZERO: LamportTime = LamportTime(0);

    pub fn new(t: u64) -> Self {
        Self(t)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The time immediately after this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Saturating subtraction, used for ring-age checks.
    pub fn saturating_sub(self, rhs: u64) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl Display for LamportTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LamportTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LamportTime> for u64 {
    fn from(t: LamportTime) -> Self {
        t.0
    }
}

/// A thread-safe Lamport clock.
///
/// The clock issues monotonically increasing times and can *witness*
/// remote times, after which locally issued times are strictly greater
/// than the witnessed value.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current time without advancing the clock.
    pub fn time(&self) -> LamportTime {
        LamportTime(self.counter.load(Ordering::SeqCst))
    }

    /// Advances the clock and returns the newly issued time.
    pub fn increment(&self) -> LamportTime {
        LamportTime(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Observes a time from another node.
    ///
    /// After `witness(v)` returns, `time() > v` holds. Stale witnesses
    /// (values below the current time) are no-ops.
    pub fn witness(&self, v: LamportTime) {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            // Local clock already ahead of the witnessed time.
            if current > v.0 {
                return;
            }
            match self.counter.compare_exchange_weak(
                current,
                v.0 + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

// ============================================================================
// Member Model
// ============================================================================

/// Lifecycle status of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MemberStatus {
    /// Placeholder for a member created from a buffered intent, before
    /// the first liveness observation arrives.
    #[default]
    None,
    /// Member is reachable and participating.
    Alive,
    /// Member announced an orderly departure that has not completed yet.
    Leaving,
    /// Member departed gracefully; retained until the tombstone expires.
    Left,
    /// Member stopped responding to liveness probes.
    Failed,
}

impl Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::None => "none",
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Left => "left",
            MemberStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Version range advertised by a member, for the gossip protocol itself
/// and for the delegate payload format layered on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VersionRange {
    pub min: u8,
    pub cur: u8,
    pub max: u8,
}

impl VersionRange {
    pub fn new(min: u8, cur: u8, max: u8) -> Self {
        Self { min, cur, max }
    }
}

/// A cluster member as seen by the embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Cluster-unique node name.
    pub name: String,

    /// Last known gossip address.
    pub addr: SocketAddr,

    /// Operator-assigned metadata (role, datacenter, ...).
    pub tags: Tags,

    /// Current lifecycle status.
    pub status: MemberStatus,

    /// Gossip protocol versions this member speaks.
    pub protocol: VersionRange,

    /// Delegate payload versions this member understands.
    pub delegate: VersionRange,
}

// ============================================================================
// Tags
// ============================================================================

/// Maximum encoded size of a member's tag blob.
pub const TAGS_MAX_SIZE: usize = 512;

/// Error produced by tag encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum TagError {
    /// Encoded tags exceed [`TAGS_MAX_SIZE`].
    #[error("encoded tags are {0} bytes, exceeding the {TAGS_MAX_SIZE} byte limit")]
    TooLarge(usize),

    /// The tag blob could not be decoded.
    #[error("malformed tag blob: {0}")]
    Malformed(#[from] postcard::Error),
}

/// Operator-assigned key/value metadata attached to a member.
///
/// Ordered so that the encoded form is canonical: two members with equal
/// tags always gossip byte-identical meta blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encodes the tags into the opaque meta blob carried by the
    /// transport. Fails if the encoding exceeds [`TAGS_MAX_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, TagError> {
        let buf = postcard::to_allocvec(&self.0).map_err(TagError::Malformed)?;
        if buf.len() > TAGS_MAX_SIZE {
            return Err(TagError::TooLarge(buf.len()));
        }
        Ok(buf)
    }

    /// Decodes a meta blob back into tags. An empty blob decodes to empty
    /// tags, so nodes without metadata gossip zero bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, TagError> {
        if buf.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(postcard::from_bytes(buf)?))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
