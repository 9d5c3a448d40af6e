//! Events delivered to the embedder.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use murmur_types::{LamportTime, Member};
use murmur_wire::{MessageType, QueryResponseMessage, encode_message};
use tokio::time::Instant;

use crate::core::MurmurInner;
use crate::{Error, Result};

/// A notification from the membership layer.
///
/// Delivered on the event channel returned by
/// [`Murmur::create`](crate::Murmur::create), after snapshotting and
/// optional coalescing.
#[derive(Debug)]
pub enum Event {
    /// One or more members changed state.
    Member(MemberEvent),

    /// A user event was disseminated.
    User(UserEventData),

    /// A query matched this node; the embedder may respond.
    Query(QueryEvent),
}

/// The kind of membership change a [`MemberEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberEventType {
    /// Member became alive (join or rejoin).
    Join,
    /// Member departed gracefully.
    Leave,
    /// Member stopped responding to probes.
    Failed,
    /// Member changed its tags or address.
    Update,
    /// Member was evicted from the member table by the reaper.
    Reap,
}

impl fmt::Display for MemberEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberEventType::Join => "member-join",
            MemberEventType::Leave => "member-leave",
            MemberEventType::Failed => "member-failed",
            MemberEventType::Update => "member-update",
            MemberEventType::Reap => "member-reap",
        };
        write!(f, "{s}")
    }
}

/// A membership change affecting one or more members.
///
/// Multiple members appear together only after coalescing; the raw path
/// emits one member per event.
#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub ty: MemberEventType,
    pub members: Vec<Member>,
}

/// A user event received from the cluster (or issued locally).
#[derive(Debug, Clone)]
pub struct UserEventData {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,

    /// Whether the sender allowed coalescing.
    pub coalesce: bool,
}

/// A query that matched this node.
///
/// Dropping the event without calling [`respond`](QueryEvent::respond)
/// is fine; the originator simply never hears from this node.
pub struct QueryEvent {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,

    pub(crate) id: u32,
    pub(crate) source_addr: SocketAddr,
    pub(crate) source_node: String,
    pub(crate) relay_factor: u8,
    pub(crate) deadline: Instant,
    pub(crate) responded: AtomicBool,
    pub(crate) core: std::sync::Weak<MurmurInner>,
}

impl fmt::Debug for QueryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEvent")
            .field("ltime", &self.ltime)
            .field("name", &self.name)
            .field("from", &self.source_node)
            .finish()
    }
}

impl QueryEvent {
    /// Remaining time until the originator stops listening.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Sends a payload response back to the originator.
    ///
    /// At most one response per query is transmitted; the payload must
    /// fit the configured response size limit and the deadline must not
    /// have passed.
    pub async fn respond(&self, payload: Vec<u8>) -> Result<()> {
        let Some(core) = self.core.upgrade() else {
            return Err(Error::QueryAlreadyResponded);
        };

        if Instant::now() > self.deadline {
            return Err(Error::QueryAlreadyResponded);
        }
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(Error::QueryAlreadyResponded);
        }

        let limit = core.config.query_response_size_limit;
        let resp = QueryResponseMessage {
            ltime: self.ltime,
            id: self.id,
            from: core.config.node_name.clone(),
            flags: 0,
            payload,
        };
        let raw = encode_message(MessageType::QueryResponse, &resp)?;
        if raw.len() > limit {
            // Undo the claim so the embedder can retry with less data.
            self.responded.store(false, Ordering::SeqCst);
            return Err(Error::QueryResponseTooLarge {
                size: raw.len(),
                limit,
            });
        }

        core.transport.send_to(self.source_addr, raw.clone()).await?;
        core.relay_response(self.relay_factor, self.source_addr, &self.source_node, raw)
            .await;
        Ok(())
    }

    /// How much of the query window remains.
    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
