//! The transport seam.
//!
//! Murmur never touches the network directly. A SWIM-style gossip
//! transport (liveness probing, UDP/TCP framing, payload encryption,
//! broadcast piggybacking) is injected behind the [`Transport`] trait,
//! and delivers its observations back through the [`GossipDelegate`]
//! trait that the core implements.
//!
//! The contract, in both directions:
//!
//! - The transport owns liveness: it probes peers and reports
//!   join/leave/update observations as [`NodeInfo`] callbacks. It MUST
//!   report the local node itself as joined when started.
//! - The transport owns bytes: opaque payloads queued through
//!   [`Transport::queue_broadcast`] are piggybacked onto gossip and
//!   retransmitted a bounded number of times; payloads received from
//!   peers arrive via [`GossipDelegate::notify_message`] verbatim.
//! - The transport drives anti-entropy: periodically (and on join) it
//!   pulls [`GossipDelegate::local_state`] from one side and feeds it to
//!   [`GossipDelegate::merge_remote_state`] on the other.
//! - The transport measures: each completed probe reports its round-trip
//!   time along with the ack payload the remote side produced via
//!   [`GossipDelegate::ack_payload`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use murmur_types::VersionRange;
use tokio::sync::oneshot;

use crate::key_manager::Keyring;

/// Errors reported by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// None of the requested peers could be contacted.
    #[error("no peers could be contacted: {0}")]
    NoPeers(String),

    /// The transport was already shut down.
    #[error("transport is shut down")]
    Shutdown,

    /// The destination is not reachable.
    #[error("unreachable address {0}")]
    Unreachable(SocketAddr),

    /// Implementation-specific failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// A liveness observation about one node, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Cluster-unique node name.
    pub name: String,

    /// The node's gossip address.
    pub addr: SocketAddr,

    /// Opaque meta blob (encoded tags) the node gossips.
    pub meta: Bytes,

    /// Gossip protocol versions the node speaks.
    pub protocol: VersionRange,

    /// Delegate payload versions the node understands.
    pub delegate: VersionRange,
}

/// An outbound message queued for gossip dissemination.
///
/// Broadcasts with equal `key` invalidate earlier queued broadcasts; a
/// `None` key is never invalidated. When the transport has transmitted
/// the message its configured number of times, it fires `notify`.
pub struct Broadcast {
    /// Invalidation key.
    pub key: Option<String>,

    /// The encoded message, type byte included.
    pub msg: Bytes,

    /// Fired once the transport finishes transmitting this broadcast.
    pub notify: Option<oneshot::Sender<()>>,
}

impl Broadcast {
    pub fn new(key: Option<String>, msg: Bytes) -> Self {
        Self {
            key,
            msg,
            notify: None,
        }
    }

    pub fn with_notify(key: Option<String>, msg: Bytes, notify: oneshot::Sender<()>) -> Self {
        Self {
            key,
            msg,
            notify: Some(notify),
        }
    }
}

impl fmt::Debug for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("key", &self.key)
            .field("len", &self.msg.len())
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

/// The injected gossip transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Wires the core's delegate into the transport and starts its
    /// background machinery. Called exactly once, before any other
    /// method.
    async fn start(&self, delegate: Arc<dyn GossipDelegate>) -> Result<(), TransportError>;

    /// Contacts the given peers and push/pulls state with each. Returns
    /// how many were successfully contacted along with the combined
    /// error for the rest, so partial success is visible.
    async fn join(&self, peers: &[SocketAddr]) -> (usize, Result<(), TransportError>);

    /// Gracefully announces departure at the transport level.
    async fn leave(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Hard stop. No graceful announcements.
    async fn shutdown(&self) -> Result<(), TransportError>;

    /// The address this node gossips from.
    fn local_addr(&self) -> SocketAddr;

    /// The transport's current estimate of cluster size, for timeout
    /// and retransmit scaling.
    fn num_nodes(&self) -> usize;

    /// Sends one message directly to a peer, outside the gossip layer.
    async fn send_to(&self, dest: SocketAddr, msg: Bytes) -> Result<(), TransportError>;

    /// Queues a message for broadcast dissemination.
    fn queue_broadcast(&self, broadcast: Broadcast);

    /// Number of broadcasts waiting in the transmit queue.
    fn num_queued(&self) -> usize;

    /// Re-gossips the local node's meta blob after a tags change.
    async fn update_node(&self, meta: Bytes) -> Result<(), TransportError>;

    /// The symmetric keyring used for payload encryption, if encryption
    /// is enabled.
    fn keyring(&self) -> Option<Arc<Keyring>> {
        None
    }
}

/// The core's half of the contract, implemented by Murmur and handed to
/// the transport at [`Transport::start`].
#[async_trait]
pub trait GossipDelegate: Send + Sync + 'static {
    /// An opaque payload arrived from a peer.
    async fn notify_message(&self, msg: Bytes);

    /// Produces this node's full push/pull state.
    async fn local_state(&self, join: bool) -> Bytes;

    /// Merges a peer's push/pull state. `join` is true during the
    /// initial exchange of a `join` call.
    async fn merge_remote_state(&self, buf: Bytes, join: bool);

    /// A node was observed alive.
    async fn notify_join(&self, node: NodeInfo);

    /// A node stopped responding or announced departure.
    async fn notify_leave(&self, node: NodeInfo);

    /// A node's meta/address changed.
    async fn notify_update(&self, node: NodeInfo);

    /// Two nodes claim the same name.
    async fn notify_conflict(&self, existing: NodeInfo, other: NodeInfo);

    /// Payload to attach to probe acks (the local coordinate).
    async fn ack_payload(&self) -> Bytes;

    /// A probe of `node` completed with round-trip `rtt`; `payload` is
    /// the remote side's ack payload.
    async fn notify_ping_complete(&self, node: String, rtt: Duration, payload: Bytes);

    /// The meta blob to gossip for the local node.
    async fn node_meta(&self) -> Bytes;
}
