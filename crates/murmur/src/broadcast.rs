//! Broadcast queue adapter.
//!
//! The transport owns the transmit-limited queue; this adapter assigns
//! the invalidation keys the membership layer cares about and watches
//! the queue depth. Keys partition broadcasts into classes where a newer
//! message obsoletes an older one: a node's join intent supersedes its
//! earlier join intent, a coalescible user event supersedes an earlier
//! emission under the same name. Queries and non-coalescible events are
//! never invalidated.

use std::sync::Arc;

use bytes::Bytes;
use murmur_wire::MessageType;
use tokio::sync::oneshot;
use tracing::warn;

use crate::transport::{Broadcast, Transport};

pub(crate) struct BroadcastQueue {
    transport: Arc<dyn Transport>,

    /// Log a warning when the queue grows beyond this depth.
    depth_warning: usize,
}

impl BroadcastQueue {
    pub(crate) fn new(transport: Arc<dyn Transport>, depth_warning: usize) -> Self {
        Self {
            transport,
            depth_warning,
        }
    }

    /// Queues a join/leave intent, superseding earlier intents of the
    /// same kind for the same node.
    pub(crate) fn queue_intent(
        &self,
        ty: MessageType,
        node: &str,
        raw: Bytes,
        notify: Option<oneshot::Sender<()>>,
    ) {
        let prefix = match ty {
            MessageType::Leave => "leave",
            MessageType::Join => "join",
            other => {
                debug_assert!(false, "not an intent type: {other:?}");
                return;
            }
        };
        self.queue(Broadcast {
            key: Some(format!("{prefix}:{node}")),
            msg: raw,
            notify,
        });
    }

    /// Queues a user event. Coalescible events share an invalidation
    /// class per name; non-coalescible ones get a unique slot so later
    /// emissions don't drop earlier ones.
    pub(crate) fn queue_user_event(&self, name: &str, coalesce: bool, raw: Bytes) {
        let key = coalesce.then(|| format!("ue:{name}"));
        self.queue(Broadcast::new(key, raw));
    }

    /// Queues a query or query rebroadcast. Never invalidated; every
    /// query must be transmitted its full retransmit count.
    pub(crate) fn queue_query(&self, raw: Bytes) {
        self.queue(Broadcast::new(None, raw));
    }

    pub(crate) fn queue(&self, broadcast: Broadcast) {
        let depth = self.transport.num_queued();
        if depth > self.depth_warning {
            warn!(depth, "broadcast queue depth exceeds warning threshold");
        }
        self.transport.queue_broadcast(broadcast);
    }
}
