//! Glue between the transport and the membership core.
//!
//! The delegate holds a weak reference to the core: the transport
//! outliving the core (or vice versa) during teardown must not keep the
//! other alive, and callbacks arriving mid-shutdown degrade to no-ops.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use murmur_wire::{decode_coordinate_payload, encode_coordinate_payload};
use tracing::{debug, warn};

use crate::core::MurmurInner;
use crate::instrumentation::METRICS;
use crate::transport::{GossipDelegate, NodeInfo};

pub(crate) struct CoreDelegate {
    core: Weak<MurmurInner>,
}

impl CoreDelegate {
    pub(crate) fn new(core: Weak<MurmurInner>) -> Self {
        Self { core }
    }

    fn core(&self) -> Option<Arc<MurmurInner>> {
        self.core.upgrade()
    }
}

#[async_trait]
impl GossipDelegate for CoreDelegate {
    async fn notify_message(&self, msg: Bytes) {
        if msg.is_empty() {
            return;
        }
        if let Some(core) = self.core() {
            core.handle_message(msg).await;
        }
    }

    async fn local_state(&self, _join: bool) -> Bytes {
        match self.core() {
            Some(core) => core.local_push_pull_state(),
            None => Bytes::new(),
        }
    }

    async fn merge_remote_state(&self, buf: Bytes, join: bool) {
        if let Some(core) = self.core() {
            core.merge_push_pull_state(buf, join).await;
        }
    }

    async fn notify_join(&self, node: NodeInfo) {
        let Some(core) = self.core() else { return };
        let tr = {
            let mut db = core.members.lock().expect("member lock poisoned");
            db.node_join(node, Instant::now())
        };
        core.apply_transition(tr).await;
    }

    async fn notify_leave(&self, node: NodeInfo) {
        let Some(core) = self.core() else { return };
        let tr = {
            let mut db = core.members.lock().expect("member lock poisoned");
            db.node_leave(&node, Instant::now())
        };
        core.apply_transition(tr).await;
    }

    async fn notify_update(&self, node: NodeInfo) {
        let Some(core) = self.core() else { return };
        let tr = {
            let mut db = core.members.lock().expect("member lock poisoned");
            db.node_update(&node, Instant::now())
        };
        core.apply_transition(tr).await;
    }

    async fn notify_conflict(&self, existing: NodeInfo, other: NodeInfo) {
        let Some(core) = self.core() else { return };

        if existing.name != core.config.node_name {
            warn!(
                node = %existing.name,
                first = %existing.addr,
                second = %other.addr,
                "name conflict between two remote nodes; names must be unique"
            );
            return;
        }

        warn!(
            other = %other.addr,
            "another node claims our name, starting conflict resolution"
        );
        crate::internal_query::spawn_conflict_resolution(core);
    }

    async fn ack_payload(&self) -> Bytes {
        let Some(core) = self.core() else {
            return Bytes::new();
        };
        let Some(coord) = &core.coord else {
            return Bytes::new();
        };

        let coordinate = coord
            .client
            .lock()
            .expect("coordinate lock poisoned")
            .get_coordinate();
        match encode_coordinate_payload(&coordinate) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to encode coordinate ack payload");
                Bytes::new()
            }
        }
    }

    async fn notify_ping_complete(&self, node: String, rtt: Duration, payload: Bytes) {
        let Some(core) = self.core() else { return };
        let Some(coord) = &core.coord else { return };
        if payload.is_empty() {
            // Peer runs without coordinates; nothing to fold in.
            return;
        }

        let other = match decode_coordinate_payload(&payload) {
            Ok(coordinate) => coordinate,
            Err(e) => {
                warn!(node = %node, error = %e, "undecodable coordinate in ping ack");
                METRICS.incr_coordinate_rejections();
                return;
            }
        };

        let updated = {
            let mut client = coord.client.lock().expect("coordinate lock poisoned");
            client.update(&node, &other, rtt)
        };
        match updated {
            Ok(_) => {
                coord
                    .cache
                    .write()
                    .expect("coordinate cache poisoned")
                    .insert(node, other);
            }
            Err(e) => {
                debug!(node = %node, error = %e, "coordinate update rejected");
                METRICS.incr_coordinate_rejections();
            }
        }
    }

    async fn node_meta(&self) -> Bytes {
        let Some(core) = self.core() else {
            return Bytes::new();
        };
        let tags = core.tags.read().expect("tags lock poisoned");
        match tags.encode() {
            Ok(meta) => Bytes::from(meta),
            Err(e) => {
                warn!(error = %e, "failed to encode tags for gossip");
                Bytes::new()
            }
        }
    }
}
