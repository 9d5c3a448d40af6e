//! Inbound gossip message dispatch.
//!
//! Raw payloads from the transport land here, are decoded by type byte,
//! and flow into the state machine. A message that was genuinely news
//! is re-enqueued (with its original bytes) for further gossip; stale,
//! duplicate, or malformed messages are dropped so the cluster cannot
//! ping-pong them forever.
//!
//! Decode failures are logged and swallowed: bad network input must
//! never crash the node or surface to the embedder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use murmur_types::MemberStatus;
use murmur_wire::{
    self as wire, JoinIntent, LeaveIntent, MessageType, QueryMessage, QueryResponseMessage,
    UserEventMessage,
};
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::MurmurState;
use crate::instrumentation::METRICS;

use super::MurmurInner;

impl MurmurInner {
    /// Entry point for every opaque payload the transport delivers.
    pub(crate) async fn handle_message(self: &Arc<Self>, raw: Bytes) {
        METRICS.incr_messages_received();

        let (ty, body) = match wire::peek_type(&raw) {
            Ok(split) => split,
            Err(e) => {
                warn!(error = %e, "dropping undecodable gossip payload");
                METRICS.incr_messages_dropped();
                return;
            }
        };

        match ty {
            MessageType::Leave => match wire::decode_body::<LeaveIntent>(body) {
                Ok(msg) => self.handle_leave_intent(&msg, raw).await,
                Err(e) => self.drop_malformed(ty, &e),
            },
            MessageType::Join => match wire::decode_body::<JoinIntent>(body) {
                Ok(msg) => self.handle_join_intent(&msg, raw).await,
                Err(e) => self.drop_malformed(ty, &e),
            },
            MessageType::UserEvent => match wire::decode_body::<UserEventMessage>(body) {
                Ok(msg) => {
                    if self.handle_user_event(&msg).await {
                        METRICS.incr_messages_rebroadcast();
                        self.broadcasts.queue_user_event(&msg.name, msg.coalesce, raw);
                    }
                }
                Err(e) => self.drop_malformed(ty, &e),
            },
            MessageType::Query => match wire::decode_body::<QueryMessage>(body) {
                Ok(msg) => {
                    if self.handle_query_message(&msg).await {
                        METRICS.incr_messages_rebroadcast();
                        self.broadcasts.queue_query(raw);
                    }
                }
                Err(e) => self.drop_malformed(ty, &e),
            },
            MessageType::QueryResponse => match wire::decode_body::<QueryResponseMessage>(body) {
                Ok(msg) => self.handle_query_response(&msg),
                Err(e) => self.drop_malformed(ty, &e),
            },
            MessageType::Relay => self.handle_relay(body).await,
            MessageType::PushPull => {
                // Anti-entropy state arrives through the dedicated
                // merge path, never as loose gossip.
                warn!("unexpected push/pull payload on the gossip path");
                METRICS.incr_messages_dropped();
            }
            MessageType::ConflictResponse | MessageType::KeyResponse => {
                // These ride inside query responses; loose copies are
                // protocol misuse.
                warn!(ty = ty.as_u8(), "unexpected bare management message");
                METRICS.incr_messages_dropped();
            }
        }
    }

    fn drop_malformed(&self, ty: MessageType, error: &wire::WireError) {
        warn!(ty = ty.as_u8(), %error, "dropping malformed message");
        METRICS.incr_messages_dropped();
    }

    /// Applies a leave intent and rebroadcasts it if it was news.
    pub(crate) async fn handle_leave_intent(self: &Arc<Self>, msg: &LeaveIntent, raw: Bytes) {
        self.clock.witness(msg.ltime);

        let local_alive = self.current_state() == MurmurState::Alive;
        let tr = {
            let mut db = self.members.lock().expect("member lock poisoned");
            db.leave_intent(&msg.node, msg.ltime, local_alive, Instant::now())
        };

        if self.apply_transition(tr).await {
            METRICS.incr_messages_rebroadcast();
            self.broadcasts
                .queue_intent(MessageType::Leave, &msg.node, raw, None);
        }
    }

    /// Applies a join intent and rebroadcasts it if it was news.
    pub(crate) async fn handle_join_intent(self: &Arc<Self>, msg: &JoinIntent, raw: Bytes) {
        self.clock.witness(msg.ltime);

        let tr = {
            let mut db = self.members.lock().expect("member lock poisoned");
            db.join_intent(&msg.node, msg.ltime, Instant::now())
        };

        if self.apply_transition(tr).await {
            METRICS.incr_messages_rebroadcast();
            self.broadcasts
                .queue_intent(MessageType::Join, &msg.node, raw, None);
        }
    }

    /// Forwards a relayed message one hop to its destination. Relays
    /// are consumed here; the inner bytes go out as-is, so a relay can
    /// never chain.
    async fn handle_relay(&self, body: &[u8]) {
        let (header, inner) = match wire::decode_relay(body) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "dropping malformed relay");
                METRICS.incr_messages_dropped();
                return;
            }
        };

        debug!(dest = %header.dest, "forwarding relayed message");
        if let Err(e) = self
            .transport
            .send_to(header.dest, Bytes::copy_from_slice(inner))
            .await
        {
            warn!(dest = %header.dest, error = %e, "relay forward failed");
        }
    }

    /// Unicasts `raw` through up to `relay_factor` random live peers so
    /// it can reach `dest_addr` around a partial partition. The peers
    /// themselves forward blindly (single hop).
    pub(crate) async fn relay_response(
        &self,
        relay_factor: u8,
        dest_addr: SocketAddr,
        dest_node: &str,
        raw: Bytes,
    ) {
        if relay_factor == 0 {
            return;
        }

        let local = self.config.node_name.as_str();
        let relayers: Vec<SocketAddr> = {
            let db = self.members.lock().expect("member lock poisoned");
            let eligible: Vec<_> = db
                .members()
                .into_iter()
                .filter(|m| {
                    m.status == MemberStatus::Alive && m.name != local && m.name != dest_node
                })
                .map(|m| m.addr)
                .collect();
            eligible
                .choose_multiple(&mut rand::thread_rng(), relay_factor as usize)
                .copied()
                .collect()
        };

        if relayers.is_empty() {
            return;
        }

        let header = wire::RelayHeader { dest: dest_addr };
        let relayed = match wire::encode_relay(&header, &raw) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode relay");
                return;
            }
        };

        for addr in relayers {
            if let Err(e) = self.transport.send_to(addr, relayed.clone()).await {
                debug!(relayer = %addr, error = %e, "relay send failed");
            }
        }
    }
}
