//! Anti-entropy push/pull.
//!
//! Pairwise state exchange is the only path where member statuses and
//! event history cross between nodes in bulk; steady-state gossip is
//! best-effort per message. Each side serializes its clocks, the
//! status time of every known member, its left list, and the full event
//! ring; the receiving side replays everything through the exact same
//! intent and event handlers used for live gossip, so the ordering
//! rules hold no matter which path a fact arrived on.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use murmur_types::LamportTime;
use murmur_wire::{self as wire, MessageType, PushPull, UserEventMessage};
use tracing::warn;

use crate::instrumentation::METRICS;

use super::MurmurInner;

impl MurmurInner {
    /// Serializes this node's full state for a push/pull exchange.
    pub(crate) fn local_push_pull_state(&self) -> Bytes {
        let (status_ltimes, left_members) = {
            let db = self.members.lock().expect("member lock poisoned");
            (db.status_ltimes(), db.left_names())
        };
        let events = {
            let events = self.events.lock().expect("event lock poisoned");
            events.ring.to_wire()
        };

        let msg = PushPull {
            ltime: self.clock.time(),
            status_ltimes,
            left_members,
            event_ltime: self.event_clock.time(),
            events,
            query_ltime: self.query_clock.time(),
        };

        match wire::encode_message(MessageType::PushPull, &msg) {
            Ok(raw) => raw,
            Err(e) => {
                // Nothing useful to send; the peer will drop the empty
                // buffer and retry on the next cycle.
                warn!(error = %e, "failed to encode push/pull state");
                Bytes::new()
            }
        }
    }

    /// Merges a peer's push/pull state into the local node.
    pub(crate) async fn merge_push_pull_state(self: &Arc<Self>, buf: Bytes, is_join: bool) {
        if buf.is_empty() {
            return;
        }

        let msg = match wire::peek_type(&buf) {
            Ok((MessageType::PushPull, body)) => match wire::decode_body::<PushPull>(body) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "dropping malformed push/pull state");
                    METRICS.incr_messages_dropped();
                    return;
                }
            },
            Ok((ty, _)) => {
                warn!(ty = ty.as_u8(), "unexpected message type in push/pull");
                METRICS.incr_messages_dropped();
                return;
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable push/pull state");
                METRICS.incr_messages_dropped();
                return;
            }
        };

        // Witness one below each received clock: the peer told us its
        // clock reading, not that a message exists at that exact time.
        if msg.ltime > LamportTime::ZERO {
            self.clock.witness(msg.ltime.saturating_sub(1));
        }
        if msg.event_ltime > LamportTime::ZERO {
            self.event_clock.witness(msg.event_ltime.saturating_sub(1));
        }
        if msg.query_ltime > LamportTime::ZERO {
            self.query_clock.witness(msg.query_ltime.saturating_sub(1));
        }

        // Departed members first, so a node in both maps lands on its
        // terminal status.
        for name in &msg.left_members {
            let Some(&ltime) = msg.status_ltimes.get(name) else {
                continue;
            };
            let intent = wire::LeaveIntent {
                ltime,
                node: name.clone(),
            };
            let raw = match wire::encode_message(MessageType::Leave, &intent) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "failed to re-encode leave intent");
                    continue;
                }
            };
            self.handle_leave_intent(&intent, raw).await;
        }

        for (name, &ltime) in &msg.status_ltimes {
            if msg.left_members.iter().any(|left| left == name) {
                continue;
            }
            if *name == self.config.node_name {
                // Our own status is authoritative locally.
                continue;
            }
            let intent = wire::JoinIntent {
                ltime,
                node: name.clone(),
            };
            let raw = match wire::encode_message(MessageType::Join, &intent) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "failed to re-encode join intent");
                    continue;
                }
            };
            self.handle_join_intent(&intent, raw).await;
        }

        // During a non-replay join the incoming history is witnessed
        // but never delivered: raise the admission floor first.
        if is_join && self.event_join_ignore.load(Ordering::SeqCst) {
            let mut events = self.events.lock().expect("event lock poisoned");
            if msg.event_ltime > events.min_time {
                events.min_time = msg.event_ltime;
            }
        }

        for slot in msg.events.into_iter().flatten() {
            for record in slot.events {
                let event = UserEventMessage {
                    ltime: slot.ltime,
                    name: record.name,
                    payload: record.payload,
                    coalesce: false,
                };
                self.handle_user_event(&event).await;
            }
        }
    }
}
