//! The query engine.
//!
//! Queries are request/response dissemination: a query fans out through
//! gossip, every matching node may ack it and send one payload response
//! unicast back to the originator (optionally relayed through random
//! peers), and the originator collects responses until the deadline.
//!
//! Dedup is by `(ltime, id)` through a Lamport ring; filters are ANDed
//! across kinds and ORed within the node-name list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use murmur_types::LamportTime;
use murmur_wire::{
    self as wire, Filter, MessageType, QUERY_FLAG_ACK, QUERY_FLAG_NO_BROADCAST, QueryMessage,
    QueryResponseMessage, encode_filter, encode_message,
};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::MurmurInner;
use crate::event::{Event, QueryEvent};
use crate::instrumentation::METRICS;
use crate::ring::{IngestOutcome, QueryRing};
use crate::{Error, MurmurState, Result};

// ============================================================================
// Parameters & Handle
// ============================================================================

/// Options for an outbound query.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Only these nodes should process the query (empty = everyone).
    pub filter_nodes: Vec<String>,

    /// `(tag, regex)` pairs every processing node must match.
    pub filter_tags: Vec<(String, String)>,

    /// Ask matching nodes for a zero-byte ack before their response.
    pub request_ack: bool,

    /// How many random peers each responder relays its response
    /// through, for delivery under partial failures.
    pub relay_factor: u8,

    /// Response deadline; defaults to a cluster-size-scaled multiple of
    /// the gossip interval.
    pub timeout: Option<Duration>,

    /// Deliver only to directly contacted nodes; no rebroadcast.
    pub no_broadcast: bool,
}

/// A response payload from one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResponse {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Collects acks and responses for one in-flight query.
///
/// Both channels close when the deadline fires; late responses are
/// discarded by the engine, not buffered.
pub struct QueryResponseHandle {
    ltime: LamportTime,
    id: u32,
    deadline: Instant,
    acks: mpsc::Receiver<String>,
    responses: mpsc::Receiver<NodeResponse>,
}

impl QueryResponseHandle {
    /// Name of the next acking node, or `None` once the deadline closed
    /// the channel.
    pub async fn next_ack(&mut self) -> Option<String> {
        self.acks.recv().await
    }

    /// The next payload response, or `None` once the deadline closed
    /// the channel.
    pub async fn next_response(&mut self) -> Option<NodeResponse> {
        self.responses.recv().await
    }

    /// When the engine stops collecting.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Lamport time allocated to this query.
    pub fn ltime(&self) -> LamportTime {
        self.ltime
    }

    /// Random id disambiguating queries at the same time.
    pub fn id(&self) -> u32 {
        self.id
    }
}

// ============================================================================
// Engine State
// ============================================================================

/// Sender side of one outstanding query's collection channels.
pub(crate) struct OutstandingQuery {
    ack_tx: mpsc::Sender<String>,
    resp_tx: mpsc::Sender<NodeResponse>,
    deadline: Instant,

    /// Nodes already counted, for at-most-once semantics per responder.
    acked: HashSet<String>,
    responded: HashSet<String>,
}

/// Query-side shared state: the dedup ring and the outstanding map.
pub(crate) struct QueryCore {
    pub(crate) ring: QueryRing,
    pub(crate) min_time: LamportTime,
    outstanding: HashMap<(LamportTime, u32), OutstandingQuery>,
}

impl QueryCore {
    pub(crate) fn new(ring_len: usize, min_time: LamportTime) -> Self {
        Self {
            ring: QueryRing::new(ring_len),
            min_time,
            outstanding: HashMap::new(),
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

pub(crate) async fn start_query(
    inner: &Arc<MurmurInner>,
    name: &str,
    payload: &[u8],
    params: QueryParams,
) -> Result<QueryResponseHandle> {
    let state = inner.current_state();
    if state != MurmurState::Alive {
        return Err(Error::WrongState {
            required: MurmurState::Alive,
            actual: state,
        });
    }

    let mut filters = Vec::new();
    if !params.filter_nodes.is_empty() {
        filters.push(encode_filter(&Filter::Node(params.filter_nodes.clone()))?);
    }
    for (tag, expr) in &params.filter_tags {
        filters.push(encode_filter(&Filter::Tag {
            tag: tag.clone(),
            expr: expr.clone(),
        })?);
    }

    let mut flags = 0;
    if params.request_ack {
        flags |= QUERY_FLAG_ACK;
    }
    if params.no_broadcast {
        flags |= QUERY_FLAG_NO_BROADCAST;
    }

    let timeout = params.timeout.unwrap_or_else(|| inner.default_query_timeout());
    let msg = QueryMessage {
        ltime: inner.query_clock.increment(),
        id: rand::thread_rng().r#gen(),
        source_addr: inner.transport.local_addr(),
        source_node: inner.config.node_name.clone(),
        filters,
        flags,
        relay_factor: params.relay_factor,
        timeout,
        name: name.to_string(),
        payload: payload.to_vec(),
    };

    let raw = encode_message(MessageType::Query, &msg)?;
    if raw.len() > inner.config.query_size_limit {
        return Err(Error::QueryTooLarge {
            size: raw.len(),
            limit: inner.config.query_size_limit,
        });
    }

    let handle = register_query(inner, &msg);

    // Local application first: we may be a matching responder, and it
    // seeds the dedup ring so the gossiped copy bounces off us.
    inner.handle_query_message(&msg).await;
    inner.broadcasts.queue_query(raw);

    Ok(handle)
}

/// Registers collection state for an outbound query and arms its
/// deadline.
fn register_query(inner: &Arc<MurmurInner>, msg: &QueryMessage) -> QueryResponseHandle {
    let capacity = inner.config.query_response_channel_capacity.max(1);
    let (ack_tx, ack_rx) = mpsc::channel(capacity);
    let (resp_tx, resp_rx) = mpsc::channel(capacity);
    let deadline = Instant::now() + msg.timeout;
    let key = (msg.ltime, msg.id);

    {
        let mut queries = inner.queries.lock().expect("query lock poisoned");
        queries.outstanding.insert(
            key,
            OutstandingQuery {
                ack_tx,
                resp_tx,
                deadline,
                acked: HashSet::new(),
                responded: HashSet::new(),
            },
        );
    }

    // Closing the channels is the handle's end-of-stream signal.
    let engine = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let mut queries = engine.queries.lock().expect("query lock poisoned");
        queries.outstanding.remove(&key);
    });

    QueryResponseHandle {
        ltime: msg.ltime,
        id: msg.id,
        deadline,
        acks: ack_rx,
        responses: resp_rx,
    }
}

// ============================================================================
// Inbound
// ============================================================================

impl MurmurInner {
    /// Processes an inbound (or locally issued) query. Returns whether
    /// the message should continue through gossip.
    pub(crate) async fn handle_query_message(self: &Arc<Self>, msg: &QueryMessage) -> bool {
        self.query_clock.witness(msg.ltime);

        let outcome = {
            let mut queries = self.queries.lock().expect("query lock poisoned");
            if msg.ltime < queries.min_time {
                return false;
            }
            let now = self.query_clock.time();
            queries.ring.ingest(msg.ltime, now, msg.id)
        };

        match outcome {
            IngestOutcome::TooOld => {
                warn!(
                    name = %msg.name,
                    ltime = %msg.ltime,
                    "dropping query older than the ring horizon"
                );
                METRICS.incr_messages_dropped();
                return false;
            }
            IngestOutcome::Duplicate => {
                METRICS.incr_query_duplicates();
                return false;
            }
            IngestOutcome::New => {}
        }

        let rebroadcast = !msg.no_broadcast();

        if !self.query_filters_match(&msg.filters) {
            return rebroadcast;
        }
        METRICS.incr_queries_served();

        if msg.wants_ack() {
            let ack = QueryResponseMessage {
                ltime: msg.ltime,
                id: msg.id,
                from: self.config.node_name.clone(),
                flags: QUERY_FLAG_ACK,
                payload: Vec::new(),
            };
            match encode_message(MessageType::QueryResponse, &ack) {
                Ok(raw) => {
                    if let Err(e) = self.transport.send_to(msg.source_addr, raw.clone()).await {
                        warn!(dest = %msg.source_addr, error = %e, "query ack send failed");
                    }
                    self.relay_response(msg.relay_factor, msg.source_addr, &msg.source_node, raw)
                        .await;
                }
                Err(e) => warn!(error = %e, "failed to encode query ack"),
            }
        }

        let event = QueryEvent {
            ltime: msg.ltime,
            name: msg.name.clone(),
            payload: msg.payload.clone(),
            id: msg.id,
            source_addr: msg.source_addr,
            source_node: msg.source_node.clone(),
            relay_factor: msg.relay_factor,
            deadline: Instant::now() + msg.timeout,
            responded: AtomicBool::new(false),
            core: Arc::downgrade(self),
        };
        let _ = self.event_tx.send(Event::Query(event)).await;

        rebroadcast
    }

    /// Routes a query response back to its waiting handle.
    pub(crate) fn handle_query_response(&self, msg: &QueryResponseMessage) {
        self.query_clock.witness(msg.ltime);

        let mut queries = self.queries.lock().expect("query lock poisoned");
        let Some(entry) = queries.outstanding.get_mut(&(msg.ltime, msg.id)) else {
            debug!(
                ltime = %msg.ltime,
                id = msg.id,
                from = %msg.from,
                "response for unknown or expired query"
            );
            return;
        };

        if Instant::now() > entry.deadline {
            // The reaper task will remove the entry momentarily.
            return;
        }

        if msg.is_ack() {
            if !entry.acked.insert(msg.from.clone()) {
                return;
            }
            if entry.ack_tx.try_send(msg.from.clone()).is_err() {
                METRICS.incr_query_responses_dropped();
                warn!(from = %msg.from, "ack channel full, dropping ack");
            }
        } else {
            if !entry.responded.insert(msg.from.clone()) {
                return;
            }
            let response = NodeResponse {
                from: msg.from.clone(),
                payload: msg.payload.clone(),
            };
            if entry.resp_tx.try_send(response).is_err() {
                METRICS.incr_query_responses_dropped();
                warn!(from = %msg.from, "response channel full, dropping response");
            }
        }
    }

    /// Evaluates a query's filters against the local node. Kinds are
    /// ANDed; an unknown or malformed filter fails closed.
    pub(crate) fn query_filters_match(&self, filters: &[Vec<u8>]) -> bool {
        for raw in filters {
            let filter = match wire::decode_filter(raw) {
                Ok(filter) => filter,
                Err(e) => {
                    warn!(error = %e, "unrecognized query filter, not processing");
                    return false;
                }
            };

            match filter {
                Filter::Node(names) => {
                    if !names.iter().any(|n| *n == self.config.node_name) {
                        return false;
                    }
                }
                Filter::Tag { tag, expr } => {
                    let tags = self.tags.read().expect("tags lock poisoned");
                    let value = tags.get(&tag).unwrap_or("");
                    match regex::Regex::new(&expr) {
                        Ok(re) => {
                            if !re.is_match(value) {
                                return false;
                            }
                        }
                        Err(e) => {
                            warn!(expr = %expr, error = %e, "invalid tag filter regex");
                            return false;
                        }
                    }
                }
            }
        }
        true
    }
}
