//! The membership core.
//!
//! [`Murmur`] is the embedder-facing handle: a cheaply cloneable wrapper
//! over the shared node state. The core is internally concurrent; every
//! public method is safe to call from any task.
//!
//! # Lifecycle
//!
//! ```text
//! Alive ──leave()──► Leaving ──► Left
//!   │                              │
//!   └───────────shutdown()─────────┴──► Shutdown
//! ```
//!
//! # Locking
//!
//! Three lock domains, acquired in this order when nested: lifecycle
//! `state`, member table `members`, then the event/query cores. No lock
//! is held across a channel send to the embedder pipeline or across any
//! transport call.

mod messages;
mod pushpull;
pub(crate) mod state;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use bytes::Bytes;
use murmur_coordinate::{Client as CoordinateClient, Coordinate};
use murmur_types::{LamportClock, LamportTime, Member, Tags};
use murmur_wire::{JoinIntent, LeaveIntent, MessageType, UserEventMessage, encode_message};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::broadcast::BroadcastQueue;
use crate::coalesce;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, MemberEvent, UserEventData};
use crate::instrumentation::METRICS;
use crate::internal_query;
use crate::key_manager::KeyManager;
use crate::query::{QueryCore, QueryParams, QueryResponseHandle};
use crate::reap;
use crate::ring::{EventRing, IngestOutcome};
use crate::snapshot::{self, SnapshotHandle};
use crate::transport::Transport;

use self::state::MemberDb;

// ============================================================================
// Lifecycle State
// ============================================================================

/// Lifecycle state of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MurmurState {
    /// Participating normally.
    Alive,
    /// A graceful leave is in progress.
    Leaving,
    /// Gracefully departed; the node no longer gossips.
    Left,
    /// Hard-stopped.
    Shutdown,
}

impl fmt::Display for MurmurState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MurmurState::Alive => "alive",
            MurmurState::Leaving => "leaving",
            MurmurState::Left => "left",
            MurmurState::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Shared Inner State
// ============================================================================

/// Event ring plus its admission floor.
pub(crate) struct EventCore {
    pub(crate) ring: EventRing,

    /// Events below this time were consumed before a restart (or
    /// belong to a join we chose not to replay) and must not be
    /// redelivered.
    pub(crate) min_time: LamportTime,
}

/// Coordinate client plus the peer coordinate cache.
pub(crate) struct CoordState {
    pub(crate) client: Mutex<CoordinateClient>,
    pub(crate) cache: RwLock<HashMap<String, Coordinate>>,
}

pub(crate) struct MurmurInner {
    pub(crate) config: Config,
    pub(crate) transport: Arc<dyn Transport>,

    /// Member, event, and query Lamport clocks; independent domains.
    pub(crate) clock: LamportClock,
    pub(crate) event_clock: LamportClock,
    pub(crate) query_clock: LamportClock,

    pub(crate) state: RwLock<MurmurState>,
    pub(crate) members: Mutex<MemberDb>,
    pub(crate) events: Mutex<EventCore>,
    pub(crate) queries: Mutex<QueryCore>,

    /// Local tags; mutable via `set_tags`, gossiped as the meta blob.
    pub(crate) tags: RwLock<Tags>,

    pub(crate) broadcasts: BroadcastQueue,

    /// Head of the embedder event pipeline.
    pub(crate) event_tx: mpsc::Sender<Event>,

    /// Closing signal for every background task.
    pub(crate) shutdown_tx: watch::Sender<bool>,

    /// While set, user events learned through push/pull are witnessed
    /// but not delivered (join with `replay = false`).
    pub(crate) event_join_ignore: AtomicBool,

    /// Serializes `join` calls so `event_join_ignore` stays coherent.
    pub(crate) join_lock: tokio::sync::Mutex<()>,

    pub(crate) coord: Option<CoordState>,
    pub(crate) snapshot: Option<SnapshotHandle>,
}

impl MurmurInner {
    pub(crate) fn current_state(&self) -> MurmurState {
        *self.state.read().expect("state lock poisoned")
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Delivers member events into the pipeline, outside any lock.
    pub(crate) async fn deliver_member_events(&self, events: Vec<MemberEvent>) {
        for ev in events {
            METRICS.incr_events_delivered();
            if self.event_tx.send(Event::Member(ev)).await.is_err() {
                // Pipeline is gone; we are shutting down.
                return;
            }
        }
    }

    /// Applies the non-lock parts of a state transition: event
    /// delivery, leave-reset timers, refutation.
    pub(crate) async fn apply_transition(self: &Arc<Self>, tr: state::Transition) -> bool {
        if tr.refute_join.is_some() {
            let ltime = self.clock.increment();
            Box::pin(self.broadcast_join(ltime)).await;
        }

        if let Some((node, ltime)) = tr.arm_leave_reset {
            self.arm_leave_reset(node, ltime);
        }

        let rebroadcast = tr.rebroadcast;
        self.deliver_member_events(tr.events).await;
        rebroadcast
    }

    /// Broadcasts (and locally applies) a join intent for this node.
    pub(crate) async fn broadcast_join(self: &Arc<Self>, ltime: LamportTime) {
        let node = self.config.node_name.clone();
        let msg = JoinIntent {
            ltime,
            node: node.clone(),
        };
        self.clock.witness(ltime);

        let tr = {
            let mut db = self.members.lock().expect("member lock poisoned");
            db.join_intent(&node, ltime, Instant::now())
        };
        self.apply_transition(tr).await;

        match encode_message(MessageType::Join, &msg) {
            Ok(raw) => self
                .broadcasts
                .queue_intent(MessageType::Join, &node, raw, None),
            Err(e) => warn!(error = %e, "failed to encode join intent"),
        }
    }

    /// Arms the timer that reverts a stuck Leaving member to Alive.
    fn arm_leave_reset(self: &Arc<Self>, node: String, ltime: LamportTime) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown_rx();
        let timeout = self.config.leave_timeout;
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    let mut db = inner.members.lock().expect("member lock poisoned");
                    db.reset_leaving(&node, ltime, Instant::now());
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    /// Applies a user event locally. Returns true when the event was
    /// new (deliver + rebroadcast).
    pub(crate) async fn handle_user_event(&self, msg: &UserEventMessage) -> bool {
        self.event_clock.witness(msg.ltime);

        let outcome = {
            let mut events = self.events.lock().expect("event lock poisoned");
            if msg.ltime < events.min_time {
                return false;
            }
            let now = self.event_clock.time();
            events.ring.ingest(msg.ltime, now, &msg.name, &msg.payload)
        };

        match outcome {
            IngestOutcome::TooOld => {
                warn!(
                    name = %msg.name,
                    ltime = %msg.ltime,
                    "dropping user event older than the ring horizon"
                );
                METRICS.incr_messages_dropped();
                false
            }
            IngestOutcome::Duplicate => false,
            IngestOutcome::New => {
                if msg.name.starts_with(internal_query::INTERNAL_PREFIX) {
                    // Reserved namespace; gossip it onward but keep it
                    // away from the embedder.
                    warn!(name = %msg.name, "user event in the reserved namespace");
                    return true;
                }
                METRICS.incr_events_delivered();
                let _ = self
                    .event_tx
                    .send(Event::User(UserEventData {
                        ltime: msg.ltime,
                        name: msg.name.clone(),
                        payload: msg.payload.clone(),
                        coalesce: msg.coalesce,
                    }))
                    .await;
                true
            }
        }
    }

    /// Default query deadline: `gossip_interval * mult * ceil(log10(n + 1))`.
    pub(crate) fn default_query_timeout(&self) -> std::time::Duration {
        let n = self.transport.num_nodes().max(1);
        let scale = ((n + 1) as f64).log10().ceil().max(1.0) as u32;
        self.config.gossip_interval * self.config.query_timeout_mult * scale
    }
}

// ============================================================================
// Public Handle
// ============================================================================

/// A handle to a running Murmur node.
///
/// Clones share the same node. Dropping all handles does not stop the
/// node; call [`shutdown`](Murmur::shutdown).
#[derive(Clone)]
pub struct Murmur {
    inner: Arc<MurmurInner>,
}

impl fmt::Debug for Murmur {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Murmur")
            .field("node", &self.inner.config.node_name)
            .field("state", &self.inner.current_state())
            .finish()
    }
}

impl Murmur {
    /// Creates a node, wires it to the transport, and starts the
    /// background machinery.
    ///
    /// Returns the handle plus the event channel carrying member
    /// changes, user events, and queries (after snapshotting and
    /// optional coalescing).
    pub async fn create(
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<(Murmur, mpsc::Receiver<Event>)> {
        config.validate()?;

        // Recover clocks and the previous-member list before anything
        // starts moving.
        let replayed = match &config.snapshot_path {
            Some(path) => Some(snapshot::replay(path)?),
            None => None,
        };

        let clock = LamportClock::new();
        let event_clock = LamportClock::new();
        let query_clock = LamportClock::new();
        let mut event_min_time = LamportTime::ZERO;
        let mut query_min_time = LamportTime::ZERO;
        if let Some(replay) = &replayed {
            clock.witness(replay.last_clock);
            if replay.last_event_clock > LamportTime::ZERO {
                event_min_time = replay.last_event_clock.next();
                event_clock.witness(replay.last_event_clock);
            }
            if replay.last_query_clock > LamportTime::ZERO {
                query_min_time = replay.last_query_clock.next();
                query_clock.witness(replay.last_query_clock);
            }
        }

        let (shutdown_tx, _) = watch::channel(false);

        // Build the event pipeline back to front:
        //   core -> internal queries -> snapshot -> coalescers -> embedder
        let capacity = config.event_channel_capacity;
        let (embedder_tx, embedder_rx) = mpsc::channel(capacity);

        let mut tail_tx = embedder_tx;
        if config.user_coalescing_enabled() {
            let (tx, rx) = mpsc::channel(capacity);
            coalesce::spawn_user_coalescer(
                rx,
                tail_tx,
                config.user_coalesce_period,
                config.user_quiescent_period,
                shutdown_tx.subscribe(),
            );
            tail_tx = tx;
        }
        if config.member_coalescing_enabled() {
            let (tx, rx) = mpsc::channel(capacity);
            coalesce::spawn_member_coalescer(
                rx,
                tail_tx,
                config.coalesce_period,
                config.quiescent_period,
                shutdown_tx.subscribe(),
            );
            tail_tx = tx;
        }

        let mut snapshot_stage = None;
        if config.snapshot_path.is_some() {
            let (tx, rx) = mpsc::channel(capacity);
            snapshot_stage = Some((rx, tail_tx));
            tail_tx = tx;
        }

        let (internal_tx, internal_rx) = mpsc::channel(capacity);
        let internal_out = tail_tx;
        let event_tx = internal_tx;

        let coord = config.coordinate.clone().map(|cfg| {
            let mut client = CoordinateClient::new(cfg);
            let mut cache = HashMap::new();
            if let Some(replay) = &replayed {
                for (name, coordinate) in &replay.coordinates {
                    if *name == config.node_name {
                        if let Err(e) = client.set_coordinate(coordinate.clone()) {
                            warn!(error = %e, "ignoring incompatible persisted coordinate");
                        }
                    } else {
                        cache.insert(name.clone(), coordinate.clone());
                    }
                }
            }
            CoordState {
                client: Mutex::new(client),
                cache: RwLock::new(cache),
            }
        });

        let snapshot_handle = match (&config.snapshot_path, snapshot_stage) {
            (Some(path), Some((rx, out))) => {
                let replay = replayed.as_ref().expect("replay ran for snapshot path");
                Some(snapshot::start(
                    path.clone(),
                    &config,
                    replay,
                    rx,
                    out,
                    shutdown_tx.subscribe(),
                )?)
            }
            _ => None,
        };

        let inner = Arc::new(MurmurInner {
            members: Mutex::new(MemberDb::new(
                config.node_name.clone(),
                config.flap_timeout,
            )),
            events: Mutex::new(EventCore {
                ring: EventRing::new(config.event_buffer_size),
                min_time: event_min_time,
            }),
            queries: Mutex::new(QueryCore::new(config.query_buffer_size, query_min_time)),
            tags: RwLock::new(config.tags.clone()),
            broadcasts: BroadcastQueue::new(
                Arc::clone(&transport),
                config.broadcast_queue_depth_warning,
            ),
            clock,
            event_clock,
            query_clock,
            state: RwLock::new(MurmurState::Alive),
            event_tx,
            shutdown_tx,
            event_join_ignore: AtomicBool::new(false),
            join_lock: tokio::sync::Mutex::new(()),
            coord,
            snapshot: snapshot_handle,
            transport: Arc::clone(&transport),
            config,
        });

        // Snapshot clock/coordinate ticker needs the inner handle.
        if inner.snapshot.is_some() {
            snapshot::spawn_clock_ticker(Arc::clone(&inner));
        }

        internal_query::spawn(Arc::clone(&inner), internal_rx, internal_out);

        let delegate = Arc::new(crate::delegate::CoreDelegate::new(Arc::downgrade(&inner)));
        transport.start(delegate).await?;

        // Stamp our own presence so peers order us correctly.
        let ltime = inner.clock.increment();
        inner.broadcast_join(ltime).await;

        reap::spawn_reaper(Arc::clone(&inner));
        reap::spawn_reconnector(Arc::clone(&inner));

        info!(node = %inner.config.node_name, "murmur node started");
        Ok((Murmur { inner }, embedder_rx))
    }

    pub(crate) fn from_inner(inner: Arc<MurmurInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<MurmurInner> {
        &self.inner
    }

    /// The node's own name.
    pub fn local_name(&self) -> &str {
        &self.inner.config.node_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MurmurState {
        self.inner.current_state()
    }

    /// Snapshot of the member table, the local node included.
    pub fn members(&self) -> Vec<Member> {
        self.inner
            .members
            .lock()
            .expect("member lock poisoned")
            .members()
    }

    /// Number of known members (any status).
    pub fn num_members(&self) -> usize {
        self.members().len()
    }

    /// Joins an existing cluster by contacting the given peers.
    ///
    /// Returns how many peers were successfully contacted. With
    /// `replay` false, user events carried by the initial push/pull are
    /// witnessed (the event clock advances) but not delivered.
    pub async fn join(&self, peers: &[SocketAddr], replay: bool) -> Result<usize> {
        let state = self.state();
        if state != MurmurState::Alive {
            return Err(Error::WrongState {
                required: MurmurState::Alive,
                actual: state,
            });
        }

        let _guard = self.inner.join_lock.lock().await;
        if !replay {
            self.inner.event_join_ignore.store(true, Ordering::SeqCst);
        }

        let (contacted, outcome) = self.inner.transport.join(peers).await;
        if contacted > 0 {
            let ltime = self.inner.clock.increment();
            self.inner.broadcast_join(ltime).await;
        }

        if !replay {
            self.inner.event_join_ignore.store(false, Ordering::SeqCst);
        }

        match outcome {
            Ok(()) => Ok(contacted),
            Err(source) => Err(Error::JoinFailed { contacted, source }),
        }
    }

    /// Gracefully leaves the cluster.
    ///
    /// Broadcasts a leave intent, waits up to `broadcast_timeout` for
    /// the transmit notifier, then performs the transport-level leave.
    /// On notifier timeout the sequence still completes; the timeout is
    /// reported afterwards. Idempotent once Left.
    pub async fn leave(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().expect("state lock poisoned");
            match *state {
                MurmurState::Left => return Ok(()),
                MurmurState::Leaving => return Err(Error::LeaveInProgress),
                MurmurState::Shutdown => {
                    return Err(Error::WrongState {
                        required: MurmurState::Alive,
                        actual: MurmurState::Shutdown,
                    });
                }
                MurmurState::Alive => *state = MurmurState::Leaving,
            }
        }

        if let Some(snapshot) = &self.inner.snapshot {
            snapshot.leave().await;
        }

        let node = self.inner.config.node_name.clone();
        let ltime = self.inner.clock.increment();
        let msg = LeaveIntent {
            ltime,
            node: node.clone(),
        };
        self.inner.clock.witness(ltime);

        // Apply our own departure; we are Leaving, so it lands.
        let tr = {
            let mut db = self.inner.members.lock().expect("member lock poisoned");
            db.leave_intent(&node, ltime, false, Instant::now())
        };
        self.inner.apply_transition(tr).await;

        let raw = encode_message(MessageType::Leave, &msg)?;
        let (notify_tx, notify_rx) = tokio::sync::oneshot::channel();
        self.inner
            .broadcasts
            .queue_intent(MessageType::Leave, &node, raw, Some(notify_tx));

        let timed_out = tokio::time::timeout(self.inner.config.broadcast_timeout, notify_rx)
            .await
            .is_err();
        if timed_out {
            warn!("leave broadcast did not finish before the timeout");
        }

        self.inner
            .transport
            .leave(self.inner.config.broadcast_timeout)
            .await?;

        if !self.inner.config.leave_propagate_delay.is_zero() {
            tokio::time::sleep(self.inner.config.leave_propagate_delay).await;
        }

        {
            let mut state = self.inner.state.write().expect("state lock poisoned");
            if *state != MurmurState::Shutdown {
                *state = MurmurState::Left;
            }
        }

        if timed_out {
            Err(Error::BroadcastTimeout)
        } else {
            Ok(())
        }
    }

    /// Hard-stops the node: no departure broadcast, background tasks
    /// terminated, event channel closed. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().expect("state lock poisoned");
            if *state == MurmurState::Shutdown {
                return Ok(());
            }
            if *state != MurmurState::Left {
                warn!("shutdown without a graceful leave");
            }
            *state = MurmurState::Shutdown;
        }

        self.inner.transport.shutdown().await?;
        let _ = self.inner.shutdown_tx.send(true);

        if let Some(snapshot) = &self.inner.snapshot {
            snapshot.wait().await;
        }
        Ok(())
    }

    /// Broadcasts a named user event cluster-wide.
    pub async fn user_event(&self, name: &str, payload: &[u8], coalesce: bool) -> Result<()> {
        let state = self.state();
        if !matches!(state, MurmurState::Alive | MurmurState::Leaving) {
            return Err(Error::WrongState {
                required: MurmurState::Alive,
                actual: state,
            });
        }

        let size = name.len() + payload.len();
        if size > self.inner.config.user_event_size_limit {
            return Err(Error::UserEventTooLarge {
                size,
                limit: self.inner.config.user_event_size_limit,
            });
        }

        let msg = UserEventMessage {
            ltime: self.inner.event_clock.increment(),
            name: name.to_string(),
            payload: payload.to_vec(),
            coalesce,
        };

        // Local apply first; it witnesses the clock and delivers to our
        // own embedder.
        let fresh = self.inner.handle_user_event(&msg).await;
        debug_assert!(fresh, "locally issued event must be new");

        let raw = encode_message(MessageType::UserEvent, &msg)?;
        self.inner.broadcasts.queue_user_event(name, coalesce, raw);
        Ok(())
    }

    /// Issues a cluster-wide query and returns a handle for collecting
    /// acks and responses until the deadline.
    pub async fn query(
        &self,
        name: &str,
        payload: &[u8],
        params: QueryParams,
    ) -> Result<QueryResponseHandle> {
        crate::query::start_query(self.inner(), name, payload, params).await
    }

    /// Retires a Failed member immediately instead of waiting out the
    /// reconnect window, and broadcasts the transition.
    pub async fn remove_failed_node(&self, name: &str) -> Result<()> {
        let node = name.to_string();
        let ltime = self.inner.clock.increment();
        let msg = LeaveIntent {
            ltime,
            node: node.clone(),
        };
        self.inner.clock.witness(ltime);

        let local_alive = self.state() == MurmurState::Alive;
        let tr = {
            let mut db = self.inner.members.lock().expect("member lock poisoned");
            db.leave_intent(&node, ltime, local_alive, Instant::now())
        };
        self.inner.apply_transition(tr).await;

        let raw = encode_message(MessageType::Leave, &msg)?;
        let (notify_tx, notify_rx) = tokio::sync::oneshot::channel();
        self.inner
            .broadcasts
            .queue_intent(MessageType::Leave, &node, raw, Some(notify_tx));

        if tokio::time::timeout(self.inner.config.broadcast_timeout, notify_rx)
            .await
            .is_err()
        {
            return Err(Error::BroadcastTimeout);
        }
        Ok(())
    }

    /// Replaces the local tags and re-gossips the member record.
    pub async fn set_tags(&self, tags: Tags) -> Result<()> {
        let meta = tags.encode()?;
        {
            let mut current = self.inner.tags.write().expect("tags lock poisoned");
            *current = tags.clone();
        }
        {
            let mut db = self.inner.members.lock().expect("member lock poisoned");
            db.set_local_tags(tags);
        }
        self.inner
            .transport
            .update_node(Bytes::from(meta))
            .await
            .map_err(Into::into)
    }

    /// The local node's network coordinate.
    pub fn get_coordinate(&self) -> Result<Coordinate> {
        let coord = self
            .inner
            .coord
            .as_ref()
            .ok_or(Error::CoordinatesDisabled)?;
        Ok(coord
            .client
            .lock()
            .expect("coordinate lock poisoned")
            .get_coordinate())
    }

    /// The most recently gossiped coordinate of `name`, if any.
    pub fn get_cached_coordinate(&self, name: &str) -> Result<Option<Coordinate>> {
        let coord = self
            .inner
            .coord
            .as_ref()
            .ok_or(Error::CoordinatesDisabled)?;
        Ok(coord
            .cache
            .read()
            .expect("coordinate cache poisoned")
            .get(name)
            .cloned())
    }

    /// The deadline a query gets when its params leave the timeout
    /// unset: a cluster-size-scaled multiple of the gossip interval.
    pub fn default_query_timeout(&self) -> std::time::Duration {
        self.inner.default_query_timeout()
    }

    /// Cluster-wide key management over internal queries.
    pub fn key_manager(&self) -> KeyManager {
        KeyManager::new(self.clone())
    }

    /// Peers recorded alive in the snapshot before the last restart;
    /// the natural rejoin targets. Empty without a snapshot.
    pub fn previous_nodes(&self) -> Vec<crate::snapshot::PreviousNode> {
        self.inner
            .snapshot
            .as_ref()
            .map(|s| s.previous_nodes())
            .unwrap_or_default()
    }
}
