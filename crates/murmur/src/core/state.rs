//! Member table and the clock-ordered state machine.
//!
//! All transitions are pure: handlers mutate the table and return what
//! should happen outside the lock (events to deliver, whether the
//! triggering message deserves rebroadcast, timers to arm). The caller
//! owns locking, event delivery, and timer scheduling, so every rule in
//! the transition table is testable without a runtime.
//!
//! # Ordering
//!
//! Transitions are gated by Lamport time: an intent carrying a time at
//! or below the member's `status_ltime` is ignored and never
//! rebroadcast. Intents may arrive before the liveness observation that
//! creates the member; those are parked in the recent-intent buffers and
//! applied when the member materializes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use murmur_types::{LamportTime, Member, MemberStatus, Tags};
use tracing::{debug, warn};

use crate::event::{MemberEvent, MemberEventType};
use crate::instrumentation::METRICS;
use crate::transport::NodeInfo;

/// Buffered intents older than this are dropped unapplied; the node
/// they reference never materialized.
pub(crate) const RECENT_INTENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// What a state-machine handler wants done once the member lock is
/// released.
#[derive(Debug, Default)]
pub(crate) struct Transition {
    /// Member events to deliver to the embedder pipeline.
    pub events: Vec<MemberEvent>,

    /// Whether the triggering message was news and should be gossiped
    /// onward.
    pub rebroadcast: bool,

    /// Arm a timer reverting this `(node, ltime)` from Leaving to Alive
    /// if the leave never completes.
    pub arm_leave_reset: Option<(String, LamportTime)>,

    /// The local node's own leave was contradicted; broadcast a fresh
    /// join intent at this time to refute it.
    pub refute_join: Option<LamportTime>,
}

impl Transition {
    fn none() -> Self {
        Self::default()
    }

    fn rebroadcast() -> Self {
        Self {
            rebroadcast: true,
            ..Self::default()
        }
    }
}

/// Internal per-member record.
#[derive(Debug, Clone)]
pub(crate) struct MemberState {
    pub member: Member,

    /// Lamport time of the last applied status change.
    pub status_ltime: LamportTime,

    /// Wall-clock instant of the last status change; drives the reaper
    /// and flap detection.
    pub status_change: Instant,
}

#[derive(Debug, Clone, Copy)]
struct IntentRecord {
    ltime: LamportTime,
    recorded: Instant,
}

/// The member table plus the failed/left working lists.
///
/// Invariant: a name is in at most one of `failed`/`left`, and only
/// while the corresponding member's status is Failed/Left.
#[derive(Debug)]
pub(crate) struct MemberDb {
    local_name: String,
    flap_timeout: Duration,

    members: HashMap<String, MemberState>,
    failed: Vec<String>,
    left: Vec<String>,

    recent_join: HashMap<String, IntentRecord>,
    recent_leave: HashMap<String, IntentRecord>,
}

impl MemberDb {
    pub(crate) fn new(local_name: String, flap_timeout: Duration) -> Self {
        Self {
            local_name,
            flap_timeout,
            members: HashMap::new(),
            failed: Vec::new(),
            left: Vec::new(),
            recent_join: HashMap::new(),
            recent_leave: HashMap::new(),
        }
    }

    // ========================================================================
    // Read access
    // ========================================================================

    pub(crate) fn get(&self, name: &str) -> Option<&MemberState> {
        self.members.get(name)
    }

    pub(crate) fn members(&self) -> Vec<Member> {
        self.members.values().map(|m| m.member.clone()).collect()
    }

    pub(crate) fn status_ltimes(&self) -> HashMap<String, LamportTime> {
        self.members
            .iter()
            .map(|(name, m)| (name.clone(), m.status_ltime))
            .collect()
    }

    pub(crate) fn left_names(&self) -> Vec<String> {
        self.left.clone()
    }

    /// Alive members other than the local node; the eligible set for
    /// query relaying and reconnection targets.
    pub(crate) fn alive_peers(&self) -> Vec<Member> {
        self.members
            .values()
            .filter(|m| m.member.status == MemberStatus::Alive && m.member.name != self.local_name)
            .map(|m| m.member.clone())
            .collect()
    }

    pub(crate) fn failed_members(&self) -> Vec<Member> {
        self.failed
            .iter()
            .filter_map(|name| self.members.get(name))
            .map(|m| m.member.clone())
            .collect()
    }

    // ========================================================================
    // Liveness observations (from the transport)
    // ========================================================================

    /// A node was observed alive.
    pub(crate) fn node_join(&mut self, node: NodeInfo, now: Instant) -> Transition {
        let tags = match Tags::decode(&node.meta) {
            Ok(tags) => tags,
            Err(e) => {
                warn!(node = %node.name, error = %e, "failed to decode member tags");
                Tags::new()
            }
        };

        if self.members.contains_key(&node.name) {
            let state = self
                .members
                .get_mut(&node.name)
                .expect("presence checked above");
            let old_status = state.member.status;

            // Rejoin after a failure inside the flap window is noise
            // worth counting.
            if old_status == MemberStatus::Failed
                && now.duration_since(state.status_change) < self.flap_timeout
            {
                METRICS.incr_member_flaps();
                debug!(node = %node.name, "member flapped");
            }

            state.member.addr = node.addr;
            state.member.tags = tags;
            state.member.protocol = node.protocol;
            state.member.delegate = node.delegate;
            state.member.status = MemberStatus::Alive;
            state.status_change = now;

            if matches!(old_status, MemberStatus::Failed | MemberStatus::Left) {
                self.erase_from_lists(&node.name);
            }
        } else {
            // Intents can precede the observation that creates the
            // member; apply whatever was parked.
            let join_ltime = self
                .take_recent(&node.name, IntentKind::Join, now)
                .unwrap_or(LamportTime::ZERO);
            let leave_ltime = self.take_recent(&node.name, IntentKind::Leave, now);

            let (status, status_ltime) = match leave_ltime {
                Some(lt) if lt > join_ltime => (MemberStatus::Leaving, lt),
                _ => (MemberStatus::Alive, join_ltime),
            };

            self.members.insert(
                node.name.clone(),
                MemberState {
                    member: Member {
                        name: node.name.clone(),
                        addr: node.addr,
                        tags,
                        status,
                        protocol: node.protocol,
                        delegate: node.delegate,
                    },
                    status_ltime,
                    status_change: now,
                },
            );
        }

        let member = self.members[&node.name].member.clone();
        debug!(node = %member.name, addr = %member.addr, "member joined");
        Transition {
            events: vec![MemberEvent {
                ty: MemberEventType::Join,
                members: vec![member],
            }],
            ..Transition::default()
        }
    }

    /// A node stopped responding or completed its departure.
    pub(crate) fn node_leave(&mut self, node: &NodeInfo, now: Instant) -> Transition {
        let Some(state) = self.members.get_mut(&node.name) else {
            // Never heard of it; nothing to transition.
            return Transition::none();
        };

        match state.member.status {
            MemberStatus::Leaving => {
                state.member.status = MemberStatus::Left;
                state.status_change = now;
                let member = state.member.clone();
                self.left.push(node.name.clone());
                debug!(node = %node.name, "member left");
                Transition {
                    events: vec![MemberEvent {
                        ty: MemberEventType::Leave,
                        members: vec![member],
                    }],
                    ..Transition::default()
                }
            }
            MemberStatus::Alive | MemberStatus::None => {
                state.member.status = MemberStatus::Failed;
                state.status_change = now;
                let member = state.member.clone();
                self.failed.push(node.name.clone());
                debug!(node = %node.name, "member failed");
                Transition {
                    events: vec![MemberEvent {
                        ty: MemberEventType::Failed,
                        members: vec![member],
                    }],
                    ..Transition::default()
                }
            }
            // Already terminal; repeated observations are uninteresting.
            MemberStatus::Left | MemberStatus::Failed => Transition::none(),
        }
    }

    /// A node's meta or address changed.
    pub(crate) fn node_update(&mut self, node: &NodeInfo, now: Instant) -> Transition {
        let Some(state) = self.members.get_mut(&node.name) else {
            return Transition::none();
        };

        match Tags::decode(&node.meta) {
            Ok(tags) => state.member.tags = tags,
            Err(e) => {
                warn!(node = %node.name, error = %e, "failed to decode updated tags");
            }
        }
        state.member.addr = node.addr;
        state.member.protocol = node.protocol;
        state.member.delegate = node.delegate;
        state.status_change = now;

        Transition {
            events: vec![MemberEvent {
                ty: MemberEventType::Update,
                members: vec![state.member.clone()],
            }],
            ..Transition::default()
        }
    }

    // ========================================================================
    // Intents (from gossip)
    // ========================================================================

    /// Applies a join intent for `node` at `ltime`.
    pub(crate) fn join_intent(&mut self, node: &str, ltime: LamportTime, now: Instant) -> Transition {
        if !self.members.contains_key(node) {
            // Park it; rebroadcast only if it was news to the buffer.
            let fresh = self.upsert_recent(node, IntentKind::Join, ltime, now);
            return if fresh {
                Transition::rebroadcast()
            } else {
                Transition::none()
            };
        }
        let state = self
            .members
            .get_mut(node)
            .expect("presence checked above");

        if ltime <= state.status_ltime {
            return Transition::none();
        }

        state.status_ltime = ltime;

        // A newer join contradicts an in-flight leave; the leave must
        // have been for an older incarnation.
        if state.member.status == MemberStatus::Leaving {
            state.member.status = MemberStatus::Alive;
            state.status_change = now;
        }

        Transition::rebroadcast()
    }

    /// Applies a leave intent for `node` at `ltime`. `local_alive` is
    /// whether the local node is in the Alive lifecycle state (a leave
    /// intent about ourselves while alive gets refuted, not applied).
    pub(crate) fn leave_intent(
        &mut self,
        node: &str,
        ltime: LamportTime,
        local_alive: bool,
        now: Instant,
    ) -> Transition {
        if !self.members.contains_key(node) {
            let fresh = self.upsert_recent(node, IntentKind::Leave, ltime, now);
            return if fresh {
                Transition::rebroadcast()
            } else {
                Transition::none()
            };
        }
        let state = self
            .members
            .get_mut(node)
            .expect("presence checked above");

        if ltime <= state.status_ltime {
            return Transition::none();
        }

        if node == self.local_name && local_alive {
            // Someone is gossiping our departure while we are alive;
            // refute with a fresh join intent instead of applying.
            warn!("refuting an outdated leave intent about the local node");
            return Transition {
                refute_join: Some(LamportTime::ZERO), // caller allocates the time
                ..Transition::default()
            };
        }

        match state.member.status {
            MemberStatus::Alive | MemberStatus::None => {
                state.member.status = MemberStatus::Leaving;
                state.status_ltime = ltime;
                state.status_change = now;
                Transition {
                    rebroadcast: true,
                    arm_leave_reset: Some((node.to_string(), ltime)),
                    ..Transition::default()
                }
            }
            MemberStatus::Failed | MemberStatus::Leaving => {
                // A leave intent for a failed member is how the cluster
                // retires it (RemoveFailedNode); for a leaving member it
                // completes the departure.
                let was_failed = state.member.status == MemberStatus::Failed;
                state.member.status = MemberStatus::Left;
                state.status_ltime = ltime;
                state.status_change = now;
                let member = state.member.clone();

                if was_failed {
                    self.erase_from_lists(node);
                }
                self.left.push(node.to_string());

                Transition {
                    events: vec![MemberEvent {
                        ty: MemberEventType::Leave,
                        members: vec![member],
                    }],
                    rebroadcast: true,
                    ..Transition::default()
                }
            }
            MemberStatus::Left => Transition::none(),
        }
    }

    /// Reverts a member to Alive if it is still Leaving at the same
    /// Lamport time; the departure it announced never completed.
    pub(crate) fn reset_leaving(&mut self, node: &str, ltime: LamportTime, now: Instant) {
        if let Some(state) = self.members.get_mut(node)
            && state.member.status == MemberStatus::Leaving
            && state.status_ltime == ltime
        {
            state.member.status = MemberStatus::Alive;
            state.status_change = now;
            debug!(node, "leave never completed, member reverted to alive");
        }
    }

    // ========================================================================
    // Reaping
    // ========================================================================

    /// Evicts failed members older than `reconnect_timeout` and left
    /// members older than `tombstone_timeout`. Returns the reaped
    /// members.
    pub(crate) fn reap(
        &mut self,
        reconnect_timeout: Duration,
        tombstone_timeout: Duration,
        now: Instant,
    ) -> Vec<Member> {
        let mut reaped = Vec::new();

        let failed = std::mem::take(&mut self.failed);
        self.failed = self.evict_expired(failed, reconnect_timeout, now, &mut reaped);

        let left = std::mem::take(&mut self.left);
        self.left = self.evict_expired(left, tombstone_timeout, now, &mut reaped);

        // Expire parked intents nobody claimed.
        self.recent_join
            .retain(|_, rec| now.duration_since(rec.recorded) < RECENT_INTENT_TIMEOUT);
        self.recent_leave
            .retain(|_, rec| now.duration_since(rec.recorded) < RECENT_INTENT_TIMEOUT);

        reaped
    }

    /// Updates the local member's tags after a `set_tags` call.
    pub(crate) fn set_local_tags(&mut self, tags: Tags) {
        let local = self.local_name.clone();
        if let Some(state) = self.members.get_mut(&local) {
            state.member.tags = tags;
        }
    }

    /// Walks one eviction list, removing expired members from the table
    /// and returning the survivors.
    fn evict_expired(
        &mut self,
        list: Vec<String>,
        timeout: Duration,
        now: Instant,
        reaped: &mut Vec<Member>,
    ) -> Vec<String> {
        let mut keep = Vec::with_capacity(list.len());
        for name in list {
            match self.members.get(&name) {
                Some(state) if now.duration_since(state.status_change) > timeout => {
                    let state = self.members.remove(&name).expect("member present");
                    reaped.push(state.member);
                }
                Some(_) => keep.push(name),
                // List entry without a member record; drop it.
                None => {}
            }
        }
        keep
    }

    // ========================================================================
    // Intent buffer plumbing
    // ========================================================================

    fn recent_map(&mut self, kind: IntentKind) -> &mut HashMap<String, IntentRecord> {
        match kind {
            IntentKind::Join => &mut self.recent_join,
            IntentKind::Leave => &mut self.recent_leave,
        }
    }

    /// Records an intent for an unknown node. Returns true if the
    /// buffer changed (a fresh node, a newer time, or a stale entry
    /// being replaced).
    fn upsert_recent(
        &mut self,
        node: &str,
        kind: IntentKind,
        ltime: LamportTime,
        now: Instant,
    ) -> bool {
        let map = self.recent_map(kind);
        match map.get(node) {
            Some(existing)
                if existing.ltime >= ltime
                    && now.duration_since(existing.recorded) < RECENT_INTENT_TIMEOUT =>
            {
                false
            }
            _ => {
                map.insert(
                    node.to_string(),
                    IntentRecord {
                        ltime,
                        recorded: now,
                    },
                );
                true
            }
        }
    }

    /// Consumes a parked intent if it is still fresh.
    fn take_recent(&mut self, node: &str, kind: IntentKind, now: Instant) -> Option<LamportTime> {
        let rec = self.recent_map(kind).remove(node)?;
        (now.duration_since(rec.recorded) < RECENT_INTENT_TIMEOUT).then_some(rec.ltime)
    }

    fn erase_from_lists(&mut self, name: &str) {
        self.failed.retain(|n| n != name);
        self.left.retain(|n| n != name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentKind {
    Join,
    Leave,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;

    use bytes::Bytes;
    use murmur_types::VersionRange;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn info(name: &str, port: u16) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            addr: addr(port),
            meta: Bytes::new(),
            protocol: VersionRange::new(1, 1, 1),
            delegate: VersionRange::new(1, 1, 1),
        }
    }

    fn db() -> MemberDb {
        MemberDb::new("local".to_string(), Duration::from_secs(60))
    }

    fn t(v: u64) -> LamportTime {
        LamportTime::new(v)
    }

    #[test]
    fn join_creates_alive_member() {
        let mut db = db();
        let out = db.node_join(info("a", 1), Instant::now());

        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].ty, MemberEventType::Join);
        let state = db.get("a").unwrap();
        assert_eq!(state.member.status, MemberStatus::Alive);
        assert_eq!(state.status_ltime, LamportTime::ZERO);
    }

    #[test]
    fn buffered_join_intent_applies_on_join() {
        let mut db = db();
        let now = Instant::now();

        let out = db.join_intent("a", t(5), now);
        assert!(out.rebroadcast, "fresh parked intent should rebroadcast");

        db.node_join(info("a", 1), now);
        assert_eq!(db.get("a").unwrap().status_ltime, t(5));
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Alive);
    }

    #[test]
    fn buffered_leave_wins_over_older_join() {
        let mut db = db();
        let now = Instant::now();

        db.join_intent("a", t(5), now);
        db.leave_intent("a", t(8), true, now);
        db.node_join(info("a", 1), now);

        let state = db.get("a").unwrap();
        assert_eq!(state.member.status, MemberStatus::Leaving);
        assert_eq!(state.status_ltime, t(8));
    }

    #[test]
    fn duplicate_parked_intent_not_rebroadcast() {
        let mut db = db();
        let now = Instant::now();
        assert!(db.join_intent("a", t(5), now).rebroadcast);
        assert!(!db.join_intent("a", t(5), now).rebroadcast);
        assert!(!db.join_intent("a", t(3), now).rebroadcast);
        assert!(db.join_intent("a", t(6), now).rebroadcast);
    }

    #[test]
    fn stale_intent_ignored() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);
        db.join_intent("a", t(10), now);

        let out = db.join_intent("a", t(10), now);
        assert!(!out.rebroadcast);
        let out = db.join_intent("a", t(4), now);
        assert!(!out.rebroadcast);
        assert_eq!(db.get("a").unwrap().status_ltime, t(10));
    }

    #[test]
    fn leave_intent_marks_leaving_and_arms_timer() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);

        let out = db.leave_intent("a", t(3), true, now);
        assert!(out.rebroadcast);
        assert_eq!(out.arm_leave_reset, Some(("a".to_string(), t(3))));
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Leaving);
    }

    #[test]
    fn node_leave_after_leaving_is_left() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);
        db.leave_intent("a", t(3), true, now);

        let out = db.node_leave(&info("a", 1), now);
        assert_eq!(out.events[0].ty, MemberEventType::Leave);
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Left);
        assert_eq!(db.left_names(), vec!["a".to_string()]);
    }

    #[test]
    fn node_leave_while_alive_is_failure() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);

        let out = db.node_leave(&info("a", 1), now);
        assert_eq!(out.events[0].ty, MemberEventType::Failed);
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Failed);
        assert_eq!(db.failed_members().len(), 1);
    }

    #[test]
    fn repeated_node_leave_is_silent() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);
        db.node_leave(&info("a", 1), now);

        let out = db.node_leave(&info("a", 1), now);
        assert!(out.events.is_empty());
    }

    #[test]
    fn newer_join_intent_aborts_leaving() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);
        db.leave_intent("a", t(3), true, now);

        let out = db.join_intent("a", t(4), now);
        assert!(out.rebroadcast);
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Alive);
        assert_eq!(db.get("a").unwrap().status_ltime, t(4));
    }

    #[test]
    fn leave_intent_on_failed_member_retires_it() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);
        db.node_leave(&info("a", 1), now);

        let out = db.leave_intent("a", t(9), true, now);
        assert!(out.rebroadcast);
        assert_eq!(out.events[0].ty, MemberEventType::Leave);
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Left);
        assert!(db.failed_members().is_empty());
        assert_eq!(db.left_names(), vec!["a".to_string()]);
    }

    #[test]
    fn leave_intent_about_live_self_requests_refutation() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("local", 1), now);

        let out = db.leave_intent("local", t(7), true, now);
        assert!(out.refute_join.is_some());
        assert!(!out.rebroadcast);
        assert_eq!(db.get("local").unwrap().member.status, MemberStatus::Alive);
    }

    #[test]
    fn leave_intent_about_leaving_self_applies() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("local", 1), now);

        let out = db.leave_intent("local", t(7), false, now);
        assert!(out.rebroadcast);
        assert_eq!(db.get("local").unwrap().member.status, MemberStatus::Leaving);
    }

    #[test]
    fn reset_leaving_reverts_only_matching_ltime() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);
        db.leave_intent("a", t(3), true, now);

        // A newer leave superseded the timer's generation; no revert.
        db.leave_intent("a", t(4), true, now);
        db.reset_leaving("a", t(3), now);
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Leaving);

        db.reset_leaving("a", t(4), now);
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Alive);
    }

    #[test]
    fn rejoin_after_failure_clears_failed_list() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);
        db.node_leave(&info("a", 1), now);
        assert_eq!(db.failed_members().len(), 1);

        let out = db.node_join(info("a", 1), now);
        assert_eq!(out.events[0].ty, MemberEventType::Join);
        assert!(db.failed_members().is_empty());
        assert_eq!(db.get("a").unwrap().member.status, MemberStatus::Alive);
    }

    #[test]
    fn reap_evicts_by_age_and_list() {
        let mut db = db();
        let start = Instant::now();
        db.node_join(info("a", 1), start);
        db.node_leave(&info("a", 1), start);

        db.node_join(info("b", 2), start);
        db.leave_intent("b", t(2), true, start);
        db.node_leave(&info("b", 2), start);

        // Short reconnect timeout, long tombstone: only the failed
        // member goes.
        let later = start + Duration::from_secs(100);
        let reaped = db.reap(
            Duration::from_secs(50),
            Duration::from_secs(1_000),
            later,
        );
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].name, "a");
        assert!(db.get("a").is_none());
        assert!(db.get("b").is_some());

        let much_later = start + Duration::from_secs(2_000);
        let reaped = db.reap(
            Duration::from_secs(50),
            Duration::from_secs(1_000),
            much_later,
        );
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].name, "b");
        assert!(db.get("b").is_none());
    }

    #[test]
    fn name_in_at_most_one_list() {
        let mut db = db();
        let now = Instant::now();
        db.node_join(info("a", 1), now);
        db.node_leave(&info("a", 1), now); // failed
        db.leave_intent("a", t(5), true, now); // failed -> left

        assert!(db.failed_members().is_empty());
        assert_eq!(db.left_names(), vec!["a".to_string()]);
    }
}
