//! In-memory gossip transport for integration tests.
//!
//! Implements the full [`Transport`] contract against a shared
//! in-process router: join performs a two-way push/pull and links the
//! nodes, queued broadcasts fan out to every linked peer on a gossip
//! tick, a probe loop detects hard-stopped peers and reports them as
//! leaves, and probe completions carry coordinate ack payloads with a
//! synthetic RTT.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use murmur::transport::{Broadcast, GossipDelegate, NodeInfo, Transport, TransportError};
use murmur::{Config, Event, Keyring, Murmur, VersionRange};
use tokio::sync::{mpsc, watch};

/// Gossip/probe cadence for tests; everything else scales off this.
pub const TICK: Duration = Duration::from_millis(20);

/// Synthetic round-trip time reported for every completed probe.
pub const FAKE_RTT: Duration = Duration::from_millis(5);

// ============================================================================
// Router
// ============================================================================

struct QueuedBroadcast {
    key: Option<String>,
    msg: Bytes,
    notify: Option<tokio::sync::oneshot::Sender<()>>,
}

/// One registered endpoint; shared between the transport handle and its
/// driver task.
struct Endpoint {
    name: String,
    addr: SocketAddr,
    delegate: RwLock<Option<Arc<dyn GossipDelegate>>>,
    alive: AtomicBool,

    /// Peers this endpoint gossips with.
    links: Mutex<HashSet<SocketAddr>>,

    /// Pending broadcasts, keyed invalidation applied on enqueue.
    queue: Mutex<Vec<QueuedBroadcast>>,
}

impl Endpoint {
    fn delegate(&self) -> Option<Arc<dyn GossipDelegate>> {
        self.delegate.read().expect("delegate lock").clone()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn linked(&self) -> Vec<SocketAddr> {
        self.links.lock().expect("links lock").iter().copied().collect()
    }

    async fn node_info(&self) -> NodeInfo {
        let meta = match self.delegate() {
            Some(d) => d.node_meta().await,
            None => Bytes::new(),
        };
        NodeInfo {
            name: self.name.clone(),
            addr: self.addr,
            meta,
            protocol: VersionRange::new(1, 1, 1),
            delegate: VersionRange::new(1, 1, 1),
        }
    }
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    endpoints: Arc<Mutex<HashMap<SocketAddr, Arc<Endpoint>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint(&self, addr: SocketAddr) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().expect("router lock").get(&addr).cloned()
    }

    fn register(&self, name: &str, addr: SocketAddr) -> Arc<Endpoint> {
        let endpoint = Arc::new(Endpoint {
            name: name.to_string(),
            addr,
            delegate: RwLock::new(None),
            alive: AtomicBool::new(false),
            links: Mutex::new(HashSet::new()),
            queue: Mutex::new(Vec::new()),
        });
        // A restart at the same address replaces the dead incarnation.
        self.endpoints
            .lock()
            .expect("router lock")
            .insert(addr, Arc::clone(&endpoint));
        endpoint
    }

    fn alive_endpoint(&self, addr: SocketAddr) -> Option<Arc<Endpoint>> {
        self.endpoint(addr).filter(|ep| ep.is_alive())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Drains the broadcast queue to every linked alive peer, then fires
/// the transmit notifiers.
async fn gossip_round(network: &LocalNetwork, endpoint: &Arc<Endpoint>) {
    let drained: Vec<QueuedBroadcast> =
        std::mem::take(&mut *endpoint.queue.lock().expect("queue lock"));
    if drained.is_empty() {
        return;
    }

    let peers: Vec<Arc<Endpoint>> = endpoint
        .linked()
        .into_iter()
        .filter_map(|addr| network.alive_endpoint(addr))
        .collect();

    for broadcast in drained {
        for peer in &peers {
            if let Some(delegate) = peer.delegate() {
                delegate.notify_message(broadcast.msg.clone()).await;
            }
        }
        if let Some(notify) = broadcast.notify {
            let _ = notify.send(());
        }
    }
}

/// Probes every linked peer: dead ones are reported as leaves and
/// unlinked, live ones complete a ping with a coordinate ack payload.
async fn probe_round(network: &LocalNetwork, endpoint: &Arc<Endpoint>) {
    let Some(delegate) = endpoint.delegate() else {
        return;
    };

    for addr in endpoint.linked() {
        let peer = network.endpoint(addr);
        let peer_alive = peer.as_ref().is_some_and(|p| p.is_alive());

        if !peer_alive {
            endpoint.links.lock().expect("links lock").remove(&addr);
            if let Some(peer) = peer {
                delegate.notify_leave(peer.node_info().await).await;
            }
            continue;
        }

        let peer = peer.expect("alive peer present");
        if let Some(peer_delegate) = peer.delegate() {
            let payload = peer_delegate.ack_payload().await;
            delegate
                .notify_ping_complete(peer.name.clone(), FAKE_RTT, payload)
                .await;
        }
    }
}

/// Periodic anti-entropy with one random linked peer.
async fn push_pull_round(network: &LocalNetwork, endpoint: &Arc<Endpoint>) {
    let Some(ours) = endpoint.delegate() else { return };
    let linked = endpoint.linked();
    let Some(&addr) = linked.first() else { return };
    let Some(peer) = network.alive_endpoint(addr) else {
        return;
    };
    let Some(theirs) = peer.delegate() else { return };

    let our_state = ours.local_state(false).await;
    let their_state = theirs.local_state(false).await;
    theirs.merge_remote_state(our_state, false).await;
    ours.merge_remote_state(their_state, false).await;
}

fn spawn_driver(network: LocalNetwork, endpoint: Arc<Endpoint>, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TICK);
        let mut rounds: u64 = 0;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !endpoint.is_alive() {
                        return;
                    }
                    gossip_round(&network, &endpoint).await;
                    probe_round(&network, &endpoint).await;
                    rounds += 1;
                    // Anti-entropy runs far less often than gossip.
                    if rounds % 16 == 0 {
                        push_pull_round(&network, &endpoint).await;
                    }
                }
                _ = stop.changed() => return,
            }
        }
    });
}

// ============================================================================
// Transport
// ============================================================================

pub struct LocalTransport {
    network: LocalNetwork,
    endpoint: Arc<Endpoint>,
    keyring: Option<Arc<Keyring>>,
    stop_tx: watch::Sender<bool>,
}

impl LocalTransport {
    pub fn new(network: &LocalNetwork, name: &str, addr: SocketAddr) -> Arc<Self> {
        Self::with_keyring(network, name, addr, None)
    }

    pub fn with_keyring(
        network: &LocalNetwork,
        name: &str,
        addr: SocketAddr,
        keyring: Option<Arc<Keyring>>,
    ) -> Arc<Self> {
        let endpoint = network.register(name, addr);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            network: network.clone(),
            endpoint,
            keyring,
            stop_tx,
        })
    }

    /// Links two endpoints and cross-introduces the members of their
    /// components, mimicking alive-message propagation.
    async fn link(&self, peer: &Arc<Endpoint>) {
        let mut component: Vec<Arc<Endpoint>> = vec![Arc::clone(&self.endpoint), Arc::clone(peer)];
        let mut seen: HashSet<SocketAddr> = component.iter().map(|e| e.addr).collect();
        let mut frontier = component.clone();
        while let Some(ep) = frontier.pop() {
            for addr in ep.linked() {
                if seen.insert(addr)
                    && let Some(next) = self.network.alive_endpoint(addr)
                {
                    component.push(Arc::clone(&next));
                    frontier.push(next);
                }
            }
        }

        // Full mesh within the component, remembering which pairs are
        // new so already-known members are not re-announced.
        let pre_existing: HashMap<SocketAddr, HashSet<SocketAddr>> = component
            .iter()
            .map(|e| (e.addr, e.links.lock().expect("links lock").clone()))
            .collect();
        for a in &component {
            for b in &component {
                if a.addr != b.addr {
                    a.links.lock().expect("links lock").insert(b.addr);
                }
            }
        }

        for a in &component {
            let Some(delegate) = a.delegate() else { continue };
            for b in &component {
                if a.addr != b.addr && !pre_existing[&a.addr].contains(&b.addr) {
                    delegate.notify_join(b.node_info().await).await;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn start(&self, delegate: Arc<dyn GossipDelegate>) -> Result<(), TransportError> {
        *self.endpoint.delegate.write().expect("delegate lock") = Some(Arc::clone(&delegate));
        self.endpoint.alive.store(true, Ordering::SeqCst);

        // The local node is always present in its own member table.
        delegate.notify_join(self.endpoint.node_info().await).await;

        spawn_driver(
            self.network.clone(),
            Arc::clone(&self.endpoint),
            self.stop_tx.subscribe(),
        );
        Ok(())
    }

    async fn join(&self, peers: &[SocketAddr]) -> (usize, Result<(), TransportError>) {
        if !self.endpoint.is_alive() {
            return (0, Err(TransportError::Shutdown));
        }

        let mut contacted = 0;
        let mut failed = Vec::new();
        for &addr in peers {
            let Some(peer) = self.network.alive_endpoint(addr) else {
                failed.push(addr);
                continue;
            };
            let (Some(ours), Some(theirs)) = (self.endpoint.delegate(), peer.delegate()) else {
                failed.push(addr);
                continue;
            };

            // Two-way anti-entropy on first contact.
            let our_state = ours.local_state(true).await;
            let their_state = theirs.local_state(true).await;
            theirs.merge_remote_state(our_state, false).await;
            ours.merge_remote_state(their_state, true).await;

            self.link(&peer).await;
            contacted += 1;
        }

        if failed.is_empty() {
            (contacted, Ok(()))
        } else {
            (
                contacted,
                Err(TransportError::NoPeers(format!("{failed:?}"))),
            )
        }
    }

    async fn leave(&self, _timeout: Duration) -> Result<(), TransportError> {
        // Graceful: peers (and the local node itself) observe the
        // departure as a node-leave.
        let info = self.endpoint.node_info().await;
        for addr in self.endpoint.linked() {
            let Some(peer) = self.network.alive_endpoint(addr) else {
                continue;
            };
            if let Some(delegate) = peer.delegate() {
                delegate.notify_leave(info.clone()).await;
            }
            peer.links
                .lock()
                .expect("links lock")
                .remove(&self.endpoint.addr);
        }
        if let Some(delegate) = self.endpoint.delegate() {
            delegate.notify_leave(info).await;
        }
        self.endpoint.links.lock().expect("links lock").clear();
        self.endpoint.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        // Hard stop: no notifications, peers find out by probing.
        self.endpoint.alive.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.endpoint.addr
    }

    fn num_nodes(&self) -> usize {
        self.endpoint.links.lock().expect("links lock").len() + 1
    }

    async fn send_to(&self, dest: SocketAddr, msg: Bytes) -> Result<(), TransportError> {
        let Some(peer) = self.network.alive_endpoint(dest) else {
            return Err(TransportError::Unreachable(dest));
        };
        let Some(delegate) = peer.delegate() else {
            return Err(TransportError::Unreachable(dest));
        };
        delegate.notify_message(msg).await;
        Ok(())
    }

    fn queue_broadcast(&self, broadcast: Broadcast) {
        let mut queue = self.endpoint.queue.lock().expect("queue lock");
        if let Some(key) = &broadcast.key {
            // Keyed invalidation: a newer broadcast supersedes older
            // ones with the same key.
            queue.retain(|queued| queued.key.as_deref() != Some(key));
        }
        queue.push(QueuedBroadcast {
            key: broadcast.key,
            msg: broadcast.msg,
            notify: broadcast.notify,
        });
    }

    fn num_queued(&self) -> usize {
        self.endpoint.queue.lock().expect("queue lock").len()
    }

    async fn update_node(&self, _meta: Bytes) -> Result<(), TransportError> {
        let info = self.endpoint.node_info().await;
        for addr in self.endpoint.linked() {
            let Some(peer) = self.network.alive_endpoint(addr) else {
                continue;
            };
            if let Some(delegate) = peer.delegate() {
                delegate.notify_update(info.clone()).await;
            }
        }
        Ok(())
    }

    fn keyring(&self) -> Option<Arc<Keyring>> {
        self.keyring.clone()
    }
}

// ============================================================================
// Node Helpers
// ============================================================================

/// A running node plus its plumbing.
pub struct TestNode {
    pub murmur: Murmur,
    pub events: mpsc::Receiver<Event>,
    pub transport: Arc<LocalTransport>,
    pub addr: SocketAddr,
}

/// A config with intervals shrunk to test scale.
pub fn test_config(name: &str) -> Config {
    Config {
        reap_interval: Duration::from_millis(50),
        reconnect_interval: Duration::from_millis(50),
        reconnect_timeout: Duration::from_secs(3600),
        tombstone_timeout: Duration::from_millis(60),
        broadcast_timeout: Duration::from_secs(2),
        gossip_interval: TICK,
        ..Config::new(name)
    }
}

pub fn test_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Starts a node on the shared network.
pub async fn start_node(network: &LocalNetwork, config: Config, port: u16) -> TestNode {
    let addr = test_addr(port);
    let transport = LocalTransport::new(network, &config.node_name, addr);
    let (murmur, events) = Murmur::create(config, transport.clone() as Arc<dyn Transport>)
        .await
        .expect("node starts");
    TestNode {
        murmur,
        events,
        transport,
        addr,
    }
}

/// Starts a node whose transport carries a keyring.
pub async fn start_node_with_keyring(
    network: &LocalNetwork,
    config: Config,
    port: u16,
    keyring: Arc<Keyring>,
) -> TestNode {
    let addr = test_addr(port);
    let transport =
        LocalTransport::with_keyring(network, &config.node_name, addr, Some(keyring));
    let (murmur, events) = Murmur::create(config, transport.clone() as Arc<dyn Transport>)
        .await
        .expect("node starts");
    TestNode {
        murmur,
        events,
        transport,
        addr,
    }
}

/// Waits until `predicate` holds or the timeout expires.
pub async fn wait_for<F: FnMut() -> bool>(mut predicate: F, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drains currently pending events without blocking.
pub fn drain_events(node: &mut TestNode) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = node.events.try_recv() {
        out.push(event);
    }
    out
}
