//! S5: snapshot-backed restart recovers previous peers and suppresses
//! replayed events.

mod common;

use std::time::Duration;

use common::{LocalNetwork, drain_events, start_node, test_config, wait_for};
use murmur::{Config, Event};

#[tokio::test(flavor = "multi_thread")]
async fn restart_recovers_peers_and_suppresses_replay() {
    let network = LocalNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("a.snapshot");

    let config = Config {
        snapshot_path: Some(snapshot_path.clone()),
        snapshot_fsync_interval: Duration::from_millis(20),
        snapshot_clock_interval: Duration::from_millis(20),
        ..test_config("a")
    };

    let b = start_node(&network, test_config("b"), 7301).await;
    let mut a = start_node(&network, config.clone(), 7302).await;

    a.murmur.join(&[b.addr], false).await.unwrap();
    wait_for(
        || a.murmur.num_members() == 2,
        Duration::from_secs(2),
        "join",
    )
    .await;

    // A user event the snapshot must remember.
    b.murmur
        .user_event("release", b"v42", false)
        .await
        .unwrap();
    wait_for(
        || {
            drain_events(&mut a)
                .iter()
                .any(|e| matches!(e, Event::User(u) if u.name == "release"))
        },
        Duration::from_secs(2),
        "event delivery",
    )
    .await;
    // The snapshot records the event-clock advance; give fsync a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Hard exit: no leave, so the snapshot keeps the alive set.
    a.murmur.shutdown().await.unwrap();

    // Restart with the same snapshot path.
    let mut a2 = start_node(&network, config, 7302).await;

    let previous = a2.murmur.previous_nodes();
    assert!(
        previous.iter().any(|n| n.name == "b" && n.addr == b.addr),
        "previous nodes should include b: {previous:?}"
    );

    // Rejoin via the recovered peer list.
    let addrs: Vec<_> = previous.iter().map(|n| n.addr).collect();
    a2.murmur.join(&addrs, false).await.unwrap();
    wait_for(
        || a2.murmur.num_members() == 2,
        Duration::from_secs(2),
        "rejoin",
    )
    .await;

    // B re-sends the same event; the recovered clock floor suppresses
    // a second delivery (anti-entropy will replay it regardless).
    tokio::time::sleep(Duration::from_millis(400)).await;
    let replayed: Vec<Event> = drain_events(&mut a2);
    assert!(
        !replayed
            .iter()
            .any(|e| matches!(e, Event::User(u) if u.name == "release")),
        "replayed event must be suppressed after restart"
    );

    a2.murmur.shutdown().await.unwrap();
    b.murmur.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_leave_clears_snapshot_state() {
    let network = LocalNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("a.snapshot");

    let config = Config {
        snapshot_path: Some(snapshot_path.clone()),
        ..test_config("a")
    };

    let b = start_node(&network, test_config("b"), 7311).await;
    let a = start_node(&network, config.clone(), 7312).await;

    a.murmur.join(&[b.addr], false).await.unwrap();
    wait_for(
        || a.murmur.num_members() == 2,
        Duration::from_secs(2),
        "join",
    )
    .await;

    a.murmur.leave().await.unwrap();
    a.murmur.shutdown().await.unwrap();

    // A left on purpose; the snapshot must not suggest rejoining.
    let a2 = start_node(&network, config, 7312).await;
    assert!(
        a2.murmur.previous_nodes().is_empty(),
        "leave must clear the previous-node list"
    );

    a2.murmur.shutdown().await.unwrap();
    b.murmur.shutdown().await.unwrap();
}
