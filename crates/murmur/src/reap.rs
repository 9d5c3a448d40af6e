//! Background eviction and reconnection loops.

use std::sync::Arc;
use std::time::Instant;

use murmur_types::MemberStatus;
use rand::seq::SliceRandom;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::core::MurmurInner;
use crate::event::{MemberEvent, MemberEventType};

/// Periodically evicts failed members past the reconnect window and
/// left members past their tombstone, removing them from the member
/// table entirely.
pub(crate) fn spawn_reaper(inner: Arc<MurmurInner>) {
    let mut shutdown = inner.shutdown_rx();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(inner.config.reap_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let reaped = {
                        let mut db = inner.members.lock().expect("member lock poisoned");
                        db.reap(
                            inner.config.reconnect_timeout,
                            inner.config.tombstone_timeout,
                            Instant::now(),
                        )
                    };
                    if reaped.is_empty() {
                        continue;
                    }

                    // A reaped peer's coordinate history is useless and
                    // would poison a future node reusing the name.
                    if let Some(coord) = &inner.coord {
                        let mut client =
                            coord.client.lock().expect("coordinate lock poisoned");
                        let mut cache =
                            coord.cache.write().expect("coordinate cache poisoned");
                        for member in &reaped {
                            client.forget_node(&member.name);
                            cache.remove(&member.name);
                        }
                    }

                    for member in reaped {
                        info!(node = %member.name, status = %member.status, "reaped member");
                        inner
                            .deliver_member_events(vec![MemberEvent {
                                ty: MemberEventType::Reap,
                                members: vec![member],
                            }])
                            .await;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}

/// Periodically picks one random failed member and asks the transport
/// to re-establish contact at its last known address.
pub(crate) fn spawn_reconnector(inner: Arc<MurmurInner>) {
    let mut shutdown = inner.shutdown_rx();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(inner.config.reconnect_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let target = {
                        let db = inner.members.lock().expect("member lock poisoned");
                        let failed = db.failed_members();
                        failed.choose(&mut rand::thread_rng()).cloned()
                    };
                    let Some(member) = target else { continue };
                    debug_assert_eq!(member.status, MemberStatus::Failed);

                    debug!(node = %member.name, addr = %member.addr, "attempting reconnect");
                    let (contacted, _) = inner.transport.join(&[member.addr]).await;
                    if contacted > 0 {
                        info!(node = %member.name, "reconnected to failed member");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}
