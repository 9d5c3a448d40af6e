//! Event coalescing.
//!
//! A burst of flapping members or rapid-fire user events would otherwise
//! reach the embedder as a storm of notifications. A coalescer buffers
//! the events it handles and flushes the net result when either timer
//! expires:
//!
//! - the *quantum* timer starts on the first buffered event and caps
//!   how long anything may be delayed;
//! - the *quiescent* timer resets on every buffered event and flushes
//!   early once the burst goes quiet.
//!
//! Events a coalescer does not handle pass through with no added
//! latency. The two strategies ([`member`], [`user`]) share this one
//! driver.

mod member;
mod user;

pub(crate) use member::MemberEventCoalescer;
pub(crate) use user::UserEventCoalescer;

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::event::Event;

/// A coalescing strategy: which events it buffers, how they merge, and
/// what a flush emits.
pub(crate) trait Coalescer: Send + 'static {
    fn handles(&self, event: &Event) -> bool;
    fn coalesce(&mut self, event: Event);
    fn flush(&mut self, out: &mut Vec<Event>);
}

pub(crate) fn spawn_member_coalescer(
    rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    coalesce_period: Duration,
    quiescent_period: Duration,
    shutdown: watch::Receiver<bool>,
) {
    spawn(
        MemberEventCoalescer::new(),
        rx,
        tx,
        coalesce_period,
        quiescent_period,
        shutdown,
    );
}

pub(crate) fn spawn_user_coalescer(
    rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    coalesce_period: Duration,
    quiescent_period: Duration,
    shutdown: watch::Receiver<bool>,
) {
    spawn(
        UserEventCoalescer::new(),
        rx,
        tx,
        coalesce_period,
        quiescent_period,
        shutdown,
    );
}

fn spawn<C: Coalescer>(
    mut strategy: C,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    coalesce_period: Duration,
    quiescent_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        // Absent deadlines park their select branch forever.
        let mut quantum: Option<Instant> = None;
        let mut quiescent: Option<Instant> = None;

        loop {
            let next_flush = match (quantum, quiescent) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };

            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) if strategy.handles(&event) => {
                        let now = Instant::now();
                        quantum.get_or_insert(now + coalesce_period);
                        quiescent = Some(now + quiescent_period);
                        strategy.coalesce(event);
                    }
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        // Upstream closed; drain and stop.
                        flush(&mut strategy, &tx).await;
                        return;
                    }
                },
                () = sleep_until_maybe(next_flush), if next_flush.is_some() => {
                    flush(&mut strategy, &tx).await;
                    quantum = None;
                    quiescent = None;
                }
                _ = shutdown.changed() => {
                    flush(&mut strategy, &tx).await;
                    return;
                }
            }
        }
    });
}

async fn sleep_until_maybe(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn flush<C: Coalescer>(strategy: &mut C, tx: &mpsc::Sender<Event>) {
    let mut out = Vec::new();
    strategy.flush(&mut out);
    for event in out {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
