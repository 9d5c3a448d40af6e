//! # Murmur: decentralized cluster membership
//!
//! Murmur is a cluster-membership, failure-detection, and lightweight
//! event-dissemination core. A process runs one node that joins a
//! cluster, learns the set of live peers, is notified of
//! joins/leaves/failures, broadcasts custom *user events*, and issues
//! request/response *queries*, all over a SWIM-style gossip transport
//! injected behind a narrow trait.
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────────────────────┐
//!   transport ───►│ delegate: decode + dispatch   │
//!   (probes,      │   membership state machine    │──► event channel
//!    gossip,      │   event/query rings           │    (internal queries,
//!    push/pull)   │   broadcast queue adapter     │     snapshot, coalesce)
//!                 └───────────────────────────────┘
//!                     reaper · reconnector · snapshotter · coalescers
//! ```
//!
//! Ordering is Lamport-clock based: three independent clocks (member,
//! event, query) gate every state transition, so facts can arrive in
//! any order over any path (live gossip or anti-entropy push/pull) and
//! converge to the same result.
//!
//! # Example
//!
//! ```no_run
//! # async fn example(transport: std::sync::Arc<dyn murmur::transport::Transport>) -> murmur::Result<()> {
//! use murmur::{Config, Event, Murmur};
//!
//! let (node, mut events) = Murmur::create(Config::new("node-a"), transport).await?;
//! node.join(&["10.0.0.2:7946".parse().unwrap()], false).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Member(ev) => println!("{}: {} members", ev.ty, ev.members.len()),
//!         Event::User(ev) => println!("user event {}", ev.name),
//!         Event::Query(query) => query.respond(b"pong".to_vec()).await?,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod broadcast;
mod coalesce;
mod config;
mod core;
mod delegate;
mod error;
mod event;
mod instrumentation;
mod internal_query;
mod key_manager;
mod query;
mod reap;
mod ring;
mod snapshot;
pub mod transport;

pub use config::Config;
pub use core::{Murmur, MurmurState};
pub use error::{Error, Result};
pub use event::{Event, MemberEvent, MemberEventType, QueryEvent, UserEventData};
pub use instrumentation::METRICS;
pub use key_manager::{KeyManager, KeyResponse, Keyring, KeyringError};
pub use query::{NodeResponse, QueryParams, QueryResponseHandle};
pub use snapshot::PreviousNode;

// Re-export the sibling crates embedders interact with directly.
pub use murmur_coordinate as coordinate;
pub use murmur_types as types;
pub use murmur_wire as wire;

pub use murmur_types::{LamportClock, LamportTime, Member, MemberStatus, Tags, VersionRange};
