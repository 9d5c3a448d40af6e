//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use murmur_coordinate::CoordinateConfig;
use murmur_types::Tags;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for a Murmur node.
///
/// Built by the embedder and handed to [`Murmur::create`](crate::Murmur::create).
/// The defaults are tuned for LAN clusters; WAN deployments typically
/// stretch the intervals rather than the structural limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster-unique name for this node.
    pub node_name: String,

    /// Operator-assigned metadata gossiped with the member record.
    pub tags: Tags,

    /// Capacity of the event channel handed to the embedder, and of the
    /// internal pipeline stages feeding it. A slow embedder eventually
    /// back-pressures the ingest tasks, never the lock holders.
    pub event_channel_capacity: usize,

    /// How often the reaper walks the failed and left lists.
    pub reap_interval: Duration,

    /// How long a failed member is remembered (and reconnection
    /// attempted) before it is reaped.
    pub reconnect_timeout: Duration,

    /// How often the reconnector attempts to rejoin one failed member.
    pub reconnect_interval: Duration,

    /// How long a gracefully departed member's tombstone is kept.
    pub tombstone_timeout: Duration,

    /// A member failing and rejoining faster than this counts as a flap.
    pub flap_timeout: Duration,

    /// How long a remote member may sit in Leaving before reverting to
    /// Alive (covers aborted leaves).
    pub leave_timeout: Duration,

    /// How long `leave` waits for its intent broadcast to drain.
    pub broadcast_timeout: Duration,

    /// Extra settle time after a graceful leave before `leave` returns.
    pub leave_propagate_delay: Duration,

    /// Size of the user-event ring buffer. Events older than this many
    /// Lamport ticks are rejected as too old.
    pub event_buffer_size: usize,

    /// Size of the query dedup ring buffer.
    pub query_buffer_size: usize,

    /// Maximum combined size of a user event name + payload.
    pub user_event_size_limit: usize,

    /// Maximum encoded size of an outbound query message.
    pub query_size_limit: usize,

    /// Maximum size of a single query response payload.
    pub query_response_size_limit: usize,

    /// Capacity of the per-query ack and response channels; overflow
    /// responses are dropped, not buffered.
    pub query_response_channel_capacity: usize,

    /// Multiplier over `gossip_interval * log10(n + 1)` for the default
    /// query deadline.
    pub query_timeout_mult: u32,

    /// The transport's gossip interval, used for query deadline math.
    pub gossip_interval: Duration,

    /// Replay user events when joining, instead of only witnessing the
    /// event clock. Kept off for fresh joins; a rejoining node that
    /// processed the events before the restart does not want them twice.
    pub replay_on_join: bool,

    /// Warn when the transport's broadcast queue grows beyond this depth.
    pub broadcast_queue_depth_warning: usize,

    /// Path of the append-only recovery snapshot. `None` disables
    /// snapshotting.
    pub snapshot_path: Option<PathBuf>,

    /// Rewrite the snapshot once it grows beyond this many bytes.
    pub snapshot_size_limit: u64,

    /// Upper bound on how long appended snapshot records may sit
    /// unsynced.
    pub snapshot_fsync_interval: Duration,

    /// How often the snapshot records the member clock and the cached
    /// peer coordinates.
    pub snapshot_clock_interval: Duration,

    /// Quantum for member-event coalescing; zero disables the member
    /// coalescer.
    pub coalesce_period: Duration,

    /// Quiescence window for member-event coalescing.
    pub quiescent_period: Duration,

    /// Quantum for user-event coalescing; zero disables the user-event
    /// coalescer.
    pub user_coalesce_period: Duration,

    /// Quiescence window for user-event coalescing.
    pub user_quiescent_period: Duration,

    /// Path the keyring is persisted to after key-management operations.
    /// `None` keeps the keyring in memory only.
    pub keyring_file: Option<PathBuf>,

    /// Coordinate subsystem tuning; `None` disables network coordinates.
    #[serde(skip, default = "default_coordinate_config")]
    pub coordinate: Option<CoordinateConfig>,
}

fn default_coordinate_config() -> Option<CoordinateConfig> {
    Some(CoordinateConfig::default())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            tags: Tags::new(),
            event_channel_capacity: 1024,
            reap_interval: Duration::from_secs(15),
            reconnect_timeout: Duration::from_secs(24 * 60 * 60),
            reconnect_interval: Duration::from_secs(30),
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
            flap_timeout: Duration::from_secs(60),
            leave_timeout: Duration::from_secs(120),
            broadcast_timeout: Duration::from_secs(5),
            leave_propagate_delay: Duration::from_millis(0),
            event_buffer_size: 512,
            query_buffer_size: 512,
            user_event_size_limit: 512,
            query_size_limit: 1024,
            query_response_size_limit: 1024,
            query_response_channel_capacity: 64,
            query_timeout_mult: 16,
            gossip_interval: Duration::from_millis(200),
            replay_on_join: false,
            broadcast_queue_depth_warning: 1024,
            snapshot_path: None,
            snapshot_size_limit: 128 * 1024,
            snapshot_fsync_interval: Duration::from_millis(500),
            snapshot_clock_interval: Duration::from_millis(500),
            coalesce_period: Duration::ZERO,
            quiescent_period: Duration::ZERO,
            user_coalesce_period: Duration::ZERO,
            user_quiescent_period: Duration::ZERO,
            keyring_file: None,
            coordinate: default_coordinate_config(),
        }
    }
}

impl Config {
    /// Creates a config with the given node name and library defaults
    /// for everything else.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Returns true when member-event coalescing is enabled.
    pub(crate) fn member_coalescing_enabled(&self) -> bool {
        !self.coalesce_period.is_zero()
    }

    /// Returns true when user-event coalescing is enabled.
    pub(crate) fn user_coalescing_enabled(&self) -> bool {
        !self.user_coalesce_period.is_zero()
    }

    /// Validates structural invariants the rest of the core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Config("node_name must not be empty".into()));
        }
        if self.event_buffer_size == 0 {
            return Err(Error::Config("event_buffer_size must be non-zero".into()));
        }
        if self.query_buffer_size == 0 {
            return Err(Error::Config("query_buffer_size must be non-zero".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config(
                "event_channel_capacity must be non-zero".into(),
            ));
        }
        if self.member_coalescing_enabled() && self.quiescent_period.is_zero() {
            return Err(Error::Config(
                "quiescent_period must be non-zero when coalescing is enabled".into(),
            ));
        }
        if self.user_coalescing_enabled() && self.user_quiescent_period.is_zero() {
            return Err(Error::Config(
                "user_quiescent_period must be non-zero when user coalescing is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_name_is_valid() {
        assert!(Config::new("node-a").validate().is_ok());
    }

    #[test]
    fn empty_name_rejected() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn zero_ring_rejected() {
        let config = Config {
            event_buffer_size: 0,
            ..Config::new("node-a")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn coalescing_requires_quiescent_period() {
        let config = Config {
            coalesce_period: Duration::from_millis(50),
            quiescent_period: Duration::ZERO,
            ..Config::new("node-a")
        };
        assert!(config.validate().is_err());
    }
}
