//! Error types for the Murmur core.

use murmur_types::TagError;
use murmur_wire::WireError;
use thiserror::Error;

use crate::MurmurState;
use crate::key_manager::KeyResponse;
use crate::transport::TransportError;

/// Errors surfaced by the Murmur public API.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation is not valid in the node's current lifecycle state.
    #[error("operation requires the {required} state, node is {actual}")]
    WrongState {
        /// State the operation requires.
        required: MurmurState,
        /// State the node is actually in.
        actual: MurmurState,
    },

    /// A graceful leave is already running on another task.
    #[error("leave already in progress")]
    LeaveInProgress,

    /// A user event exceeded the configured size limit.
    #[error("user event exceeds size limit of {limit} bytes (got {size})")]
    UserEventTooLarge {
        size: usize,
        limit: usize,
    },

    /// An encoded query exceeded the configured size limit.
    #[error("query exceeds size limit of {limit} bytes (got {size})")]
    QueryTooLarge {
        size: usize,
        limit: usize,
    },

    /// A query response exceeded the configured size limit.
    #[error("query response exceeds size limit of {limit} bytes (got {size})")]
    QueryResponseTooLarge {
        size: usize,
        limit: usize,
    },

    /// `respond` was called twice, or after the query deadline.
    #[error("query already responded to or expired")]
    QueryAlreadyResponded,

    /// Waiting for the leave broadcast to drain timed out. The graceful
    /// leave still completed; the intent may not have reached every peer.
    #[error("timeout waiting for graceful leave broadcast")]
    BroadcastTimeout,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Tag encoding failed or exceeded the meta size limit.
    #[error(transparent)]
    Tags(#[from] TagError),

    /// The transport reported a failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Join contacted some peers but not all of them; `contacted` is
    /// the partial-success count.
    #[error("join contacted {contacted} peer(s): {source}")]
    JoinFailed {
        contacted: usize,
        #[source]
        source: TransportError,
    },

    /// The coordinate subsystem is disabled in the configuration.
    #[error("network coordinates are disabled")]
    CoordinatesDisabled,

    /// Outbound message encoding failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A key-management operation failed on part of the cluster. The
    /// per-node messages are in the carried [`KeyResponse`].
    #[error("{failures}/{responses} nodes reported failure")]
    KeyOperation {
        /// Nodes that responded with an error.
        failures: usize,
        /// Nodes that responded at all.
        responses: usize,
        /// Full aggregated response, per-node messages included.
        response: Box<KeyResponse>,
    },

    /// No keyring is installed on the transport, so key management is
    /// unavailable.
    #[error("no keyring configured on the transport")]
    KeyringUnavailable,

    /// The provided key was not valid base64 or had a bad length.
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// Snapshot I/O failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] std::io::Error),
}

/// Result alias for Murmur operations.
pub type Result<T> = std::result::Result<T, Error>;
