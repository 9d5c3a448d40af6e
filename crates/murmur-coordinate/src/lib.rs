//! Vivaldi network coordinates.
//!
//! Every Murmur node maintains a coordinate in a low-dimensional Euclidean
//! space, augmented with a *height* (modeling the access-link latency that
//! Euclidean embeddings cannot express) and an *adjustment* (a rolling
//! correction for systematic embedding error). The distance between two
//! coordinates estimates the round-trip time between their nodes.
//!
//! # Algorithm
//!
//! Coordinates are updated on every completed liveness probe. Given a
//! measured RTT `r` to a peer with coordinate `c_p` and error `err_p`:
//!
//! ```text
//! w     = err_l / (err_l + err_p)          mixing weight
//! e     = |dist(c_l, c_p) - r| / r         relative error of the estimate
//! err_l = e*ce*w + err_l*(1 - ce*w)        confidence update, clamped
//! c_l   = c_l + (r - dist) * cc * w * unit(c_l - c_p)
//! ```
//!
//! Nodes with a *lower* error estimate move less; fresh nodes with high
//! error converge quickly toward well-established peers. A gravity term
//! pulls the whole constellation toward the origin so it cannot drift.
//!
//! # References
//!
//! - Dabek et al. (2004): "Vivaldi: A Decentralized Network Coordinate
//!   System"
//! - Ledlie et al. (2007): "Network Coordinates in the Wild" (heights and
//!   adjustment terms)

mod client;
mod config;
mod coordinate;

pub use client::{Client, ClientStats};
pub use config::CoordinateConfig;
pub use coordinate::Coordinate;

/// Errors produced by coordinate operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinateError {
    /// The two coordinates have different dimensionality and cannot be
    /// compared or mixed.
    #[error("coordinate dimensionality conflict: {ours} vs {theirs}")]
    DimensionalityConflict {
        /// Local dimensionality.
        ours: usize,
        /// Peer dimensionality.
        theirs: usize,
    },

    /// A coordinate contained NaN or infinite components.
    #[error("coordinate has invalid components")]
    InvalidCoordinate,

    /// The measured round-trip time is outside the sane range.
    #[error("round trip time {0:?} is not a positive value below {1:?}")]
    RttOutOfRange(std::time::Duration, std::time::Duration),
}

/// Result alias for coordinate operations.
pub type Result<T> = std::result::Result<T, CoordinateError>;
