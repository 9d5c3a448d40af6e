//! The coordinate value type and its vector algebra.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{CoordinateConfig, CoordinateError, Result};

/// Components whose magnitude falls below this are treated as zero to
/// avoid division blow-ups near co-located coordinates.
const ZERO_THRESHOLD: f64 = 1.0e-6;

const SECONDS_TO_NANOSECONDS: f64 = 1.0e9;

/// A point in the network coordinate space.
///
/// Distances between coordinates approximate round-trip times. The value
/// is gossiped in probe acks, cached per peer, and persisted in
/// snapshots, hence the serde derives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Euclidean portion of the coordinate, in seconds.
    pub vec: Vec<f64>,

    /// Confidence in the coordinate: lower is better. Not a distance
    /// component.
    pub error: f64,

    /// Rolling correction added to every distance involving this node.
    pub adjustment: f64,

    /// Non-Euclidean access-link component, in seconds.
    pub height: f64,
}

impl Coordinate {
    /// Creates the origin coordinate for the given configuration, with
    /// maximal error (a fresh node knows nothing about where it is).
    pub fn new(config: &CoordinateConfig) -> Self {
        Self {
            vec: vec![0.0; config.dimensionality],
            error: config.vivaldi_error_max,
            adjustment: 0.0,
            height: config.height_min,
        }
    }

    /// Returns false if any component is NaN or infinite.
    pub fn is_valid(&self) -> bool {
        self.vec.iter().all(|c| c.is_finite())
            && self.error.is_finite()
            && self.adjustment.is_finite()
            && self.height.is_finite()
    }

    /// Returns true when the two coordinates can be compared.
    pub fn is_compatible_with(&self, other: &Coordinate) -> bool {
        self.vec.len() == other.vec.len()
    }

    /// Estimated round-trip time to `other`.
    ///
    /// The adjusted distance is used only while it stays positive; a
    /// badly negative adjustment must not produce a zero estimate for a
    /// distant node.
    pub fn distance_to(&self, other: &Coordinate) -> Result<Duration> {
        let mut dist = self.raw_distance_to(other)?;
        let adjusted = dist + self.adjustment + other.adjustment;
        if adjusted > 0.0 {
            dist = adjusted;
        }
        Ok(Duration::from_nanos((dist * SECONDS_TO_NANOSECONDS) as u64))
    }

    /// Distance in seconds without the adjustment terms. Used by the
    /// client when computing new adjustment samples.
    pub(crate) fn raw_distance_to(&self, other: &Coordinate) -> Result<f64> {
        if !self.is_compatible_with(other) {
            return Err(CoordinateError::DimensionalityConflict {
                ours: self.vec.len(),
                theirs: other.vec.len(),
            });
        }
        Ok(magnitude(&diff(&self.vec, &other.vec)) + self.height + other.height)
    }

    /// Moves this coordinate by `force` seconds along the unit vector
    /// away from `other`, dragging the height along proportionally.
    pub(crate) fn apply_force(
        &self,
        config: &CoordinateConfig,
        force: f64,
        other: &Coordinate,
    ) -> Result<Coordinate> {
        if !self.is_compatible_with(other) {
            return Err(CoordinateError::DimensionalityConflict {
                ours: self.vec.len(),
                theirs: other.vec.len(),
            });
        }

        let mut ret = self.clone();
        let (unit, mag) = unit_vector_at(&self.vec, &other.vec);
        ret.vec = add(&ret.vec, &mul(&unit, force));
        if mag > ZERO_THRESHOLD {
            ret.height = (ret.height + other.height) * force / mag + ret.height;
            ret.height = ret.height.max(config.height_min);
        }
        Ok(ret)
    }
}

// ============================================================================
// Vector helpers
// ============================================================================

fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

fn diff(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

fn mul(a: &[f64], factor: f64) -> Vec<f64> {
    a.iter().map(|x| x * factor).collect()
}

fn magnitude(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Returns the unit vector pointing from `b` toward `a`, plus the raw
/// distance between the two positions.
///
/// Co-located positions get a uniformly random unit vector so fresh
/// clusters (everyone at the origin) spread out instead of producing
/// NaNs; the returned magnitude is zero in that case.
fn unit_vector_at(a: &[f64], b: &[f64]) -> (Vec<f64>, f64) {
    let ret = diff(a, b);
    let mag = magnitude(&ret);
    if mag > ZERO_THRESHOLD {
        return (mul(&ret, 1.0 / mag), mag);
    }

    let mut rng = rand::thread_rng();
    loop {
        let ret: Vec<f64> = (0..a.len()).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        let mag = magnitude(&ret);
        if mag > ZERO_THRESHOLD {
            return (mul(&ret, 1.0 / mag), 0.0);
        }
        // Pathologically unlucky draw near the origin; redraw.
    }
}
