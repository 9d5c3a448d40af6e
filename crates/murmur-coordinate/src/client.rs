//! The coordinate client: owns the local coordinate and folds in
//! observations from completed liveness probes.

use std::collections::HashMap;
use std::time::Duration;

use crate::{Coordinate, CoordinateConfig, CoordinateError, Result};

/// Observability counters for a [`Client`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Times the local coordinate went invalid (NaN/Inf) and was reset
    /// to the origin.
    pub resets: u64,

    /// Observations rejected before they reached the algorithm (bad
    /// peer coordinate or out-of-range RTT).
    pub rejected: u64,
}

/// Maintains the local node's coordinate.
///
/// Not internally synchronized; the embedding layer wraps it in its own
/// lock because updates and reads are already serialized with the peer
/// coordinate cache.
#[derive(Debug)]
pub struct Client {
    coord: Coordinate,
    origin: Coordinate,
    config: CoordinateConfig,

    /// Rolling window of `rtt - raw_distance` samples feeding the
    /// adjustment term.
    adjustment_samples: Vec<f64>,
    adjustment_index: usize,

    /// Recent RTT samples per peer for the median filter.
    latency_filters: HashMap<String, Vec<f64>>,

    stats: ClientStats,
}

impl Client {
    /// Creates a client positioned at the origin.
    pub fn new(config: CoordinateConfig) -> Self {
        Self {
            coord: Coordinate::new(&config),
            origin: Coordinate::new(&config),
            adjustment_samples: vec![0.0; config.adjustment_window_size],
            adjustment_index: 0,
            latency_filters: HashMap::new(),
            stats: ClientStats::default(),
            config,
        }
    }

    /// Returns a copy of the local coordinate.
    pub fn get_coordinate(&self) -> Coordinate {
        self.coord.clone()
    }

    /// Forcibly replaces the local coordinate, e.g. when recovering a
    /// persisted coordinate at startup.
    pub fn set_coordinate(&mut self, coord: Coordinate) -> Result<()> {
        self.check_coordinate(&coord)?;
        self.coord = coord;
        Ok(())
    }

    /// Drops per-node filter state for a departed peer.
    pub fn forget_node(&mut self, node: &str) {
        self.latency_filters.remove(node);
    }

    /// Returns the client's counters.
    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Estimated RTT from the local node to `other`.
    pub fn distance_to(&self, other: &Coordinate) -> Result<Duration> {
        self.coord.distance_to(other)
    }

    /// Folds one probe observation into the local coordinate and returns
    /// the updated value.
    ///
    /// `node` identifies the peer for the latency filter, `other` is the
    /// peer's coordinate from the probe ack, and `rtt` the measured
    /// round trip. Observations that fail the sanity checks are counted
    /// in [`ClientStats::rejected`] and leave the coordinate untouched.
    pub fn update(&mut self, node: &str, other: &Coordinate, rtt: Duration) -> Result<Coordinate> {
        if let Err(e) = self.check_coordinate(other) {
            self.stats.rejected += 1;
            return Err(e);
        }
        if rtt.is_zero() || rtt > self.config.max_rtt {
            self.stats.rejected += 1;
            return Err(CoordinateError::RttOutOfRange(rtt, self.config.max_rtt));
        }

        let rtt_seconds = self.latency_filter(node, rtt.as_secs_f64());
        self.update_vivaldi(other, rtt_seconds)?;
        self.update_adjustment(other, rtt_seconds)?;
        self.update_gravity()?;

        if !self.coord.is_valid() {
            self.stats.resets += 1;
            self.coord = Coordinate::new(&self.config);
        }
        Ok(self.coord.clone())
    }

    /// Validates a peer-supplied coordinate against the local space.
    fn check_coordinate(&self, coord: &Coordinate) -> Result<()> {
        if !self.coord.is_compatible_with(coord) {
            return Err(CoordinateError::DimensionalityConflict {
                ours: self.coord.vec.len(),
                theirs: coord.vec.len(),
            });
        }
        if !coord.is_valid() {
            return Err(CoordinateError::InvalidCoordinate);
        }
        Ok(())
    }

    /// Median filter over the last few RTT samples for this peer.
    /// Smooths transient spikes without lagging real latency shifts.
    fn latency_filter(&mut self, node: &str, rtt_seconds: f64) -> f64 {
        let samples = self
            .latency_filters
            .entry(node.to_string())
            .or_insert_with(|| Vec::with_capacity(self.config.latency_filter_size));
        samples.push(rtt_seconds);
        if samples.len() > self.config.latency_filter_size {
            samples.remove(0);
        }

        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted[sorted.len() / 2]
    }

    /// The core Vivaldi step: update the error estimate and move the
    /// coordinate proportionally to the disagreement with the measured
    /// RTT.
    fn update_vivaldi(&mut self, other: &Coordinate, rtt_seconds: f64) -> Result<()> {
        const ZERO_THRESHOLD: f64 = 1.0e-6;

        let dist = self.coord.distance_to(other)?.as_secs_f64();
        let rtt_seconds = rtt_seconds.max(ZERO_THRESHOLD);
        let wrongness = (dist - rtt_seconds).abs() / rtt_seconds;

        let total_error = (self.coord.error + other.error).max(ZERO_THRESHOLD);
        let weight = self.coord.error / total_error;

        self.coord.error = (self.config.vivaldi_ce * weight * wrongness
            + self.coord.error * (1.0 - self.config.vivaldi_ce * weight))
            .min(self.config.vivaldi_error_max);

        let force = self.config.vivaldi_cc * weight * (rtt_seconds - dist);
        self.coord = self.coord.apply_force(&self.config, force, other)?;
        Ok(())
    }

    /// Updates the rolling adjustment term from the raw (height-only)
    /// distance error. The /2 splits the correction between the two
    /// endpoints, since both add their adjustment to a distance.
    fn update_adjustment(&mut self, other: &Coordinate, rtt_seconds: f64) -> Result<()> {
        if self.config.adjustment_window_size == 0 {
            return Ok(());
        }

        let dist = self.coord.raw_distance_to(other)?;
        self.adjustment_samples[self.adjustment_index] = rtt_seconds - dist;
        self.adjustment_index = (self.adjustment_index + 1) % self.config.adjustment_window_size;

        let sum: f64 = self.adjustment_samples.iter().sum();
        self.coord.adjustment = sum / (2.0 * self.config.adjustment_window_size as f64);
        Ok(())
    }

    /// Applies a gentle pull toward the origin so the constellation as a
    /// whole cannot drift away over time.
    fn update_gravity(&mut self) -> Result<()> {
        let dist = self.origin.distance_to(&self.coord)?.as_secs_f64();
        let force = -1.0 * (dist / self.config.gravity_rho).powi(2);
        self.coord = self.coord.apply_force(&self.config, force, &self.origin)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn config() -> CoordinateConfig {
        CoordinateConfig::default()
    }

    #[test]
    fn update_converges_toward_measured_rtt() {
        let cfg = CoordinateConfig {
            // Disable smoothing so the trajectory is easy to reason about.
            adjustment_window_size: 0,
            latency_filter_size: 1,
            ..config()
        };
        let mut client = Client::new(cfg.clone());

        let mut other = Coordinate::new(&cfg);
        other.vec[2] = 0.001;
        let rtt = Duration::from_millis(100);

        for _ in 0..64 {
            client.update("peer", &other, rtt).unwrap();
        }

        let estimate = client.distance_to(&other).unwrap();
        let error = (estimate.as_secs_f64() - rtt.as_secs_f64()).abs();
        assert!(error < 0.010, "estimate off by {error}s");
        assert!(
            client.get_coordinate().error < config().vivaldi_error_max,
            "confidence never improved"
        );
    }

    #[test]
    fn zero_rtt_is_rejected_and_counted() {
        let mut client = Client::new(config());
        let other = Coordinate::new(&config());

        let err = client.update("peer", &other, Duration::ZERO);
        assert!(matches!(err, Err(CoordinateError::RttOutOfRange(_, _))));
        assert_eq!(client.stats().rejected, 1);
        assert_eq!(client.get_coordinate(), Coordinate::new(&config()));
    }

    #[test]
    fn absurd_rtt_is_rejected() {
        let mut client = Client::new(config());
        let other = Coordinate::new(&config());

        let err = client.update("peer", &other, Duration::from_secs(60));
        assert!(matches!(err, Err(CoordinateError::RttOutOfRange(_, _))));
        assert_eq!(client.stats().rejected, 1);
    }

    #[test]
    fn invalid_peer_coordinate_is_rejected() {
        let mut client = Client::new(config());
        let mut other = Coordinate::new(&config());
        other.vec[0] = f64::NAN;

        let err = client.update("peer", &other, Duration::from_millis(10));
        assert!(matches!(err, Err(CoordinateError::InvalidCoordinate)));
        assert_eq!(client.stats().rejected, 1);
    }

    #[test]
    fn set_coordinate_checks_dimensionality() {
        let mut client = Client::new(config());
        let narrow = Coordinate::new(&CoordinateConfig {
            dimensionality: 2,
            ..config()
        });
        assert!(client.set_coordinate(narrow).is_err());
    }

    #[test]
    fn latency_filter_takes_median() {
        let mut client = Client::new(config());

        assert_eq!(client.latency_filter("a", 0.201), 0.201);
        assert_eq!(client.latency_filter("a", 0.200), 0.201);
        assert_eq!(client.latency_filter("a", 0.207), 0.201);

        // Window slides: {0.200, 0.207, 0.187} -> median 0.200.
        assert_eq!(client.latency_filter("a", 0.187), 0.200);

        // Independent per node.
        assert_eq!(client.latency_filter("b", 0.010), 0.010);
    }

    #[test]
    fn forget_node_clears_filter_state() {
        let mut client = Client::new(config());
        client.latency_filter("a", 0.5);
        client.forget_node("a");
        assert_eq!(client.latency_filter("a", 0.1), 0.1);
    }

    proptest! {
        #[test]
        fn distance_stays_symmetric_under_updates(
            rtts in prop::collection::vec(1u64..500, 1..32),
        ) {
            let mut client = Client::new(config());
            let mut other = Coordinate::new(&config());
            other.vec[0] = 0.05;
            other.height = 0.002;

            for rtt in rtts {
                let _ = client.update("peer", &other, Duration::from_millis(rtt));
            }

            let ours = client.get_coordinate();
            let d1 = ours.distance_to(&other).unwrap().as_secs_f64();
            let d2 = other.distance_to(&ours).unwrap().as_secs_f64();
            prop_assert!((d1 - d2).abs() < 1.0e-9);
        }
    }
}
