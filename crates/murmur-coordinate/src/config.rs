//! Tuning knobs for the coordinate subsystem.

use std::time::Duration;

/// Configuration for a coordinate [`Client`](crate::Client).
///
/// The defaults below were chosen against measured latency datasets and
/// should not need tuning in ordinary deployments. All times are in
/// seconds inside the algorithm; the public API speaks [`Duration`].
#[derive(Debug, Clone)]
pub struct CoordinateConfig {
    /// Dimensionality of the Euclidean portion of the coordinate. Eight
    /// dimensions capture internet topology with low embedding error;
    /// higher values cost bandwidth on every probe ack for little gain.
    pub dimensionality: usize,

    /// Ceiling for a node's error estimate (also the initial value, so a
    /// fresh node starts maximally uncertain).
    pub vivaldi_error_max: f64,

    /// Sensitivity of the error-estimate update (`ce` in the papers).
    pub vivaldi_ce: f64,

    /// Sensitivity of the coordinate-position update (`cc`).
    pub vivaldi_cc: f64,

    /// Number of samples in the adjustment rolling window. Zero disables
    /// the adjustment term entirely.
    pub adjustment_window_size: usize,

    /// Floor for the height term. Heights must stay positive so the
    /// distance function never underestimates the access-link cost.
    pub height_min: f64,

    /// Number of RTT samples retained per node for the median latency
    /// filter that smooths spikes before they reach the algorithm.
    pub latency_filter_size: usize,

    /// Tuning factor for the gravity pull toward the origin.
    pub gravity_rho: f64,

    /// Measured RTTs above this are discarded as clock artifacts.
    pub max_rtt: Duration,
}

impl Default for CoordinateConfig {
    fn default() -> Self {
        Self {
            dimensionality: 8,
            vivaldi_error_max: 1.5,
            vivaldi_ce: 0.25,
            vivaldi_cc: 0.25,
            adjustment_window_size: 20,
            height_min: 10.0e-6,
            latency_filter_size: 3,
            gravity_rho: 150.0,
            max_rtt: Duration::from_secs(10),
        }
    }
}
