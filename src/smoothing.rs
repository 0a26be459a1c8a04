//! Position smoother: turns the noisy per-cycle position stream into a
//! stable estimate with per-axis uncertainty.
//!
//! Runs as a three-phase session: measurements are buffered until the
//! configured window fills, then a one-time expectation-maximization pass
//! over the buffer learns the filter's noise model and a forward pass
//! produces the first estimate, and from then on each measurement is a
//! single online update. The batch pass runs exactly once per session; it is
//! what fixes the effective noise model, so it must not be replaced by
//! per-step re-fitting.

use nalgebra::Vector3;

use crate::filters::linear_cv::LinearCvFilter;
use crate::types::linalg::{MeasureVec, StateMat, StateVec};

/// Filtered position with per-axis standard deviation, same units as the
/// measurements fed in.
#[derive(Clone, Copy, Debug)]
pub struct FilteredPosition {
    pub position: Vector3<f64>,
    pub std_dev: Vector3<f64>,
}

enum SmootherState {
    Empty,
    Buffering { measurements: Vec<MeasureVec> },
    Primed {
        model: LinearCvFilter,
        mean: StateVec,
        cov: StateMat,
    },
}

pub struct PositionSmoother {
    window_length: usize,
    em_iterations: usize,
    state: SmootherState,
}

impl PositionSmoother {
    pub fn new(window_length: usize, em_iterations: usize) -> Self {
        PositionSmoother {
            window_length: window_length.max(1),
            em_iterations,
            state: SmootherState::Empty,
        }
    }

    pub fn is_primed(&self) -> bool {
        matches!(self.state, SmootherState::Primed { .. })
    }

    /// Drop all session state. Not called anywhere in the core; exposed for
    /// integrators whose lost-lock policy is to start a fresh session.
    pub fn reset(&mut self) {
        self.state = SmootherState::Empty;
    }

    /// Ingest one position observation.
    ///
    /// Returns `None` until the priming window has filled; the first output
    /// comes on the window-length-th call, after the batch learning pass.
    pub fn update(&mut self, measurement: Vector3<f64>) -> Option<FilteredPosition> {
        // Online phase: a single predict/correct step from the previous
        // posterior, no re-buffering and no re-learning.
        if let SmootherState::Primed { model, mean, cov } = &mut self.state {
            let (new_mean, new_cov) = model.filter_update(mean, cov, &measurement);
            *mean = new_mean;
            *cov = new_cov;
            return Some(Self::output(&new_mean, &new_cov));
        }

        // Buffering phase (the first measurement opens the buffer and seeds
        // the initial state through `prime` later)
        let mut buffer = match std::mem::replace(&mut self.state, SmootherState::Empty) {
            SmootherState::Buffering { measurements } => measurements,
            _ => Vec::with_capacity(self.window_length),
        };
        buffer.push(measurement);
        if buffer.len() >= self.window_length {
            self.prime(buffer)
        } else {
            self.state = SmootherState::Buffering {
                measurements: buffer,
            };
            None
        }
    }

    /// One-time transition to the online phase: learn the noise model from
    /// the full buffer, then filter the same buffer forward for the first
    /// posterior.
    fn prime(&mut self, measurements: Vec<MeasureVec>) -> Option<FilteredPosition> {
        let mut seed = StateVec::zeros();
        seed[0] = measurements[0][0];
        seed[2] = measurements[0][1];
        seed[4] = measurements[0][2];

        let model = LinearCvFilter::fit(&measurements, seed, self.em_iterations);
        let (mean, cov) = model.filter(&measurements);
        let out = Self::output(&mean, &cov);
        self.state = SmootherState::Primed { model, mean, cov };
        Some(out)
    }

    fn output(mean: &StateVec, cov: &StateMat) -> FilteredPosition {
        FilteredPosition {
            position: Vector3::new(mean[0], mean[2], mean[4]),
            std_dev: Vector3::new(
                cov[(0, 0)].max(0.0).sqrt(),
                cov[(2, 2)].max(0.0).sqrt(),
                cov[(4, 4)].max(0.0).sqrt(),
            ),
        }
    }

    /// Trace of the position/velocity covariance, for convergence checks.
    pub fn covariance_trace(&self) -> Option<f64> {
        match &self.state {
            SmootherState::Primed { cov, .. } => Some(cov.trace()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // Deterministic stand-in for a stationary noisy source
    const NOISE: [f64; 12] = [
        0.4, -0.3, 0.1, -0.5, 0.2, 0.0, -0.2, 0.5, -0.1, 0.3, -0.4, 0.15,
    ];

    fn noisy(i: usize) -> Vector3<f64> {
        let n = NOISE[i % NOISE.len()];
        Vector3::new(250.0 + n, -80.0 - n, 30.0 + 0.5 * n)
    }

    #[test]
    fn test_withholds_until_window_filled() {
        let mut smoother = PositionSmoother::new(5, 10);
        for i in 0..4 {
            assert!(smoother.update(noisy(i)).is_none(), "call {} leaked output", i);
        }
        assert!(!smoother.is_primed());
        let out = smoother.update(noisy(4));
        assert!(out.is_some(), "window-length-th call must produce output");
        assert!(smoother.is_primed());
    }

    #[test]
    fn test_filtered_position_near_source() {
        let mut smoother = PositionSmoother::new(10, 20);
        let mut last = None;
        for i in 0..30 {
            if let Some(out) = smoother.update(noisy(i)) {
                last = Some(out);
            }
        }
        let out = last.unwrap();
        assert_relative_eq!(out.position[0], 250.0, epsilon = 1.0);
        assert_relative_eq!(out.position[1], -80.0, epsilon = 1.0);
        assert_relative_eq!(out.position[2], 30.0, epsilon = 1.0);
        assert!(out.std_dev.iter().all(|s| s.is_finite() && *s >= 0.0));
    }

    #[test]
    fn test_covariance_trace_non_increasing() {
        let mut smoother = PositionSmoother::new(8, 20);
        for i in 0..8 {
            smoother.update(noisy(i));
        }
        let mut prev = smoother.covariance_trace().unwrap();
        for i in 8..40 {
            smoother.update(noisy(i));
            let trace = smoother.covariance_trace().unwrap();
            assert!(
                trace <= prev + 1e-7,
                "trace grew at step {}: {} -> {}",
                i,
                prev,
                trace
            );
            prev = trace;
        }
    }

    #[test]
    fn test_reset_starts_new_session() {
        let mut smoother = PositionSmoother::new(3, 5);
        for i in 0..5 {
            smoother.update(noisy(i));
        }
        assert!(smoother.is_primed());
        smoother.reset();
        assert!(!smoother.is_primed());
        assert!(smoother.update(noisy(0)).is_none());
    }

    #[test]
    fn test_window_of_one_primes_immediately() {
        let mut smoother = PositionSmoother::new(1, 5);
        assert!(smoother.update(Vector3::new(1.0, 2.0, 3.0)).is_some());
    }
}
