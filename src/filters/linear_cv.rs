//! Constant-velocity linear Kalman filter with batch parameter learning.
//!
//! State is `[x, x_vel, y, y_vel, z, z_vel]`; only position is observed.
//! The transition and observation models are fixed by construction; what the
//! expectation-maximization pass learns from the priming buffer is the
//! process noise, the observation noise, and the initial state moments.
//! After that one batch pass the filter runs as a plain online
//! predict/correct recursion from the previous mean and covariance.
//!
//! The transition model integrates velocity with a unit time step. Unevenly
//! spaced measurements are not rescaled here; that approximation (or a
//! resampling stage) belongs to the integrator.

use crate::types::linalg::*;

/// Transition matrix: identity plus unit velocity integration per axis.
///
/// ```text
/// x(t) = x(t-1) + x_vel(t-1)
/// x_vel(t) = x_vel(t-1)
/// ```
pub fn transition_matrix() -> StateMat {
    let mut f = StateMat::identity();
    f[(0, 1)] = 1.0;
    f[(2, 3)] = 1.0;
    f[(4, 5)] = 1.0;
    f
}

/// Observation matrix: selects the position components.
pub fn observation_matrix() -> ObservationMat {
    let mut h = ObservationMat::zeros();
    h[(0, 0)] = 1.0;
    h[(1, 2)] = 1.0;
    h[(2, 4)] = 1.0;
    h
}

/// Linear-Gaussian state space model with learned noise parameters.
#[derive(Clone, Debug)]
pub struct LinearCvFilter {
    f: StateMat,
    h: ObservationMat,
    q: StateMat,
    r: MeasureMat,
    initial_mean: StateVec,
    initial_cov: StateMat,
}

/// Per-step quantities of one forward pass, kept for the smoother.
struct ForwardPass {
    pred_means: Vec<StateVec>,
    pred_covs: Vec<StateMat>,
    filt_means: Vec<StateVec>,
    filt_covs: Vec<StateMat>,
}

impl LinearCvFilter {
    /// Learn noise parameters and initial moments from a measurement buffer
    /// by iterative expectation-maximization, holding the transition and
    /// observation models fixed.
    ///
    /// `initial_mean` seeds the state prior (positions from the first
    /// measurement, velocities zero); EM refines it along with the
    /// covariances.
    pub fn fit(measurements: &[MeasureVec], initial_mean: StateVec, n_iter: usize) -> Self {
        let mut model = LinearCvFilter {
            f: transition_matrix(),
            h: observation_matrix(),
            q: StateMat::identity(),
            r: MeasureMat::identity(),
            initial_mean,
            initial_cov: StateMat::identity(),
        };
        for _ in 0..n_iter {
            model.em_step(measurements);
        }
        model
    }

    /// One forward filtering pass; returns the final mean and covariance.
    pub fn filter(&self, measurements: &[MeasureVec]) -> (StateVec, StateMat) {
        let pass = self.forward(measurements);
        let n = measurements.len();
        (pass.filt_means[n - 1], pass.filt_covs[n - 1])
    }

    /// One online predict/correct step from the previous posterior.
    pub fn filter_update(
        &self,
        mean: &StateVec,
        cov: &StateMat,
        measurement: &MeasureVec,
    ) -> (StateVec, StateMat) {
        let pred_mean = self.f * mean;
        let pred_cov = self.f * cov * self.f.transpose() + self.q;
        self.correct(&pred_mean, &pred_cov, measurement)
    }

    fn forward(&self, measurements: &[MeasureVec]) -> ForwardPass {
        let n = measurements.len();
        let mut pass = ForwardPass {
            pred_means: Vec::with_capacity(n),
            pred_covs: Vec::with_capacity(n),
            filt_means: Vec::with_capacity(n),
            filt_covs: Vec::with_capacity(n),
        };
        for (t, y) in measurements.iter().enumerate() {
            let (pred_mean, pred_cov) = if t == 0 {
                (self.initial_mean, self.initial_cov)
            } else {
                (
                    self.f * pass.filt_means[t - 1],
                    self.f * pass.filt_covs[t - 1] * self.f.transpose() + self.q,
                )
            };
            let (filt_mean, filt_cov) = self.correct(&pred_mean, &pred_cov, y);
            pass.pred_means.push(pred_mean);
            pass.pred_covs.push(pred_cov);
            pass.filt_means.push(filt_mean);
            pass.filt_covs.push(filt_cov);
        }
        pass
    }

    /// Measurement update in Joseph form.
    ///
    /// A singular innovation covariance cannot happen while R stays positive
    /// definite; if it does numerically, the correction is skipped and the
    /// prediction carried through, since the smoother contract is to degrade
    /// rather than fail.
    fn correct(
        &self,
        pred_mean: &StateVec,
        pred_cov: &StateMat,
        measurement: &MeasureVec,
    ) -> (StateVec, StateMat) {
        let s = self.h * pred_cov * self.h.transpose() + self.r;
        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => return (*pred_mean, *pred_cov),
        };
        let k: KalmanGain = pred_cov * self.h.transpose() * s_inv;
        let innovation = measurement - self.h * pred_mean;
        let mean = pred_mean + k * innovation;
        let i_kh = StateMat::identity() - k * self.h;
        let cov = i_kh * pred_cov * i_kh.transpose() + k * self.r * k.transpose();
        (mean, cov)
    }

    /// One EM iteration: Rauch-Tung-Striebel smoothing pass (E-step), then
    /// closed-form updates of Q, R and the initial moments (M-step).
    fn em_step(&mut self, measurements: &[MeasureVec]) {
        let n = measurements.len();
        if n == 0 {
            return;
        }
        let pass = self.forward(measurements);

        // Backward smoothing, keeping the smoother gains for the lag-one
        // covariances the M-step needs.
        let mut smooth_means = vec![StateVec::zeros(); n];
        let mut smooth_covs = vec![StateMat::zeros(); n];
        let mut gains = vec![StateMat::zeros(); n.saturating_sub(1)];
        smooth_means[n - 1] = pass.filt_means[n - 1];
        smooth_covs[n - 1] = pass.filt_covs[n - 1];
        for t in (0..n - 1).rev() {
            let pred_inv = match pass.pred_covs[t + 1].try_inverse() {
                Some(inv) => inv,
                None => {
                    // Degenerate prediction: fall through with the filtered
                    // posterior for this step.
                    smooth_means[t] = pass.filt_means[t];
                    smooth_covs[t] = pass.filt_covs[t];
                    continue;
                }
            };
            let c = pass.filt_covs[t] * self.f.transpose() * pred_inv;
            smooth_means[t] =
                pass.filt_means[t] + c * (smooth_means[t + 1] - pass.pred_means[t + 1]);
            smooth_covs[t] =
                pass.filt_covs[t] + c * (smooth_covs[t + 1] - pass.pred_covs[t + 1]) * c.transpose();
            gains[t] = c;
        }

        // M-step: initial moments
        self.initial_mean = smooth_means[0];
        self.initial_cov = symmetrize(&smooth_covs[0]);

        // M-step: process noise over the n-1 transitions
        if n > 1 {
            let mut q_acc = StateMat::zeros();
            for t in 1..n {
                // Lag-one covariance Cov(x_t, x_{t-1} | all measurements)
                let v = smooth_covs[t] * gains[t - 1].transpose();
                let err = smooth_means[t] - self.f * smooth_means[t - 1];
                q_acc += err * err.transpose() + smooth_covs[t] - v * self.f.transpose()
                    - self.f * v.transpose()
                    + self.f * smooth_covs[t - 1] * self.f.transpose();
            }
            self.q = symmetrize(&(q_acc / (n - 1) as f64));
        }

        // M-step: observation noise over all measurements
        let mut r_acc = MeasureMat::zeros();
        for (t, y) in measurements.iter().enumerate() {
            let resid = y - self.h * smooth_means[t];
            r_acc += resid * resid.transpose()
                + self.h * smooth_covs[t] * self.h.transpose();
        }
        let r_new = r_acc / n as f64;
        self.r = MeasureMat::from_fn(|i, j| 0.5 * (r_new[(i, j)] + r_new[(j, i)]));
    }
}

fn symmetrize(m: &StateMat) -> StateMat {
    StateMat::from_fn(|i, j| 0.5 * (m[(i, j)] + m[(j, i)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn seed_mean(first: &MeasureVec) -> StateVec {
        let mut m = StateVec::zeros();
        m[0] = first[0];
        m[2] = first[1];
        m[4] = first[2];
        m
    }

    #[test]
    fn test_transition_integrates_velocity() {
        let f = transition_matrix();
        let mut x = StateVec::zeros();
        x[0] = 1.0;
        x[1] = 0.5; // x position 1.0, x velocity 0.5
        let next = f * x;
        assert_relative_eq!(next[0], 1.5);
        assert_relative_eq!(next[1], 0.5);
    }

    #[test]
    fn test_observation_selects_positions() {
        let h = observation_matrix();
        let mut x = StateVec::zeros();
        x[0] = 1.0;
        x[2] = 2.0;
        x[4] = 3.0;
        x[1] = 9.0; // velocities must not leak into the observation
        let y = h * x;
        assert_relative_eq!(y[0], 1.0);
        assert_relative_eq!(y[1], 2.0);
        assert_relative_eq!(y[2], 3.0);
    }

    #[test]
    fn test_fit_and_filter_track_constant_position() {
        let noise = [0.3, -0.2, 0.1, -0.4, 0.25, 0.0, -0.15, 0.35, -0.05, 0.2];
        let measurements: Vec<MeasureVec> = (0..20)
            .map(|i| {
                let n = noise[i % noise.len()];
                Vector3::new(100.0 + n, 50.0 - n, 10.0 + 0.5 * n)
            })
            .collect();
        let model = LinearCvFilter::fit(&measurements, seed_mean(&measurements[0]), 20);
        let (mean, cov) = model.filter(&measurements);
        assert_relative_eq!(mean[0], 100.0, epsilon = 1.0);
        assert_relative_eq!(mean[2], 50.0, epsilon = 1.0);
        assert_relative_eq!(mean[4], 10.0, epsilon = 1.0);
        for i in 0..6 {
            assert!(cov[(i, i)] >= 0.0, "negative variance at {}", i);
        }
    }

    #[test]
    fn test_online_update_stays_stable() {
        let measurements: Vec<MeasureVec> =
            (0..20).map(|_| Vector3::new(5.0, -3.0, 1.0)).collect();
        let model = LinearCvFilter::fit(&measurements, seed_mean(&measurements[0]), 10);
        let (mut mean, mut cov) = model.filter(&measurements);
        for _ in 0..50 {
            let (m, p) = model.filter_update(&mean, &cov, &Vector3::new(5.0, -3.0, 1.0));
            mean = m;
            cov = p;
        }
        assert_relative_eq!(mean[0], 5.0, epsilon = 1e-3);
        assert_relative_eq!(mean[1], 0.0, epsilon = 1e-2); // velocity settles
    }
}
