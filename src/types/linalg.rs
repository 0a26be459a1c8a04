//! Linear algebra type system for the position smoother
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the constant-velocity Kalman filter.

use nalgebra::{SMatrix, SVector};

// ===== State Dimension =====
// [x, x_vel, y, y_vel, z, z_vel]: position interleaved with velocity per axis
pub const STATE_DIM: usize = 6;

// ===== Measurement Dimension =====
pub const MEASURE_DIM: usize = 3; // (x, y, z) position only, velocity is hidden

// ===== Filter Types =====
pub type StateVec = SVector<f64, STATE_DIM>;
pub type StateMat = SMatrix<f64, STATE_DIM, STATE_DIM>;

// Measurement types
pub type MeasureVec = SVector<f64, MEASURE_DIM>;
pub type MeasureMat = SMatrix<f64, MEASURE_DIM, MEASURE_DIM>;

// Observation model and Kalman gain
pub type ObservationMat = SMatrix<f64, MEASURE_DIM, STATE_DIM>; // 3×6
pub type KalmanGain = SMatrix<f64, STATE_DIM, MEASURE_DIM>; // 6×3
