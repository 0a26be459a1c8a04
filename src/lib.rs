//! GNSS-free visual geolocation core.
//!
//! Estimates a vehicle's geographic pose by matching live camera frames
//! against a geo-referenced reference raster: the raster is rotated and
//! cropped to the camera's viewing geometry ([`align`]), an external matcher
//! solves for the relative pose, the result is carried back through the
//! alignment and the raster geotransform into geodetic coordinates
//! ([`geopose`]), and the noisy position stream is smoothed into a stable
//! fix with per-axis uncertainty ([`smoothing`]).

pub mod align;
pub mod filters;
pub mod frames;
pub mod gate;
pub mod geopose;
pub mod pipeline;
pub mod smoothing;
pub mod solver;
pub mod types;

pub use align::{rotate_and_crop, AlignError, AlignmentTransform};
pub use gate::GateDecision;
pub use geopose::{reconstruct, GeometryFailure};
pub use pipeline::{CycleInputs, CycleSkip, EstimatorConfig, PoseEstimator, PositionFix};
pub use smoothing::{FilteredPosition, PositionSmoother};
pub use solver::{PoseSolverClient, SolverError};
