// pipeline.rs — Pure per-cycle computation layer
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - the HTTP round trip to the pose solver
//   - logging sinks and process lifecycle
//
// A cycle is two calls with the solver round trip in between:
//   prepare()  — admission gate, context snapshot, reference alignment
//   complete() — geopose reconstruction, plausibility check, smoothing
//
// This split keeps the geometry unit-testable with synthetic estimates and
// lets the orchestrator own the supersession policy for in-flight requests.

use nalgebra::Vector3;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::align::{self, AlignmentTransform};
use crate::frames;
use crate::gate;
use crate::geopose::{self, GeometryFailure};
use crate::smoothing::PositionSmoother;
use crate::solver::SolverError;
use crate::types::{
    CameraGeoPose, CameraIntrinsics, GroundTrackElevation, PoseEstimationContext, QueryImage,
    Quat, RasterStack, RawPoseEstimate,
};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct EstimatorConfig {
    /// Max camera pitch from nadir (degrees) for attempting estimation
    pub max_pitch_deg: f64,
    /// Min altitude AGL (meters) for attempting estimation
    pub min_match_altitude_m: f64,
    /// Max in-plane deviation (degrees) of the solver rotation from the
    /// pre-aligned expectation before an estimate is discarded
    pub attitude_deviation_deg: f64,
    /// Measurements buffered before the smoother primes
    pub smoother_window: usize,
    /// Iterations of the one-time batch learning pass
    pub smoother_em_iterations: usize,
    /// Pose solver endpoint URL
    pub solver_endpoint: String,
    /// Pose solver call timeout (seconds)
    pub solver_timeout_secs: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            max_pitch_deg: 30.0,
            min_match_altitude_m: 80.0,
            attitude_deviation_deg: 10.0,
            smoother_window: 20,
            smoother_em_iterations: 20,
            solver_endpoint: "http://localhost:8090/predictions/loftr".to_string(),
            solver_timeout_secs: 10,
        }
    }
}

// ─── Cycle outcome taxonomy ──────────────────────────────────────────────────

/// Why a cycle produced no estimate. None of these are fatal; the pipeline
/// keeps accepting frames after any of them.
#[derive(Debug, Clone)]
pub enum CycleSkip {
    /// A required upstream value is absent or unusable this cycle
    MissingInput(String),
    /// The admission gate declined
    ThresholdReject(String),
    /// Non-invertible alignment or rotation-recovery matrix
    Geometry(GeometryFailure),
    /// External solver timed out, errored, reported no match, or produced an
    /// implausible estimate
    Estimator(String),
}

impl Display for CycleSkip {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CycleSkip::MissingInput(what) => write!(f, "missing input: {}", what),
            CycleSkip::ThresholdReject(reason) => write!(f, "gate rejected: {}", reason),
            CycleSkip::Geometry(failure) => write!(f, "geometry failure: {}", failure),
            CycleSkip::Estimator(reason) => write!(f, "estimator failure: {}", reason),
        }
    }
}

impl From<GeometryFailure> for CycleSkip {
    fn from(failure: GeometryFailure) -> Self {
        CycleSkip::Geometry(failure)
    }
}

impl From<SolverError> for CycleSkip {
    fn from(err: SolverError) -> Self {
        CycleSkip::Estimator(err.to_string())
    }
}

/// Log a skip at the severity its class calls for.
pub fn log_skip(skip: &CycleSkip) {
    match skip {
        CycleSkip::MissingInput(_) | CycleSkip::Estimator(_) => log::info!("{}", skip),
        CycleSkip::ThresholdReject(_) | CycleSkip::Geometry(_) => log::warn!("{}", skip),
    }
}

// ─── Cycle inputs and intermediate state ─────────────────────────────────────

/// Everything the pipeline may consume in one cycle, frozen by the caller.
/// Optional fields are simply absent when upstream has not delivered yet.
#[derive(Clone)]
pub struct CycleInputs {
    pub timestamp: f64,
    pub raster: Option<Arc<RasterStack>>,
    pub query: Option<QueryImage>,
    pub intrinsics: Option<CameraIntrinsics>,
    pub camera_geopose: Option<CameraGeoPose>,
    /// NaN when unavailable
    pub altitude_agl: f64,
    pub ground_track: Option<GroundTrackElevation>,
}

/// Output of [`PoseEstimator::prepare`]: what the solver call needs, plus
/// what post-processing needs once the solver answers.
pub struct PreparedCycle {
    pub context: PoseEstimationContext,
    pub transform: AlignmentTransform,
    pub aligned: Array3<u8>,
    pub query: QueryImage,
}

/// Smoothed geocoded pose message for downstream consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PositionFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_amsl: f64,
    pub altitude_agl: f64,
    pub orientation: Quat,
    pub utm_proj: String,
    pub sd_east_m: f64,
    pub sd_north_m: f64,
    pub sd_up_m: f64,
}

// ─── Estimator ───────────────────────────────────────────────────────────────

/// Per-session pipeline state: configuration plus the position smoother,
/// which is the only value that survives across cycles. One estimator is
/// owned by one task; that ownership is the mutual-exclusion guarantee for
/// the smoother's filter state.
pub struct PoseEstimator {
    config: EstimatorConfig,
    smoother: PositionSmoother,
    /// Origin of the local smoothing frame, set by the first reconstruction
    local_origin: Option<(f64, f64)>,
}

impl PoseEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let smoother = PositionSmoother::new(config.smoother_window, config.smoother_em_iterations);
        PoseEstimator {
            config,
            smoother,
            local_origin: None,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Integrator hook for lost-lock policies: drop the smoothing session.
    /// Nothing in the core calls this.
    pub fn reset_session(&mut self) {
        self.smoother.reset();
        self.local_origin = None;
    }

    /// First half of a cycle: admission gate, context snapshot, and
    /// reference alignment. The returned [`PreparedCycle`] is handed to the
    /// solver; its context must be the one used to complete the cycle.
    pub fn prepare(&self, inputs: &CycleInputs) -> Result<PreparedCycle, CycleSkip> {
        let decision = gate::evaluate(
            inputs.camera_geopose.as_ref().map(|g| &g.orientation),
            inputs.altitude_agl,
            self.config.max_pitch_deg,
            self.config.min_match_altitude_m,
        );
        if !decision.admit {
            return Err(CycleSkip::ThresholdReject(decision.reason));
        }

        let raster = inputs
            .raster
            .as_ref()
            .ok_or_else(|| CycleSkip::MissingInput("reference raster".to_string()))?;
        let query = inputs
            .query
            .as_ref()
            .ok_or_else(|| CycleSkip::MissingInput("camera frame".to_string()))?;
        let intrinsics = inputs
            .intrinsics
            .ok_or_else(|| CycleSkip::MissingInput("camera intrinsics".to_string()))?;
        let ground_track = inputs
            .ground_track
            .ok_or_else(|| CycleSkip::MissingInput("ground track elevation".to_string()))?;
        // The gate admits only with an orientation present
        let camera_geopose = inputs
            .camera_geopose
            .ok_or_else(|| CycleSkip::MissingInput("camera geopose".to_string()))?;

        let context = PoseEstimationContext {
            raster: Arc::clone(raster),
            camera_geopose,
            ground_track,
            timestamp: inputs.timestamp,
        };

        let heading = frames::heading_from_enu(&camera_geopose.orientation);
        let crop = (intrinsics.height, intrinsics.width);
        let (aligned, transform) = align::rotate_and_crop(&context.raster, heading, crop)
            .map_err(|e| CycleSkip::MissingInput(e.to_string()))?;

        Ok(PreparedCycle {
            context,
            transform,
            aligned,
            query: query.clone(),
        })
    }

    /// Second half of a cycle: reconstruct the geodetic pose from the solver
    /// output, sanity-check it, and feed the smoother.
    ///
    /// Returns `Ok(None)` while the smoother is still priming; the cycle
    /// succeeded but no fix is published yet.
    pub fn complete(
        &mut self,
        context: &PoseEstimationContext,
        transform: &AlignmentTransform,
        raw: &RawPoseEstimate,
    ) -> Result<Option<PositionFix>, CycleSkip> {
        // The reference was pre-rotated to the camera heading, so a correct
        // match carries only a small residual in-plane rotation.
        let residual_deg = raw.rotation[(1, 0)]
            .atan2(raw.rotation[(0, 0)])
            .to_degrees()
            .abs();
        if residual_deg > self.config.attitude_deviation_deg {
            return Err(CycleSkip::Estimator(format!(
                "estimate rotated {:.1}° from aligned expectation (limit {:.1}°)",
                residual_deg, self.config.attitude_deviation_deg
            )));
        }

        let pose = geopose::reconstruct(raw, transform, context)?;

        let (origin_lat, origin_lon) = *self
            .local_origin
            .get_or_insert((pose.latitude, pose.longitude));
        let (east, north) =
            frames::latlon_to_meters(pose.latitude, pose.longitude, origin_lat, origin_lon);

        let filtered = match self
            .smoother
            .update(Vector3::new(east, north, pose.altitude_amsl))
        {
            Some(f) => f,
            None => return Ok(None),
        };

        let (latitude, longitude) = frames::meters_to_latlon(
            filtered.position[0],
            filtered.position[1],
            origin_lat,
            origin_lon,
        );
        let altitude_amsl = filtered.position[2];

        Ok(Some(PositionFix {
            timestamp: context.timestamp,
            latitude,
            longitude,
            altitude_amsl,
            altitude_agl: altitude_amsl - context.ground_track.amsl,
            orientation: pose.orientation,
            utm_proj: pose.utm_proj,
            sd_east_m: filtered.std_dev[0],
            sd_north_m: filtered.std_dev[1],
            sd_up_m: filtered.std_dev[2],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3 as V3};
    use ndarray::{Array2, Array3};

    const NADIR: Quat = Quat {
        w: std::f64::consts::FRAC_1_SQRT_2,
        x: 0.0,
        y: std::f64::consts::FRAC_1_SQRT_2,
        z: 0.0,
    };

    fn config(window: usize) -> EstimatorConfig {
        EstimatorConfig {
            smoother_window: window,
            smoother_em_iterations: 5,
            ..EstimatorConfig::default()
        }
    }

    fn inputs(t: f64) -> CycleInputs {
        let raster = RasterStack::new(
            Array3::from_shape_fn((64, 64, 3), |(r, c, ch)| ((r + c * 3 + ch) % 256) as u8),
            GeoTransform::new(60.0, 24.0, -1e-5, 1e-5),
            "EPSG:4326".to_string(),
        );
        CycleInputs {
            timestamp: t,
            raster: Some(Arc::new(raster)),
            query: Some(QueryImage {
                data: Array2::zeros((32, 32)),
                timestamp: t,
            }),
            intrinsics: Some(CameraIntrinsics {
                width: 32,
                height: 32,
                fx: 400.0,
                fy: 400.0,
                cx: 16.0,
                cy: 16.0,
            }),
            camera_geopose: Some(CameraGeoPose {
                timestamp: t,
                latitude: 60.0,
                longitude: 24.0,
                altitude_amsl: 170.0,
                orientation: NADIR,
            }),
            altitude_agl: 150.0,
            ground_track: Some(GroundTrackElevation {
                timestamp: t,
                amsl: 20.0,
            }),
        }
    }

    /// Solver output for a camera hovering over the aligned crop center
    fn hovering_raw() -> RawPoseEstimate {
        RawPoseEstimate {
            rotation: Matrix3::identity(),
            translation: V3::new(-16.0, -16.0, 150.0),
        }
    }

    #[test]
    fn test_prepare_rejects_low_altitude() {
        let estimator = PoseEstimator::new(config(3));
        let mut cycle_inputs = inputs(0.0);
        cycle_inputs.altitude_agl = 10.0;
        assert!(matches!(
            estimator.prepare(&cycle_inputs),
            Err(CycleSkip::ThresholdReject(_))
        ));
    }

    #[test]
    fn test_prepare_rejects_missing_orientation_as_threshold() {
        let estimator = PoseEstimator::new(config(3));
        let mut cycle_inputs = inputs(0.0);
        cycle_inputs.camera_geopose = None;
        assert!(matches!(
            estimator.prepare(&cycle_inputs),
            Err(CycleSkip::ThresholdReject(_))
        ));
    }

    #[test]
    fn test_prepare_flags_missing_raster() {
        let estimator = PoseEstimator::new(config(3));
        let mut cycle_inputs = inputs(0.0);
        cycle_inputs.raster = None;
        assert!(matches!(
            estimator.prepare(&cycle_inputs),
            Err(CycleSkip::MissingInput(_))
        ));
    }

    #[test]
    fn test_prepare_flags_oversized_crop() {
        let estimator = PoseEstimator::new(config(3));
        let mut cycle_inputs = inputs(0.0);
        if let Some(intrinsics) = cycle_inputs.intrinsics.as_mut() {
            intrinsics.width = 128;
            intrinsics.height = 128;
        }
        assert!(matches!(
            estimator.prepare(&cycle_inputs),
            Err(CycleSkip::MissingInput(_))
        ));
    }

    #[test]
    fn test_cycle_withholds_until_primed_then_fixes() {
        let mut estimator = PoseEstimator::new(config(3));
        let mut fix = None;
        for i in 0..3 {
            let prepared = estimator.prepare(&inputs(i as f64)).expect("gate admits");
            let out = estimator
                .complete(&prepared.context, &prepared.transform, &hovering_raw())
                .expect("cycle succeeds");
            if i < 2 {
                assert!(out.is_none(), "fix published before smoother primed");
            } else {
                fix = out;
            }
        }
        let fix = fix.expect("third cycle publishes a fix");

        // Constant input stream: the smoothed fix sits on the raw pose
        let prepared = estimator.prepare(&inputs(9.0)).unwrap();
        let raw_pose =
            crate::geopose::reconstruct(&hovering_raw(), &prepared.transform, &prepared.context)
                .unwrap();
        assert_relative_eq!(fix.latitude, raw_pose.latitude, epsilon = 1e-7);
        assert_relative_eq!(fix.longitude, raw_pose.longitude, epsilon = 1e-7);
        assert_relative_eq!(fix.altitude_amsl, raw_pose.altitude_amsl, epsilon = 1e-3);
        assert_relative_eq!(
            fix.altitude_agl,
            fix.altitude_amsl - 20.0,
            epsilon = 1e-9
        );
        assert!(fix.utm_proj.contains("+proj=utm +zone=35"));
        assert!(fix.sd_east_m.is_finite() && fix.sd_east_m >= 0.0);
    }

    #[test]
    fn test_rotated_estimate_is_discarded() {
        let mut estimator = PoseEstimator::new(config(3));
        let prepared = estimator.prepare(&inputs(0.0)).unwrap();
        let theta = 30.0_f64.to_radians();
        let raw = RawPoseEstimate {
            rotation: Matrix3::new(
                theta.cos(),
                -theta.sin(),
                0.0,
                theta.sin(),
                theta.cos(),
                0.0,
                0.0,
                0.0,
                1.0,
            ),
            translation: V3::new(-16.0, -16.0, 150.0),
        };
        assert!(matches!(
            estimator.complete(&prepared.context, &prepared.transform, &raw),
            Err(CycleSkip::Estimator(_))
        ));
    }

    #[test]
    fn test_geometry_failure_aborts_cycle() {
        let mut estimator = PoseEstimator::new(config(3));
        let prepared = estimator.prepare(&inputs(0.0)).unwrap();
        let mut m = *prepared.transform.matrix();
        m[(0, 0)] = 0.0;
        m[(0, 1)] = 0.0;
        m[(1, 0)] = 0.0;
        m[(1, 1)] = 0.0;
        let singular = AlignmentTransform::from_matrix(m);
        assert!(matches!(
            estimator.complete(&prepared.context, &singular, &hovering_raw()),
            Err(CycleSkip::Geometry(_))
        ));
    }

    #[test]
    fn test_reset_session_restarts_priming() {
        let mut estimator = PoseEstimator::new(config(2));
        for i in 0..2 {
            let prepared = estimator.prepare(&inputs(i as f64)).unwrap();
            estimator
                .complete(&prepared.context, &prepared.transform, &hovering_raw())
                .unwrap();
        }
        estimator.reset_session();
        let prepared = estimator.prepare(&inputs(5.0)).unwrap();
        let out = estimator
            .complete(&prepared.context, &prepared.transform, &hovering_raw())
            .unwrap();
        assert!(out.is_none());
    }
}
