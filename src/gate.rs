//! Admission gate: decide whether pose estimation is worth attempting this
//! cycle.
//!
//! Matching a camera frame against the reference raster only works when the
//! camera is looking roughly straight down from a sufficient height. The gate
//! is a pure predicate over the frozen cycle inputs; it performs no I/O and
//! mutates nothing.

use crate::frames::off_nadir_pitch_deg;
use crate::types::Quat;

#[derive(Clone, Debug)]
pub struct GateDecision {
    pub admit: bool,
    pub reason: String,
}

impl GateDecision {
    fn reject(reason: String) -> Self {
        GateDecision {
            admit: false,
            reason,
        }
    }
}

/// Evaluate the admission gate.
///
/// Rejects when the camera orientation is unavailable (fail-safe: treated as
/// pitched too far off nadir), when the off-nadir pitch exceeds `max_pitch_deg`,
/// or when altitude above ground is unknown (NaN) or below `min_altitude_m`.
pub fn evaluate(
    orientation: Option<&Quat>,
    altitude_agl: f64,
    max_pitch_deg: f64,
    min_altitude_m: f64,
) -> GateDecision {
    let q = match orientation {
        Some(q) => q,
        None => {
            return GateDecision::reject(
                "camera orientation unavailable, assuming pitch too high".to_string(),
            )
        }
    };

    let off_nadir = off_nadir_pitch_deg(q);
    if off_nadir > max_pitch_deg {
        return GateDecision::reject(format!(
            "camera pitch {:.1}° off nadir exceeds limit {:.1}°",
            off_nadir, max_pitch_deg
        ));
    }

    if altitude_agl.is_nan() {
        return GateDecision::reject("altitude AGL unavailable".to_string());
    }
    if altitude_agl <= min_altitude_m {
        return GateDecision::reject(format!(
            "altitude {:.1} m at or below matching minimum {:.1} m",
            altitude_agl, min_altitude_m
        ));
    }

    GateDecision {
        admit: true,
        reason: format!(
            "pitch {:.1}° off nadir, altitude {:.1} m",
            off_nadir, altitude_agl
        ),
    }
}
