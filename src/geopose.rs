//! Geopose reconstructor: turn a raw solver pose in the aligned-image frame
//! into a geodetic position, altitude breakdown, and compass-frame
//! orientation.
//!
//! The raw estimate lives in the frame of the rotated-and-cropped reference,
//! so the alignment has to be inverted before the raster geotransform means
//! anything. Both inversions in here (the full alignment and its rotation
//! block) are checked independently; a singular matrix aborts the cycle with
//! no output rather than letting a half-converted pose escape.

use nalgebra::Vector4;
use std::fmt::{Display, Formatter};

use crate::align::AlignmentTransform;
use crate::frames;
use crate::types::{GeodeticPose, PoseEstimationContext, RawPoseEstimate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryFailure {
    /// The alignment transform could not be inverted
    AlignmentNotInvertible,
    /// The alignment rotation block could not be inverted while recovering
    /// orientation
    RotationNotInvertible,
}

impl Display for GeometryFailure {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            GeometryFailure::AlignmentNotInvertible => {
                write!(f, "rotation-and-crop transform is not invertible")
            }
            GeometryFailure::RotationNotInvertible => {
                write!(f, "alignment rotation block is not invertible")
            }
        }
    }
}

/// Reconstruct the geodetic camera pose from a raw solver estimate.
///
/// `transform` must be the alignment used to produce the reference the
/// solver matched against, and `context` the snapshot frozen when that
/// alignment was made.
pub fn reconstruct(
    raw: &RawPoseEstimate,
    transform: &AlignmentTransform,
    context: &PoseEstimationContext,
) -> Result<GeodeticPose, GeometryFailure> {
    // Camera position in the aligned-image world frame
    let t_world = raw.rotation.transpose() * (-raw.translation);

    let inverse = transform.try_inverse().ok_or_else(|| {
        log::warn!("rotation and cropping was non-invertible, cannot compute geopose");
        GeometryFailure::AlignmentNotInvertible
    })?;

    // Back to the original (unrotated, uncropped) raster pixel frame
    let t_raster = inverse * Vector4::new(t_world[0], t_world[1], t_world[2], 1.0);

    // Image pixel axes to the (row, col, elevation) order the provider
    // geotransform consumes, then to geodetic coordinates
    let geo = context
        .raster
        .geotransform
        .map(frames::image_to_raster_axes(t_raster));
    let (longitude, latitude, elevation_rel) = (geo[0], geo[1], geo[2]);

    // Orientation: revert the alignment rotation, then permute the solver's
    // south-east-up world convention into compass/down
    let rotation_inv = transform.rotation_block().try_inverse().ok_or_else(|| {
        log::warn!("alignment rotation block was non-invertible, cannot recover orientation");
        GeometryFailure::RotationNotInvertible
    })?;
    let r_ned = frames::seu_to_ned() * rotation_inv * raw.rotation.transpose();
    let orientation = frames::rotation_to_quat(&r_ned);

    let zone = frames::utm_zone(longitude);

    Ok(GeodeticPose {
        latitude,
        longitude,
        altitude_amsl: elevation_rel + context.ground_track.amsl,
        altitude_agl: elevation_rel,
        orientation,
        utm_proj: frames::utm_proj_string(zone),
    })
}
