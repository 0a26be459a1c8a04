//! Coordinate frame conventions and conversions.
//!
//! Four frames meet in this pipeline and each boundary is owned by exactly
//! one function here:
//!
//! - **image pixel**: x along columns (width), y along rows (height), z up
//!   out of the raster
//! - **raster geodetic input**: (row, col, elevation) order consumed by the
//!   provider geotransform
//! - **ENU**: camera geopose orientation from telemetry
//! - **compass/down (NED)**: reconstructed vehicle orientation output
//!
//! The external solver reports its world frame in a south-east-up variant;
//! `seu_to_ned` is the fixed permutation that brings it to compass/down.

use crate::types::Quat;
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector4};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Compass heading in degrees [0, 360) from an ENU orientation quaternion.
///
/// ENU yaw is measured from east, counterclockwise; heading is measured from
/// north, clockwise, hence the 90° shift.
pub fn heading_from_enu(q: &Quat) -> f64 {
    let enu_yaw = (2.0 * (q.w * q.z + q.x * q.y)).atan2(1.0 - 2.0 * (q.y * q.y + q.z * q.z));
    let heading = 90.0 - enu_yaw.to_degrees();
    (heading % 360.0 + 360.0) % 360.0
}

/// Off-nadir pitch angle in degrees of an ENU orientation quaternion.
///
/// 0° means the camera looks straight down.
pub fn off_nadir_pitch_deg(q: &Quat) -> f64 {
    // Clamp against rounding on normalized quaternions; asin of 1 + 1e-16
    // would poison the gate with NaN
    let pitch = (2.0 * (q.w * q.y - q.x * q.z)).clamp(-1.0, 1.0).asin();
    90.0 - pitch.to_degrees()
}

/// Fixed permutation from the solver's south-east-up world convention to
/// compass/down: S→N, E→E, U→D.
pub fn seu_to_ned() -> Matrix3<f64> {
    Matrix3::new(
        -1.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, //
        0.0, 0.0, -1.0,
    )
}

/// Reorder a homogeneous image-pixel vector (x along width, y along height,
/// z up) into the (row, col, elevation) order the raster geotransform
/// consumes. z is negated on the way out of the solver's convention.
pub fn image_to_raster_axes(v: Vector4<f64>) -> Vector4<f64> {
    Vector4::new(v[1], v[0], -v[2], v[3])
}

/// Orientation quaternion of a (possibly slightly non-orthonormal) rotation
/// matrix.
pub fn rotation_to_quat(m: &Matrix3<f64>) -> Quat {
    let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*m));
    Quat {
        w: q.w,
        x: q.i,
        y: q.j,
        z: q.k,
    }
}

/// UTM zone number (1..=60) for a longitude in degrees.
pub fn utm_zone(longitude: f64) -> u32 {
    let zone = ((longitude + 180.0) / 6.0).floor() as i64 + 1;
    zone.clamp(1, 60) as u32
}

/// PROJ string identifying the local UTM projection for a zone.
pub fn utm_proj_string(zone: u32) -> String {
    format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", zone)
}

/// Convert lat/lon to local east/north meters about an origin
/// (equirectangular approximation).
pub fn latlon_to_meters(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let d_lat = (lat - origin_lat).to_radians();
    let d_lon = (lon - origin_lon).to_radians();
    let x = EARTH_RADIUS_M * d_lon * origin_lat.to_radians().cos();
    let y = EARTH_RADIUS_M * d_lat;
    (x, y)
}

/// Inverse of [`latlon_to_meters`].
pub fn meters_to_latlon(x: f64, y: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let d_lat = y / EARTH_RADIUS_M;
    let d_lon = x / (EARTH_RADIUS_M * origin_lat.to_radians().cos());
    (origin_lat + d_lat.to_degrees(), origin_lon + d_lon.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_nadir_pitch_zero() {
        // 90° pitch down about the ENU y axis: straight at the ground
        let half = std::f64::consts::FRAC_1_SQRT_2;
        let q = Quat {
            w: half,
            x: 0.0,
            y: half,
            z: 0.0,
        };
        assert_relative_eq!(off_nadir_pitch_deg(&q), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_level_pitch_is_90() {
        assert_relative_eq!(off_nadir_pitch_deg(&Quat::identity()), 90.0, epsilon = 1e-9);
    }

    #[test]
    fn test_heading_east_facing() {
        // Identity ENU orientation faces east → compass heading 90°
        assert_relative_eq!(heading_from_enu(&Quat::identity()), 90.0, epsilon = 1e-9);
    }

    #[test]
    fn test_heading_wraps() {
        // ENU yaw 180° → heading (90 − 180) mod 360 = 270
        let q = Quat {
            w: 0.0,
            x: 0.0,
            y: 0.0,
            z: 1.0,
        };
        assert_relative_eq!(heading_from_enu(&q), 270.0, epsilon = 1e-9);
    }

    #[test]
    fn test_utm_zones() {
        assert_eq!(utm_zone(-180.0), 1);
        assert_eq!(utm_zone(179.9), 60);
        assert_eq!(utm_zone(0.0), 31);
    }

    #[test]
    fn test_local_meters_round_trip() {
        let (x, y) = latlon_to_meters(60.001, 24.002, 60.0, 24.0);
        let (lat, lon) = meters_to_latlon(x, y, 60.0, 24.0);
        assert_relative_eq!(lat, 60.001, epsilon = 1e-9);
        assert_relative_eq!(lon, 24.002, epsilon = 1e-9);
    }

    #[test]
    fn test_rotation_quat_round_trip() {
        // 45° about z, as the rotation matrix the reconstructor would hand in
        let rot = Rotation3::from_axis_angle(&nalgebra::Vector3::z_axis(), 0.25 * std::f64::consts::PI);
        let q = rotation_to_quat(&rot.into_inner());
        assert_relative_eq!(q.w, 0.9238795325112867, epsilon = 1e-9);
        assert_relative_eq!(q.z, 0.3826834323650898, epsilon = 1e-9);
        assert_relative_eq!(q.x, 0.0, epsilon = 1e-12);
    }
}
