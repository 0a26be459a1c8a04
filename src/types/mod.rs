pub mod linalg;

pub use linalg::*;

use nalgebra::{Matrix4, Vector4};
use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Orientation quaternion (w, x, y, z).
///
/// The frame the quaternion lives in depends on where it came from: camera
/// geopose orientation is ENU, reconstructed vehicle orientation is
/// compass/down (NED).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Quat {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quat {
    pub fn identity() -> Self {
        Quat {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

/// Affine mapping from reference raster pixel coordinates to geodetic
/// coordinates. Owned by the raster provider; never mutated here.
///
/// Consumes homogeneous (row, col, elevation, 1) vectors in the original
/// (unrotated, uncropped) raster frame and produces
/// (longitude, latitude, elevation, 1). Elevation passes through in meters.
#[derive(Clone, Debug)]
pub struct GeoTransform {
    matrix: Matrix4<f64>,
}

impl GeoTransform {
    /// Build an axis-aligned geotransform from provider metadata: the
    /// geodetic coordinates of pixel (0, 0) and the per-pixel steps along
    /// raster rows (latitude, typically negative) and columns (longitude).
    pub fn new(origin_lat: f64, origin_lon: f64, lat_per_row: f64, lon_per_col: f64) -> Self {
        let mut m = Matrix4::identity();
        m[(0, 0)] = 0.0;
        m[(0, 1)] = lon_per_col;
        m[(0, 3)] = origin_lon;
        m[(1, 0)] = lat_per_row;
        m[(1, 1)] = 0.0;
        m[(1, 3)] = origin_lat;
        GeoTransform { matrix: m }
    }

    /// Map a homogeneous (row, col, elevation, 1) pixel-frame vector to
    /// (longitude, latitude, elevation, 1).
    pub fn map(&self, v: Vector4<f64>) -> Vector4<f64> {
        self.matrix * v
    }

    /// Convenience: geodetic (latitude, longitude) of a pixel.
    pub fn pixel_to_geo(&self, row: f64, col: f64) -> (f64, f64) {
        let out = self.map(Vector4::new(row, col, 0.0, 1.0));
        (out[1], out[0])
    }
}

/// Reference raster stack: 8-bit grayscale orthophoto in channel 0, 16-bit
/// elevation raster packed little-endian into channels 1 and 2.
#[derive(Clone, Debug)]
pub struct RasterStack {
    /// Pixel data, shape (height, width, 3)
    pub data: Array3<u8>,
    /// Pixel-to-geodetic mapping for the *unrotated, uncropped* raster
    pub geotransform: GeoTransform,
    /// Projection metadata of the geotransform output, e.g. "EPSG:4326"
    pub projection: String,
}

impl RasterStack {
    pub fn new(data: Array3<u8>, geotransform: GeoTransform, projection: String) -> Self {
        assert_eq!(
            data.shape()[2],
            3,
            "raster stack must have 3 channels (gray + 2x8-bit elevation)"
        );
        RasterStack {
            data,
            geotransform,
            projection,
        }
    }

    pub fn height(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[1]
    }

    /// Grayscale reference image (channel 0).
    pub fn reference_image(&self) -> ArrayView2<'_, u8> {
        self.data.index_axis(ndarray::Axis(2), 0)
    }

    /// Decode the packed elevation raster back to 16-bit values.
    pub fn elevation_raster(&self) -> Array2<u16> {
        let (h, w) = (self.height(), self.width());
        Array2::from_shape_fn((h, w), |(r, c)| {
            let lo = self.data[[r, c, 1]] as u16;
            let hi = self.data[[r, c, 2]] as u16;
            lo | (hi << 8)
        })
    }
}

/// Single-channel grayscale frame from the vehicle camera.
#[derive(Clone, Debug)]
pub struct QueryImage {
    pub data: Array2<u8>,
    pub timestamp: f64,
}

impl QueryImage {
    pub fn height(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[1]
    }
}

/// Camera geodetic pose with ENU orientation, from upstream telemetry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CameraGeoPose {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_amsl: f64,
    pub orientation: Quat,
}

/// Elevation of the ground track under the vehicle, meters AMSL.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GroundTrackElevation {
    pub timestamp: f64,
    pub amsl: f64,
}

/// Camera intrinsics. Only the sensor resolution participates in the core
/// (it sizes the reference crop); focal terms ride along for the solver.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub width: usize,
    pub height: usize,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Rotation + translation in the aligned-image frame, as returned by the
/// external pose solver.
#[derive(Clone, Debug)]
pub struct RawPoseEstimate {
    pub rotation: nalgebra::Matrix3<f64>,
    pub translation: nalgebra::Vector3<f64>,
}

/// Geocoded vehicle pose: WGS 84 position, altitude breakdown, and
/// orientation in the compass/down frame, tagged with the UTM zone used for
/// local projections downstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeodeticPose {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_amsl: f64,
    pub altitude_agl: f64,
    pub orientation: Quat,
    pub utm_proj: String,
}

/// Immutable per-cycle snapshot of everything pose post-processing needs.
///
/// Frozen in one step so that every downstream computation in the cycle sees
/// inputs from the same instant, never a mix of stale and fresh readings.
#[derive(Clone, Debug)]
pub struct PoseEstimationContext {
    pub raster: Arc<RasterStack>,
    pub camera_geopose: CameraGeoPose,
    pub ground_track: GroundTrackElevation,
    pub timestamp: f64,
}
