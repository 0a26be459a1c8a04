//! Image aligner: rotate the reference raster stack to the camera heading
//! and center-crop it to the query resolution.
//!
//! The returned [`AlignmentTransform`] is the homogeneous map from the
//! original raster pixel frame to the aligned (rotated and cropped) frame.
//! Pose post-processing inverts it to carry solver output back into the
//! frame the geotransform understands, so it is kept in 4×4 form even though
//! the warp itself only needs a 2×3 affine.

use nalgebra::{Matrix3, Matrix4, Vector3};
use ndarray::Array3;
use std::fmt::{Display, Formatter};

use crate::types::RasterStack;

#[derive(Debug, Clone, PartialEq)]
pub enum AlignError {
    /// Target crop is empty or larger than the source raster
    BadCropSize {
        source: (usize, usize),
        target: (usize, usize),
    },
    /// The warp affine could not be inverted for resampling
    SingularWarp,
}

impl Display for AlignError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            AlignError::BadCropSize { source, target } => write!(
                f,
                "crop {}x{} invalid for source {}x{}",
                target.0, target.1, source.0, source.1
            ),
            AlignError::SingularWarp => write!(f, "warp affine is not invertible"),
        }
    }
}

/// Homogeneous transform from original raster pixel space to aligned pixel
/// space: rotation about the raster center in the top-left 2×2 block, crop
/// translation in the top-right of rows 0 and 1, identity elsewhere.
#[derive(Clone, Debug)]
pub struct AlignmentTransform {
    matrix: Matrix4<f64>,
}

impl AlignmentTransform {
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    /// Inverse of the full 4×4 transform. `None` signals an unrecoverable
    /// numerical edge case that the caller must treat as a geometry failure.
    pub fn try_inverse(&self) -> Option<Matrix4<f64>> {
        self.matrix.try_inverse()
    }

    /// The 3×3 rotation block (2D rotation padded with identity z), used to
    /// revert the alignment rotation on solver orientation output.
    pub fn rotation_block(&self) -> Matrix3<f64> {
        let m = &self.matrix;
        Matrix3::new(
            m[(0, 0)],
            m[(0, 1)],
            0.0,
            m[(1, 0)],
            m[(1, 1)],
            0.0,
            0.0,
            0.0,
            1.0,
        )
    }
}

#[cfg(test)]
impl AlignmentTransform {
    pub(crate) fn from_matrix(matrix: Matrix4<f64>) -> Self {
        AlignmentTransform { matrix }
    }
}

/// 2×3 affine rotating by `degrees` about the raster center, unit scale.
fn rotation_about_center(width: usize, height: usize, degrees: f64) -> [[f64; 3]; 2] {
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    let theta = degrees.to_radians();
    let (alpha, beta) = (theta.cos(), theta.sin());
    [
        [alpha, beta, (1.0 - alpha) * cx - beta * cy],
        [-beta, alpha, beta * cx + (1.0 - alpha) * cy],
    ]
}

/// Rotate the raster stack about its center by the camera heading and
/// center-crop it to `crop` = (height, width).
///
/// Returns the aligned pixel data (same channel layout as the input stack)
/// and the alignment transform of the operation.
pub fn rotate_and_crop(
    stack: &RasterStack,
    heading_deg: f64,
    crop: (usize, usize),
) -> Result<(Array3<u8>, AlignmentTransform), AlignError> {
    let (src_h, src_w) = (stack.height(), stack.width());
    let (crop_h, crop_w) = crop;
    if crop_h == 0 || crop_w == 0 || crop_h > src_h || crop_w > src_w {
        return Err(AlignError::BadCropSize {
            source: (src_h, src_w),
            target: crop,
        });
    }

    let r = rotation_about_center(src_w, src_h, heading_deg);

    // Center-crop offset per axis (height first, matching the crop argument)
    let off_rows = ((src_h - crop_h) / 2) as f64;
    let off_cols = ((src_w - crop_w) / 2) as f64;

    // Canonical transform: translate-after-rotate, padded to homogeneous 4×4
    let mut matrix = Matrix4::identity();
    matrix[(0, 0)] = r[0][0];
    matrix[(0, 1)] = r[0][1];
    matrix[(1, 0)] = r[1][0];
    matrix[(1, 1)] = r[1][1];
    matrix[(0, 3)] = r[0][2] + off_rows;
    matrix[(1, 3)] = r[1][2] + off_cols;
    let transform = AlignmentTransform { matrix };

    // Warp-only translation hack: negate and axis-swap the crop offset so
    // the crop region resamples into the top-left corner of the output
    // buffer, making "first crop_h x crop_w pixels" the center crop.
    let warp = [
        [r[0][0], r[0][1], r[0][2] - off_cols],
        [r[1][0], r[1][1], r[1][2] - off_rows],
    ];

    let aligned = warp_stack(&stack.data, &warp, crop_h, crop_w)?;
    Ok((aligned, transform))
}

/// Inverse-mapped nearest-neighbour affine warp of all channels into an
/// output buffer of (out_h, out_w). Samples falling outside the source are
/// zero, matching the border behavior the matcher is calibrated against.
fn warp_stack(
    data: &Array3<u8>,
    affine: &[[f64; 3]; 2],
    out_h: usize,
    out_w: usize,
) -> Result<Array3<u8>, AlignError> {
    let fwd = Matrix3::new(
        affine[0][0],
        affine[0][1],
        affine[0][2],
        affine[1][0],
        affine[1][1],
        affine[1][2],
        0.0,
        0.0,
        1.0,
    );
    let inv = fwd.try_inverse().ok_or(AlignError::SingularWarp)?;

    let (src_h, src_w, channels) = {
        let s = data.shape();
        (s[0], s[1], s[2])
    };
    let mut out = Array3::<u8>::zeros((out_h, out_w, channels));

    for y_dst in 0..out_h {
        for x_dst in 0..out_w {
            let p = inv * Vector3::new(x_dst as f64, y_dst as f64, 1.0);
            let x_src = p[0].round();
            let y_src = p[1].round();
            if x_src < 0.0 || y_src < 0.0 {
                continue;
            }
            let (xs, ys) = (x_src as usize, y_src as usize);
            if xs >= src_w || ys >= src_h {
                continue;
            }
            for ch in 0..channels {
                out[[y_dst, x_dst, ch]] = data[[ys, xs, ch]];
            }
        }
    }
    Ok(out)
}
