use std::fmt::Debug;

use approx::{AbsDiffEq, RelativeEq};
use geo_types::Coord;

use crate::{BoundingBox, Error, RasterSize, Result};

/// Affine transformation from pixel space (col, row) to projected coordinates.
#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeoTransform([f64; 6]);

impl GeoTransform {
    /// Creates a new `GeoTransform` from the provided coefficients.
    ///
    /// The coefficients are in the order: [top left x, pixel width, rotation (0 if north is up), top left y, rotation (0 if north is up), pixel height].
    pub const fn new(coefficients: [f64; 6]) -> Self {
        GeoTransform(coefficients)
    }

    /// Creates the geotransform of a raster covering the bounding box with the given pixel size.
    /// The sign of the pixel size determines which corner of the box becomes the origin.
    pub fn for_bounding_box(bbox: &BoundingBox, pixel_size: (f64, f64)) -> Self {
        let origin_x = if pixel_size.0 < 0.0 { bbox.max_x } else { bbox.min_x };
        let origin_y = if pixel_size.1 < 0.0 { bbox.max_y } else { bbox.min_y };
        Self::new([origin_x, pixel_size.0, 0.0, origin_y, 0.0, pixel_size.1])
    }

    /// Translates a pixel location to a coordinate.
    /// Pixel (0, 0) is the top left corner of the raster.
    pub fn apply(&self, col: f64, row: f64) -> Coord<f64> {
        let x = self.0[0] + self.0[1] * col + self.0[2] * row;
        let y = self.0[3] + self.0[4] * col + self.0[5] * row;
        Coord { x, y }
    }

    pub fn top_left(&self) -> Coord<f64> {
        Coord { x: self.0[0], y: self.0[3] }
    }

    /// The horizontal cell size
    pub fn cell_size_x(&self) -> f64 {
        self.0[1]
    }

    /// The vertical cell size
    pub fn cell_size_y(&self) -> f64 {
        self.0[5]
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.0[1], self.0[5])
    }

    /// Returns the coefficients of the transformation.
    pub fn coefficients(&self) -> [f64; 6] {
        self.0
    }

    /// The normalized bounding box of a raster with this transform and the given size.
    pub fn bounding_box(&self, size: RasterSize) -> BoundingBox {
        let cols = size.cols as f64;
        let rows = size.rows as f64;
        let x_bounds = [self.0[0], self.0[0] + cols * self.0[1] + rows * self.0[2]];
        let y_bounds = [self.0[3], self.0[3] + cols * self.0[4] + rows * self.0[5]];

        BoundingBox::new(
            x_bounds[0].min(x_bounds[1]),
            y_bounds[0].min(y_bounds[1]),
            x_bounds[0].max(x_bounds[1]),
            y_bounds[0].max(y_bounds[1]),
        )
    }

    pub fn invert(&self) -> Result<Self> {
        let gt_in = &self.0;
        let mut gt_out = [0.0; 6];

        if gt_in[2] == 0.0 && gt_in[4] == 0.0 && gt_in[1] != 0.0 && gt_in[5] != 0.0 {
            // no rotation, avoids the determinant computation and its precision issues
            gt_out[0] = -gt_in[0] / gt_in[1];
            gt_out[1] = 1.0 / gt_in[1];
            gt_out[3] = -gt_in[3] / gt_in[5];
            gt_out[5] = 1.0 / gt_in[5];
            return Ok(gt_out.into());
        }

        // Assume a 3rd row that is [1 0 0].
        let det = gt_in[1] * gt_in[5] - gt_in[2] * gt_in[4];
        let magnitude = f64::max(f64::max(gt_in[1].abs(), gt_in[2].abs()), f64::max(gt_in[4].abs(), gt_in[5].abs()));

        if det.abs() <= 1e-10 * magnitude * magnitude {
            return Err(Error::Runtime(
                "GeoTransform::invert: Determinant is too small, cannot compute inverse.".to_string(),
            ));
        }

        let inv_det = 1.0 / det;

        gt_out[1] = gt_in[5] * inv_det;
        gt_out[4] = -gt_in[4] * inv_det;

        gt_out[2] = -gt_in[2] * inv_det;
        gt_out[5] = gt_in[1] * inv_det;

        gt_out[0] = (gt_in[2] * gt_in[3] - gt_in[0] * gt_in[5]) * inv_det;
        gt_out[3] = (-gt_in[1] * gt_in[3] + gt_in[0] * gt_in[4]) * inv_det;

        Ok(gt_out.into())
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        GeoTransform([0.0, 1.0, 0.0, 0.0, 0.0, -1.0])
    }
}

impl From<[f64; 6]> for GeoTransform {
    fn from(coefficients: [f64; 6]) -> Self {
        GeoTransform(coefficients)
    }
}

impl From<GeoTransform> for [f64; 6] {
    fn from(geo_trans: GeoTransform) -> [f64; 6] {
        geo_trans.0
    }
}

impl Debug for GeoTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GeoTransform(topleft: ({}, {}), pixel_width: {}, pixel_height: {})",
            self.0[0],
            self.0[3],
            self.cell_size_x(),
            self.cell_size_y()
        )
    }
}

impl AbsDiffEq for GeoTransform {
    type Epsilon = f64;

    fn default_epsilon() -> Self::Epsilon {
        f64::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: Self::Epsilon) -> bool {
        self.0.abs_diff_eq(&other.0, epsilon)
    }
}

impl RelativeEq for GeoTransform {
    fn default_max_relative() -> Self::Epsilon {
        f64::default_max_relative()
    }

    fn relative_eq(&self, other: &Self, epsilon: Self::Epsilon, max_relative: Self::Epsilon) -> bool {
        self.0.relative_eq(&other.0, epsilon, max_relative)
    }
}
