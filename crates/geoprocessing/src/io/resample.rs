//! Resampling of a raster band onto another grid, used by the in memory warp.
//!
//! Source locations are expressed in continuous pixel space: the center of pixel (col, row)
//! is located at (col + 0.5, row + 0.5).

use std::collections::HashMap;
use std::f64::consts::PI;

use ndarray::{Array2, ArrayView2};

use crate::{GeoTransform, RasterSize, Result, io::CoordinateTransform, nodata, warp::ResampleMethod};

/// Maps projected coordinates to pixel locations of the source raster.
pub struct SourceGrid {
    inverse: GeoTransform,
}

impl SourceGrid {
    pub fn new(geotransform: GeoTransform) -> Result<Self> {
        Ok(SourceGrid {
            inverse: geotransform.invert()?,
        })
    }

    fn pixel_location(&self, x: f64, y: f64) -> (f64, f64) {
        let loc = self.inverse.apply(x, y);
        (loc.x, loc.y)
    }
}

/// Resamples the source band onto the target grid.
/// Target pixels that fall outside of the source get the source nodata value (0 without nodata).
pub fn warp_band(
    source: ArrayView2<f64>,
    nodata: Option<f64>,
    source_grid: &SourceGrid,
    target_geotransform: &GeoTransform,
    target_size: RasterSize,
    target_to_source: &dyn CoordinateTransform,
    method: ResampleMethod,
) -> Result<Array2<f64>> {
    let fill = nodata.unwrap_or(0.0);
    let mut result = Array2::from_elem(target_size.shape(), fill);

    let source_location = |col: f64, row: f64| -> Result<(f64, f64)> {
        let coord = target_geotransform.apply(col, row);
        let (x, y) = target_to_source.transform_point(coord.x, coord.y)?;
        Ok(source_grid.pixel_location(x, y))
    };

    for ((row, col), dst) in result.indexed_iter_mut() {
        let center = source_location(col as f64 + 0.5, row as f64 + 0.5)?;
        if !inside(source, center) {
            continue;
        }

        let value = if is_area_method(method) {
            let corners = [
                source_location(col as f64, row as f64)?,
                source_location(col as f64 + 1.0, row as f64)?,
                source_location(col as f64, row as f64 + 1.0)?,
                source_location(col as f64 + 1.0, row as f64 + 1.0)?,
            ];
            area_sample(source, nodata, center, &corners, method)
        } else {
            point_sample(source, nodata, center, method)
        };

        *dst = value.unwrap_or(fill);
    }

    Ok(result)
}

fn inside(source: ArrayView2<f64>, (px, py): (f64, f64)) -> bool {
    px >= 0.0 && py >= 0.0 && px < source.ncols() as f64 && py < source.nrows() as f64
}

fn is_area_method(method: ResampleMethod) -> bool {
    matches!(
        method,
        ResampleMethod::Mode
            | ResampleMethod::Average
            | ResampleMethod::Min
            | ResampleMethod::Max
            | ResampleMethod::Median
            | ResampleMethod::FirstQuartile
            | ResampleMethod::ThirdQuartile
    )
}

fn nearest(source: ArrayView2<f64>, (px, py): (f64, f64)) -> f64 {
    source[(py.floor() as usize, px.floor() as usize)]
}

fn point_sample(source: ArrayView2<f64>, nodata: Option<f64>, location: (f64, f64), method: ResampleMethod) -> Option<f64> {
    match method {
        ResampleMethod::Bilinear => kernel_sample(source, nodata, location, 1, bilinear_weight),
        ResampleMethod::Cubic => kernel_sample(source, nodata, location, 2, cubic_weight),
        ResampleMethod::CubicSpline => kernel_sample(source, nodata, location, 2, cubic_spline_weight),
        ResampleMethod::Lanczos => kernel_sample(source, nodata, location, 3, lanczos_weight),
        _ => Some(nearest(source, location)),
    }
}

/// Weighted sum of the valid neighbours within `radius` pixels, the weights are renormalized
/// so nodata neighbours and neighbours outside of the raster do not bias the result.
fn kernel_sample(source: ArrayView2<f64>, nodata: Option<f64>, (px, py): (f64, f64), radius: i64, kernel: fn(f64) -> f64) -> Option<f64> {
    // location relative to the pixel centers
    let x = px - 0.5;
    let y = py - 0.5;
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);

    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    for row in (y0 - radius + 1)..=(y0 + radius) {
        if row < 0 || row >= source.nrows() as i64 {
            continue;
        }

        let wy = kernel(y - row as f64);
        if wy == 0.0 {
            continue;
        }

        for col in (x0 - radius + 1)..=(x0 + radius) {
            if col < 0 || col >= source.ncols() as i64 {
                continue;
            }

            let value = source[(row as usize, col as usize)];
            if nodata::is_nodata(value, nodata) {
                continue;
            }

            let weight = wy * kernel(x - col as f64);
            weighted_sum += weight * value;
            weight_sum += weight;
        }
    }

    if weight_sum.abs() < f64::EPSILON {
        return None;
    }

    Some(weighted_sum / weight_sum)
}

fn bilinear_weight(t: f64) -> f64 {
    (1.0 - t.abs()).max(0.0)
}

/// Keys cubic convolution kernel (a = -0.5)
fn cubic_weight(t: f64) -> f64 {
    const A: f64 = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((A * t - 5.0 * A) * t + 8.0 * A) * t - 4.0 * A
    } else {
        0.0
    }
}

/// Cubic B-spline kernel
fn cubic_spline_weight(t: f64) -> f64 {
    let t = t.abs();
    if t <= 1.0 {
        (4.0 - 6.0 * t * t + 3.0 * t * t * t) / 6.0
    } else if t < 2.0 {
        (2.0 - t).powi(3) / 6.0
    } else {
        0.0
    }
}

fn lanczos_weight(t: f64) -> f64 {
    const A: f64 = 3.0;
    if t == 0.0 {
        return 1.0;
    }

    if t.abs() >= A {
        return 0.0;
    }

    let pt = PI * t;
    A * pt.sin() * (pt / A).sin() / (pt * pt)
}

/// Aggregates the valid source pixels whose center lies in the footprint of the target pixel.
/// When the footprint contains no source pixel center, the pixel containing the target center is used.
fn area_sample(
    source: ArrayView2<f64>,
    nodata: Option<f64>,
    center: (f64, f64),
    corners: &[(f64, f64); 4],
    method: ResampleMethod,
) -> Option<f64> {
    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
    let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);

    // pixel indices with a center in [min, max)
    let col_range = (min_x - 0.5).ceil().max(0.0) as usize..((max_x - 0.5).ceil().max(0.0) as usize).min(source.ncols());
    let row_range = (min_y - 0.5).ceil().max(0.0) as usize..((max_y - 0.5).ceil().max(0.0) as usize).min(source.nrows());

    let mut values = Vec::with_capacity(col_range.len() * row_range.len());
    for row in row_range {
        for col in col_range.clone() {
            values.push(source[(row, col)]);
        }
    }

    if values.is_empty() {
        values.push(nearest(source, center));
    }

    values.retain(|&v| nodata::is_valid(v, nodata));
    if values.is_empty() {
        return None;
    }

    match method {
        ResampleMethod::Average => Some(values.iter().sum::<f64>() / values.len() as f64),
        ResampleMethod::Min => values.into_iter().reduce(f64::min),
        ResampleMethod::Max => values.into_iter().reduce(f64::max),
        ResampleMethod::Mode => mode(&values),
        ResampleMethod::Median => quantile(values, 0.5),
        ResampleMethod::FirstQuartile => quantile(values, 0.25),
        ResampleMethod::ThirdQuartile => quantile(values, 0.75),
        _ => Some(nearest(source, center)),
    }
}

/// Most frequent value, ties are resolved in favor of the smallest value
fn mode(values: &[f64]) -> Option<f64> {
    let mut counts: HashMap<u64, (f64, usize)> = HashMap::new();
    for &v in values {
        counts.entry(v.to_bits()).or_insert((v, 0)).1 += 1;
    }

    counts
        .into_values()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.total_cmp(&a.0)))
        .map(|(value, _)| value)
}

fn quantile(mut values: Vec<f64>, q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    values.sort_by(f64::total_cmp);
    let index = ((values.len() - 1) as f64 * q).round() as usize;
    values.get(index).copied()
}
