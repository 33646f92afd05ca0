use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::{
    BoundingBox, Error, GeoTransform, RasterSize, Result,
    blocks::LARGEST_BLOCK,
    io::{CreationOptions, GeoBackend, WarpRequest},
    metadata, statistics,
};

/// Resampling algorithm used when warping a raster onto another grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResampleMethod {
    #[default]
    Nearest,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Mode,
    Average,
    Max,
    Min,
    Median,
    FirstQuartile,
    ThirdQuartile,
}

impl FromStr for ResampleMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "nearest" | "near" => ResampleMethod::Nearest,
            "bilinear" => ResampleMethod::Bilinear,
            "cubic" => ResampleMethod::Cubic,
            "cubic_spline" | "cubicspline" => ResampleMethod::CubicSpline,
            "lanczos" => ResampleMethod::Lanczos,
            "mode" => ResampleMethod::Mode,
            "average" => ResampleMethod::Average,
            "max" => ResampleMethod::Max,
            "min" => ResampleMethod::Min,
            "med" | "median" => ResampleMethod::Median,
            "q1" => ResampleMethod::FirstQuartile,
            "q3" => ResampleMethod::ThirdQuartile,
            _ => return Err(Error::UnknownResampleMethod(vec![s.to_string()])),
        })
    }
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResampleMethod::Nearest => "nearest",
            ResampleMethod::Bilinear => "bilinear",
            ResampleMethod::Cubic => "cubic",
            ResampleMethod::CubicSpline => "cubic_spline",
            ResampleMethod::Lanczos => "lanczos",
            ResampleMethod::Mode => "mode",
            ResampleMethod::Average => "average",
            ResampleMethod::Max => "max",
            ResampleMethod::Min => "min",
            ResampleMethod::Median => "med",
            ResampleMethod::FirstQuartile => "q1",
            ResampleMethod::ThirdQuartile => "q3",
        };

        write!(f, "{name}")
    }
}

/// Parses all the method names, the error lists every unknown name.
pub fn parse_resample_methods<S: AsRef<str>>(methods: &[S]) -> Result<Vec<ResampleMethod>> {
    let mut result = Vec::with_capacity(methods.len());
    let mut unknown = Vec::new();
    for method in methods {
        match method.as_ref().parse::<ResampleMethod>() {
            Ok(m) => result.push(m),
            Err(_) => unknown.push(method.as_ref().to_string()),
        }
    }

    if !unknown.is_empty() {
        return Err(Error::UnknownResampleMethod(unknown));
    }

    Ok(result)
}

/// Number of pixels of the given size needed to cover the extent, a 0 dimension is clamped to 1.
pub fn grid_dimension(extent: f64, pixel_size: f64, axis: &str) -> usize {
    let size = (extent / pixel_size).round().abs() as usize;
    if size == 0 {
        log::warn!("bounding_box is so small that {axis} dimension rounds to 0; clamping to 1.");
        return 1;
    }

    size
}

/// The raster grid covering the bounding box with the requested pixel size.
pub fn target_grid(bbox: &BoundingBox, pixel_size: (f64, f64)) -> (GeoTransform, RasterSize) {
    let cols = grid_dimension(bbox.width(), pixel_size.0, "x");
    let rows = grid_dimension(bbox.height(), pixel_size.1, "y");
    (GeoTransform::for_bounding_box(bbox, pixel_size), RasterSize::with_rows_cols(rows, cols))
}

/// Optional settings of a single raster warp.
#[derive(Debug, Clone)]
pub struct WarpOptions {
    /// Output bounding box in the target projection, defaults to the source bounding box
    pub target_bounding_box: Option<BoundingBox>,
    /// Output projection, defaults to the source projection
    pub target_projection: Option<String>,
    pub creation_options: CreationOptions,
    pub largest_block: usize,
}

impl Default for WarpOptions {
    fn default() -> Self {
        WarpOptions {
            target_bounding_box: None,
            target_projection: None,
            creation_options: crate::runtimeconfiguration::default_creation_options(),
            largest_block: LARGEST_BLOCK,
        }
    }
}

/// Resamples the raster to the requested pixel size, bounding box and projection.
/// Statistics are calculated on the resulting raster.
pub fn warp_raster(
    backend: &dyn GeoBackend,
    base: &Path,
    pixel_size: (f64, f64),
    target: &Path,
    method: ResampleMethod,
    options: &WarpOptions,
) -> Result<()> {
    if pixel_size.0 == 0.0 || pixel_size.1 == 0.0 {
        return Err(Error::InvalidArgument(format!("Invalid target pixel size: {pixel_size:?}")));
    }

    let bbox = match options.target_bounding_box {
        Some(bbox) => bbox,
        None => metadata::raster_info(backend, base)?.bounding_box,
    };

    let (geotransform, size) = target_grid(&bbox, pixel_size);
    let request = WarpRequest {
        geotransform,
        size,
        target_projection: options.target_projection.clone(),
        method,
        creation_options: options.creation_options.clone(),
    };

    log::debug!(
        "Warp {} -> {} ({method}, {size}, {bbox})",
        base.to_string_lossy(),
        target.to_string_lossy()
    );
    backend.warp(base, target, &request)?;
    statistics::calculate_raster_stats(backend, target, options.largest_block)?;
    Ok(())
}
