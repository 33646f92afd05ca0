use geo_types::{Rect, coord};
use ndarray::Array2;

use crate::{
    GeoTransform, RasterDataType, RasterSize, Result,
    io::{MemoryBackend, RasterCreateOptions},
    statistics::RasterStatistics,
    vector::Feature,
};

pub const NOD: f64 = -1.0;
pub const PROJECTION: &str = "EPSG:31370";

pub fn memory_backend() -> MemoryBackend {
    MemoryBackend::new()
}

/// Geotransform with unit pixels and the lower left corner of the raster at the origin.
pub fn unit_geotransform(rows: usize) -> GeoTransform {
    GeoTransform::new([0.0, 1.0, 0.0, rows as f64, 0.0, -1.0])
}

/// Adds a single band Float64 raster with unit pixels and the lower left corner at the origin.
pub fn add_raster(backend: &MemoryBackend, path: &str, data: &Array2<f64>, nodata: Option<f64>) -> Result<()> {
    add_multiband_raster(backend, path, std::slice::from_ref(data), nodata, (data.ncols(), 1))
}

/// Adds a Float64 raster with the given native (cols, rows) block size.
pub fn add_multiband_raster(
    backend: &MemoryBackend,
    path: &str,
    bands: &[Array2<f64>],
    nodata: Option<f64>,
    block_size: (usize, usize),
) -> Result<()> {
    let shape = bands.first().map(|b| b.dim()).unwrap_or_default();
    let options = RasterCreateOptions {
        size: RasterSize::from(shape),
        band_count: bands.len(),
        data_type: RasterDataType::Float64,
        geotransform: unit_geotransform(shape.0),
        projection: PROJECTION.to_string(),
        nodata: vec![nodata],
        creation_options: vec![
            "TILED=YES".to_string(),
            format!("BLOCKXSIZE={}", block_size.0),
            format!("BLOCKYSIZE={}", block_size.1),
        ],
    };

    backend.insert_raster(path, &options, bands)
}

/// Full array reduction used as reference for the block based statistics.
pub fn reference_statistics(data: &Array2<f64>, nodata: Option<f64>) -> Option<RasterStatistics> {
    let valid: Vec<f64> = data.iter().copied().filter(|&v| crate::nodata::is_valid(v, nodata)).collect();
    if valid.is_empty() {
        return None;
    }

    let count = valid.len() as f64;
    let sum: f64 = valid.iter().sum();
    let mean = sum / count;
    let variance = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;

    Some(RasterStatistics {
        min: valid.iter().copied().fold(f64::INFINITY, f64::min),
        max: valid.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean,
        stddev: variance.sqrt(),
        sum,
        value_count: valid.len() as u64,
    })
}

/// Axis aligned square polygon feature with the lower left corner at `origin`.
pub fn square_feature(fid: u64, origin: (f64, f64), size: f64) -> Feature {
    let rect = Rect::new(
        coord! { x: origin.0, y: origin.1 },
        coord! { x: origin.0 + size, y: origin.1 + size },
    );

    Feature::new(fid, rect.to_polygon())
}
