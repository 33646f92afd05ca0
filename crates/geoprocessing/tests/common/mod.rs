#![allow(dead_code)]

use geo_types::{Rect, coord};
use geoprocessing::{
    GeoTransform, RasterDataType, RasterSize, Result,
    io::{MemoryBackend, RasterCreateOptions},
    vector::Feature,
};
use ndarray::Array2;

pub const NOD: f64 = -1.0;
pub const PROJECTION: &str = "EPSG:31370";

/// Adds a single band Float64 raster with square pixels and the top left corner at `origin`.
pub fn add_raster(
    backend: &MemoryBackend,
    path: &str,
    data: &Array2<f64>,
    nodata: Option<f64>,
    origin: (f64, f64),
    pixel_size: f64,
    block_size: (usize, usize),
) -> Result<()> {
    let options = RasterCreateOptions {
        size: RasterSize::from(data.dim()),
        band_count: 1,
        data_type: RasterDataType::Float64,
        geotransform: GeoTransform::new([origin.0, pixel_size, 0.0, origin.1, 0.0, -pixel_size]),
        projection: PROJECTION.to_string(),
        nodata: vec![nodata],
        creation_options: vec![
            "TILED=YES".to_string(),
            format!("BLOCKXSIZE={}", block_size.0),
            format!("BLOCKYSIZE={}", block_size.1),
        ],
    };

    backend.insert_raster(path, &options, std::slice::from_ref(data))
}

/// Adds a unit pixel raster with the lower left corner at the origin.
pub fn add_unit_raster(backend: &MemoryBackend, path: &str, data: &Array2<f64>, nodata: Option<f64>) -> Result<()> {
    add_raster(backend, path, data, nodata, (0.0, data.nrows() as f64), 1.0, (2, 2))
}

pub fn rect_feature(fid: u64, min: (f64, f64), max: (f64, f64)) -> Feature {
    Feature::new(fid, Rect::new(coord! { x: min.0, y: min.1 }, coord! { x: max.0, y: max.1 }).to_polygon())
}

/// Min, max, mean and population standard deviation of the values that are not nodata.
pub fn reference_statistics(data: &Array2<f64>, nodata: f64) -> Option<(f64, f64, f64, f64)> {
    let valid: Vec<f64> = data.iter().copied().filter(|&v| v != nodata).collect();
    if valid.is_empty() {
        return None;
    }

    let n = valid.len() as f64;
    let mean = valid.iter().sum::<f64>() / n;
    let stddev = (valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let min = valid.iter().copied().fold(f64::INFINITY, f64::min);
    let max = valid.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some((min, max, mean, stddev))
}
