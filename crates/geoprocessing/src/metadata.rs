//! Metadata of raster and vector datasets.

use std::path::Path;

use crate::{
    BoundingBox, Error, GeoTransform, RasterDataType, RasterSize, Result,
    io::{GeoBackend, RasterDataset},
};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RasterInfo {
    /// (x, y) pixel size, either can be negative
    pub pixel_size: (f64, f64),
    /// Average of the absolute x and y pixel sizes
    pub mean_pixel_size: f64,
    pub raster_size: RasterSize,
    /// Nodata value of every band
    pub nodata: Vec<Option<f64>>,
    pub band_count: usize,
    pub geotransform: GeoTransform,
    /// Data type of the first band
    pub data_type: RasterDataType,
    pub projection: String,
    /// Normalized bounding box: min <= max regardless of the geotransform signs
    pub bounding_box: BoundingBox,
    /// Native (cols, rows) block size of the first band
    pub block_size: (usize, usize),
}

impl RasterInfo {
    pub fn from_dataset(dataset: &dyn RasterDataset) -> Result<Self> {
        let geotransform = dataset.geotransform();
        let pixel_size = geotransform.pixel_size();
        let raster_size = dataset.raster_size();
        let band_count = dataset.band_count();

        let nodata = (1..=band_count).map(|band| dataset.nodata(band)).collect::<Result<Vec<_>>>()?;

        Ok(RasterInfo {
            pixel_size,
            mean_pixel_size: (pixel_size.0.abs() + pixel_size.1.abs()) / 2.0,
            raster_size,
            nodata,
            band_count,
            geotransform,
            data_type: dataset.data_type(1)?,
            projection: dataset.projection(),
            bounding_box: geotransform.bounding_box(raster_size),
            block_size: dataset.block_size(1)?,
        })
    }

    /// Nodata of a 1-based band index
    pub fn band_nodata(&self, band: usize) -> Option<f64> {
        band.checked_sub(1).and_then(|i| self.nodata.get(i).copied().flatten())
    }
}

pub fn raster_info(backend: &dyn GeoBackend, path: &Path) -> Result<RasterInfo> {
    RasterInfo::from_dataset(backend.open_raster(path)?.as_ref())
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VectorInfo {
    pub projection: String,
    pub bounding_box: BoundingBox,
    pub feature_count: usize,
}

/// Metadata of the named layer (or the first layer when no name is given).
/// A layer without geometries has no extent and is reported as an error.
pub fn vector_info(backend: &dyn GeoBackend, path: &Path, layer: Option<&str>) -> Result<VectorInfo> {
    let dataset = backend.open_vector(path)?;
    let layer = dataset.layer_or_first(layer)?;

    let bounding_box = layer.extent().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "Vector layer '{}' of {} has no geometries",
            layer.name,
            path.to_string_lossy()
        ))
    })?;

    Ok(VectorInfo {
        projection: layer.projection.clone(),
        bounding_box,
        feature_count: layer.features.len(),
    })
}
