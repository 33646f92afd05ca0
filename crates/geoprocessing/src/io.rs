//! Abstraction of the geospatial storage layer.
//!
//! All processing operations access rasters and vectors through a `GeoBackend`.
//! The `MemoryBackend` keeps everything in memory, the `GdalBackend` (feature `gdal`) works on files.

use std::path::{Path, PathBuf};

use geo_types::Geometry;
use ndarray::{Array2, ArrayView2};

use crate::{
    BandStatistics, BlockWindow, GeoTransform, RasterDataType, RasterSize, Result, VectorDataset, warp::ResampleMethod,
};

#[cfg(feature = "gdal")]
mod gdal;
mod memory;
mod rasterize;
mod resample;

#[cfg(feature = "gdal")]
#[doc(inline)]
pub use gdal::GdalBackend;
#[doc(inline)]
pub use memory::MemoryBackend;

/// A band of a raster on disk, bands are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RasterPathBand {
    pub path: PathBuf,
    pub band: usize,
}

impl RasterPathBand {
    pub fn new(path: impl Into<PathBuf>, band: usize) -> Self {
        RasterPathBand { path: path.into(), band }
    }
}

impl<P: Into<PathBuf>> From<(P, usize)> for RasterPathBand {
    fn from(value: (P, usize)) -> Self {
        RasterPathBand::new(value.0, value.1)
    }
}

/// Creation options of a raster as key value pairs (e.g. `TILED=YES`).
pub type CreationOptions = Vec<String>;

/// Looks up the value of a `KEY=VALUE` creation option, the key is case insensitive.
pub fn creation_option<'a>(options: &'a [String], key: &str) -> Option<&'a str> {
    options.iter().find_map(|opt| {
        let (k, v) = opt.split_once('=')?;
        k.trim().eq_ignore_ascii_case(key).then_some(v.trim())
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterCreateOptions {
    pub size: RasterSize,
    pub band_count: usize,
    pub data_type: RasterDataType,
    pub geotransform: GeoTransform,
    /// Projection as well known text, empty when unknown
    pub projection: String,
    /// Nodata value per band, a single entry is applied to all bands
    pub nodata: Vec<Option<f64>>,
    pub creation_options: CreationOptions,
}

impl RasterCreateOptions {
    pub fn band_nodata(&self, band: usize) -> Option<f64> {
        match self.nodata.len() {
            0 => None,
            1 => self.nodata[0],
            _ => self.nodata.get(band - 1).copied().flatten(),
        }
    }
}

/// Describes the output grid of a warp operation.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpRequest {
    pub geotransform: GeoTransform,
    pub size: RasterSize,
    /// Projection of the output, `None` keeps the source projection
    pub target_projection: Option<String>,
    pub method: ResampleMethod,
    pub creation_options: CreationOptions,
}

/// A geometry burned into a raster with the given value.
#[derive(Debug, Clone, PartialEq)]
pub struct BurnShape {
    pub geometry: Geometry<f64>,
    pub value: f64,
}

/// Transforms points between two coordinate reference systems.
pub trait CoordinateTransform: Send + Sync {
    fn transform_point(&self, x: f64, y: f64) -> Result<(f64, f64)>;
}

/// Transform that leaves the coordinates untouched, used when source and target projection are identical.
pub struct IdentityTransform;

impl CoordinateTransform for IdentityTransform {
    fn transform_point(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        Ok((x, y))
    }
}

/// An open raster, pixel data is exchanged as `f64` regardless of the band data type.
/// Written values are converted to the band data type.
pub trait RasterDataset: Send {
    fn path(&self) -> &Path;
    fn raster_size(&self) -> RasterSize;
    fn band_count(&self) -> usize;
    fn geotransform(&self) -> GeoTransform;
    fn projection(&self) -> String;
    /// The native (cols, rows) block size of the band storage
    fn block_size(&self, band: usize) -> Result<(usize, usize)>;
    fn data_type(&self, band: usize) -> Result<RasterDataType>;
    fn nodata(&self, band: usize) -> Result<Option<f64>>;
    fn set_nodata(&mut self, band: usize, nodata: Option<f64>) -> Result<()>;
    fn set_geotransform(&mut self, geotransform: GeoTransform) -> Result<()>;
    fn set_projection(&mut self, projection: &str) -> Result<()>;
    fn read_window(&self, band: usize, window: BlockWindow) -> Result<Array2<f64>>;
    fn write_window(&mut self, band: usize, xoff: usize, yoff: usize, data: ArrayView2<f64>) -> Result<()>;
    fn fill(&mut self, band: usize, value: f64) -> Result<()>;
    fn statistics(&self, band: usize) -> Result<Option<BandStatistics>>;
    fn set_statistics(&mut self, band: usize, stats: BandStatistics) -> Result<()>;
    fn flush(&mut self) -> Result<()>;

    fn read_band(&self, band: usize) -> Result<Array2<f64>> {
        self.read_window(band, BlockWindow::full(self.raster_size()))
    }
}

/// Factory for datasets and the raster operations that are delegated to the storage library.
pub trait GeoBackend: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn open_raster(&self, path: &Path) -> Result<Box<dyn RasterDataset>>;
    fn open_raster_for_update(&self, path: &Path) -> Result<Box<dyn RasterDataset>>;
    /// Creates a new raster, all bands are initialized to 0.
    fn create_raster(&self, path: &Path, options: &RasterCreateOptions) -> Result<Box<dyn RasterDataset>>;
    fn delete_raster(&self, path: &Path) -> Result<()>;
    fn open_vector(&self, path: &Path) -> Result<VectorDataset>;
    fn write_vector(&self, path: &Path, dataset: &VectorDataset) -> Result<()>;
    fn coordinate_transformer(&self, source_projection: &str, target_projection: &str) -> Result<Box<dyn CoordinateTransform>>;
    /// Resamples the source raster to the grid described in the request, all bands are warped.
    fn warp(&self, source: &Path, target: &Path, request: &WarpRequest) -> Result<()>;
    /// Burns the shapes into an existing raster band.
    fn rasterize(&self, path: &Path, band: usize, shapes: &[BurnShape], all_touched: bool) -> Result<()>;
}

/// Two projections are considered equal when their normalized text representation matches.
pub fn same_projection(a: &str, b: &str) -> bool {
    let normalize = |s: &str| s.split_whitespace().collect::<String>().to_ascii_uppercase();
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_option_lookup() {
        let options = vec!["TILED=YES".to_string(), "blockxsize = 256".to_string()];
        assert_eq!(creation_option(&options, "tiled"), Some("YES"));
        assert_eq!(creation_option(&options, "BLOCKXSIZE"), Some("256"));
        assert_eq!(creation_option(&options, "BIGTIFF"), None);
    }

    #[test]
    fn band_nodata() {
        let mut options = RasterCreateOptions {
            size: RasterSize::square(1),
            band_count: 2,
            data_type: RasterDataType::Float32,
            geotransform: GeoTransform::default(),
            projection: String::new(),
            nodata: vec![Some(-1.0)],
            creation_options: Vec::new(),
        };

        assert_eq!(options.band_nodata(1), Some(-1.0));
        assert_eq!(options.band_nodata(2), Some(-1.0));

        options.nodata = vec![None, Some(5.0)];
        assert_eq!(options.band_nodata(1), None);
        assert_eq!(options.band_nodata(2), Some(5.0));
    }
}
