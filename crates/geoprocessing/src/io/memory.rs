use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use ndarray::{Array2, ArrayView2, s};

use crate::{
    BandStatistics, BlockWindow, Error, GeoTransform, RasterDataType, RasterSize, Result, VectorDataset,
    io::{
        BurnShape, CoordinateTransform, GeoBackend, IdentityTransform, RasterCreateOptions, RasterDataset, WarpRequest,
        creation_option, rasterize, resample, same_projection,
    },
};

const DEFAULT_TILE_SIZE: usize = 256;

#[derive(Debug, Clone)]
struct MemBand {
    data: Array2<f64>,
    data_type: RasterDataType,
    nodata: Option<f64>,
    statistics: Option<BandStatistics>,
}

#[derive(Debug, Clone)]
struct MemRaster {
    size: RasterSize,
    geotransform: GeoTransform,
    projection: String,
    block_size: (usize, usize),
    bands: Vec<MemBand>,
}

impl MemRaster {
    fn band(&self, band: usize) -> Result<&MemBand> {
        band.checked_sub(1)
            .and_then(|index| self.bands.get(index))
            .ok_or_else(|| Error::InvalidArgument(format!("Band {band} out of range ({} bands)", self.bands.len())))
    }

    fn band_mut(&mut self, band: usize) -> Result<&mut MemBand> {
        let band_count = self.bands.len();
        band.checked_sub(1)
            .and_then(|index| self.bands.get_mut(index))
            .ok_or_else(|| Error::InvalidArgument(format!("Band {band} out of range ({band_count} bands)")))
    }
}

type SharedRaster = Arc<RwLock<MemRaster>>;

#[derive(Default)]
struct Store {
    rasters: HashMap<PathBuf, SharedRaster>,
    vectors: HashMap<PathBuf, VectorDataset>,
    transforms: HashMap<(String, String), Arc<dyn CoordinateTransform>>,
}

/// Backend that keeps all datasets in memory, keyed by their path.
///
/// Clones share the same storage, so a clone can be handed to worker threads.
/// Coordinate transformations between different projections have to be registered upfront.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<RwLock<Store>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a raster with the provided band contents.
    pub fn insert_raster(&self, path: impl AsRef<Path>, options: &RasterCreateOptions, bands: &[Array2<f64>]) -> Result<()> {
        if bands.len() != options.band_count {
            return Err(Error::InvalidArgument(format!(
                "Expected {} bands, got {}",
                options.band_count,
                bands.len()
            )));
        }

        let mut ds = self.create_raster(path.as_ref(), options)?;
        for (index, data) in bands.iter().enumerate() {
            ds.write_window(index + 1, 0, 0, data.view())?;
        }

        ds.flush()
    }

    pub fn insert_vector(&self, path: impl Into<PathBuf>, dataset: VectorDataset) -> Result<()> {
        self.store.write()?.vectors.insert(path.into(), dataset);
        Ok(())
    }

    /// Registers the transformation used between two projections.
    pub fn register_transform(
        &self,
        source_projection: &str,
        target_projection: &str,
        transform: impl CoordinateTransform + 'static,
    ) -> Result<()> {
        self.store.write()?.transforms.insert(
            (source_projection.to_string(), target_projection.to_string()),
            Arc::new(transform),
        );
        Ok(())
    }

    /// The paths of all rasters in the store, sorted
    pub fn raster_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = self.store.read()?.rasters.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    pub fn read_band(&self, path: impl AsRef<Path>, band: usize) -> Result<Array2<f64>> {
        self.open_raster(path.as_ref())?.read_band(band)
    }

    fn raster(&self, path: &Path) -> Result<SharedRaster> {
        self.store
            .read()?
            .rasters
            .get(path)
            .cloned()
            .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))
    }

    fn open(&self, path: &Path, writable: bool) -> Result<MemRasterDataset> {
        Ok(MemRasterDataset {
            path: path.to_path_buf(),
            raster: self.raster(path)?,
            writable,
        })
    }
}

fn block_size_from_options(size: RasterSize, options: &[String]) -> (usize, usize) {
    let block_option = |key: &str| creation_option(options, key).and_then(|v| v.parse::<usize>().ok()).filter(|&v| v > 0);

    let tiled = creation_option(options, "TILED").is_some_and(|v| v.eq_ignore_ascii_case("YES") || v.eq_ignore_ascii_case("TRUE"));
    if tiled {
        (
            block_option("BLOCKXSIZE").unwrap_or(DEFAULT_TILE_SIZE),
            block_option("BLOCKYSIZE").unwrap_or(DEFAULT_TILE_SIZE),
        )
    } else {
        (size.cols.max(1), block_option("BLOCKYSIZE").unwrap_or(1))
    }
}

impl GeoBackend for MemoryBackend {
    fn exists(&self, path: &Path) -> bool {
        self.store
            .read()
            .map(|store| store.rasters.contains_key(path) || store.vectors.contains_key(path))
            .unwrap_or(false)
    }

    fn open_raster(&self, path: &Path) -> Result<Box<dyn RasterDataset>> {
        Ok(Box::new(self.open(path, false)?))
    }

    fn open_raster_for_update(&self, path: &Path) -> Result<Box<dyn RasterDataset>> {
        Ok(Box::new(self.open(path, true)?))
    }

    fn create_raster(&self, path: &Path, options: &RasterCreateOptions) -> Result<Box<dyn RasterDataset>> {
        if options.band_count == 0 {
            return Err(Error::InvalidArgument("A raster needs at least one band".to_string()));
        }

        let mut bands = Vec::with_capacity(options.band_count);
        for band in 1..=options.band_count {
            bands.push(MemBand {
                data: Array2::zeros(options.size.shape()),
                data_type: options.data_type,
                nodata: options.data_type.checked_nodata(options.band_nodata(band))?,
                statistics: None,
            });
        }

        let raster = MemRaster {
            size: options.size,
            geotransform: options.geotransform,
            projection: options.projection.clone(),
            block_size: block_size_from_options(options.size, &options.creation_options),
            bands,
        };

        let raster = Arc::new(RwLock::new(raster));
        self.store.write()?.rasters.insert(path.to_path_buf(), raster.clone());
        log::debug!("Created in memory raster {}", path.to_string_lossy());

        Ok(Box::new(MemRasterDataset {
            path: path.to_path_buf(),
            raster,
            writable: true,
        }))
    }

    fn delete_raster(&self, path: &Path) -> Result<()> {
        match self.store.write()?.rasters.remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidPath(path.to_path_buf())),
        }
    }

    fn open_vector(&self, path: &Path) -> Result<VectorDataset> {
        self.store
            .read()?
            .vectors
            .get(path)
            .cloned()
            .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))
    }

    fn write_vector(&self, path: &Path, dataset: &VectorDataset) -> Result<()> {
        self.insert_vector(path, dataset.clone())
    }

    fn coordinate_transformer(&self, source_projection: &str, target_projection: &str) -> Result<Box<dyn CoordinateTransform>> {
        if same_projection(source_projection, target_projection) {
            return Ok(Box::new(IdentityTransform));
        }

        let transform = self
            .store
            .read()?
            .transforms
            .get(&(source_projection.to_string(), target_projection.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::Runtime(format!(
                    "No coordinate transformation available from '{source_projection}' to '{target_projection}'"
                ))
            })?;

        Ok(Box::new(SharedTransform(transform)))
    }

    fn warp(&self, source: &Path, target: &Path, request: &WarpRequest) -> Result<()> {
        let src = self.raster(source)?;
        let src = src.read()?.clone();

        let target_projection = request.target_projection.clone().unwrap_or_else(|| src.projection.clone());
        // maps target coordinates back into the source raster
        let transform = self.coordinate_transformer(&target_projection, &src.projection)?;
        let grid = resample::SourceGrid::new(src.geotransform)?;

        let data_type = src.bands.first().map(|b| b.data_type).unwrap_or_default();
        let options = RasterCreateOptions {
            size: request.size,
            band_count: src.bands.len(),
            data_type,
            geotransform: request.geotransform,
            projection: target_projection,
            nodata: src.bands.iter().map(|b| b.nodata).collect(),
            creation_options: request.creation_options.clone(),
        };

        let mut dst = self.create_raster(target, &options)?;
        for (index, band) in src.bands.iter().enumerate() {
            let warped = resample::warp_band(
                band.data.view(),
                band.nodata,
                &grid,
                &request.geotransform,
                request.size,
                transform.as_ref(),
                request.method,
            )?;
            dst.write_window(index + 1, 0, 0, warped.view())?;
        }

        dst.flush()
    }

    fn rasterize(&self, path: &Path, band: usize, shapes: &[BurnShape], all_touched: bool) -> Result<()> {
        let raster = self.raster(path)?;
        let mut raster = raster.write()?;
        let geotransform = raster.geotransform;
        let band = raster.band_mut(band)?;
        let data_type = band.data_type;
        rasterize::burn_shapes(&mut band.data, &geotransform, shapes, all_touched, |v| data_type.coerce(v))
    }
}

struct SharedTransform(Arc<dyn CoordinateTransform>);

impl CoordinateTransform for SharedTransform {
    fn transform_point(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        self.0.transform_point(x, y)
    }
}

/// Handle to an in memory raster.
pub struct MemRasterDataset {
    path: PathBuf,
    raster: SharedRaster,
    writable: bool,
}

impl MemRasterDataset {
    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::Runtime(format!(
                "Raster {} is opened in read only mode",
                self.path.to_string_lossy()
            )));
        }

        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&MemRaster) -> Result<T>) -> Result<T> {
        f(&*self.raster.read()?)
    }

    fn update(&mut self, f: impl FnOnce(&mut MemRaster) -> Result<()>) -> Result<()> {
        self.check_writable()?;
        f(&mut *self.raster.write()?)
    }

    fn check_window(size: RasterSize, window: &BlockWindow) -> Result<()> {
        if !window.fits_in(size) {
            return Err(Error::InvalidArgument(format!(
                "Window {window:?} exceeds the raster dimensions {size}"
            )));
        }

        Ok(())
    }
}

impl RasterDataset for MemRasterDataset {
    fn path(&self) -> &Path {
        &self.path
    }

    fn raster_size(&self) -> RasterSize {
        self.raster.read().map(|r| r.size).unwrap_or_default()
    }

    fn band_count(&self) -> usize {
        self.raster.read().map(|r| r.bands.len()).unwrap_or_default()
    }

    fn geotransform(&self) -> GeoTransform {
        self.raster.read().map(|r| r.geotransform).unwrap_or_default()
    }

    fn projection(&self) -> String {
        self.raster.read().map(|r| r.projection.clone()).unwrap_or_default()
    }

    fn block_size(&self, band: usize) -> Result<(usize, usize)> {
        self.read(|r| r.band(band).map(|_| r.block_size))
    }

    fn data_type(&self, band: usize) -> Result<RasterDataType> {
        self.read(|r| Ok(r.band(band)?.data_type))
    }

    fn nodata(&self, band: usize) -> Result<Option<f64>> {
        self.read(|r| Ok(r.band(band)?.nodata))
    }

    fn set_nodata(&mut self, band: usize, nodata: Option<f64>) -> Result<()> {
        self.update(|r| {
            let band = r.band_mut(band)?;
            band.nodata = band.data_type.checked_nodata(nodata)?;
            Ok(())
        })
    }

    fn set_geotransform(&mut self, geotransform: GeoTransform) -> Result<()> {
        self.update(|r| {
            r.geotransform = geotransform;
            Ok(())
        })
    }

    fn set_projection(&mut self, projection: &str) -> Result<()> {
        self.update(|r| {
            r.projection = projection.to_string();
            Ok(())
        })
    }

    fn read_window(&self, band: usize, window: BlockWindow) -> Result<Array2<f64>> {
        self.read(|r| {
            Self::check_window(r.size, &window)?;
            Ok(r.band(band)?.data.slice(s![window.row_range(), window.col_range()]).to_owned())
        })
    }

    fn write_window(&mut self, band: usize, xoff: usize, yoff: usize, data: ArrayView2<f64>) -> Result<()> {
        let window = BlockWindow::new(xoff, yoff, data.ncols(), data.nrows());
        self.update(|r| {
            Self::check_window(r.size, &window)?;
            let band = r.band_mut(band)?;
            let data_type = band.data_type;
            band.data
                .slice_mut(s![window.row_range(), window.col_range()])
                .zip_mut_with(&data, |dst, &src| *dst = data_type.coerce(src));
            Ok(())
        })
    }

    fn fill(&mut self, band: usize, value: f64) -> Result<()> {
        self.update(|r| {
            let band = r.band_mut(band)?;
            band.data.fill(band.data_type.coerce(value));
            Ok(())
        })
    }

    fn statistics(&self, band: usize) -> Result<Option<BandStatistics>> {
        self.read(|r| Ok(r.band(band)?.statistics))
    }

    fn set_statistics(&mut self, band: usize, stats: BandStatistics) -> Result<()> {
        self.update(|r| {
            r.band_mut(band)?.statistics = Some(stats);
            Ok(())
        })
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
