//! GDAL implementation of the storage layer.

use std::ffi::{CString, c_int};
use std::path::{Path, PathBuf};

use gdal::{
    Dataset, DatasetOptions, DriverManager, GdalOpenFlags,
    errors::GdalError,
    raster::{Buffer, GdalDataType},
    spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef},
    vector::{FieldValue as GdalFieldValue, LayerAccess, LayerOptions, OGRFieldType, ToGdal},
};
use inf::gdalinterop::{check_gdal_pointer, check_gdal_rc, create_string_list};
use ndarray::{Array2, ArrayView2};

use crate::{
    BandStatistics, BlockWindow, Error, GeoTransform, RasterDataType, RasterSize, Result,
    io::{BurnShape, CoordinateTransform, GeoBackend, IdentityTransform, RasterCreateOptions, RasterDataset, WarpRequest, same_projection},
    vector::{Feature, FieldDefinition, FieldType, FieldValue, VectorDataset, VectorLayer},
    warp::ResampleMethod,
};

impl From<GdalDataType> for RasterDataType {
    fn from(value: GdalDataType) -> Self {
        match value {
            GdalDataType::UInt8 => RasterDataType::Uint8,
            GdalDataType::Int8 => RasterDataType::Int8,
            GdalDataType::UInt16 => RasterDataType::Uint16,
            GdalDataType::Int16 => RasterDataType::Int16,
            GdalDataType::UInt32 => RasterDataType::Uint32,
            GdalDataType::Int32 => RasterDataType::Int32,
            GdalDataType::UInt64 => RasterDataType::Uint64,
            GdalDataType::Int64 => RasterDataType::Int64,
            GdalDataType::Float32 => RasterDataType::Float32,
            _ => RasterDataType::Float64,
        }
    }
}

fn gdal_ordinal(data_type: RasterDataType) -> gdal_sys::GDALDataType::Type {
    use gdal_sys::GDALDataType;

    match data_type {
        RasterDataType::Uint8 => GDALDataType::GDT_Byte,
        RasterDataType::Int8 => GDALDataType::GDT_Int8,
        RasterDataType::Uint16 => GDALDataType::GDT_UInt16,
        RasterDataType::Int16 => GDALDataType::GDT_Int16,
        RasterDataType::Uint32 => GDALDataType::GDT_UInt32,
        RasterDataType::Int32 => GDALDataType::GDT_Int32,
        RasterDataType::Uint64 => GDALDataType::GDT_UInt64,
        RasterDataType::Int64 => GDALDataType::GDT_Int64,
        RasterDataType::Float32 => GDALDataType::GDT_Float32,
        RasterDataType::Float64 => GDALDataType::GDT_Float64,
    }
}

fn gdal_resample_name(method: ResampleMethod) -> &'static str {
    match method {
        ResampleMethod::Nearest => "near",
        ResampleMethod::Bilinear => "bilinear",
        ResampleMethod::Cubic => "cubic",
        ResampleMethod::CubicSpline => "cubicspline",
        ResampleMethod::Lanczos => "lanczos",
        ResampleMethod::Mode => "mode",
        ResampleMethod::Average => "average",
        ResampleMethod::Max => "max",
        ResampleMethod::Min => "min",
        ResampleMethod::Median => "med",
        ResampleMethod::FirstQuartile => "q1",
        ResampleMethod::ThirdQuartile => "q3",
    }
}

fn open_with_flags(path: &Path, flags: GdalOpenFlags) -> Result<Dataset> {
    let options = DatasetOptions {
        open_flags: flags,
        ..Default::default()
    };

    Dataset::open_ex(path, options).map_err(|err| match err {
        GdalError::NullPointer { .. } if !path.exists() => Error::InvalidPath(PathBuf::from(path)),
        _ => Error::Runtime(format!("Failed to open dataset: {} ({err})", path.to_string_lossy())),
    })
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.to_string_lossy().to_string()).map_err(|_| Error::InvalidPath(path.to_path_buf()))
}

/// Backend that stores the datasets on disk using GDAL, the driver is chosen based on the file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct GdalBackend;

impl GdalBackend {
    pub fn new() -> Self {
        GdalBackend
    }
}

impl GeoBackend for GdalBackend {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open_raster(&self, path: &Path) -> Result<Box<dyn RasterDataset>> {
        let ds = open_with_flags(path, GdalOpenFlags::GDAL_OF_READONLY | GdalOpenFlags::GDAL_OF_RASTER)?;
        Ok(Box::new(GdalRasterDataset::new(path, ds)))
    }

    fn open_raster_for_update(&self, path: &Path) -> Result<Box<dyn RasterDataset>> {
        let ds = open_with_flags(path, GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER)?;
        Ok(Box::new(GdalRasterDataset::new(path, ds)))
    }

    fn create_raster(&self, path: &Path, options: &RasterCreateOptions) -> Result<Box<dyn RasterDataset>> {
        inf::fs::create_directory_for_file(path)?;

        let driver = DriverManager::get_output_driver_for_dataset_name(path, true).ok_or_else(|| {
            Error::Runtime(format!(
                "Could not detect raster type from filename: {}",
                path.to_string_lossy()
            ))
        })?;

        let c_path = path_to_cstring(path)?;
        let c_opts = create_string_list(&options.creation_options)?;
        let handle = unsafe {
            gdal_sys::GDALCreate(
                driver.c_driver(),
                c_path.as_ptr(),
                options.size.cols as c_int,
                options.size.rows as c_int,
                options.band_count as c_int,
                gdal_ordinal(options.data_type),
                c_opts.as_ptr(),
            )
        };

        let mut ds = unsafe { Dataset::from_c_dataset(check_gdal_pointer(handle, "GDALCreate")?) };
        ds.set_geo_transform(&options.geotransform.coefficients())?;
        if !options.projection.is_empty() {
            ds.set_projection(&options.projection)?;
        }

        for band_index in 1..=options.band_count {
            let mut band = ds.rasterband(band_index)?;
            if let Some(nodata) = options.data_type.checked_nodata(options.band_nodata(band_index))? {
                band.set_no_data_value(Some(nodata))?;
            }
            // drivers do not guarantee initialized pixels
            band.fill(0.0, None)?;
        }

        Ok(Box::new(GdalRasterDataset::new(path, ds)))
    }

    fn delete_raster(&self, path: &Path) -> Result<()> {
        let c_path = path_to_cstring(path)?;
        check_gdal_rc(unsafe { gdal_sys::GDALDeleteDataset(std::ptr::null_mut(), c_path.as_ptr()) })?;
        Ok(())
    }

    fn open_vector(&self, path: &Path) -> Result<VectorDataset> {
        let ds = open_with_flags(path, GdalOpenFlags::GDAL_OF_READONLY | GdalOpenFlags::GDAL_OF_VECTOR)?;

        let mut result = VectorDataset::default();
        for mut layer in ds.layers() {
            let projection = match layer.spatial_ref() {
                Some(srs) => srs.to_wkt()?,
                None => String::new(),
            };

            let mut vector_layer = VectorLayer::new(layer.name(), projection);
            vector_layer.fields = layer
                .defn()
                .fields()
                .map(|field| {
                    let field_type = match field.field_type() {
                        OGRFieldType::OFTInteger | OGRFieldType::OFTInteger64 => FieldType::Integer,
                        OGRFieldType::OFTReal => FieldType::Real,
                        _ => FieldType::String,
                    };
                    FieldDefinition::new(field.name(), field_type)
                })
                .collect();

            for feature in layer.features() {
                let geometry = match feature.geometry() {
                    Some(geom) => Some(geom.to_geo()?),
                    None => None,
                };

                let mut vector_feature = Feature {
                    fid: feature.fid().unwrap_or_default(),
                    geometry,
                    fields: Default::default(),
                };

                for (name, value) in feature.fields() {
                    let value = match value {
                        Some(GdalFieldValue::IntegerValue(v)) => FieldValue::Integer(v as i64),
                        Some(GdalFieldValue::Integer64Value(v)) => FieldValue::Integer(v),
                        Some(GdalFieldValue::RealValue(v)) => FieldValue::Real(v),
                        Some(GdalFieldValue::StringValue(v)) => FieldValue::String(v),
                        Some(other) => FieldValue::String(format!("{other:?}")),
                        None => continue,
                    };
                    vector_feature.fields.insert(name, value);
                }

                vector_layer.features.push(vector_feature);
            }

            result.layers.push(vector_layer);
        }

        Ok(result)
    }

    fn write_vector(&self, path: &Path, dataset: &VectorDataset) -> Result<()> {
        inf::fs::create_directory_for_file(path)?;
        let driver = DriverManager::get_output_driver_for_dataset_name(path, false).ok_or_else(|| {
            Error::Runtime(format!(
                "Could not detect vector type from filename: {}",
                path.to_string_lossy()
            ))
        })?;

        if path.exists() {
            driver.delete(path)?;
        }

        let mut ds = driver.create_vector_only(path)?;
        for layer in &dataset.layers {
            let srs = if layer.projection.is_empty() {
                None
            } else {
                Some(SpatialRef::from_wkt(&layer.projection)?)
            };

            let mut gdal_layer = ds.create_layer(LayerOptions {
                name: &layer.name,
                srs: srs.as_ref(),
                ty: gdal_sys::OGRwkbGeometryType::wkbUnknown,
                options: None,
            })?;

            let field_defs: Vec<(&str, OGRFieldType::Type)> = layer
                .fields
                .iter()
                .map(|f| {
                    let field_type = match f.field_type {
                        FieldType::Integer => OGRFieldType::OFTInteger64,
                        FieldType::Real => OGRFieldType::OFTReal,
                        FieldType::String => OGRFieldType::OFTString,
                    };
                    (f.name.as_str(), field_type)
                })
                .collect();
            gdal_layer.create_defn_fields(&field_defs)?;

            for feature in &layer.features {
                let Some(geometry) = &feature.geometry else {
                    log::debug!("Skipping feature {} without geometry", feature.fid);
                    continue;
                };

                let names: Vec<&str> = feature.fields.keys().map(String::as_str).collect();
                let values: Vec<GdalFieldValue> = feature
                    .fields
                    .values()
                    .map(|v| match v {
                        FieldValue::Integer(v) => GdalFieldValue::Integer64Value(*v),
                        FieldValue::Real(v) => GdalFieldValue::RealValue(*v),
                        FieldValue::String(v) => GdalFieldValue::StringValue(v.clone()),
                    })
                    .collect();

                gdal_layer.create_feature_fields(geometry.to_gdal()?, &names, &values)?;
            }
        }

        Ok(())
    }

    fn coordinate_transformer(&self, source_projection: &str, target_projection: &str) -> Result<Box<dyn CoordinateTransform>> {
        if same_projection(source_projection, target_projection) {
            return Ok(Box::new(IdentityTransform));
        }

        // validate the projections upfront
        GdalTransform::create(source_projection, target_projection)?;
        Ok(Box::new(GdalTransform {
            source: source_projection.to_string(),
            target: target_projection.to_string(),
        }))
    }

    fn warp(&self, source: &Path, target: &Path, request: &WarpRequest) -> Result<()> {
        let src_ds = open_with_flags(source, GdalOpenFlags::GDAL_OF_READONLY | GdalOpenFlags::GDAL_OF_RASTER)?;
        let bbox = request.geotransform.bounding_box(request.size);

        let mut options = vec![
            "-overwrite".to_string(),
            "-te".to_string(),
            bbox.min_x.to_string(),
            bbox.min_y.to_string(),
            bbox.max_x.to_string(),
            bbox.max_y.to_string(),
            "-ts".to_string(),
            request.size.cols.to_string(),
            request.size.rows.to_string(),
            "-r".to_string(),
            gdal_resample_name(request.method).to_string(),
            "-multi".to_string(),
            "-wo".to_string(),
            "NUM_THREADS=ALL_CPUS".to_string(),
        ];

        if let Some(srs) = &request.target_projection {
            options.push("-t_srs".to_string());
            options.push(srs.clone());
        }

        for opt in &request.creation_options {
            options.push("-co".to_string());
            options.push(opt.clone());
        }

        warp_to_disk(&src_ds, target, &options)
    }

    fn rasterize(&self, path: &Path, band: usize, shapes: &[BurnShape], all_touched: bool) -> Result<()> {
        let ds = open_with_flags(path, GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER)?;

        let geometries = shapes.iter().map(|s| s.geometry.to_gdal()).collect::<std::result::Result<Vec<_>, _>>()?;
        let burn_values: Vec<f64> = shapes.iter().map(|s| s.value).collect();
        let geometry_handles: Vec<gdal_sys::OGRGeometryH> = geometries.iter().map(|g| unsafe { g.c_geometry() }).collect();
        let bands = [band as c_int];

        let mut options = Vec::new();
        if all_touched {
            options.push("ALL_TOUCHED=TRUE".to_string());
        }
        let c_opts = create_string_list(&options)?;

        unsafe {
            check_gdal_rc(gdal_sys::GDALRasterizeGeometries(
                ds.c_dataset(),
                bands.len() as c_int,
                bands.as_ptr(),
                geometry_handles.len() as c_int,
                geometry_handles.as_ptr(),
                None,
                std::ptr::null_mut(),
                burn_values.as_ptr(),
                c_opts.as_ptr(),
                None,
                std::ptr::null_mut(),
            ))?;
        }

        Ok(())
    }
}

/// Transformation between two projections.
/// GDAL transformation handles cannot be shared between threads, the handle is created on use.
struct GdalTransform {
    source: String,
    target: String,
}

impl GdalTransform {
    fn create(source: &str, target: &str) -> Result<CoordTransform> {
        let source = SpatialRef::from_wkt(source)?;
        source.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        let target = SpatialRef::from_wkt(target)?;
        target.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        Ok(CoordTransform::new(&source, &target)?)
    }
}

impl CoordinateTransform for GdalTransform {
    fn transform_point(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let transform = Self::create(&self.source, &self.target)?;
        let mut xs = [x];
        let mut ys = [y];
        transform.transform_coords(&mut xs, &mut ys, &mut [])?;
        Ok((xs[0], ys[0]))
    }
}

struct WarpAppOptionsWrapper {
    options: *mut gdal_sys::GDALWarpAppOptions,
}

impl WarpAppOptionsWrapper {
    fn new(opts: &[String]) -> Result<Self> {
        let c_opts = create_string_list(opts)?;
        let options = unsafe { gdal_sys::GDALWarpAppOptionsNew(c_opts.as_ptr(), core::ptr::null_mut()) };
        Ok(WarpAppOptionsWrapper {
            options: check_gdal_pointer(options, "GDALWarpAppOptionsNew")?,
        })
    }
}

impl Drop for WarpAppOptionsWrapper {
    fn drop(&mut self) {
        unsafe {
            gdal_sys::GDALWarpAppOptionsFree(self.options);
        }
    }
}

fn warp_to_disk(src_ds: &Dataset, dest_path: &Path, options: &[String]) -> Result<()> {
    let warp_options = WarpAppOptionsWrapper::new(options)?;
    inf::fs::create_directory_for_file(dest_path)?;
    let path_str = path_to_cstring(dest_path)?;

    unsafe {
        let mut user_error: c_int = 0;
        let mut src_handle = src_ds.c_dataset();
        let handle = gdal_sys::GDALWarp(
            path_str.as_ptr(),
            std::ptr::null_mut(),
            1,
            &mut src_handle,
            warp_options.options,
            &mut user_error,
        );

        if user_error != 0 {
            return Err(Error::Runtime("GDAL Warp: invalid arguments".to_string()));
        }

        gdal_sys::GDALClose(check_gdal_pointer(handle, "GDALWarp")?);
    }

    Ok(())
}

pub struct GdalRasterDataset {
    path: PathBuf,
    ds: Dataset,
}

impl GdalRasterDataset {
    fn new(path: &Path, ds: Dataset) -> Self {
        GdalRasterDataset {
            path: path.to_path_buf(),
            ds,
        }
    }
}

impl RasterDataset for GdalRasterDataset {
    fn path(&self) -> &Path {
        &self.path
    }

    fn raster_size(&self) -> RasterSize {
        let (cols, rows) = self.ds.raster_size();
        RasterSize::with_rows_cols(rows, cols)
    }

    fn band_count(&self) -> usize {
        self.ds.raster_count()
    }

    fn geotransform(&self) -> GeoTransform {
        self.ds.geo_transform().map(GeoTransform::from).unwrap_or_default()
    }

    fn projection(&self) -> String {
        self.ds.projection()
    }

    fn block_size(&self, band: usize) -> Result<(usize, usize)> {
        Ok(self.ds.rasterband(band)?.block_size())
    }

    fn data_type(&self, band: usize) -> Result<RasterDataType> {
        Ok(self.ds.rasterband(band)?.band_type().into())
    }

    fn nodata(&self, band: usize) -> Result<Option<f64>> {
        Ok(self.ds.rasterband(band)?.no_data_value())
    }

    fn set_nodata(&mut self, band: usize, nodata: Option<f64>) -> Result<()> {
        let data_type = self.data_type(band)?;
        let mut band = self.ds.rasterband(band)?;
        match data_type.checked_nodata(nodata)? {
            Some(nodata) => band.set_no_data_value(Some(nodata))?,
            None => band.delete_no_data_value()?,
        }

        Ok(())
    }

    fn set_geotransform(&mut self, geotransform: GeoTransform) -> Result<()> {
        self.ds.set_geo_transform(&geotransform.coefficients())?;
        Ok(())
    }

    fn set_projection(&mut self, projection: &str) -> Result<()> {
        self.ds.set_projection(projection)?;
        Ok(())
    }

    fn read_window(&self, band: usize, window: BlockWindow) -> Result<Array2<f64>> {
        let band = self.ds.rasterband(band)?;
        let size = (window.win_xsize, window.win_ysize);
        let buffer = band.read_as::<f64>((window.xoff as isize, window.yoff as isize), size, size, None)?;
        let (_, data) = buffer.into_shape_and_vec();
        Array2::from_shape_vec(window.shape(), data).map_err(|err| Error::Runtime(format!("Invalid block buffer: {err}")))
    }

    fn write_window(&mut self, band: usize, xoff: usize, yoff: usize, data: ArrayView2<f64>) -> Result<()> {
        let data_type = self.data_type(band)?;
        let mut band = self.ds.rasterband(band)?;
        let size = (data.ncols(), data.nrows());
        let values: Vec<f64> = data.iter().map(|&v| data_type.coerce(v)).collect();
        let mut buffer = Buffer::new(size, values);
        band.write((xoff as isize, yoff as isize), size, &mut buffer)?;
        Ok(())
    }

    fn fill(&mut self, band: usize, value: f64) -> Result<()> {
        self.ds.rasterband(band)?.fill(value, None)?;
        Ok(())
    }

    fn statistics(&self, band: usize) -> Result<Option<BandStatistics>> {
        let band = self.ds.rasterband(band)?;
        let (mut min, mut max, mut mean, mut stddev) = (0.0, 0.0, 0.0, 0.0);
        let rc = unsafe {
            gdal_sys::GDALGetRasterStatistics(band.c_rasterband(), 0, 0, &mut min, &mut max, &mut mean, &mut stddev)
        };

        if rc != gdal_sys::CPLErr::CE_None {
            return Ok(None);
        }

        Ok(Some(BandStatistics { min, max, mean, stddev }))
    }

    fn set_statistics(&mut self, band: usize, stats: BandStatistics) -> Result<()> {
        let band = self.ds.rasterband(band)?;
        check_gdal_rc(unsafe {
            gdal_sys::GDALSetRasterStatistics(band.c_rasterband(), stats.min, stats.max, stats.mean, stats.stddev)
        })?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ds.flush_cache()?;
        Ok(())
    }
}
