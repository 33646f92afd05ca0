//! Creation of new rasters based on existing rasters or vectors and burning vector layers into rasters.

use std::path::Path;

use crate::{
    BoundingBox, Error, GeoTransform, RasterDataType, RasterSize, Result,
    boundingbox::MergeMode,
    io::{BurnShape, CreationOptions, GeoBackend, RasterCreateOptions, RasterPathBand, creation_option},
    runtimeconfiguration::default_creation_options,
    vector::FieldValue,
};

/// Settings for `new_raster_from_base`, the defaults create a single band raster with the size of the base.
#[derive(Debug, Clone)]
pub struct NewRasterOptions {
    pub band_count: usize,
    /// Value to fill every band with, `None` entries keep the band zero initialized
    pub fill: Vec<Option<f64>>,
    /// Overrides the size of the base raster
    pub size: Option<RasterSize>,
    pub creation_options: CreationOptions,
}

impl Default for NewRasterOptions {
    fn default() -> Self {
        NewRasterOptions {
            band_count: 1,
            fill: Vec::new(),
            size: None,
            creation_options: default_creation_options(),
        }
    }
}

/// Creation options that keep the tiling of a base raster with the given (cols, rows) block size.
/// Striped bases (blocks spanning the full width) keep the creation options as provided.
fn tiling_options(options: &[String], base_block: (usize, usize), cols: usize) -> CreationOptions {
    let mut result = options.to_vec();
    if base_block.0 != cols {
        for (key, value) in [
            ("TILED", "YES".to_string()),
            ("BLOCKXSIZE", base_block.0.to_string()),
            ("BLOCKYSIZE", base_block.1.to_string()),
        ] {
            if creation_option(&result, key).is_none() {
                result.push(format!("{key}={value}"));
            }
        }
    }

    result
}

/// Creates a new raster with the georeference of the base raster.
///
/// `nodata` contains the nodata value per band, missing entries result in bands without nodata.
pub fn new_raster_from_base(
    backend: &dyn GeoBackend,
    base: &Path,
    target: &Path,
    data_type: RasterDataType,
    nodata: &[Option<f64>],
    options: &NewRasterOptions,
) -> Result<()> {
    if nodata.len() > options.band_count || options.fill.len() > options.band_count {
        return Err(Error::InvalidArgument(format!(
            "Got {} nodata values and {} fill values for a raster with {} band(s)",
            nodata.len(),
            options.fill.len(),
            options.band_count
        )));
    }

    let base_ds = backend.open_raster(base)?;
    let size = options.size.unwrap_or(base_ds.raster_size());

    let create_options = RasterCreateOptions {
        size,
        band_count: options.band_count,
        data_type,
        geotransform: base_ds.geotransform(),
        projection: base_ds.projection(),
        nodata: (0..options.band_count).map(|i| nodata.get(i).copied().flatten()).collect(),
        creation_options: tiling_options(&options.creation_options, base_ds.block_size(1)?, size.cols),
    };
    drop(base_ds);

    let mut target_ds = backend.create_raster(target, &create_options)?;
    for (index, fill) in options.fill.iter().enumerate() {
        if let Some(fill) = fill {
            target_ds.fill(index + 1, *fill)?;
        }
    }

    target_ds.flush()
}

/// Creates a single band raster that encloses the extent of all the layers of the vector.
///
/// The origin of the raster is the corner of the vector extent indicated by the signs of the pixel size,
/// the dimensions are rounded up so the raster covers the full extent.
#[allow(clippy::too_many_arguments)]
pub fn create_raster_from_vector_extents(
    backend: &dyn GeoBackend,
    vector: &Path,
    target: &Path,
    pixel_size: (f64, f64),
    data_type: RasterDataType,
    nodata: Option<f64>,
    fill: Option<f64>,
    creation_options: &[String],
) -> Result<()> {
    if pixel_size.0 == 0.0 || pixel_size.1 == 0.0 {
        return Err(Error::InvalidArgument(format!("Invalid target pixel size: {pixel_size:?}")));
    }

    let dataset = backend.open_vector(vector)?;
    let extents: Vec<BoundingBox> = dataset.layers.iter().filter_map(|layer| layer.extent()).collect();
    let extent = BoundingBox::merge_all(&extents, MergeMode::Union)
        .ok_or_else(|| Error::InvalidArgument(format!("Vector {} has no geometries", vector.to_string_lossy())))?;

    let dimension = |extent: f64, pixel_size: f64, axis: &str| {
        let size = (extent / pixel_size).abs().ceil() as usize;
        if size == 0 {
            log::warn!("Vector extent is so small that the {axis} dimension rounds to 0; clamping to 1.");
        }
        size.max(1)
    };

    let size = RasterSize::with_rows_cols(
        dimension(extent.height(), pixel_size.1, "y"),
        dimension(extent.width(), pixel_size.0, "x"),
    );

    let create_options = RasterCreateOptions {
        size,
        band_count: 1,
        data_type,
        geotransform: GeoTransform::for_bounding_box(&extent, pixel_size),
        projection: dataset.layer(0)?.projection.clone(),
        nodata: vec![nodata],
        creation_options: creation_options.to_vec(),
    };

    let mut target_ds = backend.create_raster(target, &create_options)?;
    if let Some(fill) = fill {
        target_ds.fill(1, fill)?;
    }

    target_ds.flush()
}

/// The value burned into the raster for every feature.
#[derive(Debug, Clone, PartialEq)]
pub enum Burn {
    Value(f64),
    /// The numeric value of the feature attribute
    Attribute(String),
}

/// Burns the geometries of a vector layer into a raster band.
///
/// Features without a geometry are ignored, when burning an attribute features with a non numeric value are ignored as well.
pub fn rasterize_layer(
    backend: &dyn GeoBackend,
    raster: &RasterPathBand,
    vector: &Path,
    layer: Option<&str>,
    burn: &Burn,
    all_touched: bool,
) -> Result<()> {
    let dataset = backend.open_vector(vector)?;
    let layer = dataset.layer_or_first(layer)?;

    if let Burn::Attribute(name) = burn {
        if layer.field_definition(name).is_none() {
            return Err(Error::InvalidArgument(format!(
                "Field '{name}' does not exist in layer '{}' of {}",
                layer.name,
                vector.to_string_lossy()
            )));
        }
    }

    let mut skipped = 0;
    let shapes: Vec<BurnShape> = layer
        .features
        .iter()
        .filter_map(|feature| {
            let geometry = feature.geometry.clone()?;
            let value = match burn {
                Burn::Value(v) => Some(*v),
                Burn::Attribute(name) => feature.field(name).and_then(FieldValue::as_f64),
            };

            if value.is_none() {
                skipped += 1;
            }

            value.map(|value| BurnShape { geometry, value })
        })
        .collect();

    if skipped > 0 {
        log::warn!("{skipped} features without a numeric burn value were not rasterized");
    }

    backend.rasterize(&raster.path, raster.band, &shapes, all_touched)
}
