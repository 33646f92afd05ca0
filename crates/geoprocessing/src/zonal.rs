//! Statistics of the raster pixels covered by the polygons of a vector layer.
//!
//! Overlapping polygons are handled by rasterizing groups of disjoint polygons one after the other,
//! so every polygon gets the statistics of all the pixels it covers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::{
    BoundingBox, Error, RasterDataType, Result,
    align::{self, AlignOptions, BoundingBoxMode},
    blocks::{BlockLayout, LARGEST_BLOCK},
    create::{self, NewRasterOptions},
    disjoint,
    io::{BurnShape, GeoBackend, RasterPathBand},
    metadata, nodata,
    runtimeconfiguration::default_creation_options,
    scratch::ScratchSpace,
    vector::FieldValue,
    warp::ResampleMethod,
};

/// Aggregated pixel values of a single zone.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ZonalStats {
    /// `None` when the zone covers no (valid) pixels
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum: f64,
    pub count: u64,
    /// Number of nodata pixels in the zone, also counted when nodata is included in the statistics
    pub nodata_count: u64,
}

impl ZonalStats {
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }

        Some(self.sum / self.count as f64)
    }

    fn add(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug, Clone)]
pub struct ZonalOptions {
    /// Name of the zone layer, the first layer is used when not provided
    pub layer: Option<String>,
    /// Exclude the nodata pixels from min, max, sum and count
    pub ignore_nodata: bool,
    /// Include every pixel touched by a polygon instead of only the pixels whose center is covered
    pub all_touched: bool,
    /// Rasterize groups of disjoint polygons so overlapping polygons share pixels
    pub polygons_might_overlap: bool,
    pub largest_block: usize,
}

impl Default for ZonalOptions {
    fn default() -> Self {
        ZonalOptions {
            layer: None,
            ignore_nodata: true,
            all_touched: false,
            polygons_might_overlap: true,
            largest_block: LARGEST_BLOCK,
        }
    }
}

/// Calculates the statistics of the raster band for every distinct value of the zone field.
///
/// The result contains every zone value of the layer, also the zones that do not cover any pixel.
pub fn zonal_statistics(
    backend: &dyn GeoBackend,
    raster: &RasterPathBand,
    vector: &Path,
    zone_field: &str,
    options: &ZonalOptions,
) -> Result<BTreeMap<FieldValue, ZonalStats>> {
    let dataset = backend.open_vector(vector)?;
    let layer = dataset.layer_or_first(options.layer.as_deref())?;
    if layer.field_definition(zone_field).is_none() {
        return Err(Error::InvalidArgument(format!(
            "Vector {} must have a field named {zone_field}",
            vector.to_string_lossy()
        )));
    }

    // dense zone ids starting at 0
    let zone_values: BTreeSet<FieldValue> = layer.features.iter().filter_map(|f| f.field(zone_field).cloned()).collect();
    let zone_values: Vec<FieldValue> = zone_values.into_iter().collect();
    let zone_ids: BTreeMap<&FieldValue, usize> = zone_values.iter().enumerate().map(|(id, value)| (value, id)).collect();
    let used_ids: Vec<i64> = (0..zone_values.len() as i64).collect();
    let zone_nodata = nodata::find_int_not_in_sorted(&used_ids)
        .ok_or_else(|| Error::Runtime(format!("No nodata value available for {} zones", zone_values.len())))?;

    let mut zone_stats = vec![ZonalStats::default(); zone_values.len()];
    let into_result = |stats: Vec<ZonalStats>| zone_values.iter().cloned().zip(stats).collect::<BTreeMap<_, _>>();

    let without_zone = layer.features.iter().filter(|f| f.field(zone_field).is_none()).count();
    if without_zone > 0 {
        log::warn!("{without_zone} features without a value for field '{zone_field}' are ignored");
    }

    let raster_info = metadata::raster_info(backend, &raster.path)?;
    if raster.band == 0 || raster.band > raster_info.band_count {
        return Err(Error::InvalidBands(vec![(raster.path.clone(), raster.band)]));
    }

    let raster_nodata = raster_info.band_nodata(raster.band);
    let clip_box = layer
        .extent()
        .map(|extent| extent.intersection(&raster_info.bounding_box))
        .filter(BoundingBox::is_valid);

    let Some(clip_box) = clip_box else {
        log::warn!(
            "The bounding boxes of {} and {} do not intersect, no zonal statistics calculated",
            raster.path.to_string_lossy(),
            vector.to_string_lossy()
        );
        return Ok(into_result(zone_stats));
    };

    let mut scratch = ScratchSpace::new(backend, "zonal_statistics")?;
    let clipped_path = scratch.raster_path("clipped.tif");
    let zone_raster_path = scratch.raster_path("zone_ids.tif");

    align::align_and_resize_raster_stack(
        backend,
        &[&raster.path],
        &[&clipped_path],
        &[ResampleMethod::Nearest],
        raster_info.pixel_size,
        &BoundingBoxMode::Explicit(clip_box),
        &AlignOptions {
            anchor_index: Some(0),
            worker_count: Some(1),
            largest_block: options.largest_block,
            ..Default::default()
        },
    )?;

    create::new_raster_from_base(
        backend,
        &clipped_path,
        &zone_raster_path,
        RasterDataType::Int32,
        &[Some(zone_nodata as f64)],
        &NewRasterOptions {
            creation_options: default_creation_options(),
            ..Default::default()
        },
    )?;

    let groups = if options.polygons_might_overlap {
        disjoint::disjoint_polygon_sets(&layer.features)
    } else {
        vec![layer.features.iter().map(|f| f.fid).collect()]
    };

    let clipped = backend.open_raster(&clipped_path)?;
    for group in &groups {
        let shapes: Vec<BurnShape> = layer
            .features
            .iter()
            .filter(|f| group.contains(&f.fid))
            .filter_map(|f| {
                let id = f.field(zone_field).and_then(|v| zone_ids.get(v))?;
                Some(BurnShape {
                    geometry: f.geometry.clone()?,
                    value: *id as f64,
                })
            })
            .collect();

        backend.open_raster_for_update(&zone_raster_path)?.fill(1, zone_nodata as f64)?;
        backend.rasterize(&zone_raster_path, 1, &shapes, options.all_touched)?;

        let zone_raster = backend.open_raster(&zone_raster_path)?;
        let layout = BlockLayout::for_dataset(zone_raster.as_ref(), 1, options.largest_block)?;
        for window in layout.windows() {
            let zones = zone_raster.read_window(1, window)?;
            let values = clipped.read_window(raster.band, window)?;

            for (&zone, &value) in zones.iter().zip(values.iter()) {
                if zone == zone_nodata as f64 {
                    continue;
                }

                let Some(stats) = zone_stats.get_mut(zone as usize).filter(|_| zone >= 0.0) else {
                    continue;
                };

                let is_nodata = nodata::is_nodata(value, raster_nodata);
                if is_nodata {
                    stats.nodata_count += 1;
                }

                if !(is_nodata && options.ignore_nodata) {
                    stats.add(value);
                }
            }
        }
    }

    Ok(into_result(zone_stats))
}
