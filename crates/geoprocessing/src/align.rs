//! Resampling of a stack of rasters onto a common pixel grid.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use inf::progressinfo::{LogProgress, ProgressNotification};
use rayon::prelude::*;

use crate::{
    BoundingBox, Error, Result,
    blocks::LARGEST_BLOCK,
    boundingbox::{self, DEFAULT_EDGE_SAMPLES, MergeMode},
    io::{CreationOptions, GeoBackend, same_projection},
    metadata::{self, RasterInfo},
    priority,
    runtimeconfiguration::{RuntimeConfiguration, default_creation_options},
    warp::{self, ResampleMethod, WarpOptions},
};

/// How the bounding box of the aligned rasters is determined.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BoundingBoxMode {
    /// Union of the boxes of all the rasters and vectors
    Union,
    /// Intersection of the boxes of all the rasters and vectors
    Intersection,
    /// A user provided box, the vectors are ignored
    Explicit(BoundingBox),
}

impl FromStr for BoundingBoxMode {
    type Err = Error;

    /// Parses "union", "intersection" or "bb=[minx,miny,maxx,maxy]"
    fn from_str(s: &str) -> Result<Self> {
        let mode = s.trim();
        match mode {
            "union" => return Ok(BoundingBoxMode::Union),
            "intersection" => return Ok(BoundingBoxMode::Intersection),
            _ => {}
        }

        let unknown_mode = || Error::InvalidArgument(format!("Unknown bounding box mode {mode}"));
        let coordinates = mode
            .strip_prefix("bb=[")
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(unknown_mode)?;

        let values = coordinates
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| unknown_mode())?;

        let bbox: [f64; 4] = values.try_into().map_err(|_| unknown_mode())?;
        Ok(BoundingBoxMode::Explicit(BoundingBox::from_array(bbox)))
    }
}

impl fmt::Display for BoundingBoxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundingBoxMode::Union => write!(f, "union"),
            BoundingBoxMode::Intersection => write!(f, "intersection"),
            BoundingBoxMode::Explicit(bb) => write!(f, "bb=[{},{},{},{}]", bb.min_x, bb.min_y, bb.max_x, bb.max_y),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlignOptions {
    /// Vectors whose bounding boxes also contribute to a union or intersection
    pub base_vectors: Vec<PathBuf>,
    /// Index of the raster whose pixel edges the output grid snaps to
    pub anchor_index: Option<usize>,
    /// Projection of the aligned rasters, defaults to the projection of every base raster
    pub target_projection: Option<String>,
    pub creation_options: CreationOptions,
    pub largest_block: usize,
    /// Number of parallel warps, defaults to half of the available cores
    pub worker_count: Option<usize>,
    /// Lower the scheduling priority of the warp workers
    pub lower_priority: bool,
}

impl Default for AlignOptions {
    fn default() -> Self {
        AlignOptions {
            base_vectors: Vec::new(),
            anchor_index: None,
            target_projection: None,
            creation_options: default_creation_options(),
            largest_block: LARGEST_BLOCK,
            worker_count: None,
            lower_priority: true,
        }
    }
}

impl From<&RuntimeConfiguration> for AlignOptions {
    fn from(config: &RuntimeConfiguration) -> Self {
        AlignOptions {
            creation_options: config.creation_options.clone(),
            largest_block: config.largest_block,
            worker_count: config.worker_count,
            ..Default::default()
        }
    }
}

/// Bounding box in the target projection, reprojected when the projections differ.
fn projected_bounding_box(
    backend: &dyn GeoBackend,
    bbox: BoundingBox,
    projection: &str,
    target_projection: Option<&str>,
) -> Result<BoundingBox> {
    match target_projection {
        Some(target) if !same_projection(projection, target) => {
            let transform = backend.coordinate_transformer(projection, target)?;
            boundingbox::transform_bounding_box(&bbox, transform.as_ref(), DEFAULT_EDGE_SAMPLES)
        }
        _ => Ok(bbox),
    }
}

const SNAP_TOLERANCE: f64 = 1e-9;

/// Moves the corners of the box onto pixel corners of the anchor grid.
/// The lower left offset to the anchor origin is truncated to a whole number of anchor pixels,
/// the upper right corner is extended outwards to the next anchor pixel edge.
pub fn snap_to_anchor(bbox: &BoundingBox, anchor_bbox: &BoundingBox, anchor_pixel_size: (f64, f64)) -> BoundingBox {
    let (pixel_width, pixel_height) = (anchor_pixel_size.0.abs(), anchor_pixel_size.1.abs());
    let snap = |value: f64, origin: f64, pixel_size: f64, round: fn(f64) -> f64| {
        let pixels = (value - origin) / pixel_size;
        // offsets that are already on the grid must not move because of floating point noise
        let pixels = if (pixels - pixels.round()).abs() < SNAP_TOLERANCE {
            pixels.round()
        } else {
            round(pixels)
        };

        pixels * pixel_size + origin
    };

    BoundingBox::new(
        snap(bbox.min_x, anchor_bbox.min_x, pixel_width, f64::trunc),
        snap(bbox.min_y, anchor_bbox.min_y, pixel_height, f64::trunc),
        snap(bbox.max_x, anchor_bbox.min_x, pixel_width, f64::ceil),
        snap(bbox.max_y, anchor_bbox.min_y, pixel_height, f64::ceil),
    )
}

fn validate_inputs(raster_count: usize, target_count: usize, method_count: usize, anchor_index: Option<usize>) -> Result<()> {
    if raster_count != target_count || raster_count != method_count {
        return Err(Error::InvalidArgument(format!(
            "base rasters, target rasters and resample methods must have the same length, current lengths are [{raster_count}, {target_count}, {method_count}]"
        )));
    }

    if raster_count == 0 {
        return Err(Error::InvalidArgument("No rasters provided to align".to_string()));
    }

    if let Some(index) = anchor_index {
        if index >= raster_count {
            return Err(Error::InvalidArgument(format!(
                "Alignment index is out of bounds of the datasets index: {index} n_elements {raster_count}"
            )));
        }
    }

    Ok(())
}

fn target_bounding_box(
    backend: &dyn GeoBackend,
    raster_infos: &[RasterInfo],
    mode: &BoundingBoxMode,
    options: &AlignOptions,
) -> Result<BoundingBox> {
    let target_projection = options.target_projection.as_deref();

    let raster_boxes = raster_infos
        .iter()
        .map(|info| projected_bounding_box(backend, info.bounding_box, &info.projection, target_projection))
        .collect::<Result<Vec<_>>>()?;

    let mut bbox = match mode {
        BoundingBoxMode::Explicit(bbox) => *bbox,
        BoundingBoxMode::Union | BoundingBoxMode::Intersection => {
            let mut boxes = raster_boxes.clone();
            for vector in &options.base_vectors {
                let info = metadata::vector_info(backend, vector, None)?;
                boxes.push(projected_bounding_box(backend, info.bounding_box, &info.projection, target_projection)?);
            }

            let merge = if *mode == BoundingBoxMode::Union {
                MergeMode::Union
            } else {
                MergeMode::Intersection
            };

            BoundingBox::merge_all(&boxes, merge).ok_or_else(|| Error::InvalidArgument("No bounding boxes to merge".to_string()))?
        }
    };

    if !bbox.is_valid() {
        return Err(Error::EmptyIntersection(bbox));
    }

    if let Some(index) = options.anchor_index {
        bbox = snap_to_anchor(&bbox, &raster_boxes[index], raster_infos[index].pixel_size);
    }

    Ok(bbox)
}

/// The bounding box that `align_and_resize_raster_stack` uses for the given inputs.
pub fn aligned_bounding_box<P: AsRef<Path>>(
    backend: &dyn GeoBackend,
    base_rasters: &[P],
    mode: &BoundingBoxMode,
    options: &AlignOptions,
) -> Result<BoundingBox> {
    validate_inputs(base_rasters.len(), base_rasters.len(), base_rasters.len(), options.anchor_index)?;

    let infos = base_rasters
        .iter()
        .map(|path| metadata::raster_info(backend, path.as_ref()))
        .collect::<Result<Vec<_>>>()?;

    target_bounding_box(backend, &infos, mode, options)
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) / 2
}

fn create_thread_pool(worker_count: usize, lower_priority: bool) -> Result<rayon::ThreadPool> {
    let mut pool_builder = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count)
        .thread_name(|index| format!("align_worker_{index}"));

    if lower_priority {
        pool_builder = pool_builder.start_handler(|_| {
            priority::lower_thread_priority();
        });
    }

    pool_builder
        .build()
        .map_err(|e| Error::Runtime(format!("Failed to create threadpool: {e}")))
}

/// Resamples the rasters so they share the same bounding box, pixel size and projection.
///
/// The warps run in parallel on a pool of workers, the first failing warp aborts the remaining warps.
pub fn align_and_resize_raster_stack<P: AsRef<Path> + Sync, Q: AsRef<Path> + Sync>(
    backend: &dyn GeoBackend,
    base_rasters: &[P],
    target_rasters: &[Q],
    resample_methods: &[ResampleMethod],
    target_pixel_size: (f64, f64),
    mode: &BoundingBoxMode,
    options: &AlignOptions,
) -> Result<()> {
    validate_inputs(
        base_rasters.len(),
        target_rasters.len(),
        resample_methods.len(),
        options.anchor_index,
    )?;

    let infos = base_rasters
        .iter()
        .map(|path| metadata::raster_info(backend, path.as_ref()))
        .collect::<Result<Vec<_>>>()?;

    let bbox = target_bounding_box(backend, &infos, mode, options)?;
    log::debug!("Aligning {} rasters to {bbox} ({mode})", base_rasters.len());

    let warp_options = WarpOptions {
        target_bounding_box: Some(bbox),
        target_projection: options.target_projection.clone(),
        creation_options: options.creation_options.clone(),
        largest_block: options.largest_block,
    };

    let progress = LogProgress::new("align raster stack");
    progress.reset(base_rasters.len() as u64);

    let align_raster = |index: usize| -> Result<()> {
        warp::warp_raster(
            backend,
            base_rasters[index].as_ref(),
            target_pixel_size,
            target_rasters[index].as_ref(),
            resample_methods[index],
            &warp_options,
        )?;

        progress.tick()?;
        Ok(())
    };

    let worker_count = options
        .worker_count
        .unwrap_or_else(default_worker_count)
        .clamp(1, base_rasters.len());

    if worker_count > 1 {
        match create_thread_pool(worker_count, options.lower_priority) {
            Ok(pool) => return pool.install(|| (0..base_rasters.len()).into_par_iter().try_for_each(&align_raster)),
            Err(e) => log::warn!("{e}, aligning the rasters sequentially"),
        }
    }

    (0..base_rasters.len()).try_for_each(align_raster)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    use super::*;
    use crate::{
        GeoTransform, RasterDataType, RasterSize,
        io::{CoordinateTransform, MemoryBackend, RasterCreateOptions, RasterDataset as _},
        testutils,
        vector::{VectorDataset, VectorLayer},
    };

    fn add_raster_with_geotransform(backend: &MemoryBackend, path: &str, data: &Array2<f64>, gt: [f64; 6]) -> Result<()> {
        let options = RasterCreateOptions {
            size: RasterSize::from(data.dim()),
            band_count: 1,
            data_type: RasterDataType::Float64,
            geotransform: GeoTransform::new(gt),
            projection: testutils::PROJECTION.to_string(),
            nodata: vec![Some(testutils::NOD)],
            creation_options: Vec::new(),
        };
        backend.insert_raster(path, &options, std::slice::from_ref(data))
    }

    #[test]
    fn parse_bounding_box_mode() -> Result<()> {
        assert_eq!("union".parse::<BoundingBoxMode>()?, BoundingBoxMode::Union);
        assert_eq!("intersection".parse::<BoundingBoxMode>()?, BoundingBoxMode::Intersection);
        assert_eq!(
            "bb=[-1.5,2,3e2, 4.25]".parse::<BoundingBoxMode>()?,
            BoundingBoxMode::Explicit(BoundingBox::new(-1.5, 2.0, 300.0, 4.25))
        );
        assert_eq!(BoundingBoxMode::Explicit(BoundingBox::new(0.0, 1.0, 2.0, 3.0)).to_string(), "bb=[0,1,2,3]");

        for invalid in ["onion", "bb=[1,2,3]", "bb=[1,2,3,x]", "bb=1,2,3,4"] {
            assert!(invalid.parse::<BoundingBoxMode>().is_err(), "{invalid}");
        }
        Ok(())
    }

    #[test]
    fn snap_to_anchor_pixel_edges() {
        let anchor = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let snapped = snap_to_anchor(&BoundingBox::new(2.7, 3.2, 8.0, 9.0), &anchor, (2.0, -2.0));
        assert_eq!(snapped, BoundingBox::new(2.0, 2.0, 8.0, 10.0));

        // corners that are already on the grid stay in place
        let snapped = snap_to_anchor(&BoundingBox::new(0.1 + 0.2 - 0.3, 4.0, 6.000000000001, 8.0), &anchor, (2.0, -2.0));
        assert_eq!(snapped, BoundingBox::new(0.0, 4.0, 6.0, 8.0));

        // truncation goes towards the anchor origin for boxes left of the anchor
        let snapped = snap_to_anchor(&BoundingBox::new(-2.7, 0.0, 8.0, 9.0), &anchor, (2.0, -2.0));
        assert_eq!(snapped.min_x, -2.0);
    }

    #[test]
    fn input_validation() -> Result<()> {
        let backend = testutils::memory_backend();
        testutils::add_raster(&backend, "a.tif", &Array2::zeros((2, 2)), None)?;

        let result = align_and_resize_raster_stack(
            &backend,
            &["a.tif"],
            &["a_out.tif", "b_out.tif"],
            &[ResampleMethod::Nearest],
            (1.0, -1.0),
            &BoundingBoxMode::Union,
            &AlignOptions::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = align_and_resize_raster_stack(
            &backend,
            &["a.tif"],
            &["a_out.tif"],
            &[ResampleMethod::Nearest],
            (1.0, -1.0),
            &BoundingBoxMode::Union,
            &AlignOptions {
                anchor_index: Some(1),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(!backend.exists(Path::new("a_out.tif")));
        Ok(())
    }

    #[test]
    fn intersection_of_disjoint_rasters() -> Result<()> {
        let backend = testutils::memory_backend();
        let data = Array2::from_elem((2, 2), 1.0);
        add_raster_with_geotransform(&backend, "a.tif", &data, [0.0, 1.0, 0.0, 2.0, 0.0, -1.0])?;
        add_raster_with_geotransform(&backend, "b.tif", &data, [10.0, 1.0, 0.0, 12.0, 0.0, -1.0])?;

        let rasters = ["a.tif", "b.tif"];
        let result = aligned_bounding_box(&backend, &rasters, &BoundingBoxMode::Intersection, &AlignOptions::default());
        assert!(matches!(result, Err(Error::EmptyIntersection(_))));

        let union = aligned_bounding_box(&backend, &rasters, &BoundingBoxMode::Union, &AlignOptions::default())?;
        assert_eq!(union, BoundingBox::new(0.0, 0.0, 12.0, 12.0));

        let explicit = BoundingBoxMode::Explicit(BoundingBox::new(5.0, 0.0, 4.0, 1.0));
        let result = aligned_bounding_box(&backend, &rasters, &explicit, &AlignOptions::default());
        assert!(matches!(result, Err(Error::EmptyIntersection(_))));
        Ok(())
    }

    #[test]
    fn vectors_contribute_to_the_bounding_box() -> Result<()> {
        let backend = testutils::memory_backend();
        testutils::add_raster(&backend, "a.tif", &Array2::zeros((4, 4)), None)?;

        let mut layer = VectorLayer::new("zones", testutils::PROJECTION);
        layer.features.push(testutils::square_feature(1, (1.0, 1.0), 10.0));
        backend.insert_vector("zones.gpkg", VectorDataset::with_layer(layer))?;

        let options = AlignOptions {
            base_vectors: vec![PathBuf::from("zones.gpkg")],
            ..Default::default()
        };

        let bbox = aligned_bounding_box(&backend, &["a.tif"], &BoundingBoxMode::Intersection, &options)?;
        assert_eq!(bbox, BoundingBox::new(1.0, 1.0, 4.0, 4.0));

        // vectors are ignored for an explicit box
        let explicit = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let bbox = aligned_bounding_box(&backend, &["a.tif"], &BoundingBoxMode::Explicit(explicit), &options)?;
        assert_eq!(bbox, explicit);
        Ok(())
    }

    struct Shift(f64);

    impl CoordinateTransform for Shift {
        fn transform_point(&self, x: f64, y: f64) -> Result<(f64, f64)> {
            Ok((x + self.0, y + self.0))
        }
    }

    #[test]
    fn boxes_are_reprojected_to_the_target_projection() -> Result<()> {
        let backend = testutils::memory_backend();
        testutils::add_raster(&backend, "a.tif", &Array2::zeros((4, 4)), None)?;
        backend.register_transform(testutils::PROJECTION, "EPSG:3035", Shift(100.0))?;

        let options = AlignOptions {
            target_projection: Some("EPSG:3035".to_string()),
            ..Default::default()
        };

        let bbox = aligned_bounding_box(&backend, &["a.tif"], &BoundingBoxMode::Union, &options)?;
        assert_relative_eq!(bbox.min_x, 100.0);
        assert_relative_eq!(bbox.max_y, 104.0);
        Ok(())
    }

    #[test_log::test]
    fn anchor_aligns_output_grid() -> Result<()> {
        let backend = testutils::memory_backend();
        let data = Array2::from_elem((4, 4), 1.0);
        add_raster_with_geotransform(&backend, "anchor.tif", &data, [0.0, 1.0, 0.0, 4.0, 0.0, -1.0])?;
        add_raster_with_geotransform(&backend, "shifted.tif", &data, [0.3, 1.0, 0.0, 4.3, 0.0, -1.0])?;

        align_and_resize_raster_stack(
            &backend,
            &["anchor.tif", "shifted.tif"],
            &["anchor_out.tif", "shifted_out.tif"],
            &[ResampleMethod::Nearest, ResampleMethod::Nearest],
            (1.0, -1.0),
            &BoundingBoxMode::Union,
            &AlignOptions {
                anchor_index: Some(0),
                worker_count: Some(2),
                ..Default::default()
            },
        )?;

        let anchor = backend.open_raster(Path::new("anchor_out.tif"))?;
        let shifted = backend.open_raster(Path::new("shifted_out.tif"))?;
        assert_eq!(anchor.geotransform(), shifted.geotransform());
        assert_eq!(anchor.raster_size(), shifted.raster_size());

        // the lower left corner is a whole number of anchor pixels away from the anchor origin
        let bbox = aligned_bounding_box(
            &backend,
            &["anchor.tif", "shifted.tif"],
            &BoundingBoxMode::Union,
            &AlignOptions {
                anchor_index: Some(0),
                ..Default::default()
            },
        )?;
        assert_eq!(bbox, BoundingBox::new(0.0, 0.0, 5.0, 5.0));

        // north up rasters start at the top edge, which is snapped outwards onto the anchor grid
        let top_left = anchor.geotransform().top_left();
        assert_relative_eq!(top_left.x, 0.0);
        assert_relative_eq!(top_left.y, 5.0);
        assert_eq!(anchor.raster_size(), RasterSize::with_rows_cols(5, 5));
        assert_eq!(backend.read_band("anchor_out.tif", 1)?.row(0).to_vec(), vec![testutils::NOD; 5]);
        assert_eq!(backend.read_band("anchor_out.tif", 1)?.row(1).slice(ndarray::s![..4]).to_vec(), vec![1.0; 4]);

        // the statistics of the aligned rasters are calculated
        assert!(anchor.statistics(1)?.is_some());
        Ok(())
    }

    #[test]
    fn sequential_alignment_resamples() -> Result<()> {
        let backend = testutils::memory_backend();
        #[rustfmt::skip]
        let data = array![
            [1.0, 1.0, 2.0, 2.0],
            [1.0, 1.0, 2.0, 2.0],
            [3.0, 3.0, 4.0, 4.0],
            [3.0, 3.0, 4.0, 4.0],
        ];
        testutils::add_raster(&backend, "fine.tif", &data, Some(testutils::NOD))?;

        align_and_resize_raster_stack(
            &backend,
            &["fine.tif"],
            &["coarse.tif"],
            &[ResampleMethod::Max],
            (2.0, -2.0),
            &BoundingBoxMode::Intersection,
            &AlignOptions {
                worker_count: Some(1),
                ..Default::default()
            },
        )?;

        assert_eq!(backend.read_band("coarse.tif", 1)?, array![[1.0, 2.0], [3.0, 4.0]]);
        Ok(())
    }
}
