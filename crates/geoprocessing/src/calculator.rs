//! Block wise application of a local operation on a stack of aligned rasters.
//!
//! The blocks are computed on the calling thread, a writer thread stores the results in the target
//! raster while a statistics thread accumulates the first statistics pass.
//! The second statistics pass reads the written output again once all blocks are stored.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use inf::progressinfo::{LogProgress, ProgressNotification};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};

use crate::{
    BlockWindow, Error, RasterDataType, RasterSize, Result,
    blocks::{BlockLayout, LARGEST_BLOCK},
    io::{CreationOptions, GeoBackend, RasterCreateOptions, RasterDataset, RasterPathBand, same_projection},
    pipeline::{self, DEFAULT_JOIN_TIMEOUT, DEFAULT_QUEUE_SIZE},
    runtimeconfiguration::{RuntimeConfiguration, default_creation_options},
    statistics::{self, RasterStatistics, StatsAccumulator},
};

/// An input of the raster calculator.
#[derive(Debug, Clone, PartialEq)]
pub enum CalcInput {
    /// A raster band that is streamed block by block
    Raster(RasterPathBand),
    /// An in memory array, tiled or broadcast to the shape of every block.
    /// Dimensions of size 1 are broadcast.
    Array(Array2<f64>),
    /// A value passed unchanged to every invocation of the operation
    Value(f64),
}

impl CalcInput {
    pub fn raster(path: impl Into<PathBuf>, band: usize) -> Self {
        CalcInput::Raster(RasterPathBand::new(path, band))
    }

    pub fn array(values: Array2<f64>) -> Self {
        CalcInput::Array(values)
    }

    /// A single row that is broadcast over all the rows of the output
    pub fn row(values: Array1<f64>) -> Self {
        CalcInput::Array(values.insert_axis(Axis(0)))
    }

    /// A single column that is broadcast over all the columns of the output
    pub fn column(values: Array1<f64>) -> Self {
        CalcInput::Array(values.insert_axis(Axis(1)))
    }

    pub fn value(value: f64) -> Self {
        CalcInput::Value(value)
    }
}

impl From<RasterPathBand> for CalcInput {
    fn from(value: RasterPathBand) -> Self {
        CalcInput::Raster(value)
    }
}

/// Argument passed to the operation, in the same order as the inputs.
#[derive(Debug, Clone)]
pub enum OpArg<'a> {
    Block(ArrayView2<'a, f64>),
    Value(f64),
}

impl<'a> OpArg<'a> {
    /// The block data, fails for value arguments
    pub fn block(&self) -> Result<ArrayView2<'a, f64>> {
        match self {
            OpArg::Block(view) => Ok(view.clone()),
            OpArg::Value(v) => Err(Error::InvalidArgument(format!("Expected a block argument, got value {v}"))),
        }
    }

    /// The value, fails for block arguments
    pub fn value(&self) -> Result<f64> {
        match self {
            OpArg::Value(v) => Ok(*v),
            OpArg::Block(_) => Err(Error::InvalidArgument("Expected a value argument, got a block".to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalculatorOptions {
    pub creation_options: CreationOptions,
    /// Calculate the statistics of the output and store them in the raster metadata
    pub calc_raster_stats: bool,
    pub largest_block: usize,
    /// Number of blocks that can be queued for the writer and statistics threads
    pub queue_size: usize,
    pub join_timeout: Duration,
}

impl Default for CalculatorOptions {
    fn default() -> Self {
        CalculatorOptions {
            creation_options: default_creation_options(),
            calc_raster_stats: true,
            largest_block: LARGEST_BLOCK,
            queue_size: DEFAULT_QUEUE_SIZE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl From<&RuntimeConfiguration> for CalculatorOptions {
    fn from(config: &RuntimeConfiguration) -> Self {
        CalculatorOptions {
            creation_options: config.creation_options.clone(),
            calc_raster_stats: true,
            largest_block: config.largest_block,
            queue_size: config.queue_size,
            join_timeout: config.join_timeout,
        }
    }
}

/// Where the data of an input comes from during the block iteration.
enum BlockSource<'a> {
    /// Index in the list of opened rasters
    Raster(usize),
    /// The array broadcast to the full output shape
    Array(ArrayView2<'a, f64>),
    Value(f64),
}

fn raster_inputs(inputs: &[CalcInput]) -> Vec<&RasterPathBand> {
    inputs
        .iter()
        .filter_map(|input| match input {
            CalcInput::Raster(rb) => Some(rb),
            _ => None,
        })
        .collect()
}

/// Output shape (rows, cols) of the arrays, broadcasting dimensions of size 1.
/// When a raster shape is provided all arrays need to be broadcastable to it.
fn broadcast_shape(raster_shape: Option<(usize, usize)>, arrays: &[&Array2<f64>]) -> Result<(usize, usize)> {
    let shape = raster_shape.unwrap_or_else(|| {
        arrays
            .iter()
            .fold((1, 1), |acc, a| (acc.0.max(a.nrows()), acc.1.max(a.ncols())))
    });

    let fits = |len: usize, target: usize| len == 1 || len == target;
    let incompatible: Vec<String> = arrays
        .iter()
        .filter(|a| !fits(a.nrows(), shape.0) || !fits(a.ncols(), shape.1))
        .map(|a| format!("{:?}", a.dim()))
        .collect();

    if !incompatible.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "Arrays with shapes {} can not be broadcast to shape {shape:?}",
            incompatible.join(", ")
        )));
    }

    Ok(shape)
}

/// Validates the raster inputs and opens them, all problems of a kind are reported together.
fn open_raster_inputs(backend: &dyn GeoBackend, inputs: &[&RasterPathBand], target: &Path) -> Result<Vec<Box<dyn RasterDataset>>> {
    let missing: Vec<PathBuf> = inputs
        .iter()
        .filter(|rb| !backend.exists(&rb.path))
        .map(|rb| rb.path.clone())
        .unique()
        .collect();
    if !missing.is_empty() {
        return Err(Error::MissingFiles(missing));
    }

    if inputs.iter().any(|rb| rb.path == target) {
        return Err(Error::InvalidArgument(format!(
            "{} is used as a target path, but it is also in the base input path list {}",
            target.to_string_lossy(),
            inputs.iter().map(|rb| rb.path.to_string_lossy()).join(", ")
        )));
    }

    let datasets = inputs
        .iter()
        .map(|rb| backend.open_raster(&rb.path))
        .collect::<Result<Vec<_>>>()?;

    let invalid_bands: Vec<(PathBuf, usize)> = inputs
        .iter()
        .zip(&datasets)
        .filter(|(rb, ds)| rb.band == 0 || rb.band > ds.band_count())
        .map(|(rb, _)| (rb.path.clone(), rb.band))
        .collect();
    if !invalid_bands.is_empty() {
        return Err(Error::InvalidBands(invalid_bands));
    }

    let sizes: BTreeSet<RasterSize> = datasets.iter().map(|ds| ds.raster_size()).collect();
    if sizes.len() > 1 {
        return Err(Error::SizeMismatch(sizes.into_iter().collect()));
    }

    if let Some(first) = datasets.first() {
        let (gt, projection) = (first.geotransform(), first.projection());
        let misaligned: Vec<String> = datasets
            .iter()
            .filter(|ds| ds.geotransform() != gt || !same_projection(&ds.projection(), &projection))
            .map(|ds| format!("{} ({:?})", ds.path().to_string_lossy(), ds.geotransform()))
            .collect();

        if !misaligned.is_empty() {
            return Err(Error::NotAligned(format!(
                "{} differ from {} ({gt:?})",
                misaligned.join(", "),
                first.path().to_string_lossy()
            )));
        }
    }

    Ok(datasets)
}

struct Block {
    window: BlockWindow,
    data: Arc<Array2<f64>>,
}

fn spawn_writer(mut dataset: Box<dyn RasterDataset>, rx: Receiver<Block>) -> Result<pipeline::Worker<Box<dyn RasterDataset>>> {
    pipeline::spawn_worker("raster_calculator_writer", move || {
        for block in rx {
            dataset.write_window(1, block.window.xoff, block.window.yoff, block.data.view())?;
        }

        dataset.flush()?;
        Ok(dataset)
    })
}

fn spawn_stats(rx: Receiver<Arc<Array2<f64>>>, nodata: Option<f64>) -> Result<pipeline::Worker<StatsAccumulator>> {
    pipeline::spawn_worker("raster_calculator_stats", move || {
        let mut acc = StatsAccumulator::default();
        for block in rx {
            acc.add_block(block.view(), nodata);
        }

        Ok(acc)
    })
}

/// Applies `op` on the stack of inputs and stores the result in a new single band raster.
///
/// `op` receives one argument per input in the order of the inputs and has to return a block with
/// the shape of the current block. The output has the size and georeference of the raster inputs,
/// or the broadcast shape of the arrays when there are no raster inputs.
///
/// Returns the statistics of the output, `None` when they were not requested or when the
/// output only contains nodata.
pub fn raster_calculator<F>(
    backend: &dyn GeoBackend,
    inputs: &[CalcInput],
    mut op: F,
    target: &Path,
    target_type: RasterDataType,
    target_nodata: Option<f64>,
    options: &CalculatorOptions,
) -> Result<Option<RasterStatistics>>
where
    F: FnMut(&[OpArg]) -> Result<Array2<f64>>,
{
    if inputs.is_empty() {
        return Err(Error::InvalidArgument("No inputs provided to the raster calculator".to_string()));
    }

    if inputs.iter().all(|input| matches!(input, CalcInput::Value(_))) {
        return Err(Error::InvalidArgument(
            "Only raw values were provided, at least one raster or array input is required to determine the output size".to_string(),
        ));
    }

    let target_nodata = target_type.checked_nodata(target_nodata)?;
    let datasets = open_raster_inputs(backend, &raster_inputs(inputs), target)?;

    let arrays: Vec<&Array2<f64>> = inputs
        .iter()
        .filter_map(|input| match input {
            CalcInput::Array(a) => Some(a),
            _ => None,
        })
        .collect();
    let shape = broadcast_shape(datasets.first().map(|ds| ds.raster_size().shape()), &arrays)?;

    let mut sources = Vec::with_capacity(inputs.len());
    let mut raster_index = 0;
    for input in inputs {
        sources.push(match input {
            CalcInput::Raster(_) => {
                raster_index += 1;
                BlockSource::Raster(raster_index - 1)
            }
            CalcInput::Array(a) => BlockSource::Array(
                a.broadcast(shape)
                    .ok_or_else(|| Error::InvalidArgument(format!("Array of shape {:?} can not be broadcast", a.dim())))?,
            ),
            CalcInput::Value(v) => BlockSource::Value(*v),
        });
    }
    let bands: Vec<usize> = raster_inputs(inputs).iter().map(|rb| rb.band).collect();

    let create_options = RasterCreateOptions {
        size: RasterSize::from(shape),
        band_count: 1,
        data_type: target_type,
        geotransform: datasets.first().map(|ds| ds.geotransform()).unwrap_or_default(),
        projection: datasets.first().map(|ds| ds.projection()).unwrap_or_default(),
        nodata: vec![target_nodata],
        creation_options: options.creation_options.clone(),
    };
    let target_ds = backend.create_raster(target, &create_options)?;
    let layout = BlockLayout::for_dataset(target_ds.as_ref(), 1, options.largest_block)?;

    let (write_tx, write_rx) = mpsc::sync_channel::<Block>(options.queue_size.max(1));
    let writer = spawn_writer(target_ds, write_rx)?;

    let (stats_tx, stats) = if options.calc_raster_stats {
        let (tx, rx) = mpsc::sync_channel::<Arc<Array2<f64>>>(options.queue_size.max(1));
        (Some(tx), Some(spawn_stats(rx, target_nodata)?))
    } else {
        (None, None)
    };

    let progress = LogProgress::new("raster stack calculation");
    progress.reset(layout.block_count() as u64);

    let mut produce = || -> Result<()> {
        for window in layout.windows() {
            let raster_blocks = datasets
                .iter()
                .zip(&bands)
                .map(|(ds, &band)| ds.read_window(band, window))
                .collect::<Result<Vec<_>>>()?;

            let args: Vec<OpArg> = sources
                .iter()
                .map(|source| match source {
                    BlockSource::Raster(index) => OpArg::Block(raster_blocks[*index].view()),
                    BlockSource::Array(view) => OpArg::Block(view.slice(s![window.row_range(), window.col_range()])),
                    BlockSource::Value(v) => OpArg::Value(*v),
                })
                .collect();

            let mut result = op(&args)?;
            if result.dim() != window.shape() {
                return Err(Error::ShapeMismatch {
                    expected: window.shape(),
                    actual: result.dim(),
                });
            }

            // statistics reflect the values as stored in the raster
            result.mapv_inplace(|v| target_type.coerce(v));
            let data = Arc::new(result);

            if let Some(tx) = &stats_tx {
                if tx.send(data.clone()).is_err() {
                    // the statistics worker stopped, its join reports the cause
                    return Ok(());
                }
            }

            if write_tx.send(Block { window, data }).is_err() {
                return Ok(());
            }

            progress.tick()?;
        }

        Ok(())
    };

    let produced = produce();

    // closing the channels ends the workers
    drop(write_tx);
    drop(stats_tx);
    drop(datasets);

    let written = writer.join(options.join_timeout);
    let first_pass = stats.map(|worker| worker.join(options.join_timeout)).transpose();

    produced?;
    let mut target_ds = written?;
    let Some(first_pass) = first_pass? else {
        return Ok(None);
    };

    let result = statistics::finish_band_statistics(target_ds.as_ref(), 1, &layout, &first_pass)?;
    match &result {
        Some(stats) => {
            target_ds.set_statistics(1, stats.band_statistics())?;
            target_ds.flush()?;
        }
        None => log::warn!(
            "Stats not calculated for {} since no non-nodata pixels were found",
            target.to_string_lossy()
        ),
    }

    Ok(result)
}
