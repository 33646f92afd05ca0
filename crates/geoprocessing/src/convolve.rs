//! Overlap-add FFT convolution of a signal raster with a kernel raster.
//!
//! Both rasters are processed block by block, every (signal block, kernel block) pair is an independent
//! work item so the memory use is bounded even when the kernel does not fit in memory.
//! Workers convolve the pairs and a single writer accumulates the overlapping contributions in the target.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use inf::duration::Recorder;
use inf::progressinfo::{LogProgress, ProgressNotification, TimedCallback};
use ndarray::{Array2, Zip, s};

use crate::{
    BlockWindow, Error, RasterDataType, RasterSize, Result,
    blocks::{BlockLayout, LARGEST_BLOCK},
    create::{self, NewRasterOptions},
    fft::FftConvolver,
    io::{CreationOptions, GeoBackend, RasterDataset, RasterPathBand},
    nodata,
    pipeline::{self, DEFAULT_JOIN_TIMEOUT, DEFAULT_QUEUE_SIZE},
    runtimeconfiguration::{RuntimeConfiguration, default_creation_options},
    scratch::ScratchSpace,
};

/// Nodata value of the target when none is provided for a `Float64` target.
pub const DEFAULT_TARGET_NODATA: f64 = f32::MIN as f64;

#[derive(Debug, Clone)]
pub struct ConvolveOptions {
    /// Treat nodata signal pixels as missing and renormalize the result by the kernel coverage of the valid pixels
    pub ignore_nodata: bool,
    /// Divide the kernel by its sum before convolving
    pub normalize_kernel: bool,
    /// Pixels that are nodata in the signal are nodata in the target
    pub mask_nodata: bool,
    /// Required for targets that are not `Float64`
    pub target_nodata: Option<f64>,
    pub largest_block: usize,
    /// Number of convolution workers, defaults to the available parallelism
    pub worker_count: Option<usize>,
    pub queue_size: usize,
    pub join_timeout: Duration,
    pub creation_options: CreationOptions,
}

impl Default for ConvolveOptions {
    fn default() -> Self {
        ConvolveOptions {
            ignore_nodata: false,
            normalize_kernel: false,
            mask_nodata: true,
            target_nodata: None,
            largest_block: LARGEST_BLOCK,
            worker_count: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            creation_options: default_creation_options(),
        }
    }
}

impl From<&RuntimeConfiguration> for ConvolveOptions {
    fn from(config: &RuntimeConfiguration) -> Self {
        ConvolveOptions {
            largest_block: config.largest_block,
            worker_count: config.worker_count,
            queue_size: config.queue_size,
            join_timeout: config.join_timeout,
            creation_options: config.creation_options.clone(),
            ..Default::default()
        }
    }
}

fn target_nodata(target_type: RasterDataType, nodata: Option<f64>) -> Result<f64> {
    let nodata = match (nodata, target_type) {
        (Some(nodata), _) => nodata,
        (None, RasterDataType::Float64) => DEFAULT_TARGET_NODATA,
        (None, _) => {
            return Err(Error::InvalidArgument(format!(
                "A target nodata value is required for convolution targets of type {target_type}"
            )));
        }
    };

    target_type
        .checked_nodata(Some(nodata))?
        .ok_or_else(|| Error::InvalidArgument(format!("Invalid target nodata {nodata}")))
}

fn open_input(backend: &dyn GeoBackend, input: &RasterPathBand) -> Result<Box<dyn RasterDataset>> {
    let dataset = backend.open_raster(&input.path)?;
    if input.band == 0 || input.band > dataset.band_count() {
        return Err(Error::InvalidBands(vec![(input.path.clone(), input.band)]));
    }

    Ok(dataset)
}

/// Where the full convolution of a block pair lands in the output raster.
///
/// Returns the output window clipped to the raster and the (row, col) offset of that window in the
/// convolution result, `None` when the result lies completely outside of the raster.
fn output_placement(
    signal: BlockWindow,
    kernel: BlockWindow,
    kernel_size: RasterSize,
    raster_size: RasterSize,
) -> Option<(BlockWindow, (usize, usize))> {
    let left = signal.xoff as isize - (kernel_size.cols / 2) as isize + kernel.xoff as isize;
    let top = signal.yoff as isize - (kernel_size.rows / 2) as isize + kernel.yoff as isize;
    let right = left + (signal.win_xsize + kernel.win_xsize) as isize - 1;
    let bottom = top + (signal.win_ysize + kernel.win_ysize) as isize - 1;

    let (cols, rows) = (raster_size.cols as isize, raster_size.rows as isize);
    if right <= 0 || bottom <= 0 || left >= cols || top >= rows {
        return None;
    }

    let (x0, y0) = (left.max(0), top.max(0));
    let (x1, y1) = (right.min(cols), bottom.min(rows));
    Some((
        BlockWindow::new(x0 as usize, y0 as usize, (x1 - x0) as usize, (y1 - y0) as usize),
        ((y0 - top) as usize, (x0 - left) as usize),
    ))
}

fn zero_nodata(block: &mut Array2<f64>, nodata: Option<f64>) {
    if nodata.is_some() {
        block.mapv_inplace(|v| if nodata::is_nodata(v, nodata) { 0.0 } else { v });
    }
}

fn sum_kernel(kernel: &dyn RasterDataset, band: usize, ignore_nodata: bool, largest_block: usize) -> Result<f64> {
    let nodata = kernel.nodata(band)?;
    let mut sum = 0.0;
    for window in BlockLayout::for_dataset(kernel, band, largest_block)?.windows() {
        let mut block = kernel.read_window(band, window)?;
        if ignore_nodata {
            zero_nodata(&mut block, nodata);
        }
        sum += block.sum();
    }

    Ok(sum)
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    signal: BlockWindow,
    kernel: BlockWindow,
}

struct Tile {
    window: BlockWindow,
    result: Array2<f64>,
    coverage: Option<Array2<f64>>,
}

/// Settings shared by all the convolution workers.
#[derive(Clone, Copy)]
struct WorkerSettings {
    signal_band: usize,
    kernel_band: usize,
    signal_nodata: Option<f64>,
    kernel_nodata: Option<f64>,
    kernel_size: RasterSize,
    raster_size: RasterSize,
    ignore_nodata: bool,
    coverage: bool,
    /// Divisor applied to the kernel values
    kernel_scale: f64,
}

fn convolve_pairs(
    signal: &dyn RasterDataset,
    kernel: &dyn RasterDataset,
    settings: WorkerSettings,
    work: &Receiver<WorkItem>,
    results: &Sender<Tile>,
    failed: &AtomicBool,
) -> Result<()> {
    let mut convolver = FftConvolver::new();

    for item in work {
        if failed.load(Ordering::Relaxed) {
            break;
        }

        let Some((window, (row, col))) = output_placement(item.signal, item.kernel, settings.kernel_size, settings.raster_size) else {
            continue;
        };

        let mut signal_block = signal.read_window(settings.signal_band, item.signal)?;
        let mut kernel_block = kernel.read_window(settings.kernel_band, item.kernel)?;

        let validity = settings
            .coverage
            .then(|| signal_block.mapv(|v| if nodata::is_nodata(v, settings.signal_nodata) { 0.0 } else { 1.0 }));

        if settings.ignore_nodata {
            zero_nodata(&mut signal_block, settings.signal_nodata);
            zero_nodata(&mut kernel_block, settings.kernel_nodata);
        }

        if settings.kernel_scale != 1.0 {
            kernel_block.mapv_inplace(|v| v / settings.kernel_scale);
        }

        let signal_offset = Some((item.signal.xoff, item.signal.yoff));
        let kernel_offset = Some((item.kernel.xoff, item.kernel.yoff));
        let clip = |full: Array2<f64>| full.slice(s![row..row + window.win_ysize, col..col + window.win_xsize]).to_owned();

        let result = convolver.convolve(signal_block.view(), signal_offset, kernel_block.view(), kernel_offset)?;
        let coverage = match validity {
            Some(mask) => Some(clip(convolver.convolve(mask.view(), None, kernel_block.view(), kernel_offset)?)),
            None => None,
        };

        let tile = Tile {
            window,
            result: clip(result),
            coverage,
        };

        if results.send(tile).is_err() {
            // the writer stopped, its join reports the cause
            break;
        }
    }

    Ok(())
}

fn spawn_convolve_worker(
    index: usize,
    signal: Box<dyn RasterDataset>,
    kernel: Box<dyn RasterDataset>,
    settings: WorkerSettings,
    work: Receiver<WorkItem>,
    results: Sender<Tile>,
    failed: Arc<AtomicBool>,
) -> Result<pipeline::Worker<()>> {
    pipeline::spawn_worker(format!("convolve_worker_{index}"), move || {
        let result = convolve_pairs(signal.as_ref(), kernel.as_ref(), settings, &work, &results, &failed);
        if result.is_err() {
            failed.store(true, Ordering::Relaxed);
        }
        result
    })
}

/// Outputs of the writer, returned to the caller for the finalization pass.
struct WriterOutput {
    target: Box<dyn RasterDataset>,
    coverage: Option<Box<dyn RasterDataset>>,
}

struct Writer {
    target: Box<dyn RasterDataset>,
    coverage: Option<Box<dyn RasterDataset>>,
    /// Signal raster used to mask the nodata pixels, `None` when the output is not masked
    signal: Option<(Box<dyn RasterDataset>, usize, Option<f64>)>,
    target_nodata: f64,
}

impl Writer {
    fn accumulate(&mut self, tile: Tile) -> Result<()> {
        let mut output = self.target.read_window(1, tile.window)?;
        match &self.signal {
            Some((signal, band, signal_nodata)) => {
                let signal_values = signal.read_window(*band, tile.window)?;
                Zip::from(&mut output)
                    .and(&tile.result)
                    .and(&signal_values)
                    .for_each(|out, &add, &value| {
                        *out = if nodata::is_nodata(value, *signal_nodata) {
                            self.target_nodata
                        } else {
                            *out + add
                        };
                    });
            }
            None => output += &tile.result,
        }
        self.target.write_window(1, tile.window.xoff, tile.window.yoff, output.view())?;

        if let (Some(coverage_ds), Some(coverage)) = (&mut self.coverage, &tile.coverage) {
            let mut current = coverage_ds.read_window(1, tile.window)?;
            current += coverage;
            coverage_ds.write_window(1, tile.window.xoff, tile.window.yoff, current.view())?;
        }

        Ok(())
    }
}

fn spawn_writer(mut writer: Writer, results: Receiver<Tile>) -> Result<pipeline::Worker<WriterOutput>> {
    pipeline::spawn_worker("convolve_writer", move || {
        // ends when every worker dropped its sender
        for tile in results {
            writer.accumulate(tile)?;
        }

        writer.target.flush()?;
        if let Some(coverage) = &mut writer.coverage {
            coverage.flush()?;
        }

        Ok(WriterOutput {
            target: writer.target,
            coverage: writer.coverage,
        })
    })
}

/// Divides the accumulated result by the kernel coverage of the valid signal pixels.
fn normalize_by_coverage(
    target: &mut dyn RasterDataset,
    coverage: &dyn RasterDataset,
    target_nodata: f64,
    scale: f64,
    largest_block: usize,
) -> Result<()> {
    // coverage values this small are the remains of FFT rounding on pixels without valid neighbours
    let epsilon = 1e-9 * scale.abs().max(1.0);

    for window in BlockLayout::for_dataset(target, 1, largest_block)?.windows() {
        let mut output = target.read_window(1, window)?;
        let mask = coverage.read_window(1, window)?;
        Zip::from(&mut output).and(&mask).for_each(|out, &weight| {
            if !nodata::is_nodata(*out, Some(target_nodata)) && weight.abs() > epsilon {
                *out = *out / weight * scale;
            }
        });
        target.write_window(1, window.xoff, window.yoff, output.view())?;
    }

    target.flush()
}

/// Copies the accumulated result to the target, converting the values to the target type.
fn store_accumulated(accumulated: &dyn RasterDataset, target: &mut dyn RasterDataset, largest_block: usize) -> Result<()> {
    for window in BlockLayout::for_dataset(accumulated, 1, largest_block)?.windows() {
        let values = accumulated.read_window(1, window)?;
        target.write_window(1, window.xoff, window.yoff, values.view())?;
    }

    target.flush()
}

/// Convolves the signal raster band with the kernel raster band and stores the result in `target`.
///
/// The target has the size and georeference of the signal, the kernel is centered on every pixel.
/// Pixels outside of the signal contribute zero.
pub fn convolve_2d(
    backend: &dyn GeoBackend,
    signal: &RasterPathBand,
    kernel: &RasterPathBand,
    target: &Path,
    target_type: RasterDataType,
    options: &ConvolveOptions,
) -> Result<()> {
    let missing: Vec<PathBuf> = [&signal.path, &kernel.path]
        .into_iter()
        .filter(|p| !backend.exists(p))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(Error::MissingFiles(missing));
    }

    let recorder = Recorder::new();
    let target_nodata = target_nodata(target_type, options.target_nodata)?;
    let signal_ds = open_input(backend, signal)?;
    let kernel_ds = open_input(backend, kernel)?;
    let signal_nodata = signal_ds.nodata(signal.band)?;
    let kernel_nodata = kernel_ds.nodata(kernel.band)?;

    let kernel_sum = sum_kernel(kernel_ds.as_ref(), kernel.band, options.ignore_nodata, options.largest_block)?;
    if options.normalize_kernel && kernel_sum == 0.0 {
        return Err(Error::InvalidArgument(format!(
            "Kernel {} sums to zero and cannot be normalized",
            kernel.path.to_string_lossy()
        )));
    }
    log::debug!("Kernel sum of {}: {kernel_sum}", kernel.path.to_string_lossy());

    create::new_raster_from_base(
        backend,
        &signal.path,
        target,
        target_type,
        &[Some(target_nodata)],
        &NewRasterOptions {
            fill: vec![Some(0.0)],
            creation_options: options.creation_options.clone(),
            ..Default::default()
        },
    )?;

    let mut scratch = ScratchSpace::new(backend, "convolve_2d")?;
    let coverage_path = if options.ignore_nodata && signal_nodata.is_some() {
        let path = scratch.raster_path("coverage_mask.tif");
        create::new_raster_from_base(
            backend,
            &signal.path,
            &path,
            RasterDataType::Float64,
            &[],
            &NewRasterOptions {
                fill: vec![Some(0.0)],
                creation_options: options.creation_options.clone(),
                ..Default::default()
            },
        )?;
        Some(path)
    } else {
        None
    };

    // partial sums of other target types are kept in full precision and converted once at the end
    let accumulator_path = if target_type == RasterDataType::Float64 {
        None
    } else {
        let path = scratch.raster_path("accumulator.tif");
        create::new_raster_from_base(
            backend,
            &signal.path,
            &path,
            RasterDataType::Float64,
            &[Some(target_nodata)],
            &NewRasterOptions {
                fill: vec![Some(0.0)],
                creation_options: options.creation_options.clone(),
                ..Default::default()
            },
        )?;
        Some(path)
    };

    let settings = WorkerSettings {
        signal_band: signal.band,
        kernel_band: kernel.band,
        signal_nodata,
        kernel_nodata,
        kernel_size: kernel_ds.raster_size(),
        raster_size: signal_ds.raster_size(),
        ignore_nodata: options.ignore_nodata,
        coverage: coverage_path.is_some(),
        kernel_scale: if options.normalize_kernel { kernel_sum } else { 1.0 },
    };

    let signal_layout = BlockLayout::for_dataset(signal_ds.as_ref(), signal.band, options.largest_block)?;
    let kernel_layout = BlockLayout::for_dataset(kernel_ds.as_ref(), kernel.band, options.largest_block)?;
    let worker_count = options
        .worker_count
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
        .max(1);

    let writer = Writer {
        target: backend.open_raster_for_update(accumulator_path.as_deref().unwrap_or(target))?,
        coverage: coverage_path.as_deref().map(|p| backend.open_raster_for_update(p)).transpose()?,
        signal: options
            .mask_nodata
            .then(|| backend.open_raster(&signal.path).map(|ds| (ds, signal.band, signal_nodata)))
            .transpose()?,
        target_nodata,
    };

    let failed = Arc::new(AtomicBool::new(false));
    let (work_tx, work_rx) = crossbeam_channel::bounded::<WorkItem>(options.queue_size.max(1));
    let (result_tx, result_rx) = crossbeam_channel::bounded::<Tile>(options.queue_size.max(1));

    let writer = spawn_writer(writer, result_rx)?;
    let mut workers = Vec::with_capacity(worker_count);
    let mut spawned = Ok(());
    for index in 0..worker_count {
        // every worker reads through its own handles
        let handles = open_input(backend, signal).and_then(|s| Ok((s, open_input(backend, kernel)?)));
        match handles.and_then(|(s, k)| {
            spawn_convolve_worker(index, s, k, settings, work_rx.clone(), result_tx.clone(), failed.clone())
        }) {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                spawned = Err(e);
                break;
            }
        }
    }

    // the workers hold the remaining channel ends
    drop(work_rx);
    drop(result_tx);
    drop(signal_ds);
    drop(kernel_ds);

    log::info!(
        "Convolving {} signal blocks with {} kernel blocks using {} worker(s)",
        signal_layout.block_count(),
        kernel_layout.block_count(),
        workers.len()
    );

    let progress = LogProgress::new("convolve 2d").with_cancel_flag(failed.clone());
    progress.reset((signal_layout.block_count() * kernel_layout.block_count()) as u64);

    let produce = || -> Result<()> {
        spawned?;
        let mut status = TimedCallback::default();
        for signal_window in signal_layout.windows() {
            status.invoke(|| {
                log::info!(
                    "Convolution operating on signal pixel ({}, {})",
                    signal_window.xoff,
                    signal_window.yoff
                )
            });

            for kernel_window in kernel_layout.windows() {
                let item = WorkItem {
                    signal: signal_window,
                    kernel: kernel_window,
                };

                if work_tx.send(item).is_err() {
                    // all workers stopped, joining them reports the cause
                    return Ok(());
                }
                progress.tick()?;
            }
        }

        Ok(())
    };

    let produced = produce();
    if produced.is_err() {
        failed.store(true, Ordering::Relaxed);
    }
    drop(work_tx);

    let worker_results = pipeline::join_all(workers, options.join_timeout);
    let written = writer.join(options.join_timeout);

    worker_results?;
    let output = written?;
    produced?;

    let mut accumulated = output.target;
    if let Some(coverage) = &output.coverage {
        let scale = if options.normalize_kernel { 1.0 } else { kernel_sum };
        normalize_by_coverage(accumulated.as_mut(), coverage.as_ref(), target_nodata, scale, options.largest_block)?;
    }

    if accumulator_path.is_some() {
        let mut target_ds = backend.open_raster_for_update(target)?;
        store_accumulated(accumulated.as_ref(), target_ds.as_mut(), options.largest_block)?;
    }

    drop(accumulated);
    drop(output.coverage);
    drop(scratch);
    log::info!(
        "Convolution of {} finished in {}",
        signal.path.to_string_lossy(),
        recorder.elapsed_time_string()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::array;

    use super::*;
    use crate::testutils::{self, NOD};

    fn options() -> ConvolveOptions {
        ConvolveOptions {
            creation_options: vec!["TILED=YES".into(), "BLOCKXSIZE=2".into(), "BLOCKYSIZE=2".into()],
            largest_block: 4,
            queue_size: 2,
            worker_count: Some(3),
            ..Default::default()
        }
    }

    fn add_tiled(backend: &crate::io::MemoryBackend, path: &str, data: &Array2<f64>, nodata: Option<f64>) -> Result<()> {
        testutils::add_multiband_raster(backend, path, std::slice::from_ref(data), nodata, (2, 2))
    }

    /// Centered convolution evaluated directly, out of raster pixels contribute zero.
    fn direct_convolution(signal: &Array2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
        let (rows, cols) = signal.dim();
        let (kr, kc) = (kernel.nrows() as isize / 2, kernel.ncols() as isize / 2);
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let mut sum = 0.0;
            for ((i, j), k) in kernel.indexed_iter() {
                let (sr, sc) = (r as isize + kr - i as isize, c as isize + kc - j as isize);
                if sr >= 0 && sc >= 0 && (sr as usize) < rows && (sc as usize) < cols {
                    sum += signal[[sr as usize, sc as usize]] * k;
                }
            }
            sum
        })
    }

    #[test]
    fn placement_is_clipped_to_the_raster() {
        let raster = RasterSize::with_rows_cols(10, 10);
        let kernel = RasterSize::with_rows_cols(3, 3);

        let (window, offset) =
            output_placement(BlockWindow::new(0, 0, 4, 4), BlockWindow::new(0, 0, 3, 3), kernel, raster).expect("in raster");
        assert_eq!(window, BlockWindow::new(0, 0, 5, 5));
        assert_eq!(offset, (1, 1));

        let (window, offset) =
            output_placement(BlockWindow::new(8, 8, 2, 2), BlockWindow::new(0, 0, 3, 3), kernel, raster).expect("in raster");
        assert_eq!(window, BlockWindow::new(7, 7, 3, 3));
        assert_eq!(offset, (0, 0));
    }

    #[test]
    fn placement_outside_of_the_raster_is_skipped() {
        let raster = RasterSize::with_rows_cols(4, 4);
        let kernel = RasterSize::with_rows_cols(21, 21);

        // the first kernel block of a large kernel only affects pixels left of the signal block
        assert!(output_placement(BlockWindow::new(0, 0, 2, 2), BlockWindow::new(0, 0, 4, 4), kernel, raster).is_none());
        assert!(output_placement(BlockWindow::new(2, 2, 2, 2), BlockWindow::new(20, 20, 1, 1), kernel, raster).is_none());
        assert!(output_placement(BlockWindow::new(2, 2, 2, 2), BlockWindow::new(10, 10, 1, 1), kernel, raster).is_some());
    }

    #[test_log::test]
    fn identity_kernel_reproduces_signal() -> Result<()> {
        let backend = testutils::memory_backend();
        let signal = array![
            [1.0, 2.0, 3.0, 4.0, 5.0],
            [6.0, NOD, 8.0, 9.0, 10.0],
            [11.0, 12.0, 13.0, NOD, 15.0],
            [16.0, 17.0, 18.0, 19.0, 20.0],
        ];
        add_tiled(&backend, "signal.tif", &signal, Some(NOD))?;
        add_tiled(&backend, "kernel.tif", &array![[1.0]], None)?;

        convolve_2d(
            &backend,
            &RasterPathBand::new("signal.tif", 1),
            &RasterPathBand::new("kernel.tif", 1),
            Path::new("out.tif"),
            RasterDataType::Float64,
            &options(),
        )?;

        let out = backend.open_raster(Path::new("out.tif"))?;
        assert_eq!(out.nodata(1)?, Some(DEFAULT_TARGET_NODATA));
        let result = out.read_band(1)?;
        for ((index, &value), &expected) in result.indexed_iter().zip(signal.iter()) {
            if expected == NOD {
                assert_eq!(value, DEFAULT_TARGET_NODATA, "pixel {index:?} should be nodata");
            } else {
                assert_relative_eq!(value, expected, epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn matches_direct_convolution() -> Result<()> {
        let backend = testutils::memory_backend();
        let signal = Array2::from_shape_fn((7, 9), |(r, c)| ((r * 9 + c) % 7) as f64 - 2.0);
        let kernel = array![[0.5, 1.0, 0.0], [1.0, 2.0, -1.0], [0.25, 0.0, 1.0], [3.0, 0.5, 0.5]];
        add_tiled(&backend, "signal.tif", &signal, None)?;
        add_tiled(&backend, "kernel.tif", &kernel, None)?;

        convolve_2d(
            &backend,
            &RasterPathBand::new("signal.tif", 1),
            &RasterPathBand::new("kernel.tif", 1),
            Path::new("out.tif"),
            RasterDataType::Float64,
            &options(),
        )?;

        let result = backend.read_band(Path::new("out.tif"), 1)?;
        let expected = direct_convolution(&signal, &kernel);
        for (value, expected) in result.iter().zip(expected.iter()) {
            assert_relative_eq!(*value, *expected, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn normalized_kernel_preserves_constant_signal() -> Result<()> {
        let backend = testutils::memory_backend();
        let kernel = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        add_tiled(&backend, "signal.tif", &Array2::from_elem((8, 8), 3.5), None)?;
        add_tiled(&backend, "kernel.tif", &kernel, None)?;

        convolve_2d(
            &backend,
            &RasterPathBand::new("signal.tif", 1),
            &RasterPathBand::new("kernel.tif", 1),
            Path::new("out.tif"),
            RasterDataType::Float64,
            &ConvolveOptions {
                normalize_kernel: true,
                ..options()
            },
        )?;

        let result = backend.read_band(Path::new("out.tif"), 1)?;
        for value in result.slice(s![1..7, 1..7]) {
            assert_relative_eq!(*value, 3.5, epsilon = 1e-9);
        }
        // edge pixels miss part of the kernel support
        assert!(result[[0, 0]] < 3.5);
        Ok(())
    }

    #[test]
    fn ignore_nodata_renormalizes_by_coverage() -> Result<()> {
        let backend = testutils::memory_backend();
        let mut signal = Array2::from_elem((6, 6), 2.0);
        signal[[2, 3]] = NOD;
        signal[[5, 0]] = NOD;
        add_tiled(&backend, "signal.tif", &signal, Some(NOD))?;
        add_tiled(&backend, "kernel.tif", &Array2::from_elem((3, 3), 1.0), None)?;

        for (normalize_kernel, expected) in [(true, 2.0), (false, 18.0)] {
            let target = format!("out_{normalize_kernel}.tif");
            convolve_2d(
                &backend,
                &RasterPathBand::new("signal.tif", 1),
                &RasterPathBand::new("kernel.tif", 1),
                Path::new(&target),
                RasterDataType::Float64,
                &ConvolveOptions {
                    ignore_nodata: true,
                    normalize_kernel,
                    ..options()
                },
            )?;

            let result = backend.read_band(Path::new(&target), 1)?;
            for ((index, value), source) in result.indexed_iter().zip(signal.iter()) {
                if *source == NOD {
                    assert_eq!(*value, DEFAULT_TARGET_NODATA);
                } else {
                    assert_relative_eq!(*value, expected, epsilon = 1e-9);
                    assert!(value.is_finite(), "pixel {index:?}");
                }
            }
        }

        // only the inputs and the outputs remain, the coverage masks are removed
        assert_eq!(backend.raster_paths()?.len(), 4);
        Ok(())
    }

    #[test]
    fn unmasked_output() -> Result<()> {
        let backend = testutils::memory_backend();
        let signal = array![[1.0, NOD], [3.0, 4.0]];
        add_tiled(&backend, "signal.tif", &signal, Some(NOD))?;
        add_tiled(&backend, "kernel.tif", &array![[2.0]], None)?;

        convolve_2d(
            &backend,
            &RasterPathBand::new("signal.tif", 1),
            &RasterPathBand::new("kernel.tif", 1),
            Path::new("out.tif"),
            RasterDataType::Float64,
            &ConvolveOptions {
                mask_nodata: false,
                ..options()
            },
        )?;

        assert_eq!(backend.read_band(Path::new("out.tif"), 1)?, array![[2.0, -2.0], [6.0, 8.0]]);
        Ok(())
    }

    #[test]
    fn worker_count_does_not_change_the_result() -> Result<()> {
        let backend = testutils::memory_backend();
        let signal = Array2::from_shape_fn((9, 7), |(r, c)| (r * c) as f64 * 0.5);
        add_tiled(&backend, "signal.tif", &signal, None)?;
        add_tiled(&backend, "kernel.tif", &Array2::from_shape_fn((5, 5), |(r, c)| (r + c) as f64), None)?;

        let mut results = Vec::new();
        for worker_count in [1, 4] {
            let target = format!("out_{worker_count}.tif");
            convolve_2d(
                &backend,
                &RasterPathBand::new("signal.tif", 1),
                &RasterPathBand::new("kernel.tif", 1),
                Path::new(&target),
                RasterDataType::Float64,
                &ConvolveOptions {
                    worker_count: Some(worker_count),
                    ..options()
                },
            )?;
            results.push(backend.read_band(Path::new(&target), 1)?);
        }

        for (a, b) in results[0].iter().zip(results[1].iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn integer_target_requires_nodata() -> Result<()> {
        let backend = testutils::memory_backend();
        add_tiled(&backend, "signal.tif", &Array2::from_elem((2, 2), 1.0), None)?;
        add_tiled(&backend, "kernel.tif", &array![[1.0]], None)?;
        let signal = RasterPathBand::new("signal.tif", 1);
        let kernel = RasterPathBand::new("kernel.tif", 1);

        assert!(matches!(
            convolve_2d(&backend, &signal, &kernel, Path::new("out.tif"), RasterDataType::Int32, &options()),
            Err(Error::InvalidArgument(_))
        ));

        convolve_2d(
            &backend,
            &signal,
            &kernel,
            Path::new("out.tif"),
            RasterDataType::Int32,
            &ConvolveOptions {
                target_nodata: Some(-9999.0),
                ..options()
            },
        )?;
        assert_eq!(backend.read_band(Path::new("out.tif"), 1)?, Array2::from_elem((2, 2), 1.0));
        Ok(())
    }

    #[test]
    fn integer_target_is_rounded_once() -> Result<()> {
        let backend = testutils::memory_backend();
        let signal = Array2::from_elem((6, 6), 1.0);
        let kernel = Array2::from_elem((3, 3), 0.3);
        add_tiled(&backend, "signal.tif", &signal, None)?;
        add_tiled(&backend, "kernel.tif", &kernel, None)?;

        convolve_2d(
            &backend,
            &RasterPathBand::new("signal.tif", 1),
            &RasterPathBand::new("kernel.tif", 1),
            Path::new("out.tif"),
            RasterDataType::Int32,
            &ConvolveOptions {
                target_nodata: Some(-1.0),
                ..options()
            },
        )?;

        // every tile only adds a fraction of a pixel value, rounding per tile would lose it
        let expected = direct_convolution(&signal, &kernel).mapv(f64::round);
        assert_eq!(expected[[2, 2]], 3.0);
        assert_eq!(backend.read_band(Path::new("out.tif"), 1)?, expected);

        // the full precision accumulator is removed
        assert_eq!(backend.raster_paths()?.len(), 3);
        Ok(())
    }

    #[test]
    fn invalid_inputs() -> Result<()> {
        let backend = testutils::memory_backend();
        add_tiled(&backend, "signal.tif", &Array2::from_elem((2, 2), 1.0), None)?;
        add_tiled(&backend, "zero.tif", &array![[1.0, -1.0]], None)?;
        let signal = RasterPathBand::new("signal.tif", 1);

        assert!(matches!(
            convolve_2d(&backend, &signal, &RasterPathBand::new("missing.tif", 1), Path::new("out.tif"), RasterDataType::Float64, &options()),
            Err(Error::MissingFiles(files)) if files == vec![PathBuf::from("missing.tif")]
        ));

        assert!(matches!(
            convolve_2d(&backend, &signal, &RasterPathBand::new("zero.tif", 2), Path::new("out.tif"), RasterDataType::Float64, &options()),
            Err(Error::InvalidBands(_))
        ));

        assert!(matches!(
            convolve_2d(
                &backend,
                &signal,
                &RasterPathBand::new("zero.tif", 1),
                Path::new("out.tif"),
                RasterDataType::Float64,
                &ConvolveOptions {
                    normalize_kernel: true,
                    ..options()
                }
            ),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }
}
