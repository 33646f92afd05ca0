use std::path::Path;

use ndarray::ArrayView2;

use crate::{
    Result,
    blocks::BlockLayout,
    io::{GeoBackend, RasterDataset},
    nodata,
};

/// Statistics as stored in the raster band metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BandStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RasterStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub sum: f64,
    pub value_count: u64,
}

impl RasterStatistics {
    pub fn band_statistics(&self) -> BandStatistics {
        BandStatistics {
            min: self.min,
            max: self.max,
            mean: self.mean,
            stddev: self.stddev,
        }
    }
}

/// First statistics pass: running min, max, sum and count of the valid pixels.
/// The accumulation is commutative, so blocks can be added in any order.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsAccumulator {
    min: Option<f64>,
    max: Option<f64>,
    sum: f64,
    count: u64,
}

impl StatsAccumulator {
    pub fn add_block(&mut self, block: ArrayView2<f64>, nodata: Option<f64>) {
        for &val in block.iter().filter(|&&v| nodata::is_valid(v, nodata)) {
            self.min = Some(self.min.map_or(val, |m| m.min(val)));
            self.max = Some(self.max.map_or(val, |m| m.max(val)));
            self.sum += val;
            self.count += 1;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }

        Some(self.sum / self.count as f64)
    }

    /// Combine with the squared deviation sum of the second pass.
    /// Returns `None` when no valid pixel was seen.
    pub fn finish(&self, sum_squared_deviation: f64) -> Option<RasterStatistics> {
        let (min, max, mean) = (self.min?, self.max?, self.mean()?);
        Some(RasterStatistics {
            min,
            max,
            mean,
            stddev: (sum_squared_deviation / self.count as f64).sqrt(),
            sum: self.sum,
            value_count: self.count,
        })
    }
}

/// Sum of the squared deviations from the mean of the valid pixels.
pub fn sum_squared_deviation(block: ArrayView2<f64>, nodata: Option<f64>, mean: f64) -> f64 {
    block
        .iter()
        .filter(|&&v| nodata::is_valid(v, nodata))
        .map(|&v| (v - mean) * (v - mean))
        .sum()
}

/// Second statistics pass over the band, completes the first pass results.
pub fn finish_band_statistics(
    dataset: &dyn RasterDataset,
    band: usize,
    layout: &BlockLayout,
    first_pass: &StatsAccumulator,
) -> Result<Option<RasterStatistics>> {
    let mean = match first_pass.mean() {
        Some(mean) => mean,
        None => return Ok(None),
    };

    let nodata = dataset.nodata(band)?;
    let mut ss = 0.0;
    for window in layout.windows() {
        let block = dataset.read_window(band, window)?;
        ss += sum_squared_deviation(block.view(), nodata, mean);
    }

    Ok(first_pass.finish(ss))
}

/// Two pass statistics of a raster band, `None` if the band only contains nodata.
pub fn band_statistics(dataset: &dyn RasterDataset, band: usize, largest_block: usize) -> Result<Option<RasterStatistics>> {
    let layout = BlockLayout::for_dataset(dataset, band, largest_block)?;
    let nodata = dataset.nodata(band)?;

    let mut acc = StatsAccumulator::default();
    for window in layout.windows() {
        let block = dataset.read_window(band, window)?;
        acc.add_block(block.view(), nodata);
    }

    finish_band_statistics(dataset, band, &layout, &acc)
}

/// Calculates the statistics of every band of the raster and stores them in the band metadata.
/// Bands without valid pixels are reported with a warning and get no statistics.
pub fn calculate_raster_stats(backend: &dyn GeoBackend, path: &Path, largest_block: usize) -> Result<Vec<Option<RasterStatistics>>> {
    let mut dataset = backend.open_raster_for_update(path)?;

    let mut result = Vec::with_capacity(dataset.band_count());
    for band in 1..=dataset.band_count() {
        let stats = band_statistics(dataset.as_ref(), band, largest_block)?;
        match &stats {
            Some(stats) => dataset.set_statistics(band, stats.band_statistics())?,
            None => log::warn!(
                "Stats not calculated for {} band {band} since no non-nodata pixels were found",
                path.to_string_lossy()
            ),
        }

        result.push(stats);
    }

    dataset.flush()?;
    Ok(result)
}
