//! Tiling of a raster into blocks for out of core processing.
//!
//! Blocks grow from the native block size of the raster band towards a cell budget:
//! first wider, then taller, never beyond the raster dimensions.

use std::ops::Range;

use ndarray::Array2;

use crate::{Error, RasterSize, Result, io::RasterDataset};

/// Default cell budget of a block.
pub const LARGEST_BLOCK: usize = 1 << 20;

/// A rectangular pixel window of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockWindow {
    pub xoff: usize,
    pub yoff: usize,
    pub win_xsize: usize,
    pub win_ysize: usize,
}

impl BlockWindow {
    pub const fn new(xoff: usize, yoff: usize, win_xsize: usize, win_ysize: usize) -> Self {
        BlockWindow {
            xoff,
            yoff,
            win_xsize,
            win_ysize,
        }
    }

    /// The window covering the full raster
    pub fn full(size: RasterSize) -> Self {
        Self::new(0, 0, size.cols, size.rows)
    }

    /// The ndarray shape (rows, cols) of the window
    pub fn shape(&self) -> (usize, usize) {
        (self.win_ysize, self.win_xsize)
    }

    pub fn cell_count(&self) -> usize {
        self.win_xsize * self.win_ysize
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
    }

    pub fn row_range(&self) -> Range<usize> {
        self.yoff..self.yoff + self.win_ysize
    }

    pub fn col_range(&self) -> Range<usize> {
        self.xoff..self.xoff + self.win_xsize
    }

    pub fn fits_in(&self, size: RasterSize) -> bool {
        self.xoff + self.win_xsize <= size.cols && self.yoff + self.win_ysize <= size.rows
    }
}

/// The block tiling of a raster.
/// The layout itself holds no iteration state: every call to `windows` starts a new pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    raster_size: RasterSize,
    cols_per_block: usize,
    rows_per_block: usize,
}

impl BlockLayout {
    /// `native_block` is the (cols, rows) block size of the raster storage.
    pub fn new(raster_size: RasterSize, native_block: (usize, usize), largest_block: usize) -> Self {
        let mut cols_per_block = native_block.0.max(1);
        let mut rows_per_block = native_block.1.max(1);

        // try to make the block wider
        let width_factor = largest_block / (cols_per_block * rows_per_block);
        if width_factor > 0 {
            cols_per_block = (cols_per_block * width_factor).min(raster_size.cols);
        }

        // try to make the block taller
        let block_area = cols_per_block.max(1) * rows_per_block;
        let height_factor = largest_block / block_area;
        if height_factor > 0 {
            rows_per_block = (rows_per_block * height_factor).min(raster_size.rows);
        }

        BlockLayout {
            raster_size,
            cols_per_block: cols_per_block.min(raster_size.cols).max(1),
            rows_per_block: rows_per_block.min(raster_size.rows).max(1),
        }
    }

    pub fn for_dataset(dataset: &dyn RasterDataset, band: usize, largest_block: usize) -> Result<Self> {
        Ok(Self::new(dataset.raster_size(), dataset.block_size(band)?, largest_block))
    }

    pub fn raster_size(&self) -> RasterSize {
        self.raster_size
    }

    /// The (cols, rows) size of a full block
    pub fn block_shape(&self) -> (usize, usize) {
        (self.cols_per_block, self.rows_per_block)
    }

    pub fn col_block_count(&self) -> usize {
        self.raster_size.cols.div_ceil(self.cols_per_block)
    }

    pub fn row_block_count(&self) -> usize {
        self.raster_size.rows.div_ceil(self.rows_per_block)
    }

    pub fn block_count(&self) -> usize {
        self.col_block_count() * self.row_block_count()
    }

    /// Iterate over the block windows in row major order.
    pub fn windows(&self) -> BlockWindows {
        BlockWindows { layout: *self, index: 0 }
    }
}

/// Row major iterator over the windows of a `BlockLayout`.
#[derive(Debug, Clone)]
pub struct BlockWindows {
    layout: BlockLayout,
    index: usize,
}

impl Iterator for BlockWindows {
    type Item = BlockWindow;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.layout.block_count() {
            return None;
        }

        let col_blocks = self.layout.col_block_count();
        let (row_block, col_block) = (self.index / col_blocks, self.index % col_blocks);
        self.index += 1;

        let xoff = col_block * self.layout.cols_per_block;
        let yoff = row_block * self.layout.rows_per_block;
        Some(BlockWindow::new(
            xoff,
            yoff,
            self.layout.cols_per_block.min(self.layout.raster_size.cols - xoff),
            self.layout.rows_per_block.min(self.layout.raster_size.rows - yoff),
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.layout.block_count().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BlockWindows {}

/// Iterator over the blocks of a raster with the pixel data of the requested bands.
pub struct BandBlocks<'a> {
    dataset: &'a dyn RasterDataset,
    bands: Vec<usize>,
    windows: BlockWindows,
}

impl Iterator for BandBlocks<'_> {
    type Item = Result<(BlockWindow, Vec<Array2<f64>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let window = self.windows.next()?;
        let data: Result<Vec<Array2<f64>>> = self.bands.iter().map(|&band| self.dataset.read_window(band, window)).collect();
        Some(data.map(|data| (window, data)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.windows.size_hint()
    }
}

/// Iterate over the blocks of the raster, reading the requested bands in the requested order.
/// Bands are 1-based and may be repeated, an empty band list reads all the bands.
/// The block layout is determined by the native block size of the first requested band.
pub fn iterblocks<'a>(dataset: &'a dyn RasterDataset, bands: &[usize], largest_block: usize) -> Result<BandBlocks<'a>> {
    let bands: Vec<usize> = if bands.is_empty() {
        (1..=dataset.band_count()).collect()
    } else {
        bands.to_vec()
    };

    let invalid: Vec<usize> = bands.iter().copied().filter(|&b| b == 0 || b > dataset.band_count()).collect();
    if !invalid.is_empty() {
        return Err(Error::InvalidBands(
            invalid.into_iter().map(|b| (dataset.path().to_path_buf(), b)).collect(),
        ));
    }

    let layout = BlockLayout::for_dataset(dataset, bands.first().copied().unwrap_or(1), largest_block)?;
    Ok(BandBlocks {
        dataset,
        bands,
        windows: layout.windows(),
    })
}

/// Iterate over the block windows of the raster without reading any data.
pub fn block_offsets(dataset: &dyn RasterDataset, largest_block: usize) -> Result<BlockWindows> {
    Ok(BlockLayout::for_dataset(dataset, 1, largest_block)?.windows())
}

#[cfg(test)]
#[generic_tests::define]
mod tests {
    use super::*;

    trait Budget {
        const CELLS: usize;
    }

    struct Zero;
    struct One;
    struct Small;
    struct Medium;
    struct Standard;

    impl Budget for Zero {
        const CELLS: usize = 0;
    }

    impl Budget for One {
        const CELLS: usize = 1;
    }

    impl Budget for Small {
        const CELLS: usize = 100;
    }

    impl Budget for Medium {
        const CELLS: usize = 4096;
    }

    impl Budget for Standard {
        const CELLS: usize = LARGEST_BLOCK;
    }

    fn assert_exact_tiling(layout: &BlockLayout) {
        let size = layout.raster_size();
        let mut coverage = Array2::<u32>::zeros(size.shape());
        let mut previous: Option<BlockWindow> = None;

        for window in layout.windows() {
            assert!(!window.is_empty());
            assert!(window.fits_in(size));
            if let Some(prev) = previous {
                // row major
                assert!(window.yoff > prev.yoff || (window.yoff == prev.yoff && window.xoff > prev.xoff));
            }

            for r in window.row_range() {
                for c in window.col_range() {
                    coverage[(r, c)] += 1;
                }
            }
            previous = Some(window);
        }

        assert!(coverage.iter().all(|&c| c == 1), "blocks do not tile the raster exactly");
        assert_eq!(layout.windows().map(|w| w.cell_count()).sum::<usize>(), size.cell_count());
    }

    #[test]
    fn exact_tiling<B: Budget>() {
        for (rows, cols) in [(1, 1), (7, 13), (100, 37), (256, 300)] {
            for native in [(1, 1), (16, 16), (cols, 1), (256, 256)] {
                let layout = BlockLayout::new(RasterSize::with_rows_cols(rows, cols), native, B::CELLS);
                assert_exact_tiling(&layout);
            }
        }
    }

    #[instantiate_tests(<Zero>)]
    mod budget_zero {}

    #[instantiate_tests(<One>)]
    mod budget_one {}

    #[instantiate_tests(<Small>)]
    mod budget_small {}

    #[instantiate_tests(<Medium>)]
    mod budget_medium {}

    #[instantiate_tests(<Standard>)]
    mod budget_default {}
}

#[cfg(test)]
mod layout_tests {
    use ndarray::array;

    use super::*;
    use crate::testutils;

    #[test]
    fn grows_width_first_then_height() {
        let layout = BlockLayout::new(RasterSize::with_rows_cols(1000, 1000), (10, 10), 1000);
        // width factor 10: 100 columns, height factor 1000 / 1000 = 1
        assert_eq!(layout.block_shape(), (100, 10));

        let layout = BlockLayout::new(RasterSize::with_rows_cols(1000, 50), (10, 10), 1000);
        // width clamped to 50 columns, then height factor 1000 / 500 = 2
        assert_eq!(layout.block_shape(), (50, 20));
    }

    #[test]
    fn small_budget_keeps_native_block() {
        let layout = BlockLayout::new(RasterSize::with_rows_cols(100, 100), (16, 16), 10);
        assert_eq!(layout.block_shape(), (16, 16));
        assert_eq!(layout.block_count(), 49);
    }

    #[test]
    fn native_block_larger_than_raster() {
        let layout = BlockLayout::new(RasterSize::with_rows_cols(10, 10), (256, 256), 1 << 20);
        assert_eq!(layout.block_shape(), (10, 10));
        assert_eq!(layout.windows().collect::<Vec<_>>(), vec![BlockWindow::new(0, 0, 10, 10)]);
    }

    #[test]
    fn empty_raster_has_no_blocks() {
        let layout = BlockLayout::new(RasterSize::with_rows_cols(0, 10), (16, 16), 1 << 20);
        assert_eq!(layout.windows().count(), 0);
    }

    #[test]
    fn restartable() {
        let layout = BlockLayout::new(RasterSize::with_rows_cols(33, 17), (4, 4), 20);
        let first: Vec<BlockWindow> = layout.windows().collect();
        let second: Vec<BlockWindow> = layout.windows().collect();
        assert_eq!(first, second);
        assert_eq!(layout.windows().len(), first.len());
    }

    #[test]
    fn iterblocks_reads_bands_in_requested_order() -> Result<()> {
        let backend = testutils::memory_backend();
        let band1 = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let band2 = band1.mapv(|v| v * 10.0);
        testutils::add_multiband_raster(&backend, "multi.tif", &[band1.clone(), band2.clone()], None, (1, 1))?;

        let ds = crate::io::GeoBackend::open_raster(&backend, std::path::Path::new("multi.tif"))?;
        let mut cells = 0;
        for block in iterblocks(ds.as_ref(), &[2, 1, 2], 2)? {
            let (window, data) = block?;
            assert_eq!(data.len(), 3);
            for (r, c) in itertools::iproduct!(0..window.win_ysize, 0..window.win_xsize) {
                let (row, col) = (window.yoff + r, window.xoff + c);
                assert_eq!(data[0][(r, c)], band2[(row, col)]);
                assert_eq!(data[1][(r, c)], band1[(row, col)]);
                assert_eq!(data[2][(r, c)], band2[(row, col)]);
            }
            cells += window.cell_count();
        }

        assert_eq!(cells, 6);
        Ok(())
    }

    #[test]
    fn iterblocks_invalid_band() -> Result<()> {
        let backend = testutils::memory_backend();
        testutils::add_raster(&backend, "single.tif", &array![[1.0]], None)?;
        let ds = crate::io::GeoBackend::open_raster(&backend, std::path::Path::new("single.tif"))?;

        assert!(matches!(iterblocks(ds.as_ref(), &[1, 3], 10), Err(Error::InvalidBands(_))));
        assert_eq!(iterblocks(ds.as_ref(), &[], 10)?.count(), 1);
        assert_eq!(block_offsets(ds.as_ref(), 10)?.count(), 1);
        Ok(())
    }
}
