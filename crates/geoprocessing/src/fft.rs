//! Two dimensional FFT based convolution of blocks.

use std::sync::Arc;

use ndarray::{Array2, ArrayView2, s};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use crate::{Error, Result};

/// The smallest 5-smooth number (only prime factors 2, 3 and 5) that is at least `target`.
///
/// FFTs on such lengths are fast, lengths with large prime factors can be orders of magnitude slower.
/// Values up to 6 and powers of two are returned unchanged.
pub fn next_regular(target: usize) -> usize {
    if target <= 6 || target.is_power_of_two() {
        return target;
    }

    let mut best = usize::MAX;
    let mut p5 = 1;
    while p5 < target {
        let mut p35 = p5;
        while p35 < target {
            let p2 = target.div_ceil(p35).next_power_of_two();
            let candidate = p2 * p35;
            if candidate == target {
                return candidate;
            }

            best = best.min(candidate);
            p35 *= 3;
            if p35 == target {
                return p35;
            }
        }

        best = best.min(p35);
        p5 *= 5;
        if p5 == target {
            return p5;
        }
    }

    best.min(p5)
}

/// Padded FFT shape for the full convolution of two blocks.
pub fn convolution_shape(a: (usize, usize), b: (usize, usize)) -> ((usize, usize), (usize, usize)) {
    let shape = (a.0 + b.0 - 1, a.1 + b.1 - 1);
    (shape, (next_regular(shape.0), next_regular(shape.1)))
}

fn process_lanes(fft: &dyn Fft<f64>, data: &mut Array2<Complex64>) -> Result<()> {
    let buffer = data
        .as_slice_mut()
        .ok_or_else(|| Error::Runtime("FFT buffer is not contiguous".to_string()))?;
    fft.process(buffer);
    Ok(())
}

/// Forward and inverse 2D transforms for a fixed shape.
pub struct Fft2d {
    shape: (usize, usize),
    row_forward: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl Fft2d {
    pub fn new(planner: &mut FftPlanner<f64>, shape: (usize, usize)) -> Self {
        Fft2d {
            shape,
            row_forward: planner.plan_fft_forward(shape.1),
            col_forward: planner.plan_fft_forward(shape.0),
            row_inverse: planner.plan_fft_inverse(shape.1),
            col_inverse: planner.plan_fft_inverse(shape.0),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn transform(&self, mut data: Array2<Complex64>, rows: &dyn Fft<f64>, cols: &dyn Fft<f64>) -> Result<Array2<Complex64>> {
        process_lanes(rows, &mut data)?;
        let mut transposed = data.reversed_axes().as_standard_layout().into_owned();
        process_lanes(cols, &mut transposed)?;
        Ok(transposed.reversed_axes().as_standard_layout().into_owned())
    }

    /// Spectrum of the block, zero padded at the end of both axes to the transform shape.
    pub fn forward(&self, block: ArrayView2<f64>) -> Result<Array2<Complex64>> {
        let (rows, cols) = block.dim();
        if rows > self.shape.0 || cols > self.shape.1 {
            return Err(Error::InvalidArgument(format!(
                "Block of shape {:?} does not fit in FFT shape {:?}",
                block.dim(),
                self.shape
            )));
        }

        let mut padded = Array2::<Complex64>::zeros(self.shape);
        padded
            .slice_mut(s![..rows, ..cols])
            .zip_mut_with(&block, |dst, &src| *dst = Complex64::new(src, 0.0));

        self.transform(padded, self.row_forward.as_ref(), self.col_forward.as_ref())
    }

    /// Real part of the normalized inverse transform.
    pub fn inverse(&self, spectrum: Array2<Complex64>) -> Result<Array2<f64>> {
        if spectrum.dim() != self.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape,
                actual: spectrum.dim(),
            });
        }

        let scale = (self.shape.0 * self.shape.1) as f64;
        let signal = self.transform(spectrum, self.row_inverse.as_ref(), self.col_inverse.as_ref())?;
        Ok(signal.mapv(|c| c.re / scale))
    }
}

/// Identifies a spectrum: the transform shape and the offset of the block in its raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpectrumKey {
    pub shape: (usize, usize),
    pub xoff: usize,
    pub yoff: usize,
}

/// Remembers the last computed spectrum.
/// Consecutive work items that share a block reuse the spectrum instead of transforming it again.
#[derive(Default)]
pub struct SpectrumCache {
    last: Option<(SpectrumKey, Arc<Array2<Complex64>>)>,
    hits: u64,
}

impl SpectrumCache {
    pub fn get_or_compute(&mut self, key: SpectrumKey, compute: impl FnOnce() -> Result<Array2<Complex64>>) -> Result<Arc<Array2<Complex64>>> {
        if let Some((last_key, spectrum)) = &self.last {
            if *last_key == key {
                self.hits += 1;
                return Ok(spectrum.clone());
            }
        }

        let spectrum = Arc::new(compute()?);
        self.last = Some((key, spectrum.clone()));
        Ok(spectrum)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

/// FFT convolution state of a single worker.
pub struct FftConvolver {
    planner: FftPlanner<f64>,
    transforms: Vec<Fft2d>,
    signal_cache: SpectrumCache,
    kernel_cache: SpectrumCache,
}

impl FftConvolver {
    pub fn new() -> Self {
        FftConvolver {
            planner: FftPlanner::new(),
            transforms: Vec::new(),
            signal_cache: SpectrumCache::default(),
            kernel_cache: SpectrumCache::default(),
        }
    }

    fn transform_index(&mut self, shape: (usize, usize)) -> usize {
        if let Some(index) = self.transforms.iter().position(|t| t.shape() == shape) {
            return index;
        }

        self.transforms.push(Fft2d::new(&mut self.planner, shape));
        self.transforms.len() - 1
    }

    /// Full convolution of the signal and kernel blocks, the result has shape `signal + kernel - 1`.
    ///
    /// The offsets identify the block contents for the spectrum caches, pass `None` to bypass the cache.
    pub fn convolve(
        &mut self,
        signal: ArrayView2<f64>,
        signal_offset: Option<(usize, usize)>,
        kernel: ArrayView2<f64>,
        kernel_offset: Option<(usize, usize)>,
    ) -> Result<Array2<f64>> {
        if signal.is_empty() || kernel.is_empty() {
            return Err(Error::InvalidArgument("Cannot convolve empty blocks".to_string()));
        }

        let (shape, fshape) = convolution_shape(signal.dim(), kernel.dim());
        let index = self.transform_index(fshape);
        let fft = &self.transforms[index];

        let signal_spectrum = match signal_offset {
            Some((xoff, yoff)) => self
                .signal_cache
                .get_or_compute(SpectrumKey { shape: fshape, xoff, yoff }, || fft.forward(signal.view()))?,
            None => Arc::new(fft.forward(signal.view())?),
        };

        let kernel_spectrum = match kernel_offset {
            Some((xoff, yoff)) => self
                .kernel_cache
                .get_or_compute(SpectrumKey { shape: fshape, xoff, yoff }, || fft.forward(kernel.view()))?,
            None => Arc::new(fft.forward(kernel.view())?),
        };

        let product = &*signal_spectrum * &*kernel_spectrum;
        let result = fft.inverse(product)?;
        Ok(result.slice(s![..shape.0, ..shape.1]).to_owned())
    }

    pub fn cache_hits(&self) -> u64 {
        self.signal_cache.hits() + self.kernel_cache.hits()
    }
}

impl Default for FftConvolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::array;

    use super::*;

    fn is_regular(mut n: usize) -> bool {
        for p in [2, 3, 5] {
            while n % p == 0 {
                n /= p;
            }
        }

        n == 1
    }

    /// Direct evaluation of the full convolution
    fn direct_convolution(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
        let shape = (a.nrows() + b.nrows() - 1, a.ncols() + b.ncols() - 1);
        let mut result = Array2::zeros(shape);
        for ((ar, ac), av) in a.indexed_iter() {
            for ((br, bc), bv) in b.indexed_iter() {
                result[[ar + br, ac + bc]] += av * bv;
            }
        }

        result
    }

    fn assert_close(actual: ArrayView2<f64>, expected: ArrayView2<f64>) {
        assert_eq!(actual.dim(), expected.dim());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert_relative_eq!(*a, *e, epsilon = 1e-9);
        }
    }

    #[test]
    fn next_regular_small_values_are_unchanged() {
        for i in 0..=6 {
            assert_eq!(next_regular(i), i);
        }
    }

    #[test]
    fn next_regular_powers_of_two_are_unchanged() {
        for exp in 0..40 {
            assert_eq!(next_regular(1 << exp), 1 << exp);
        }
    }

    #[test]
    fn next_regular_is_the_smallest_regular_number() {
        for target in 7..2000 {
            let result = next_regular(target);
            assert!(result >= target);
            assert!(is_regular(result), "{result} is not 5-smooth");
            assert!(((target)..result).all(|n| !is_regular(n)), "a smaller regular number exists for {target}");
        }
    }

    #[test]
    fn next_regular_known_values() {
        assert_eq!(next_regular(7), 8);
        assert_eq!(next_regular(11), 12);
        assert_eq!(next_regular(97), 100);
        assert_eq!(next_regular(1001), 1024);
        assert_eq!(next_regular(2049), 2160);
    }

    #[test]
    fn fft_round_trip() -> Result<()> {
        let mut planner = FftPlanner::new();
        let fft = Fft2d::new(&mut planner, (4, 6));
        let data = Array2::from_shape_fn((3, 5), |(r, c)| (r * 5 + c) as f64);

        let restored = fft.inverse(fft.forward(data.view())?)?;
        assert_close(restored.slice(s![..3, ..5]), data.view());
        assert_relative_eq!(restored.row(3).sum(), 0.0, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn block_larger_than_transform() {
        let mut planner = FftPlanner::new();
        let fft = Fft2d::new(&mut planner, (2, 2));
        assert!(matches!(fft.forward(Array2::zeros((3, 2)).view()), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn convolution_matches_direct_evaluation() -> Result<()> {
        let signal = Array2::from_shape_fn((7, 11), |(r, c)| ((r * 11 + c) % 5) as f64 - 1.5);
        let kernel = array![[0.5, 1.0, 0.5], [1.0, 2.0, 1.0], [0.25, 0.0, -1.0]];

        let mut convolver = FftConvolver::new();
        let result = convolver.convolve(signal.view(), None, kernel.view(), None)?;
        assert_eq!(result.dim(), (9, 13));
        assert_close(result.view(), direct_convolution(&signal, &kernel).view());
        Ok(())
    }

    #[test]
    fn cached_spectra_are_reused() -> Result<()> {
        let signal = Array2::from_elem((4, 4), 1.0);
        let kernel_a = Array2::from_elem((2, 2), 1.0);
        let kernel_b = Array2::from_elem((2, 2), 2.0);

        let mut convolver = FftConvolver::new();
        let a = convolver.convolve(signal.view(), Some((0, 0)), kernel_a.view(), Some((0, 0)))?;
        let b = convolver.convolve(signal.view(), Some((0, 0)), kernel_b.view(), Some((2, 0)))?;
        assert_eq!(convolver.cache_hits(), 1);
        assert_close(b.view(), (a * 2.0).view());
        Ok(())
    }
}
