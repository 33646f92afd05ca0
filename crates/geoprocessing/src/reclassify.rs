use std::path::Path;

use ndarray::{Array2, ArrayView2};

use crate::{
    Error, RasterDataType, Result,
    calculator::{self, CalcInput, CalculatorOptions},
    io::{GeoBackend, RasterPathBand},
    nodata,
    statistics::RasterStatistics,
};

/// Lookup table from source pixel values to target pixel values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    // sorted on the key using the total order of f64
    entries: Vec<(f64, f64)>,
}

fn normalize_key(key: f64) -> f64 {
    // -0.0 and 0.0 are the same pixel value
    if key == 0.0 { 0.0 } else { key }
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping, an existing mapping for the same source value is replaced.
    pub fn insert(&mut self, from: f64, to: f64) {
        let from = normalize_key(from);
        match self.entries.binary_search_by(|(k, _)| k.total_cmp(&from)) {
            Ok(index) => self.entries[index].1 = to,
            Err(index) => self.entries.insert(index, (from, to)),
        }
    }

    pub fn get(&self, value: f64) -> Option<f64> {
        let value = normalize_key(value);
        self.entries
            .binary_search_by(|(k, _)| k.total_cmp(&value))
            .ok()
            .map(|index| self.entries[index].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(f64, f64)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (f64, f64)>>(iter: T) -> Self {
        let mut map = ValueMap::new();
        for (from, to) in iter {
            map.insert(from, to);
        }
        map
    }
}

impl<const N: usize> From<[(f64, f64); N]> for ValueMap {
    fn from(entries: [(f64, f64); N]) -> Self {
        entries.into_iter().collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReclassifyOptions {
    /// Fail when the raster contains a value (other than nodata) that is not in the value map.
    /// When disabled unmapped values become the target nodata.
    pub values_required: bool,
    pub calculator: CalculatorOptions,
}

impl Default for ReclassifyOptions {
    fn default() -> Self {
        ReclassifyOptions {
            values_required: true,
            calculator: CalculatorOptions::default(),
        }
    }
}

/// Replaces every pixel value of the raster band with the value from the value map.
///
/// Nodata pixels of the base become the target nodata, unless the nodata value itself is mapped.
pub fn reclassify_raster(
    backend: &dyn GeoBackend,
    base: &RasterPathBand,
    value_map: &ValueMap,
    target: &Path,
    target_type: RasterDataType,
    target_nodata: Option<f64>,
    options: &ReclassifyOptions,
) -> Result<Option<RasterStatistics>> {
    let base_nodata = backend.open_raster(&base.path)?.nodata(base.band)?;
    let values_required = options.values_required;

    let reclassify = |block: ArrayView2<f64>| -> Result<Array2<f64>> {
        let mut unmapped = Vec::new();
        let result = block.mapv(|v| match value_map.get(v) {
            Some(mapped) => mapped,
            None if nodata::is_nodata(v, base_nodata) => target_nodata.unwrap_or(v),
            None => {
                if values_required {
                    unmapped.push(v);
                }
                target_nodata.unwrap_or(v)
            }
        });

        if !unmapped.is_empty() {
            unmapped.sort_by(f64::total_cmp);
            unmapped.dedup();
            return Err(Error::UnmappedValues {
                path: base.path.clone(),
                values: unmapped,
                nodata: base_nodata,
            });
        }

        Ok(result)
    };

    calculator::raster_calculator(
        backend,
        &[CalcInput::Raster(base.clone())],
        |args| reclassify(args[0].block()?),
        target,
        target_type,
        target_nodata,
        &options.calculator,
    )
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{io::RasterDataset as _, testutils};

    #[test]
    fn value_map_lookup() {
        let map = ValueMap::from([(1.0, 10.0), (-0.0, 5.0), (f64::NAN, 7.0), (1.0, 11.0)]);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(1.0), Some(11.0));
        assert_eq!(map.get(0.0), Some(5.0));
        assert_eq!(map.get(f64::NAN), Some(7.0));
        assert_eq!(map.get(2.0), None);
    }

    #[test_log::test]
    fn reclassify_constant_raster() -> Result<()> {
        let backend = testutils::memory_backend();
        testutils::add_raster(&backend, "base.tif", &Array2::from_elem((4, 4), 5.0), Some(testutils::NOD))?;

        let stats = reclassify_raster(
            &backend,
            &RasterPathBand::new("base.tif", 1),
            &ValueMap::from([(5.0, 100.0)]),
            Path::new("target.tif"),
            RasterDataType::Float32,
            Some(testutils::NOD),
            &ReclassifyOptions::default(),
        )?;

        assert_eq!(backend.read_band("target.tif", 1)?, Array2::from_elem((4, 4), 100.0));
        assert_eq!(stats.map(|s| (s.min, s.max, s.value_count)), Some((100.0, 100.0, 16)));
        assert_eq!(backend.open_raster(Path::new("target.tif"))?.data_type(1)?, RasterDataType::Float32);
        Ok(())
    }

    #[test]
    fn nodata_maps_to_target_nodata() -> Result<()> {
        let backend = testutils::memory_backend();
        testutils::add_raster(&backend, "base.tif", &array![[1.0, testutils::NOD], [2.0, 1.0]], Some(testutils::NOD))?;

        reclassify_raster(
            &backend,
            &RasterPathBand::new("base.tif", 1),
            &ValueMap::from([(1.0, 10.0), (2.0, 20.0)]),
            Path::new("target.tif"),
            RasterDataType::Uint8,
            Some(255.0),
            &ReclassifyOptions::default(),
        )?;

        assert_eq!(backend.read_band("target.tif", 1)?, array![[10.0, 255.0], [20.0, 10.0]]);
        Ok(())
    }

    #[test]
    fn unmapped_values_are_reported() -> Result<()> {
        let backend = testutils::memory_backend();
        let mut data = Array2::from_elem((4, 4), 5.0);
        data[[2, 1]] = 7.0;
        data[[3, 3]] = 3.0;
        testutils::add_raster(&backend, "base.tif", &data, Some(testutils::NOD))?;

        let result = reclassify_raster(
            &backend,
            &RasterPathBand::new("base.tif", 1),
            &ValueMap::from([(5.0, 100.0)]),
            Path::new("target.tif"),
            RasterDataType::Float32,
            Some(testutils::NOD),
            &ReclassifyOptions::default(),
        );

        match result {
            Err(Error::UnmappedValues { path, values, nodata }) => {
                assert_eq!(path, Path::new("base.tif"));
                assert_eq!(values, vec![3.0, 7.0]);
                assert_eq!(nodata, Some(testutils::NOD));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn unmapped_values_become_nodata_when_not_required() -> Result<()> {
        let backend = testutils::memory_backend();
        testutils::add_raster(&backend, "base.tif", &array![[5.0, 7.0]], Some(testutils::NOD))?;

        reclassify_raster(
            &backend,
            &RasterPathBand::new("base.tif", 1),
            &ValueMap::from([(5.0, 100.0)]),
            Path::new("target.tif"),
            RasterDataType::Int32,
            Some(-9999.0),
            &ReclassifyOptions {
                values_required: false,
                ..Default::default()
            },
        )?;

        assert_eq!(backend.read_band("target.tif", 1)?, array![[100.0, -9999.0]]);
        Ok(())
    }
}
