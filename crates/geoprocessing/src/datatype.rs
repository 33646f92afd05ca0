use std::fmt;

use crate::{Error, Result};

/// Pixel type of a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RasterDataType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    #[default]
    Float64,
}

impl RasterDataType {
    pub fn is_integer(&self) -> bool {
        !matches!(self, RasterDataType::Float32 | RasterDataType::Float64)
    }

    pub fn bytes(&self) -> usize {
        match self {
            RasterDataType::Uint8 | RasterDataType::Int8 => 1,
            RasterDataType::Uint16 | RasterDataType::Int16 => 2,
            RasterDataType::Uint32 | RasterDataType::Int32 | RasterDataType::Float32 => 4,
            RasterDataType::Uint64 | RasterDataType::Int64 | RasterDataType::Float64 => 8,
        }
    }

    /// Check if the value can be represented by this type without saturation.
    pub fn fits(&self, value: f64) -> bool {
        use inf::cast::fits_in_type;

        match self {
            RasterDataType::Uint8 => fits_in_type::<u8>(value),
            RasterDataType::Int8 => fits_in_type::<i8>(value),
            RasterDataType::Uint16 => fits_in_type::<u16>(value),
            RasterDataType::Int16 => fits_in_type::<i16>(value),
            RasterDataType::Uint32 => fits_in_type::<u32>(value),
            RasterDataType::Int32 => fits_in_type::<i32>(value),
            RasterDataType::Uint64 => fits_in_type::<u64>(value),
            RasterDataType::Int64 => fits_in_type::<i64>(value),
            RasterDataType::Float32 => value.is_nan() || value.is_infinite() || value.abs() <= f32::MAX as f64,
            RasterDataType::Float64 => true,
        }
    }

    /// Converts the value to the closest value representable by this type.
    /// Integer types round to the nearest integer and saturate at the type bounds.
    pub fn coerce(&self, value: f64) -> f64 {
        use inf::cast::saturating;

        match self {
            RasterDataType::Uint8 => saturating::<u8>(value.round()) as f64,
            RasterDataType::Int8 => saturating::<i8>(value.round()) as f64,
            RasterDataType::Uint16 => saturating::<u16>(value.round()) as f64,
            RasterDataType::Int16 => saturating::<i16>(value.round()) as f64,
            RasterDataType::Uint32 => saturating::<u32>(value.round()) as f64,
            RasterDataType::Int32 => saturating::<i32>(value.round()) as f64,
            RasterDataType::Uint64 => saturating::<u64>(value.round()) as f64,
            RasterDataType::Int64 => saturating::<i64>(value.round()) as f64,
            RasterDataType::Float32 => value as f32 as f64,
            RasterDataType::Float64 => value,
        }
    }

    /// Validates a nodata value for this type, returns the value as stored in a band of this type.
    pub fn checked_nodata(&self, nodata: Option<f64>) -> Result<Option<f64>> {
        match nodata {
            Some(nod) if !(nod.is_nan() && !self.is_integer()) && !self.fits(nod) => Err(Error::InvalidArgument(format!(
                "Nodata value {nod} does not fit in data type {self}"
            ))),
            Some(nod) => Ok(Some(self.coerce(nod))),
            None => Ok(None),
        }
    }
}

impl fmt::Display for RasterDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RasterDataType::Uint8 => "Byte",
            RasterDataType::Int8 => "Int8",
            RasterDataType::Uint16 => "UInt16",
            RasterDataType::Int16 => "Int16",
            RasterDataType::Uint32 => "UInt32",
            RasterDataType::Int32 => "Int32",
            RasterDataType::Uint64 => "UInt64",
            RasterDataType::Int64 => "Int64",
            RasterDataType::Float32 => "Float32",
            RasterDataType::Float64 => "Float64",
        };

        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_integer_types() {
        assert_eq!(RasterDataType::Uint8.coerce(2.6), 3.0);
        assert_eq!(RasterDataType::Uint8.coerce(-4.0), 0.0);
        assert_eq!(RasterDataType::Uint8.coerce(1000.0), 255.0);
        assert_eq!(RasterDataType::Int16.coerce(-2.5), -3.0);
        assert_eq!(RasterDataType::Int32.coerce(f64::NAN), 0.0);
    }

    #[test]
    fn coerce_float_types() {
        assert_eq!(RasterDataType::Float64.coerce(0.1), 0.1);
        assert_eq!(RasterDataType::Float32.coerce(0.1), 0.1f32 as f64);
        assert!(RasterDataType::Float32.coerce(f64::NAN).is_nan());
    }

    #[test]
    fn nodata_validation() {
        assert!(RasterDataType::Uint8.checked_nodata(Some(-1.0)).is_err());
        assert_eq!(RasterDataType::Uint8.checked_nodata(Some(255.0)).unwrap(), Some(255.0));
        assert_eq!(RasterDataType::Int32.checked_nodata(None).unwrap(), None);
        assert!(RasterDataType::Float32.checked_nodata(Some(f64::NAN)).unwrap().unwrap().is_nan());
        assert_eq!(
            RasterDataType::Float32.checked_nodata(Some(f32::MIN as f64)).unwrap(),
            Some(f32::MIN as f64)
        );
    }
}
