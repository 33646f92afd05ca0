use num::NumCast;

/// Check if a f64 value fits in a given numerical type.
pub fn fits_in_type<T: NumCast>(v: f64) -> bool {
    let x: Option<T> = NumCast::from(v);
    x.is_some()
}

/// Converts the value to the target type, saturating at the bounds of the type.
/// NaN maps to the default value of the target type.
pub fn saturating<To: NumCast + num::Bounded + Default>(v: f64) -> To {
    if v.is_nan() {
        return To::default();
    }

    match NumCast::from(v) {
        Some(x) => x,
        None if v < 0.0 => To::min_value(),
        None => To::max_value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits() {
        assert!(fits_in_type::<u8>(255.0));
        assert!(!fits_in_type::<u8>(256.0));
        assert!(!fits_in_type::<i16>(-40000.0));
    }

    #[test]
    fn saturating_cast() {
        assert_eq!(saturating::<u8>(300.0), 255);
        assert_eq!(saturating::<u8>(-3.0), 0);
        assert_eq!(saturating::<i16>(-1e9), i16::MIN);
        assert_eq!(saturating::<i32>(f64::NAN), 0);
        assert_eq!(saturating::<i32>(12.0), 12);
    }
}
