//! Helpers to deal with nodata values in `f64` pixel buffers.

/// Check if the value should be treated as nodata.
/// NaN values are always considered nodata.
#[inline]
pub fn is_nodata(value: f64, nodata: Option<f64>) -> bool {
    if value.is_nan() {
        return true;
    }

    nodata.is_some_and(|nod| value == nod)
}

#[inline]
pub fn is_valid(value: f64, nodata: Option<f64>) -> bool {
    !is_nodata(value, nodata)
}

/// Returns an integer that is not present in the sorted list of values.
/// Used to pick a nodata value that does not collide with any of the values.
pub fn find_int_not_in_sorted(values: &[i64]) -> Option<i64> {
    let (first, last) = match (values.first(), values.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Some(0),
    };

    if (last - first) as usize == values.len() - 1 {
        // consecutive values, pick a value just outside of the range
        if first != i32::MIN as i64 {
            return Some(first - 1);
        } else if last != i32::MAX as i64 {
            return Some(last + 1);
        }

        return None;
    }

    // binary search for a gap
    let mut left = 0;
    let mut right = values.len() - 1;
    while right - left > 1 {
        let mid = (left + right) / 2;
        if values[mid] - values[left] > (mid - left) as i64 {
            right = mid;
        } else {
            left = mid;
        }
    }

    Some(values[left] + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodata_checks() {
        assert!(is_nodata(-1.0, Some(-1.0)));
        assert!(!is_nodata(1.0, Some(-1.0)));
        assert!(!is_nodata(1.0, None));
        assert!(is_nodata(f64::NAN, None));
        assert!(is_nodata(f64::NAN, Some(f64::NAN)));
    }

    #[test]
    fn int_not_in_array() {
        assert_eq!(find_int_not_in_sorted(&[1, 2, 3]), Some(0));
        assert_eq!(find_int_not_in_sorted(&[i32::MIN as i64, i32::MIN as i64 + 1]), Some(i32::MIN as i64 + 2));
        assert_eq!(find_int_not_in_sorted(&[1, 2, 4, 5]), Some(3));
        assert_eq!(find_int_not_in_sorted(&[0, 10, 11, 12, 13]), Some(1));
        assert_eq!(find_int_not_in_sorted(&[]), Some(0));
        // dense zone ids
        assert_eq!(find_int_not_in_sorted(&[0, 1, 2, 3]), Some(-1));

        let values = [-3, -2, 0, 7];
        let free = find_int_not_in_sorted(&values).unwrap();
        assert!(!values.contains(&free));
    }
}
