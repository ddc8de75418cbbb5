//! Generic kernels shared by all fixed-width column variants.

use std::cmp::Ordering;

use strata_error::{Result, StrataError};
use strata_types::Field;

/// A native element type backing a numeric column.
pub trait NativeValue: Copy + PartialEq + Send + Sync + 'static {
    /// Compare two values under the NaN direction hint: `hint > 0` sorts
    /// NaN greatest, `hint < 0` least; two NaNs are equal.
    fn cmp_native(a: Self, b: Self, nan_hint: i8) -> Ordering;

    fn is_nan_value(self) -> bool {
        false
    }

    fn to_field(self) -> Field;

    /// Raw little-endian bits, zero-extended to 64. Used for packed hash
    /// keys; round-trips through [`NativeValue::from_u64_bits`].
    fn to_u64_bits(self) -> u64;

    fn from_u64_bits(bits: u64) -> Self;

    fn from_field(field: &Field) -> Option<Self>;
}

macro_rules! impl_native_uint {
    ($($t:ty),*) => {$(
        impl NativeValue for $t {
            #[inline]
            fn cmp_native(a: Self, b: Self, _nan_hint: i8) -> Ordering {
                a.cmp(&b)
            }
            #[inline]
            fn to_field(self) -> Field {
                Field::UInt64(u64::from(self))
            }
            #[inline]
            fn to_u64_bits(self) -> u64 {
                u64::from(self)
            }
            #[inline]
            #[allow(clippy::cast_possible_truncation)]
            fn from_u64_bits(bits: u64) -> Self {
                bits as $t
            }
            #[inline]
            #[allow(clippy::cast_possible_truncation)]
            fn from_field(field: &Field) -> Option<Self> {
                match field {
                    Field::UInt64(v) => Some(*v as $t),
                    Field::Int64(v) => Some(*v as u64 as $t),
                    _ => None,
                }
            }
        }
    )*};
}

macro_rules! impl_native_int {
    ($($t:ty => $u:ty),*) => {$(
        impl NativeValue for $t {
            #[inline]
            fn cmp_native(a: Self, b: Self, _nan_hint: i8) -> Ordering {
                a.cmp(&b)
            }
            #[inline]
            fn to_field(self) -> Field {
                Field::Int64(i64::from(self))
            }
            #[inline]
            #[allow(clippy::cast_sign_loss)]
            fn to_u64_bits(self) -> u64 {
                u64::from(self as $u)
            }
            #[inline]
            #[allow(clippy::cast_possible_truncation)]
            fn from_u64_bits(bits: u64) -> Self {
                bits as $t
            }
            #[inline]
            #[allow(clippy::cast_possible_truncation)]
            fn from_field(field: &Field) -> Option<Self> {
                match field {
                    Field::Int64(v) => Some(*v as $t),
                    Field::UInt64(v) => Some(*v as $t),
                    _ => None,
                }
            }
        }
    )*};
}

impl_native_uint!(u8, u16, u32, u64);
impl_native_int!(i8 => u8, i16 => u16, i32 => u32, i64 => u64);

macro_rules! impl_native_float {
    ($($t:ty => $bits:ty),*) => {$(
        impl NativeValue for $t {
            #[inline]
            fn cmp_native(a: Self, b: Self, nan_hint: i8) -> Ordering {
                match (a.is_nan(), b.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => {
                        if nan_hint > 0 { Ordering::Greater } else { Ordering::Less }
                    }
                    (false, true) => {
                        if nan_hint > 0 { Ordering::Less } else { Ordering::Greater }
                    }
                    (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                }
            }
            #[inline]
            fn is_nan_value(self) -> bool {
                self.is_nan()
            }
            #[inline]
            fn to_field(self) -> Field {
                Field::Float64(f64::from(self))
            }
            #[inline]
            fn to_u64_bits(self) -> u64 {
                u64::from(self.to_bits())
            }
            #[inline]
            #[allow(clippy::cast_possible_truncation)]
            fn from_u64_bits(bits: u64) -> Self {
                <$t>::from_bits(bits as $bits)
            }
            #[inline]
            #[allow(clippy::cast_possible_truncation)]
            fn from_field(field: &Field) -> Option<Self> {
                match field {
                    Field::Float64(v) => Some(*v as $t),
                    Field::UInt64(v) => Some(*v as $t),
                    Field::Int64(v) => Some(*v as $t),
                    _ => None,
                }
            }
        }
    )*};
}

impl_native_float!(f32 => u32, f64 => u64);

/// Keep rows whose mask byte is non-zero. Output length = popcount.
pub fn filter_vec<T: NativeValue>(data: &[T], mask: &[u8]) -> Result<Vec<T>> {
    if data.len() != mask.len() {
        return Err(StrataError::SizesMismatch {
            what: "column and filter",
            left: data.len(),
            right: mask.len(),
        });
    }
    let kept = mask.iter().filter(|&&m| m != 0).count();
    let mut out = Vec::with_capacity(kept);
    for (value, &m) in data.iter().zip(mask.iter()) {
        if m != 0 {
            out.push(*value);
        }
    }
    Ok(out)
}

/// Reorder rows by `perm`, truncated to `limit` when non-zero.
pub fn permute_vec<T: NativeValue>(data: &[T], perm: &[usize], limit: usize) -> Result<Vec<T>> {
    let out_len = permuted_len(data.len(), perm, limit)?;
    let mut out = Vec::with_capacity(out_len);
    for &p in &perm[..out_len] {
        out.push(data[p]);
    }
    Ok(out)
}

/// Output length of a permute, after bounds validation.
pub fn permuted_len(len: usize, perm: &[usize], limit: usize) -> Result<usize> {
    let out_len = if limit == 0 {
        perm.len()
    } else {
        perm.len().min(limit)
    };
    if let Some(&bad) = perm[..out_len].iter().find(|&&p| p >= len) {
        return Err(StrataError::ParameterOutOfBound {
            detail: format!("permutation index {bad} out of range {len}"),
        });
    }
    Ok(out_len)
}

/// Repeat row `i` `offsets[i] - offsets[i-1]` times.
pub fn replicate_vec<T: NativeValue>(data: &[T], offsets: &[u64]) -> Result<Vec<T>> {
    if data.len() != offsets.len() {
        return Err(StrataError::SizesMismatch {
            what: "column and replicate offsets",
            left: data.len(),
            right: offsets.len(),
        });
    }
    let total = offsets.last().copied().unwrap_or(0) as usize;
    let mut out = Vec::with_capacity(total);
    let mut prev = 0_u64;
    for (value, &off) in data.iter().zip(offsets.iter()) {
        for _ in prev..off {
            out.push(*value);
        }
        prev = off;
    }
    Ok(out)
}

/// Minimum and maximum over the data, skipping NaNs. Empty input and
/// all-NaN input yield `None`.
pub fn extremes_vec<T: NativeValue>(data: &[T]) -> Option<(T, T)> {
    let mut iter = data.iter().copied().filter(|v| !v.is_nan_value());
    let first = iter.next()?;
    let mut min = first;
    let mut max = first;
    for v in iter {
        if T::cmp_native(v, min, 1) == Ordering::Less {
            min = v;
        }
        if T::cmp_native(v, max, 1) == Ordering::Greater {
            max = v;
        }
    }
    Some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_popcount() {
        let data = [1_u32, 2, 3, 4];
        let filtered = filter_vec(&data, &[1, 0, 1, 0]).expect("filter");
        assert_eq!(filtered, vec![1, 3]);
        assert!(filter_vec(&data, &[1, 0]).is_err());
    }

    #[test]
    fn test_replicate_lengths() {
        let data = [7_i64, 8, 9];
        let out = replicate_vec(&data, &[2, 2, 5]).expect("replicate");
        assert_eq!(out, vec![7, 7, 9, 9, 9]);
    }

    #[test]
    fn test_extremes_skip_nan() {
        let data = [f64::NAN, 3.0, -1.0, f64::NAN];
        let (min, max) = extremes_vec(&data).expect("extremes");
        assert_eq!(min, -1.0);
        assert_eq!(max, 3.0);
        assert!(extremes_vec::<f64>(&[f64::NAN]).is_none());
    }

    #[test]
    fn test_permute_limit() {
        let data = [10_u8, 20, 30];
        let out = permute_vec(&data, &[2, 0, 1], 2).expect("permute");
        assert_eq!(out, vec![30, 10]);
    }
}
