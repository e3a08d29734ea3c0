use std::cmp::Ordering;

use crate::datatype::Datatype;

/// A single numeric value produced by an aggregate or read from tile
/// statistics.
///
/// Integers are widened so that sums over a whole array cannot overflow in
/// practice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Int(i128),
    UInt(u128),
    Float(f64),
}

impl ScalarValue {
    /// Decode one cell of `datatype` into the matching variant.
    ///
    /// Returns `None` for non-numeric types.
    pub fn from_le_bytes(datatype: Datatype, bytes: &[u8]) -> Option<Self> {
        if datatype.is_signed_integer() {
            Some(ScalarValue::Int(datatype.as_i128(bytes)))
        } else if datatype.is_unsigned_integer() {
            Some(ScalarValue::UInt(datatype.as_i128(bytes) as u128))
        } else if datatype.is_float() {
            Some(ScalarValue::Float(datatype.as_f64(bytes)))
        } else {
            None
        }
    }

    /// Add two values of the same family. Mixed families promote to float.
    pub fn add(self, other: Self) -> Self {
        match (self, other) {
            (ScalarValue::Int(a), ScalarValue::Int(b)) => ScalarValue::Int(a.wrapping_add(b)),
            (ScalarValue::UInt(a), ScalarValue::UInt(b)) => ScalarValue::UInt(a.wrapping_add(b)),
            (a, b) => ScalarValue::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            ScalarValue::Int(v) => v as f64,
            ScalarValue::UInt(v) => v as f64,
            ScalarValue::Float(v) => v,
        }
    }

    /// Total order used by min/max accumulation.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ScalarValue::Int(a), ScalarValue::Int(b)) => a.cmp(b),
            (ScalarValue::UInt(a), ScalarValue::UInt(b)) => a.cmp(b),
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }

    pub fn min(self, other: Self) -> Self {
        if other.total_cmp(&self) == Ordering::Less {
            other
        } else {
            self
        }
    }

    pub fn max(self, other: Self) -> Self {
        if other.total_cmp(&self) == Ordering::Greater {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::UInt(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::encode_native;

    #[test]
    fn decode_picks_family_by_datatype() {
        let b = encode_native(&[-7i16]);
        assert_eq!(
            ScalarValue::from_le_bytes(Datatype::Int16, &b),
            Some(ScalarValue::Int(-7))
        );
        let b = encode_native(&[u64::MAX]);
        assert_eq!(
            ScalarValue::from_le_bytes(Datatype::UInt64, &b),
            Some(ScalarValue::UInt(u64::MAX as u128))
        );
        assert_eq!(ScalarValue::from_le_bytes(Datatype::Blob, b"x"), None);
    }

    #[test]
    fn min_max_and_add() {
        let a = ScalarValue::Int(3);
        let b = ScalarValue::Int(-4);
        assert_eq!(a.min(b), b);
        assert_eq!(a.max(b), a);
        assert_eq!(a.add(b), ScalarValue::Int(-1));
        assert_eq!(
            ScalarValue::Float(0.5).add(ScalarValue::Int(1)),
            ScalarValue::Float(1.5)
        );
    }
}
