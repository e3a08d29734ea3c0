//! Physical datatypes and typed views over little-endian cell bytes.
//!
//! Tiles arrive from the loader as raw little-endian byte buffers. Everything
//! on the read path that needs to look at a value (comparators, the Hilbert
//! mapper, aggregates) goes through [`Datatype`] so the byte layout is decided
//! in exactly one place.

use std::cmp::Ordering;

/// A tag describing the physical type of a dimension or attribute cell.
///
/// `StringAscii` and `Blob` are element types of var-sized attributes; their
/// element size is one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    StringAscii,
    Blob,
}

macro_rules! dispatch_native {
    ($dt:expr, $T:ident => $body:expr, other => $other:expr) => {
        match $dt {
            Datatype::Int8 => {
                type $T = i8;
                $body
            }
            Datatype::Int16 => {
                type $T = i16;
                $body
            }
            Datatype::Int32 => {
                type $T = i32;
                $body
            }
            Datatype::Int64 => {
                type $T = i64;
                $body
            }
            Datatype::UInt8 => {
                type $T = u8;
                $body
            }
            Datatype::UInt16 => {
                type $T = u16;
                $body
            }
            Datatype::UInt32 => {
                type $T = u32;
                $body
            }
            Datatype::UInt64 => {
                type $T = u64;
                $body
            }
            Datatype::Float32 => {
                type $T = f32;
                $body
            }
            Datatype::Float64 => {
                type $T = f64;
                $body
            }
            Datatype::StringAscii | Datatype::Blob => $other,
        }
    };
}

impl Datatype {
    /// Size in bytes of one element.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Datatype::Int8 | Datatype::UInt8 | Datatype::StringAscii | Datatype::Blob => 1,
            Datatype::Int16 | Datatype::UInt16 => 2,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::UInt64 | Datatype::Float64 => 8,
        }
    }

    #[inline]
    pub const fn is_signed_integer(self) -> bool {
        matches!(
            self,
            Datatype::Int8 | Datatype::Int16 | Datatype::Int32 | Datatype::Int64
        )
    }

    #[inline]
    pub const fn is_unsigned_integer(self) -> bool {
        matches!(
            self,
            Datatype::UInt8 | Datatype::UInt16 | Datatype::UInt32 | Datatype::UInt64
        )
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Datatype::Float32 | Datatype::Float64)
    }

    /// Whether values of this type have a numeric interpretation.
    #[inline]
    pub const fn is_numeric(self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer() || self.is_float()
    }

    /// Compare two encoded values.
    ///
    /// Numeric types compare by value (floats by IEEE total order); byte
    /// types compare lexicographically over the whole slice.
    #[inline]
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        dispatch_native!(self, T => {
            T::read_le(a).native_cmp(&T::read_le(b))
        }, other => a.cmp(b))
    }

    /// Read a numeric value as a signed 128-bit integer. Floats truncate.
    #[inline]
    pub fn as_i128(self, bytes: &[u8]) -> i128 {
        dispatch_native!(self, T => T::read_le(bytes).to_i128(), other => 0)
    }

    /// Read a numeric value as `f64`.
    #[inline]
    pub fn as_f64(self, bytes: &[u8]) -> f64 {
        dispatch_native!(self, T => T::read_le(bytes).to_f64(), other => 0.0)
    }
}

/// Rust primitive that backs a numeric [`Datatype`].
///
/// Used for typed access to result buffers and for building tiles in tests.
pub trait NativeType: Copy + Send + Sync + PartialOrd + std::fmt::Debug + 'static {
    const DATATYPE: Datatype;
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;

    /// Append the little-endian encoding to `out`.
    fn write_le(self, out: &mut Vec<u8>);

    fn native_cmp(&self, other: &Self) -> Ordering;

    fn to_i128(self) -> i128;

    fn to_f64(self) -> f64;
}

macro_rules! impl_native_int {
    ($($t:ty => $dt:ident),* $(,)?) => {$(
        impl NativeType for $t {
            const DATATYPE: Datatype = Datatype::$dt;
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..Self::SIZE]);
                <$t>::from_le_bytes(buf)
            }

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn native_cmp(&self, other: &Self) -> Ordering {
                self.cmp(other)
            }

            #[inline]
            fn to_i128(self) -> i128 {
                self as i128
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    )*};
}

macro_rules! impl_native_float {
    ($($t:ty => $dt:ident),* $(,)?) => {$(
        impl NativeType for $t {
            const DATATYPE: Datatype = Datatype::$dt;
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..Self::SIZE]);
                <$t>::from_le_bytes(buf)
            }

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn native_cmp(&self, other: &Self) -> Ordering {
                self.total_cmp(other)
            }

            #[inline]
            fn to_i128(self) -> i128 {
                self as i128
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    )*};
}

impl_native_int!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
);

impl_native_float!(f32 => Float32, f64 => Float64);

/// Encode a slice of native values as one little-endian buffer.
pub fn encode_native<T: NativeType>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    for v in values {
        v.write_le(&mut out);
    }
    out
}

/// Decode a little-endian buffer into native values. Trailing bytes that do
/// not form a whole element are ignored.
pub fn decode_native<T: NativeType>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_le).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_compare_is_numeric_not_bytewise() {
        let a = encode_native(&[-1i32]);
        let b = encode_native(&[1i32]);
        assert_eq!(Datatype::Int32.compare(&a, &b), Ordering::Less);
        // Bytewise, 0xFF.. would sort after 0x01..
        assert_eq!(a.cmp(&b), Ordering::Greater);
    }

    #[test]
    fn float_compare_uses_total_order() {
        let neg_zero = encode_native(&[-0.0f64]);
        let pos_zero = encode_native(&[0.0f64]);
        assert_eq!(
            Datatype::Float64.compare(&neg_zero, &pos_zero),
            Ordering::Less
        );
    }

    #[test]
    fn byte_types_compare_lexicographically() {
        assert_eq!(
            Datatype::StringAscii.compare(b"ab", b"b"),
            Ordering::Less
        );
        assert_eq!(Datatype::StringAscii.size(), 1);
    }

    #[test]
    fn numeric_readers() {
        let v = encode_native(&[250u8]);
        assert_eq!(Datatype::UInt8.as_i128(&v), 250);
        let f = encode_native(&[2.5f32]);
        assert_eq!(Datatype::Float32.as_f64(&f), 2.5);
        assert_eq!(decode_native::<u8>(&v), vec![250u8]);
    }
}
