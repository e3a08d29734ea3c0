use std::cmp::Ordering;

use tilemerge_result::{Error, Result};
use tilemerge_types::{ArraySchema, Datatype, NativeType};

/// Inclusive per-dimension ranges restricting a read. Dimensions without a
/// range read their whole domain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subarray {
    ranges: Vec<(String, Vec<u8>, Vec<u8>)>,
}

impl Subarray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict dimension `dim` to `[low, high]`. A later range on the same
    /// dimension replaces an earlier one.
    pub fn with_range<T: NativeType>(mut self, dim: &str, low: T, high: T) -> Self {
        let mut lo = Vec::with_capacity(T::SIZE);
        let mut hi = Vec::with_capacity(T::SIZE);
        low.write_le(&mut lo);
        high.write_le(&mut hi);
        self.ranges.retain(|(name, _, _)| name != dim);
        self.ranges.push((dim.to_string(), lo, hi));
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.ranges.is_empty()
    }

    pub(crate) fn resolve(&self, schema: &ArraySchema) -> Result<ResolvedSubarray> {
        let mut per_dim = vec![None; schema.dim_num()];
        for (name, lo, hi) in &self.ranges {
            let d = schema
                .dimensions
                .iter()
                .position(|dim| &dim.name == name)
                .ok_or_else(|| {
                    Error::InvalidArgumentError(format!("subarray names unknown dimension '{name}'"))
                })?;
            let dt = schema.dimensions[d].datatype;
            if lo.len() != dt.size() || hi.len() != dt.size() {
                return Err(Error::InvalidArgumentError(format!(
                    "subarray range for '{name}' is not encoded as {dt:?}"
                )));
            }
            if dt.compare(lo, hi) == Ordering::Greater {
                return Err(Error::InvalidArgumentError(format!(
                    "subarray range for '{name}' has low > high"
                )));
            }
            per_dim[d] = Some((lo.clone(), hi.clone()));
        }
        Ok(ResolvedSubarray {
            types: schema.dimensions.iter().map(|d| d.datatype).collect(),
            per_dim,
        })
    }
}

/// How a tile's bounding rectangle relates to the subarray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Overlap {
    None,
    Partial,
    Full,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedSubarray {
    types: Vec<Datatype>,
    per_dim: Vec<Option<(Vec<u8>, Vec<u8>)>>,
}

impl ResolvedSubarray {
    pub fn overlap(&self, mbr: &[(Vec<u8>, Vec<u8>)]) -> Overlap {
        let mut full = true;
        for (d, range) in self.per_dim.iter().enumerate() {
            let Some((lo, hi)) = range else { continue };
            let Some((mlo, mhi)) = mbr.get(d) else {
                return Overlap::Partial;
            };
            let dt = self.types[d];
            if dt.compare(mhi, lo) == Ordering::Less || dt.compare(mlo, hi) == Ordering::Greater {
                return Overlap::None;
            }
            if dt.compare(mlo, lo) == Ordering::Less || dt.compare(mhi, hi) == Ordering::Greater {
                full = false;
            }
        }
        if full { Overlap::Full } else { Overlap::Partial }
    }

    pub fn contains<'a>(&self, coord: impl Fn(usize) -> &'a [u8]) -> bool {
        self.per_dim.iter().enumerate().all(|(d, range)| match range {
            None => true,
            Some((lo, hi)) => {
                let v = coord(d);
                let dt = self.types[d];
                dt.compare(v, lo) != Ordering::Less && dt.compare(v, hi) != Ordering::Greater
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilemerge_types::{Dimension, encode_native};

    fn schema() -> ArraySchema {
        ArraySchema::new(
            vec![Dimension::new("x", 0i64, 100), Dimension::new("y", 0i64, 100)],
            vec![],
        )
        .unwrap()
    }

    fn mbr(x: (i64, i64), y: (i64, i64)) -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (encode_native(&[x.0]), encode_native(&[x.1])),
            (encode_native(&[y.0]), encode_native(&[y.1])),
        ]
    }

    #[test]
    fn classifies_tile_rectangles() {
        assert!(Subarray::new().is_unrestricted());
        assert!(!Subarray::new().with_range("x", 1i64, 2).is_unrestricted());
        let s = Subarray::new()
            .with_range("x", 10i64, 20)
            .resolve(&schema())
            .unwrap();
        assert_eq!(s.overlap(&mbr((12, 18), (0, 100))), Overlap::Full);
        assert_eq!(s.overlap(&mbr((5, 15), (0, 1))), Overlap::Partial);
        assert_eq!(s.overlap(&mbr((21, 30), (0, 1))), Overlap::None);
        let inside = [encode_native(&[10i64]), encode_native(&[99i64])];
        let outside = [encode_native(&[9i64]), encode_native(&[50i64])];
        assert!(s.contains(|d| inside[d].as_slice()));
        assert!(!s.contains(|d| outside[d].as_slice()));
    }

    #[test]
    fn rejects_unknown_or_inverted_ranges() {
        assert!(Subarray::new().with_range("z", 0i64, 1).resolve(&schema()).is_err());
        assert!(Subarray::new().with_range("x", 5i64, 1).resolve(&schema()).is_err());
        assert!(Subarray::new().with_range("x", 0u8, 1).resolve(&schema()).is_err());
    }
}
