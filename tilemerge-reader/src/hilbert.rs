//! Hilbert curve index over normalized cell coordinates.
//!
//! Uses Skilling's transpose formulation ("Programming the Hilbert curve",
//! 2004). Each dimension gets `63 / dim_num` bits so the interleaved index
//! fits a `u64`.

use tilemerge_types::{Datatype, Dimension};

#[derive(Debug, Clone)]
pub struct HilbertMapper {
    bits: u32,
    dims: Vec<DimensionRange>,
}

#[derive(Debug, Clone)]
struct DimensionRange {
    datatype: Datatype,
    low: Vec<u8>,
    high: Vec<u8>,
}

impl HilbertMapper {
    pub fn new(dimensions: &[Dimension]) -> Self {
        let dim_num = dimensions.len().max(1) as u32;
        Self {
            bits: (63 / dim_num).max(1),
            dims: dimensions
                .iter()
                .map(|d| DimensionRange {
                    datatype: d.datatype,
                    low: d.domain.0.clone(),
                    high: d.domain.1.clone(),
                })
                .collect(),
        }
    }

    /// Hilbert index of a cell given one encoded value per dimension.
    pub fn index(&self, coords: &[&[u8]]) -> u64 {
        let mut x: Vec<u64> = self
            .dims
            .iter()
            .zip(coords)
            .map(|(d, c)| self.normalize(d, c))
            .collect();
        axes_to_transpose(&mut x, self.bits);
        interleave(&x, self.bits)
    }

    /// Map a coordinate onto `[0, 2^bits - 1]` relative to the domain.
    fn normalize(&self, dim: &DimensionRange, value: &[u8]) -> u64 {
        let max_bucket = (1u64 << self.bits) - 1;
        if dim.datatype.is_float() {
            let lo = dim.datatype.as_f64(&dim.low);
            let hi = dim.datatype.as_f64(&dim.high);
            let v = dim.datatype.as_f64(value);
            if hi <= lo {
                return 0;
            }
            let norm = ((v - lo) / (hi - lo)).clamp(0.0, 1.0);
            (norm * max_bucket as f64) as u64
        } else {
            let lo = dim.datatype.as_i128(&dim.low);
            let hi = dim.datatype.as_i128(&dim.high);
            let v = dim.datatype.as_i128(value).clamp(lo, hi);
            let span = (hi - lo) as u128;
            if span == 0 {
                return 0;
            }
            let offset = (v - lo) as u128;
            if span <= max_bucket as u128 {
                offset as u64
            } else {
                (offset * max_bucket as u128 / span) as u64
            }
        }
    }
}

fn axes_to_transpose(x: &mut [u64], bits: u32) {
    let n = x.len();
    if n == 0 {
        return;
    }
    let m = 1u64 << (bits - 1);

    // Inverse undo.
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode.
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }
}

fn interleave(x: &[u64], bits: u32) -> u64 {
    let mut h = 0u64;
    for b in (0..bits).rev() {
        for v in x {
            h = (h << 1) | ((v >> b) & 1);
        }
    }
    h
}
