//! Global cell order of an array.

use std::cmp::Ordering;

use tilemerge_storage::CellCoords;
use tilemerge_types::{ArraySchema, Datatype, Layout};

use crate::hilbert::HilbertMapper;
use crate::result_tile::ResultTile;

/// A cell position in global order, detached from any tile.
///
/// Used for tile bounds in the preprocessed tile stream and for merge
/// bounds. `hilbert` is zero unless the array uses Hilbert order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalCoords {
    pub hilbert: u64,
    pub coords: CellCoords,
}

/// Compares cells by the array's cell order.
///
/// Row-major compares dimensions first to last, column-major last to first,
/// and Hilbert compares the Hilbert index first and breaks ties row-major.
#[derive(Debug, Clone)]
pub struct GlobalOrder {
    layout: Layout,
    dims: Vec<Datatype>,
    hilbert: Option<HilbertMapper>,
}

impl GlobalOrder {
    pub fn new(schema: &ArraySchema) -> Self {
        let hilbert = match schema.cell_order {
            Layout::Hilbert => Some(HilbertMapper::new(&schema.dimensions)),
            _ => None,
        };
        Self {
            layout: schema.cell_order,
            dims: schema.dimensions.iter().map(|d| d.datatype).collect(),
            hilbert,
        }
    }

    #[inline]
    pub fn is_hilbert(&self) -> bool {
        self.hilbert.is_some()
    }

    /// Hilbert index of a cell, or zero for other layouts.
    pub fn hilbert_value(&self, coords: &[&[u8]]) -> u64 {
        self.hilbert.as_ref().map_or(0, |h| h.index(coords))
    }

    pub fn global_coords(&self, coords: CellCoords) -> GlobalCoords {
        let refs: Vec<&[u8]> = coords.iter().map(Vec::as_slice).collect();
        let hilbert = self.hilbert_value(&refs);
        GlobalCoords { hilbert, coords }
    }

    /// Compare coordinates only, ignoring any Hilbert value.
    fn cmp_dims<'a>(
        &self,
        a: impl Fn(usize) -> &'a [u8],
        b: impl Fn(usize) -> &'a [u8],
    ) -> Ordering {
        let n = self.dims.len();
        let cmp_dim = |d: usize| self.dims[d].compare(a(d), b(d));
        match self.layout {
            Layout::ColMajor => {
                for d in (0..n).rev() {
                    let ord = cmp_dim(d);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
            Layout::RowMajor | Layout::Hilbert => {
                for d in 0..n {
                    let ord = cmp_dim(d);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
        Ordering::Equal
    }

    /// Ascending global order of two raw coordinate tuples.
    pub fn cmp_coords(&self, a: &[&[u8]], b: &[&[u8]]) -> Ordering {
        let h = if self.is_hilbert() {
            self.hilbert_value(a).cmp(&self.hilbert_value(b))
        } else {
            Ordering::Equal
        };
        h.then_with(|| self.cmp_dims(|d| a[d], |d| b[d]))
    }

    /// Ascending global order of two tile cells.
    #[inline]
    pub fn cmp_cells(&self, a: &ResultTile, a_pos: u64, b: &ResultTile, b_pos: u64) -> Ordering {
        a.hilbert(a_pos)
            .cmp(&b.hilbert(b_pos))
            .then_with(|| self.cmp_dims(|d| a.coord(d, a_pos), |d| b.coord(d, b_pos)))
    }

    /// Ascending global order of a tile cell against detached coordinates.
    #[inline]
    pub fn cmp_cell_to(&self, a: &ResultTile, a_pos: u64, b: &GlobalCoords) -> Ordering {
        a.hilbert(a_pos)
            .cmp(&b.hilbert)
            .then_with(|| self.cmp_dims(|d| a.coord(d, a_pos), |d| b.coords[d].as_slice()))
    }

    pub fn cmp_global(&self, a: &GlobalCoords, b: &GlobalCoords) -> Ordering {
        a.hilbert
            .cmp(&b.hilbert)
            .then_with(|| self.cmp_dims(|d| a.coords[d].as_slice(), |d| b.coords[d].as_slice()))
    }

    /// Owned comparator suitable for sorting fixture cells.
    pub fn sorter(&self) -> impl Fn(&[&[u8]], &[&[u8]]) -> Ordering + 'static {
        let order = self.clone();
        move |a: &[&[u8]], b: &[&[u8]]| order.cmp_coords(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilemerge_types::{Dimension, encode_native};

    fn cell(x: i32, y: i32) -> CellCoords {
        vec![encode_native(&[x]), encode_native(&[y])]
    }

    fn schema(layout: Layout) -> ArraySchema {
        ArraySchema::new(
            vec![Dimension::new("x", 0i32, 3), Dimension::new("y", 0i32, 3)],
            vec![],
        )
        .unwrap()
        .with_cell_order(layout)
    }

    #[test]
    fn row_and_col_major_disagree_on_off_diagonal_cells() {
        let a = cell(0, 1);
        let b = cell(1, 0);
        let row = GlobalOrder::new(&schema(Layout::RowMajor));
        let col = GlobalOrder::new(&schema(Layout::ColMajor));
        let ga = row.global_coords(a.clone());
        let gb = row.global_coords(b.clone());
        assert_eq!(row.cmp_global(&ga, &gb), Ordering::Less);
        let ga = col.global_coords(a);
        let gb = col.global_coords(b);
        assert_eq!(col.cmp_global(&ga, &gb), Ordering::Greater);
    }

    #[test]
    fn hilbert_orders_by_curve_then_coords() {
        let order = GlobalOrder::new(&schema(Layout::Hilbert));
        let g = |x, y| order.global_coords(cell(x, y));
        // Equal cells compare equal; distinct cells never do.
        assert_eq!(order.cmp_global(&g(2, 3), &g(2, 3)), Ordering::Equal);
        let mut cells: Vec<GlobalCoords> = (0..4)
            .flat_map(|x| (0..4).map(move |y| (x, y)))
            .map(|(x, y)| g(x, y))
            .collect();
        cells.sort_by(|a, b| order.cmp_global(a, b));
        for w in cells.windows(2) {
            assert!(w[0].hilbert <= w[1].hilbert);
            assert_ne!(order.cmp_global(&w[0], &w[1]), Ordering::Equal);
        }
    }
}
