//! Runs of consecutive output cells taken from one tile.

use crate::tile_store::TileHandle;

/// `length` cells of one tile starting at `start`.
///
/// Forward slabs are emitted in ascending position order. Reversed slabs are
/// emitted from `start + length - 1` down to `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCellSlab {
    pub tile: TileHandle,
    pub start: u64,
    pub length: u64,
    pub reversed: bool,
}

impl ResultCellSlab {
    /// Tile position of the `i`-th emitted cell.
    #[inline]
    pub fn position(&self, i: u64) -> u64 {
        if self.reversed {
            self.start + self.length - 1 - i
        } else {
            self.start + i
        }
    }

    /// Positions in emission order.
    pub fn positions(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.length).map(|i| self.position(i))
    }

    /// Split into the first `n` emitted cells and the rest.
    pub fn split_at(&self, n: u64) -> (Self, Self) {
        let n = n.min(self.length);
        let rest_len = self.length - n;
        if self.reversed {
            (
                Self { start: self.start + rest_len, length: n, ..*self },
                Self { start: self.start, length: rest_len, ..*self },
            )
        } else {
            (
                Self { start: self.start, length: n, ..*self },
                Self { start: self.start + n, length: rest_len, ..*self },
            )
        }
    }

    /// Whether the slab spans every cell of a tile with `cell_num` cells.
    pub fn covers_tile(&self, cell_num: u64) -> bool {
        self.start == 0 && self.length == cell_num
    }
}

/// Accumulates emitted cells, coalescing neighbours of the same tile.
#[derive(Debug, Default)]
pub(crate) struct SlabBuilder {
    slabs: Vec<ResultCellSlab>,
    cells: u64,
    reversed: bool,
}

impl SlabBuilder {
    pub fn new(reversed: bool) -> Self {
        Self {
            slabs: Vec::new(),
            cells: 0,
            reversed,
        }
    }

    pub fn push(&mut self, tile: TileHandle, pos: u64) {
        self.cells += 1;
        if let Some(last) = self.slabs.last_mut() {
            if last.tile == tile {
                if !self.reversed && last.start + last.length == pos {
                    last.length += 1;
                    return;
                }
                if self.reversed && pos + 1 == last.start {
                    last.start = pos;
                    last.length += 1;
                    return;
                }
            }
        }
        self.slabs.push(ResultCellSlab {
            tile,
            start: pos,
            length: 1,
            reversed: self.reversed,
        });
    }

    #[inline]
    pub fn cells(&self) -> u64 {
        self.cells
    }

    pub fn finish(self) -> Vec<ResultCellSlab> {
        self.slabs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles() -> (TileHandle, TileHandle) {
        (TileHandle::detached(0), TileHandle::detached(1))
    }

    #[test]
    fn forward_cells_coalesce_until_a_gap_or_tile_change() {
        let (a, b) = handles();
        let mut builder = SlabBuilder::new(false);
        for pos in [0, 1, 2, 4] {
            builder.push(a, pos);
        }
        builder.push(b, 5);
        builder.push(a, 5);
        assert_eq!(builder.cells(), 6);
        let slabs = builder.finish();
        let shape: Vec<(u64, u64)> = slabs.iter().map(|s| (s.start, s.length)).collect();
        assert_eq!(shape, vec![(0, 3), (4, 1), (5, 1), (5, 1)]);
    }

    #[test]
    fn reversed_slabs_emit_descending_positions() {
        let (a, _) = handles();
        let mut builder = SlabBuilder::new(true);
        for pos in [7, 6, 5, 3] {
            builder.push(a, pos);
        }
        let slabs = builder.finish();
        assert_eq!(slabs[0].positions().collect::<Vec<_>>(), vec![7, 6, 5]);
        assert_eq!(slabs[1].positions().collect::<Vec<_>>(), vec![3]);

        let (head, rest) = slabs[0].split_at(2);
        assert_eq!(head.positions().collect::<Vec<_>>(), vec![7, 6]);
        assert_eq!(rest.positions().collect::<Vec<_>>(), vec![5]);
    }
}
