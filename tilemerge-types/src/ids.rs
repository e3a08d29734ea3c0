//! Identifier types shared across the read path.

use bitcode::{Decode, Encode};

/// Position of a fragment in the fixed fragment list handed to a reader.
pub type FragmentIdx = usize;

/// Index of a tile within its fragment.
pub type TileIdx = u64;

/// Per-fragment read cursor.
///
/// `cell_idx` counts the cells of tile `tile_idx` already consumed in visit
/// order (ascending positions for forward reads, descending for reverse
/// reads), so `cell_idx > 0` always means the tile has contributed results.
/// A value equal to the tile's cell count means the tile is exhausted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct FragIdx {
    pub tile_idx: TileIdx,
    pub cell_idx: u64,
}

impl FragIdx {
    #[inline]
    pub const fn new(tile_idx: TileIdx, cell_idx: u64) -> Self {
        Self { tile_idx, cell_idx }
    }
}

/// Identifies one tile of one fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResultTileId {
    pub fragment_idx: FragmentIdx,
    pub tile_idx: TileIdx,
}

impl ResultTileId {
    #[inline]
    pub const fn new(fragment_idx: FragmentIdx, tile_idx: TileIdx) -> Self {
        Self {
            fragment_idx,
            tile_idx,
        }
    }
}
