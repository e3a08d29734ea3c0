//! Contracts the read path consumes from the storage layer.
//!
//! The reader never touches an on-disk format. It asks a [`FragmentMetadata`]
//! for sizes, bounds and statistics, and a [`TileLoader`] for decoded bytes.

use std::sync::Arc;

use tilemerge_result::Result;
use tilemerge_types::{FragmentIdx, ScalarValue, TileIdx};

/// Per-dimension inclusive `(min, max)` of the cells in a tile.
pub type Mbr = Vec<(Vec<u8>, Vec<u8>)>;

/// Coordinates of one cell, one little-endian value per dimension.
pub type CellCoords = Vec<Vec<u8>>;

/// First and last cell of a tile in the array's global order.
#[derive(Debug, Clone, PartialEq)]
pub struct TileBounds {
    pub first: CellCoords,
    pub last: CellCoords,
}

/// Precomputed statistics of one field over one tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileStats {
    /// `None` when every cell is null.
    pub min: Option<ScalarValue>,
    pub max: Option<ScalarValue>,
    pub sum: Option<ScalarValue>,
    pub null_count: u64,
    pub cell_count: u64,
}

/// Decoded contents of one field of one tile.
///
/// Fixed-size fields store `cell_num * cell_size` bytes in `fixed`. Var-sized
/// fields store one `u64` little-endian start offset per cell in `fixed` and
/// the concatenated payload in `var`. Nullable fields carry one validity byte
/// per cell (non-zero = valid).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileData {
    pub fixed: Vec<u8>,
    pub var: Option<Vec<u8>>,
    pub validity: Option<Vec<u8>>,
}

impl TileData {
    pub fn fixed(fixed: Vec<u8>) -> Self {
        Self {
            fixed,
            var: None,
            validity: None,
        }
    }

    /// Decoded in-memory footprint.
    pub fn size(&self) -> u64 {
        (self.fixed.len()
            + self.var.as_ref().map_or(0, Vec::len)
            + self.validity.as_ref().map_or(0, Vec::len)) as u64
    }
}

/// Read-only metadata of an opened fragment.
pub trait FragmentMetadata: Send + Sync {
    fn tile_num(&self) -> u64;

    fn cell_num(&self, tile: TileIdx) -> u64;

    /// Inclusive `(first, last)` write timestamps of the fragment.
    fn timestamp_range(&self) -> (u64, u64);

    /// Whether cells carry individual timestamps (consolidated with
    /// timestamps). Otherwise every cell has the fragment's first timestamp.
    fn has_timestamps(&self) -> bool;

    fn has_delete_meta(&self) -> bool;

    fn tile_mbr(&self, tile: TileIdx) -> Mbr;

    /// First/last cell of the tile in global order, if recorded.
    fn tile_global_bounds(&self, tile: TileIdx) -> Option<TileBounds>;

    /// Decoded size in bytes of `field` for `tile`, including offsets and
    /// validity. Zero for fields the fragment does not store.
    fn field_tile_size(&self, tile: TileIdx, field: &str) -> u64;

    fn tile_stats(&self, tile: TileIdx, field: &str) -> Option<TileStats>;
}

/// Shared handle to fragment metadata.
pub type Fragment = Arc<dyn FragmentMetadata>;

/// Loads decoded tile bytes.
///
/// Must be callable from worker threads concurrently. I/O failures are
/// reported as [`tilemerge_result::Error::Io`] and may be retried by the
/// caller; undecodable data is reported as
/// [`tilemerge_result::Error::TileCorrupt`].
pub trait TileLoader: Send + Sync {
    fn load(&self, fragment: FragmentIdx, tile: TileIdx, field: &str) -> Result<TileData>;
}

impl<L: TileLoader + ?Sized> TileLoader for Arc<L> {
    #[inline]
    fn load(&self, fragment: FragmentIdx, tile: TileIdx, field: &str) -> Result<TileData> {
        (**self).load(fragment, tile, field)
    }
}
