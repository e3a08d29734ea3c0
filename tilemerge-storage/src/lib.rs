//! Storage-side collaborators of the read path.
//!
//! [`FragmentMetadata`] and [`TileLoader`] are the only ways the reader
//! learns about fragments. [`MemFragmentStore`] implements both entirely in
//! memory, and [`InstrumentedLoader`] counts loads for diagnostics and tests.

pub mod instrumented;
pub mod mem_store;
pub mod traits;

pub use instrumented::{InstrumentedLoader, LoadStats, LoadStatsSnapshot};
pub use mem_store::{MemFragment, MemFragmentBuilder, MemFragmentStore};
pub use traits::{
    CellCoords, Fragment, FragmentMetadata, Mbr, TileBounds, TileData, TileLoader, TileStats,
};
