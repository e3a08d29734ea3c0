//! Sparse global-order reads over the fragments of a TileDB-style array.
//!
//! A [`SparseGlobalOrderReader`] merges the cells of many immutable,
//! individually sorted fragments into one stream in the array's global cell
//! order. Duplicates are resolved by timestamp, deletes and conditions are
//! applied, and results are written into caller-owned [`QueryBuffers`] in
//! as many calls as the buffers and the memory budget require.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tilemerge_reader::{QueryBuffer, QueryBuffers, ReaderOptions, SparseGlobalOrderReader};
//! # fn run(
//! #     schema: tilemerge_types::ArraySchema,
//! #     store: Arc<tilemerge_storage::MemFragmentStore>,
//! # ) -> tilemerge_result::Result<()> {
//! let mut reader = SparseGlobalOrderReader::new(
//!     schema,
//!     store.fragments(),
//!     store.clone(),
//!     ReaderOptions::default(),
//! )?;
//! let mut buffers = QueryBuffers::new().with("d", QueryBuffer::fixed(4096));
//! loop {
//!     let status = reader.execute(&mut buffers)?;
//!     // consume buffers.get("d") ...
//!     if status.is_completed() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod bitmap;
mod budget;
pub mod buffers;
mod comparator;
pub mod condition;
pub mod config;
mod copy;
mod hilbert;
mod merge;
pub mod options;
mod reader;
mod result_tile;
mod slab;
pub mod subarray;
mod tile_order;
mod tile_store;

pub use bitmap::CellBitmap;
pub use budget::BudgetUsage;
pub use buffers::{QueryBuffer, QueryBuffers};
pub use comparator::{GlobalCoords, GlobalOrder};
pub use condition::{DeleteCondition, PredicateCondition, QueryCondition};
pub use config::{OffsetsMode, ReaderConfig, TileOrderMode};
pub use copy::aggregate::{AggregateKind, AggregateSpec};
pub use options::{CancellationToken, ReadMode, ReaderContext, ReaderOptions};
pub use reader::{IncompleteReason, QueryStatus, ReadState, SparseGlobalOrderReader};
pub use result_tile::ResultTile;
pub use slab::ResultCellSlab;
pub use subarray::Subarray;
pub use tile_store::TileHandle;

pub use tilemerge_result::{Error, Result};
