//! tilemerge: globally ordered reads over sparse array fragments
//!
//! This crate is the entry point of the toolkit. It re-exports the reader
//! and the storage contracts it depends on from the `tilemerge-*` crates.
//!
//! # Quick Start
//!
//! Write two overlapping fragments into an in-memory store and read them
//! back in global order:
//!
//! ```rust
//! use tilemerge::storage::{MemFragmentBuilder, MemFragmentStore};
//! use tilemerge::types::{ArraySchema, Attribute, Datatype, Dimension};
//! use tilemerge::{QueryBuffer, QueryBuffers, ReaderOptions, SparseGlobalOrderReader};
//!
//! let schema = ArraySchema::new(
//!     vec![Dimension::new("d", 0u32, 100)],
//!     vec![Attribute::fixed("a", Datatype::Int64)],
//! )
//! .unwrap();
//! let mut store = MemFragmentStore::new();
//! for (ts, coords) in [(1, vec![1u32, 3, 5]), (2, vec![3u32, 4])] {
//!     let values: Vec<i64> = coords.iter().map(|&d| ts as i64 * 10 + d as i64).collect();
//!     let fragment = MemFragmentBuilder::new(&schema, ts)
//!         .column("d", &coords)
//!         .column("a", &values)
//!         .build()
//!         .unwrap();
//!     store.push(fragment);
//! }
//! let store = std::sync::Arc::new(store);
//!
//! let mut reader =
//!     SparseGlobalOrderReader::new(schema, store.fragments(), store.clone(), ReaderOptions::default())
//!         .unwrap();
//! let mut buffers = QueryBuffers::new().with("d", QueryBuffer::fixed(64)).with("a", QueryBuffer::fixed(128));
//! assert!(reader.execute(&mut buffers).unwrap().is_completed());
//! assert_eq!(buffers.get("d").unwrap().values::<u32>(), vec![1, 3, 4, 5]);
//! assert_eq!(buffers.get("a").unwrap().values::<i64>(), vec![11, 23, 24, 15]);
//! ```
//!
//! # Architecture
//!
//! - **Reader** (`tilemerge-reader`): merges fragments, resolves duplicates,
//!   and copies results under a memory budget.
//! - **Storage** (`tilemerge-storage`): fragment metadata and tile loading
//!   contracts, plus an in-memory implementation.
//! - **Types** (`tilemerge-types`): schemas, datatypes and cell orders.
//! - **Errors** (`tilemerge-result`): the shared error type.

pub use tilemerge_reader::{
    AggregateKind, AggregateSpec, BudgetUsage, CancellationToken, DeleteCondition,
    IncompleteReason, OffsetsMode, PredicateCondition, QueryBuffer, QueryBuffers, QueryCondition,
    QueryStatus, ReadMode, ReadState, ReaderConfig, ReaderContext, ReaderOptions,
    SparseGlobalOrderReader, Subarray, TileOrderMode,
};

pub mod storage {
    //! Fragment metadata, tile loading and the in-memory store.

    pub use tilemerge_storage::*;
}

pub mod types {
    //! Schemas, datatypes, identifiers and cell orders.

    pub use tilemerge_types::*;
}

pub use tilemerge_result::{Error, Result};
