#![allow(dead_code)]

use std::sync::Arc;

use tilemerge_reader::{QueryBuffer, QueryBuffers, QueryStatus, ReaderOptions, SparseGlobalOrderReader};
use tilemerge_storage::{MemFragment, MemFragmentBuilder, MemFragmentStore, TileLoader};
use tilemerge_test_utils::init_tracing_for_tests;
use tilemerge_types::{ArraySchema, Attribute, Datatype, Dimension};

/// One dimension `d: u32` and an `i64` attribute `a`.
pub fn schema_1d(allows_duplicates: bool) -> ArraySchema {
    ArraySchema::new(
        vec![Dimension::new("d", 0u32, 1_000_000)],
        vec![Attribute::fixed("a", Datatype::Int64)],
    )
    .unwrap()
    .with_allows_duplicates(allows_duplicates)
}

/// `schema_1d` plus a nullable var-sized string `s`.
pub fn schema_with_strings(allows_duplicates: bool) -> ArraySchema {
    ArraySchema::new(
        vec![Dimension::new("d", 0u32, 1_000_000)],
        vec![
            Attribute::fixed("a", Datatype::Int64),
            Attribute::var("s", Datatype::StringAscii).nullable(),
        ],
    )
    .unwrap()
    .with_allows_duplicates(allows_duplicates)
}

/// Two dimensions `x, y: u32` and an `i64` attribute `a`.
pub fn schema_2d() -> ArraySchema {
    ArraySchema::new(
        vec![Dimension::new("x", 0u32, 63), Dimension::new("y", 0u32, 63)],
        vec![Attribute::fixed("a", Datatype::Int64)],
    )
    .unwrap()
}

/// A fragment of `schema_1d` with `a = value(d)`.
pub fn fragment(
    schema: &ArraySchema,
    timestamp: u64,
    capacity: usize,
    coords: &[u32],
    value: impl Fn(u32) -> i64,
) -> MemFragment {
    let values: Vec<i64> = coords.iter().map(|&d| value(d)).collect();
    MemFragmentBuilder::new(schema, timestamp)
        .capacity(capacity)
        .column("d", coords)
        .column("a", &values)
        .build()
        .unwrap()
}

pub fn store(fragments: Vec<MemFragment>) -> Arc<MemFragmentStore> {
    let mut store = MemFragmentStore::new();
    for f in fragments {
        store.push(f);
    }
    Arc::new(store)
}

pub fn reader(
    schema: &ArraySchema,
    store: &Arc<MemFragmentStore>,
    options: ReaderOptions,
) -> SparseGlobalOrderReader {
    init_tracing_for_tests();
    let loader: Arc<dyn TileLoader> = store.clone();
    SparseGlobalOrderReader::new(schema.clone(), store.fragments(), loader, options).unwrap()
}

/// Buffers for `d` and `a` holding up to `cells` cells each.
pub fn da_buffers(cells: usize) -> QueryBuffers {
    QueryBuffers::new()
        .with("d", QueryBuffer::fixed(cells * 4))
        .with("a", QueryBuffer::fixed(cells * 8))
}

/// Run the reader to completion, collecting `(d, a)` across calls.
pub fn read_da(reader: &mut SparseGlobalOrderReader, cells: usize) -> Vec<(u32, i64)> {
    let mut buffers = da_buffers(cells);
    let mut out = Vec::new();
    for _ in 0..100_000 {
        let status = reader.execute(&mut buffers).unwrap();
        let d = buffers.get("d").unwrap().values::<u32>();
        let a = buffers.get("a").unwrap().values::<i64>();
        assert_eq!(d.len(), a.len(), "fields disagree on the cutoff");
        out.extend(d.into_iter().zip(a));
        if status == QueryStatus::Completed {
            return out;
        }
    }
    panic!("reader did not complete");
}

/// Dimension values only.
pub fn read_d(reader: &mut SparseGlobalOrderReader, cells: usize) -> Vec<u32> {
    read_da(reader, cells).into_iter().map(|(d, _)| d).collect()
}
