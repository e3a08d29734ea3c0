//! Merge throughput over overlapping in-memory fragments.
//!
//! Run:
//!   cargo bench --bench merge_bench

#![forbid(unsafe_code)]

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

use tilemerge_reader::{
    AggregateKind, AggregateSpec, QueryBuffer, QueryBuffers, ReaderConfig, ReaderOptions,
    SparseGlobalOrderReader, TileOrderMode,
};
use tilemerge_storage::{MemFragmentBuilder, MemFragmentStore, TileLoader};
use tilemerge_test_utils::XorShift64;
use tilemerge_types::{ArraySchema, Attribute, Datatype, Dimension};

const NUM_FRAGMENTS: u64 = 16;
const CELLS_PER_FRAGMENT: u64 = 50_000;
const TILE_CAPACITY: usize = 1_000;
const BUFFER_CELLS: usize = 65_536;

fn schema() -> ArraySchema {
    ArraySchema::new(
        vec![Dimension::new("d", 0u64, u64::MAX - 1)],
        vec![Attribute::fixed("a", Datatype::Int64)],
    )
    .unwrap()
}

/// Fragments with random, heavily overlapping coordinates.
fn setup_store(schema: &ArraySchema) -> Arc<MemFragmentStore> {
    let mut rng = XorShift64::new(0xbe7c4);
    let mut store = MemFragmentStore::new();
    for f in 0..NUM_FRAGMENTS {
        let mut coords: Vec<u64> = (0..CELLS_PER_FRAGMENT)
            .map(|_| rng.below(NUM_FRAGMENTS * CELLS_PER_FRAGMENT))
            .collect();
        coords.sort_unstable();
        coords.dedup();
        let values: Vec<i64> = coords.iter().map(|&d| d as i64 ^ f as i64).collect();
        store.push(
            MemFragmentBuilder::new(schema, f + 1)
                .capacity(TILE_CAPACITY)
                .column("d", &coords)
                .column("a", &values)
                .build()
                .unwrap(),
        );
    }
    Arc::new(store)
}

fn new_reader(schema: &ArraySchema, store: &Arc<MemFragmentStore>, options: ReaderOptions) -> SparseGlobalOrderReader {
    let loader: Arc<dyn TileLoader> = store.clone();
    SparseGlobalOrderReader::new(schema.clone(), store.fragments(), loader, options).unwrap()
}

fn drain(reader: &mut SparseGlobalOrderReader, buffers: &mut QueryBuffers) -> u64 {
    let mut cells = 0;
    loop {
        let status = reader.execute(buffers).unwrap();
        cells += buffers.result_cells();
        if status.is_completed() {
            return cells;
        }
    }
}

fn bench_global_order_read(c: &mut Criterion) {
    let schema = schema();
    let store = setup_store(&schema);

    let mut group = c.benchmark_group("global_order_read_800k");
    group.sample_size(10);

    for (name, tile_order) in [
        ("per_fragment", TileOrderMode::PerFragment),
        ("preprocess", TileOrderMode::Preprocess),
    ] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let config = ReaderConfig::default()
                        .with_memory_budget(4 * 1024 * 1024)
                        .with_tile_order(tile_order);
                    let reader = new_reader(&schema, &store, ReaderOptions::default().with_config(config));
                    let buffers = QueryBuffers::new()
                        .with("d", QueryBuffer::fixed(BUFFER_CELLS * 8))
                        .with("a", QueryBuffer::fixed(BUFFER_CELLS * 8));
                    (reader, buffers)
                },
                |(mut reader, mut buffers)| black_box(drain(&mut reader, &mut buffers)),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_aggregate_only(c: &mut Criterion) {
    let schema = schema();
    let store = setup_store(&schema);

    c.benchmark_group("aggregate_800k")
        .sample_size(10)
        .bench_function("sum_a", |b| {
            b.iter(|| {
                let options = ReaderOptions::default()
                    .with_aggregate(AggregateSpec::new("sum", AggregateKind::Sum { field: "a".into() }));
                let mut reader = new_reader(&schema, &store, options);
                reader.execute(&mut QueryBuffers::new()).unwrap();
                black_box(reader.aggregate("sum"))
            })
        });
}

criterion_group!(benches, bench_global_order_read, bench_aggregate_only);
criterion_main!(benches);
