use tilemerge_storage::{InstrumentedLoader, MemFragmentBuilder, MemFragmentStore, TileLoader};
use tilemerge_types::{ArraySchema, Attribute, Datatype, Dimension};

#[test]
fn counts_loads_per_field_and_failures() {
    tilemerge_test_utils::init_tracing_for_tests();

    let schema = ArraySchema::new(
        vec![Dimension::new("d", 0i64, 100)],
        vec![Attribute::fixed("v", Datatype::Float64)],
    )
    .unwrap();
    let mut store = MemFragmentStore::new();
    store.push(
        MemFragmentBuilder::new(&schema, 1)
            .capacity(2)
            .column("d", &[1i64, 2, 3])
            .column("v", &[0.5f64, 1.5, 2.5])
            .build()
            .unwrap(),
    );

    let (loader, stats) = InstrumentedLoader::new(store);
    let before = stats.snapshot();
    loader.load(0, 0, "d").unwrap();
    loader.load(0, 1, "d").unwrap();
    loader.load(0, 1, "v").unwrap();
    assert!(loader.load(0, 9, "v").is_err());

    let delta = stats.snapshot().delta_since(&before);
    assert_eq!(delta.loads, 3);
    assert_eq!(delta.failures, 1);
    assert_eq!(delta.loaded_bytes, 16 + 8 + 8);
    assert_eq!(stats.field_loads("d"), 2);
    assert_eq!(stats.field_loads("v"), 1);

    stats.reset();
    assert_eq!(stats.snapshot().loads, 0);
    assert_eq!(stats.field_loads("d"), 0);
}
