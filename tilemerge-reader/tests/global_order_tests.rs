mod common;

use std::sync::Arc;

use common::*;
use tilemerge_reader::{
    DeleteCondition, IncompleteReason, PredicateCondition, QueryBuffer, QueryBuffers, QueryStatus,
    ReadMode, ReaderConfig, ReaderOptions,
};
use tilemerge_storage::MemFragmentBuilder;
use tilemerge_types::{DELETE_TIMESTAMPS_FIELD, TIMESTAMPS_FIELD};

fn string_fragment(
    schema: &tilemerge_types::ArraySchema,
    timestamp: u64,
    coords: &[u32],
    strings: &[&str],
) -> tilemerge_storage::MemFragment {
    let a: Vec<i64> = coords.iter().map(|&d| d as i64).collect();
    MemFragmentBuilder::new(schema, timestamp)
        .capacity(2)
        .column("d", coords)
        .column("a", &a)
        .var_column("s", strings)
        .build()
        .unwrap()
}

fn string_buffers(cells: usize, payload: usize) -> QueryBuffers {
    QueryBuffers::new()
        .with("d", QueryBuffer::fixed(cells * 4))
        .with("s", QueryBuffer::var(cells * 8, payload).with_validity(cells))
}

#[test]
fn latest_write_wins_and_older_views_see_older_values() {
    let schema = schema_with_strings(false);
    let store = store(vec![
        string_fragment(&schema, 1, &[1], &["a"]),
        string_fragment(&schema, 2, &[1], &["b"]),
    ]);

    let mut r = reader(&schema, &store, ReaderOptions::default());
    let mut buffers = string_buffers(8, 64);
    assert_eq!(r.execute(&mut buffers).unwrap(), QueryStatus::Completed);
    assert_eq!(buffers.get("d").unwrap().values::<u32>(), vec![1]);
    assert_eq!(buffers.get("s").unwrap().var_values(), vec![b"b".as_slice()]);

    let mut r = reader(
        &schema,
        &store,
        ReaderOptions::default().with_timestamps(0, 1),
    );
    assert_eq!(r.execute(&mut buffers).unwrap(), QueryStatus::Completed);
    assert_eq!(buffers.get("s").unwrap().var_values(), vec![b"a".as_slice()]);
}

#[test]
fn interleaved_fragments_come_out_in_global_order() {
    let schema = schema_1d(false);
    let store = store(vec![
        fragment(&schema, 1, 3, &[0, 3, 6, 9, 12, 15, 18], |d| d as i64),
        fragment(&schema, 2, 2, &[1, 4, 7, 10, 13], |d| d as i64 * 10),
        fragment(&schema, 3, 4, &[2, 5, 8, 11, 14, 17, 20, 23], |d| d as i64 * 100),
    ]);

    let mut r = reader(&schema, &store, ReaderOptions::default());
    let got = read_da(&mut r, 1024);
    let mut expected: Vec<u32> = (0..16).collect();
    expected.extend([17, 18, 20, 23]);
    assert_eq!(got.iter().map(|(d, _)| *d).collect::<Vec<_>>(), expected);
    assert_eq!(got[1], (1, 10));
    assert_eq!(got[2], (2, 200));
}

#[test]
fn small_buffers_produce_the_same_cells_as_one_large_call() {
    let schema = schema_1d(false);
    let store = store(vec![
        fragment(&schema, 1, 4, &(0..60).step_by(2).collect::<Vec<u32>>(), |d| d as i64),
        fragment(&schema, 2, 5, &(0..60).step_by(3).collect::<Vec<u32>>(), |d| -(d as i64)),
        fragment(&schema, 3, 3, &(1..60).step_by(7).collect::<Vec<u32>>(), |d| d as i64 + 1000),
    ]);

    let whole = read_da(&mut reader(&schema, &store, ReaderOptions::default()), 10_000);
    for cells in [1, 2, 3, 7, 16] {
        let mut r = reader(&schema, &store, ReaderOptions::default());
        assert_eq!(read_da(&mut r, cells), whole, "buffer of {cells} cells");
    }
    // Strictly increasing: no duplicate and no out-of-order emission.
    assert!(whole.windows(2).all(|w| w[0].0 < w[1].0));
    // d = 0 is written by fragments 1 and 2; the newer fragment wins.
    assert_eq!(whole[0], (0, 0));
    assert_eq!(whole.iter().find(|(d, _)| *d == 6).unwrap().1, -6);
}

#[test]
fn undersized_buffers_report_user_buffer_size() {
    let schema = schema_1d(false);
    let store = store(vec![fragment(&schema, 1, 4, &(0..20).collect::<Vec<u32>>(), |d| d as i64)]);
    let mut r = reader(&schema, &store, ReaderOptions::default());
    let mut buffers = da_buffers(8);
    let status = r.execute(&mut buffers).unwrap();
    assert_eq!(status, QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
    assert_eq!(r.incomplete_reason(), Some(IncompleteReason::UserBufferSize));
    assert_eq!(buffers.result_cells(), 8);
    assert_eq!(buffers.get("d").unwrap().values::<u32>(), (0..8).collect::<Vec<u32>>());
}

#[test]
fn budget_returns_to_zero_and_never_exceeds_its_limit() {
    let schema = schema_1d(false);
    let store = store(vec![
        fragment(&schema, 1, 4, &(0..200).step_by(2).collect::<Vec<u32>>(), |d| d as i64),
        fragment(&schema, 2, 4, &(1..200).step_by(2).collect::<Vec<u32>>(), |d| d as i64),
    ]);
    // 20 bytes per coordinate tile; 80 bytes of coordinates per fragment.
    let config = ReaderConfig::default()
        .with_memory_budget(400)
        .with_coords_ratio(0.4);
    let mut r = reader(&schema, &store, ReaderOptions::default().with_config(config));
    let mut buffers = da_buffers(7);
    let mut cells = 0;
    loop {
        let status = r.execute(&mut buffers).unwrap();
        cells += buffers.result_cells();
        let usage = r.budget_usage();
        assert!(usage.coords_peak <= usage.coords_limit, "{usage:?}");
        assert!(usage.attributes_used <= usage.attributes_limit, "{usage:?}");
        if status.is_completed() {
            break;
        }
    }
    assert_eq!(cells, 200);
    let usage = r.budget_usage();
    assert_eq!(usage.coords_used, 0);
    assert_eq!(usage.attributes_used, 0);
    assert!(usage.coords_peak > 0);
}

#[test]
fn duplicates_resolve_by_read_timestamp() {
    let schema = schema_1d(false);
    let store = store(vec![
        fragment(&schema, 10, 4, &[5], |_| 1),
        fragment(&schema, 20, 4, &[5], |_| 2),
    ]);
    let at = |end: u64| {
        let mut r = reader(&schema, &store, ReaderOptions::default().with_timestamps(0, end));
        read_da(&mut r, 16)
    };
    assert_eq!(at(20), vec![(5, 2)]);
    assert_eq!(at(u64::MAX), vec![(5, 2)]);
    assert_eq!(at(15), vec![(5, 1)]);
    assert_eq!(at(5), vec![]);
}

#[test]
fn allowed_duplicates_return_every_cell_with_ties_in_fragment_order() {
    let schema = schema_1d(true);
    let store = store(vec![
        fragment(&schema, 7, 4, &[1, 2, 3], |_| 0),
        fragment(&schema, 7, 4, &[2, 3, 4], |_| 1),
        fragment(&schema, 9, 4, &[3], |_| 2),
    ]);
    let got = read_da(&mut reader(&schema, &store, ReaderOptions::default()), 2);
    assert_eq!(
        got,
        vec![(1, 0), (2, 1), (2, 0), (3, 2), (3, 1), (3, 0), (4, 1)]
    );
}

fn versioned_fragment(
    schema: &tilemerge_types::ArraySchema,
    coords: &[u32],
    values: &[i64],
    timestamps: &[u64],
    deletes: &[u64],
) -> tilemerge_storage::MemFragment {
    MemFragmentBuilder::new(schema, timestamps[0])
        .capacity(2)
        .column("d", coords)
        .column("a", values)
        .timestamps(timestamps)
        .delete_timestamps(deletes)
        .build()
        .unwrap()
}

#[test]
fn allowed_duplicates_interleave_per_cell_timestamps_newest_first() {
    let schema = schema_1d(true);
    let store = store(vec![
        versioned_fragment(&schema, &[1, 1], &[30, 70], &[3, 7], &[0, 0]),
        fragment(&schema, 5, 2, &[1], |_| 50),
    ]);
    let mut r = reader(&schema, &store, ReaderOptions::default());

    // The versions of a coordinate are emitted together or not at all.
    let mut tiny = da_buffers(1).with(TIMESTAMPS_FIELD, QueryBuffer::fixed(8));
    let status = r.execute(&mut tiny).unwrap();
    assert_eq!(status, QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
    assert_eq!(tiny.result_cells(), 0);

    let mut buffers = da_buffers(3).with(TIMESTAMPS_FIELD, QueryBuffer::fixed(3 * 8));
    assert!(r.execute(&mut buffers).unwrap().is_completed());
    let a = buffers.get("a").unwrap().values::<i64>();
    let ts = buffers.get(TIMESTAMPS_FIELD).unwrap().values::<u64>();
    assert_eq!(ts, vec![7, 5, 3]);
    assert_eq!(a, vec![70, 50, 30]);
}

#[test]
fn deleted_cells_disappear_from_the_delete_timestamp_on() {
    let schema = schema_1d(false);
    let store = store(vec![versioned_fragment(
        &schema,
        &[1, 2, 3],
        &[10, 20, 30],
        &[10, 10, 10],
        &[0, 20, 0],
    )]);
    let at = |end: u64| {
        let mut r = reader(&schema, &store, ReaderOptions::default().with_timestamps(0, end));
        read_d(&mut r, 16)
    };
    assert_eq!(at(15), vec![1, 2, 3]);
    assert_eq!(at(20), vec![1, 3]);
    assert_eq!(at(100), vec![1, 3]);
}

#[test]
fn delete_condition_removes_every_older_version_of_a_cell() {
    let schema = schema_1d(false);
    let store = store(vec![
        fragment(&schema, 10, 2, &[5, 6], |_| 1),
        fragment(&schema, 20, 2, &[5, 6], |_| 2),
    ]);
    let five = Arc::new(PredicateCondition::new(&[], |tile, pos| {
        tile.value::<u32>("d", pos) == Some(5)
    }));
    let at = |end: u64| {
        let options = ReaderOptions::default()
            .with_timestamps(0, end)
            .with_delete_condition(DeleteCondition::new(30, five.clone()));
        read_da(&mut reader(&schema, &store, options), 16)
    };
    assert_eq!(at(25), vec![(5, 2), (6, 2)]);
    assert_eq!(at(40), vec![(6, 2)]);
}

#[test]
fn consolidation_modes_keep_or_purge_deleted_versions() {
    let schema = schema_1d(false);
    let store = store(vec![
        versioned_fragment(&schema, &[5, 8], &[1, 1], &[10, 10], &[20, 0]),
        versioned_fragment(&schema, &[5, 8], &[2, 2], &[30, 30], &[0, 0]),
    ]);

    let read = |mode: ReadMode| {
        let mut r = reader(
            &schema,
            &store,
            ReaderOptions::default().with_mode(mode).with_timestamps(0, 40),
        );
        let mut buffers = da_buffers(16).with(DELETE_TIMESTAMPS_FIELD, QueryBuffer::fixed(16 * 8));
        assert!(r.execute(&mut buffers).unwrap().is_completed());
        let d = buffers.get("d").unwrap().values::<u32>();
        let a = buffers.get("a").unwrap().values::<i64>();
        let del = buffers.get(DELETE_TIMESTAMPS_FIELD).unwrap().values::<u64>();
        d.into_iter().zip(a).zip(del).map(|((d, a), t)| (d, a, t)).collect::<Vec<_>>()
    };

    // Every version, newest first, deleted ones reported.
    assert_eq!(
        read(ReadMode::Consolidation {
            purge_deletes: false
        }),
        vec![(5, 2, 0), (5, 1, 20), (8, 2, 0), (8, 1, 0)]
    );
    // The deleted version at d = 5 and everything older is purged.
    assert_eq!(
        read(ReadMode::Consolidation {
            purge_deletes: true
        }),
        vec![(5, 2, 0), (8, 2, 0), (8, 1, 0)]
    );
}

#[test]
fn purge_stops_a_group_at_its_newest_deleted_version() {
    let schema = schema_1d(false);
    let store = store(vec![
        versioned_fragment(&schema, &[5], &[1], &[10], &[0]),
        versioned_fragment(&schema, &[5], &[2], &[20], &[25]),
        versioned_fragment(&schema, &[5], &[3], &[30], &[0]),
    ]);
    let mut r = reader(
        &schema,
        &store,
        ReaderOptions::default()
            .with_mode(ReadMode::Consolidation {
                purge_deletes: true,
            })
            .with_timestamps(0, 40),
    );
    assert_eq!(read_da(&mut r, 1), vec![(5, 3)]);
}

#[test]
fn conditions_filter_and_delete_conditions_apply_to_older_writes() {
    let schema = schema_1d(false);
    let store = store(vec![
        fragment(&schema, 10, 3, &(0..10).collect::<Vec<u32>>(), |d| d as i64),
        fragment(&schema, 60, 3, &[20, 21], |d| d as i64),
    ]);
    let odd = Arc::new(PredicateCondition::new(&["a"], |tile, pos| {
        tile.value::<i64>("a", pos).is_some_and(|v| v % 2 == 1)
    }));
    let big = Arc::new(PredicateCondition::new(&["a"], |tile, pos| {
        tile.value::<i64>("a", pos).is_some_and(|v| v >= 7)
    }));
    let options = ReaderOptions::default()
        .with_condition(odd)
        .with_delete_condition(DeleteCondition::new(50, big));
    let mut r = reader(&schema, &store, options);
    // 7 and 9 are deleted at 50; 21 was written after the delete.
    assert_eq!(read_d(&mut r, 2), vec![1, 3, 5, 21]);
}

#[test]
fn delete_conditions_after_the_read_window_are_ignored() {
    let schema = schema_1d(false);
    let store = store(vec![fragment(&schema, 10, 3, &[1, 2, 3], |d| d as i64)]);
    let all = Arc::new(PredicateCondition::new(&[], |_, _| true));
    let options = ReaderOptions::default()
        .with_timestamps(0, 40)
        .with_delete_condition(DeleteCondition::new(50, all));
    assert_eq!(read_d(&mut reader(&schema, &store, options), 8), vec![1, 2, 3]);
}

#[test]
fn var_fields_agree_with_fixed_fields_on_the_cutoff() {
    let schema = schema_with_strings(false);
    let coords: Vec<u32> = (0..12).collect();
    let strings: Vec<String> = coords.iter().map(|&d| "x".repeat(d as usize % 4 + 1)).collect();
    let refs: Vec<&str> = strings.iter().map(String::as_str).collect();
    let store = store(vec![string_fragment(&schema, 1, &coords, &refs)]);

    let mut r = reader(&schema, &store, ReaderOptions::default());
    // Room for 12 cells of offsets but only 7 payload bytes per call.
    let mut buffers = string_buffers(12, 7);
    let mut seen: Vec<(u32, String)> = Vec::new();
    loop {
        let status = r.execute(&mut buffers).unwrap();
        let d = buffers.get("d").unwrap().values::<u32>();
        let s = buffers.get("s").unwrap().var_values();
        assert_eq!(d.len(), s.len());
        assert!(!d.is_empty());
        seen.extend(
            d.into_iter()
                .zip(s.into_iter().map(|v| String::from_utf8(v.to_vec()).unwrap())),
        );
        if status.is_completed() {
            break;
        }
        assert_eq!(status, QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
    }
    let expected: Vec<(u32, String)> = coords.into_iter().zip(strings).collect();
    assert_eq!(seen, expected);
}

#[test]
fn a_cell_larger_than_the_var_buffer_returns_no_cells() {
    let schema = schema_with_strings(false);
    let store = store(vec![string_fragment(&schema, 1, &[1], &["too long"])]);
    let mut r = reader(&schema, &store, ReaderOptions::default());
    let mut buffers = string_buffers(4, 3);
    let status = r.execute(&mut buffers).unwrap();
    assert_eq!(status, QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
    assert_eq!(buffers.result_cells(), 0);

    let mut bigger = string_buffers(4, 64);
    assert!(r.execute(&mut bigger).unwrap().is_completed());
    assert_eq!(bigger.get("s").unwrap().var_values(), vec![b"too long".as_slice()]);
}
