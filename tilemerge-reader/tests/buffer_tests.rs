mod common;

use arrow::array::{Array, Int64Array, LargeStringArray, StringArray, UInt32Array};
use common::*;
use tilemerge_reader::{
    Error, OffsetsMode, QueryBuffer, QueryBuffers, QueryStatus, ReaderConfig, ReaderOptions,
};
use tilemerge_storage::{MemFragment, MemFragmentBuilder};
use tilemerge_types::{ArraySchema, Attribute, Datatype, Dimension, encode_native};

fn strings_fragment(schema: &ArraySchema) -> MemFragment {
    MemFragmentBuilder::new(schema, 1)
        .capacity(2)
        .column("d", &[1u32, 2, 3, 4])
        .column("a", &[10i64, 20, 30, 40])
        .var_column("s", &["ab", "", "cde", "f"])
        .validity("s", &[true, false, true, true])
        .build()
        .unwrap()
}

fn config(config: ReaderConfig) -> ReaderOptions {
    ReaderOptions::default().with_config(config)
}

#[test]
fn var_offsets_follow_the_configured_format() {
    let schema = schema_with_strings(false);
    let store = store(vec![strings_fragment(&schema)]);

    let cases = [
        (ReaderConfig::default(), vec![0u64, 2, 2, 5]),
        (ReaderConfig::default().with_offsets_bitsize(32), vec![0, 2, 2, 5]),
        (
            ReaderConfig::default().with_offsets_extra_element(true),
            vec![0, 2, 2, 5, 6],
        ),
        (
            ReaderConfig::default()
                .with_offsets_bitsize(32)
                .with_offsets_extra_element(true),
            vec![0, 2, 2, 5, 6],
        ),
    ];
    for (cfg, expected) in cases {
        let width = cfg.offset_size();
        let mut r = reader(&schema, &store, config(cfg.clone()));
        let mut buffers =
            QueryBuffers::new().with("s", QueryBuffer::var(5 * width, 64).with_validity(4));
        assert_eq!(r.execute(&mut buffers).unwrap(), QueryStatus::Completed);
        let s = buffers.get("s").unwrap();
        assert_eq!(s.data_capacity(), 5 * width);
        assert_eq!(s.validity_capacity(), 4);
        assert_eq!(s.offsets(), expected, "{cfg:?}");
        assert_eq!(s.data().len(), expected.len() * width);
        assert_eq!(s.var_data(), b"abcdef");
        assert_eq!(s.validity(), Some(&[1u8, 0, 1, 1][..]));
        assert_eq!(s.var_values(), vec![b"ab".as_slice(), b"".as_slice(), b"cde".as_slice(), b"f".as_slice()]);
    }
}

#[test]
fn the_extra_offset_takes_a_slot_of_the_buffer() {
    let schema = schema_with_strings(false);
    let store = store(vec![strings_fragment(&schema)]);
    let cfg = ReaderConfig::default().with_offsets_extra_element(true);
    let mut r = reader(&schema, &store, config(cfg));
    // Four offset slots: three cells plus the closing offset.
    let mut buffers = QueryBuffers::new().with("s", QueryBuffer::var(32, 64).with_validity(4));
    let status = r.execute(&mut buffers).unwrap();
    assert!(status.is_incomplete());
    assert_eq!(buffers.get("s").unwrap().offsets(), vec![0, 2, 2, 5]);
    assert!(r.execute(&mut buffers).unwrap().is_completed());
    assert_eq!(buffers.get("s").unwrap().offsets(), vec![0, 1]);
    assert_eq!(buffers.get("s").unwrap().var_data(), b"f");
}

#[test]
fn element_offsets_count_payload_elements() {
    let schema = ArraySchema::new(
        vec![Dimension::new("d", 0u32, 100)],
        vec![Attribute::var("v", Datatype::Int32)],
    )
    .unwrap();
    let payloads = [encode_native(&[1i32]), encode_native(&[2i32, 3]), encode_native(&[4i32])];
    let fragment = MemFragmentBuilder::new(&schema, 1)
        .column("d", &[5u32, 6, 7])
        .var_column("v", &payloads)
        .build()
        .unwrap();
    let store = store(vec![fragment]);
    let cfg = ReaderConfig::default()
        .with_offsets_mode(OffsetsMode::Elements)
        .with_offsets_extra_element(true);
    let mut r = reader(&schema, &store, config(cfg));
    let mut buffers = QueryBuffers::new().with("v", QueryBuffer::var(64, 64));
    assert!(r.execute(&mut buffers).unwrap().is_completed());

    let v = buffers.get("v").unwrap();
    assert_eq!(v.offsets(), vec![0, 1, 3, 4]);
    assert_eq!(v.var_data(), encode_native(&[1i32, 2, 3, 4]).as_slice());
    assert_eq!(v.var_values()[1], encode_native(&[2i32, 3]).as_slice());
}

#[test]
fn mismatched_buffers_are_rejected() {
    let schema = schema_with_strings(false);
    let store = store(vec![strings_fragment(&schema)]);

    let cases = [
        QueryBuffers::new().with("a", QueryBuffer::var(64, 64)),
        QueryBuffers::new().with("s", QueryBuffer::fixed(64).with_validity(8)),
        QueryBuffers::new().with("s", QueryBuffer::var(64, 64)),
        QueryBuffers::new().with("missing", QueryBuffer::fixed(64)),
    ];
    for mut buffers in cases {
        let mut r = reader(&schema, &store, ReaderOptions::default());
        let err = r.execute(&mut buffers).unwrap_err();
        assert!(matches!(err, Error::InvalidArgumentError(_)), "{err}");
        assert_eq!(r.status(), Some(QueryStatus::Failed));
    }
}

#[test]
fn filled_buffers_export_as_a_record_batch() {
    let schema = schema_with_strings(false);
    let store = store(vec![strings_fragment(&schema)]);

    for bits in [32u8, 64] {
        let cfg = ReaderConfig::default().with_offsets_bitsize(bits);
        let mut r = reader(&schema, &store, config(cfg));
        let mut buffers = QueryBuffers::new()
            .with("d", QueryBuffer::fixed(16))
            .with("a", QueryBuffer::fixed(32))
            .with("s", QueryBuffer::var(32, 64).with_validity(4));
        assert!(r.execute(&mut buffers).unwrap().is_completed());

        let batch = buffers.to_record_batch(&schema).unwrap();
        assert_eq!(batch.num_rows(), 4);
        assert_eq!(batch.num_columns(), 3);
        let d = batch.column(0).as_any().downcast_ref::<UInt32Array>().unwrap();
        assert_eq!(d.values().to_vec(), vec![1, 2, 3, 4]);
        let a = batch.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(a.values().to_vec(), vec![10, 20, 30, 40]);

        let s = batch.column(2);
        assert_eq!(s.null_count(), 1);
        assert!(s.is_null(1));
        let strings: Vec<Option<&str>> = if bits == 64 {
            s.as_any().downcast_ref::<LargeStringArray>().unwrap().iter().collect()
        } else {
            s.as_any().downcast_ref::<StringArray>().unwrap().iter().collect()
        };
        assert_eq!(strings, vec![Some("ab"), None, Some("cde"), Some("f")]);
    }
}
