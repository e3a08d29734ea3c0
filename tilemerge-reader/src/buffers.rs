//! Caller-owned output buffers.
//!
//! Capacities are fixed when a buffer is created; the reader never grows
//! them. Each `execute()` writes from position zero and records how much of
//! every buffer it filled.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryArray, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array,
    Int64Array, LargeBinaryArray, LargeStringArray, StringArray, UInt8Array, UInt16Array,
    UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;
use tilemerge_result::{Error, Result};
use tilemerge_types::{ArraySchema, Datatype, FieldInfo, NativeType};

/// How offsets of a var-sized buffer were written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OffsetsFormat {
    /// 4 or 8 bytes per offset.
    pub size: usize,
    /// Offsets count elements of `element_size` bytes rather than bytes.
    pub elements: bool,
    /// A final offset equal to the payload size follows the last cell.
    pub extra: bool,
    pub element_size: usize,
}

impl OffsetsFormat {
    pub fn encode(&self, byte_offset: u64) -> u64 {
        if self.elements {
            byte_offset / self.element_size as u64
        } else {
            byte_offset
        }
    }

    fn decode(&self, value: u64) -> u64 {
        if self.elements {
            value * self.element_size as u64
        } else {
            value
        }
    }
}

/// Output buffer for one field.
///
/// Fixed-size fields write values into the data buffer. Var-sized fields
/// write one offset per cell into the data buffer and payload bytes into the
/// var buffer. Nullable fields also need a validity buffer with one byte per
/// cell.
#[derive(Debug, Clone)]
pub struct QueryBuffer {
    data: Vec<u8>,
    data_size: usize,
    var: Option<Vec<u8>>,
    var_size: usize,
    validity: Option<Vec<u8>>,
    validity_size: usize,
    cells: u64,
    offsets: Option<OffsetsFormat>,
}

impl QueryBuffer {
    /// A buffer for a fixed-size field holding up to `capacity` bytes.
    pub fn fixed(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            data_size: 0,
            var: None,
            var_size: 0,
            validity: None,
            validity_size: 0,
            cells: 0,
            offsets: None,
        }
    }

    /// A buffer for a var-sized field with `offsets_capacity` bytes of
    /// offsets and `var_capacity` bytes of payload.
    pub fn var(offsets_capacity: usize, var_capacity: usize) -> Self {
        Self {
            var: Some(vec![0; var_capacity]),
            ..Self::fixed(offsets_capacity)
        }
    }

    /// Add a validity buffer of `capacity` bytes.
    pub fn with_validity(mut self, capacity: usize) -> Self {
        self.validity = Some(vec![0; capacity]);
        self
    }

    pub fn is_var(&self) -> bool {
        self.var.is_some()
    }

    pub fn has_validity(&self) -> bool {
        self.validity.is_some()
    }

    /// Cells written by the last `execute()`.
    pub fn result_cells(&self) -> u64 {
        self.cells
    }

    /// Written bytes of the data (or offsets) buffer.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_size]
    }

    /// Written payload bytes of a var-sized buffer.
    pub fn var_data(&self) -> &[u8] {
        self.var.as_ref().map_or(&[], |v| &v[..self.var_size])
    }

    /// Written validity bytes, one per cell (non-zero = valid).
    pub fn validity(&self) -> Option<&[u8]> {
        self.validity.as_ref().map(|v| &v[..self.validity_size])
    }

    pub fn data_capacity(&self) -> usize {
        self.data.len()
    }

    pub fn var_capacity(&self) -> usize {
        self.var.as_ref().map_or(0, Vec::len)
    }

    pub fn validity_capacity(&self) -> usize {
        self.validity.as_ref().map_or(0, Vec::len)
    }

    /// Written values of a fixed-size field.
    pub fn values<T: NativeType>(&self) -> Vec<T> {
        self.data().chunks_exact(T::SIZE).map(T::read_le).collect()
    }

    /// Written offsets, as stored (bytes or elements).
    pub fn offsets(&self) -> Vec<u64> {
        match self.offsets {
            Some(f) if f.size == 4 => self.data().chunks_exact(4).map(|c| u32::read_le(c) as u64).collect(),
            Some(_) => self.data().chunks_exact(8).map(u64::read_le).collect(),
            None => Vec::new(),
        }
    }

    /// Written payload of each cell of a var-sized field.
    pub fn var_values(&self) -> Vec<&[u8]> {
        let Some(format) = self.offsets else {
            return Vec::new();
        };
        let payload = self.var_data();
        let offsets = self.offsets();
        let n = self.cells as usize;
        (0..n)
            .map(|i| {
                let start = format.decode(offsets[i]) as usize;
                let end = match offsets.get(i + 1) {
                    Some(&o) => format.decode(o) as usize,
                    None => payload.len(),
                };
                &payload[start..end]
            })
            .collect()
    }

    /// Whether the cell at `i` is valid. Always true without validity.
    pub fn is_valid(&self, i: usize) -> bool {
        self.validity().is_none_or(|v| v[i] != 0)
    }

    /// Cells this buffer can hold for `info` with the given offsets format.
    pub(crate) fn cell_capacity(&self, info: &FieldInfo, format: Option<OffsetsFormat>) -> u64 {
        let mut cap = match format {
            Some(f) => {
                let slots = (self.data.len() / f.size) as u64;
                if f.extra { slots.saturating_sub(1) } else { slots }
            }
            None => (self.data.len() / info.cell_size()) as u64,
        };
        if let Some(v) = &self.validity {
            cap = cap.min(v.len() as u64);
        }
        cap
    }

    pub(crate) fn prepare(&mut self, format: Option<OffsetsFormat>) {
        self.data_size = 0;
        self.var_size = 0;
        self.validity_size = 0;
        self.cells = 0;
        self.offsets = format;
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn var_mut(&mut self) -> Option<&mut [u8]> {
        self.var.as_deref_mut()
    }

    pub(crate) fn validity_mut(&mut self) -> Option<&mut [u8]> {
        self.validity.as_deref_mut()
    }

    pub(crate) fn set_written(&mut self, cells: u64, data: usize, var: usize) {
        self.cells = cells;
        self.data_size = data;
        self.var_size = var;
        self.validity_size = if self.validity.is_some() { cells as usize } else { 0 };
    }
}

/// Output buffers by field name, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct QueryBuffers {
    names: Vec<String>,
    buffers: FxHashMap<String, QueryBuffer>,
}

impl QueryBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, buffer: QueryBuffer) -> Self {
        self.insert(name, buffer);
        self
    }

    /// Add or replace the buffer of a field.
    pub fn insert(&mut self, name: impl Into<String>, buffer: QueryBuffer) {
        let name = name.into();
        if !self.buffers.contains_key(&name) {
            self.names.push(name.clone());
        }
        self.buffers.insert(name, buffer);
    }

    pub fn get(&self, name: &str) -> Option<&QueryBuffer> {
        self.buffers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut QueryBuffer> {
        self.buffers.get_mut(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Cells written by the last `execute()`; every buffer agrees.
    pub fn result_cells(&self) -> u64 {
        self.names
            .first()
            .and_then(|n| self.buffers.get(n))
            .map_or(0, QueryBuffer::result_cells)
    }

    /// Export the written cells as an Arrow record batch, one column per
    /// buffer.
    pub fn to_record_batch(&self, schema: &ArraySchema) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.names.len());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let info = schema.require_field(name)?;
            let buffer = &self.buffers[name];
            let (data_type, array) = to_arrow(name, &info, buffer)?;
            fields.push(Field::new(name, data_type, info.nullable));
            columns.push(array);
        }
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }
}

fn to_arrow(name: &str, info: &FieldInfo, buffer: &QueryBuffer) -> Result<(DataType, ArrayRef)> {
    let n = buffer.result_cells() as usize;
    if info.var_sized {
        let large = buffer.offsets.is_some_and(|f| f.size == 8);
        let values: Vec<Option<&[u8]>> = buffer
            .var_values()
            .into_iter()
            .enumerate()
            .map(|(i, v)| buffer.is_valid(i).then_some(v))
            .collect();
        return Ok(match info.datatype {
            Datatype::StringAscii => {
                let strings = values
                    .into_iter()
                    .map(|v| v.map(std::str::from_utf8).transpose())
                    .collect::<std::result::Result<Vec<Option<&str>>, _>>()
                    .map_err(|e| {
                        Error::InvalidArgumentError(format!("field '{name}' is not UTF-8: {e}"))
                    })?;
                if large {
                    (DataType::LargeUtf8, Arc::new(LargeStringArray::from(strings)))
                } else {
                    (DataType::Utf8, Arc::new(StringArray::from(strings)))
                }
            }
            _ if large => (
                DataType::LargeBinary,
                Arc::new(LargeBinaryArray::from_opt_vec(values)),
            ),
            _ => (DataType::Binary, Arc::new(BinaryArray::from_opt_vec(values))),
        });
    }

    macro_rules! primitive {
        ($native:ty, $array:ty, $dt:expr) => {{
            let values = buffer.values::<$native>();
            let column: Vec<Option<$native>> = values
                .into_iter()
                .take(n)
                .enumerate()
                .map(|(i, v)| buffer.is_valid(i).then_some(v))
                .collect();
            ($dt, Arc::new(<$array>::from(column)) as ArrayRef)
        }};
    }

    Ok(match info.datatype {
        Datatype::Int8 => primitive!(i8, Int8Array, DataType::Int8),
        Datatype::Int16 => primitive!(i16, Int16Array, DataType::Int16),
        Datatype::Int32 => primitive!(i32, Int32Array, DataType::Int32),
        Datatype::Int64 => primitive!(i64, Int64Array, DataType::Int64),
        Datatype::UInt8 => primitive!(u8, UInt8Array, DataType::UInt8),
        Datatype::UInt16 => primitive!(u16, UInt16Array, DataType::UInt16),
        Datatype::UInt32 => primitive!(u32, UInt32Array, DataType::UInt32),
        Datatype::UInt64 => primitive!(u64, UInt64Array, DataType::UInt64),
        Datatype::Float32 => primitive!(f32, Float32Array, DataType::Float32),
        Datatype::Float64 => primitive!(f64, Float64Array, DataType::Float64),
        Datatype::StringAscii | Datatype::Blob => {
            return Err(Error::InvalidArgumentError(format!(
                "fixed-size field '{name}' has a byte datatype"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use tilemerge_types::{Attribute, Dimension, encode_native};

    #[test]
    fn var_values_follow_offsets_in_either_mode() {
        let mut buf = QueryBuffer::var(64, 64);
        let format = OffsetsFormat {
            size: 4,
            elements: true,
            extra: true,
            element_size: 2,
        };
        buf.prepare(Some(format));
        // Cells of 2, 0 and 1 two-byte elements.
        let offsets: Vec<u8> = [0u32, 2, 2, 3].iter().flat_map(|o| o.to_le_bytes()).collect();
        buf.data_mut()[..16].copy_from_slice(&offsets);
        buf.var_mut().unwrap()[..6].copy_from_slice(b"aabbcc");
        buf.set_written(3, 16, 6);
        assert_eq!(buf.offsets(), vec![0, 2, 2, 3]);
        assert_eq!(buf.var_values(), vec![&b"aabb"[..], &b""[..], &b"cc"[..]]);
    }

    #[test]
    fn cell_capacity_accounts_for_extra_offset_and_validity() {
        let schema = ArraySchema::new(
            vec![Dimension::new("d", 0u32, 9)],
            vec![Attribute::var("s", Datatype::StringAscii).nullable()],
        )
        .unwrap();
        let info = schema.field("s").unwrap();
        let buf = QueryBuffer::var(40, 100).with_validity(3);
        let format = OffsetsFormat {
            size: 8,
            elements: false,
            extra: true,
            element_size: 1,
        };
        assert_eq!(buf.cell_capacity(&info, Some(format)), 3);
        let buf = QueryBuffer::var(40, 100).with_validity(10);
        assert_eq!(buf.cell_capacity(&info, Some(format)), 4);
    }

    #[test]
    fn record_batch_export_uses_large_types_for_64_bit_offsets() {
        let schema = ArraySchema::new(
            vec![Dimension::new("d", 0u32, 9)],
            vec![Attribute::var("s", Datatype::StringAscii).nullable()],
        )
        .unwrap();
        let mut d = QueryBuffer::fixed(8);
        d.prepare(None);
        d.data_mut().copy_from_slice(&encode_native(&[1u32, 2]));
        d.set_written(2, 8, 0);

        let mut s = QueryBuffer::var(16, 8).with_validity(2);
        s.prepare(Some(OffsetsFormat {
            size: 8,
            elements: false,
            extra: false,
            element_size: 1,
        }));
        s.data_mut().copy_from_slice(&encode_native(&[0u64, 2]));
        s.var_mut().unwrap()[..2].copy_from_slice(b"hi");
        s.validity_mut().unwrap().copy_from_slice(&[1, 0]);
        s.set_written(2, 16, 2);

        let buffers = QueryBuffers::new().with("d", d).with("s", s);
        let batch = buffers.to_record_batch(&schema).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(1).data_type(), &DataType::LargeUtf8);
        let col = batch
            .column(1)
            .as_any()
            .downcast_ref::<LargeStringArray>()
            .unwrap();
        assert_eq!(col.value(0), "hi");
        assert!(col.is_null(1));
    }
}
