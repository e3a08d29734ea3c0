//! In-memory fragments and tile loader used for tests and benchmarks.

use std::cmp::Ordering;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tilemerge_result::{Error, Result};
use tilemerge_types::{
    ArraySchema, DELETE_TIMESTAMPS_FIELD, Datatype, FragmentIdx, NativeType, ScalarValue,
    TIMESTAMPS_FIELD, TileIdx, encode_native,
};

use crate::traits::{
    CellCoords, Fragment, FragmentMetadata, Mbr, TileBounds, TileData, TileLoader, TileStats,
};

struct MemTile {
    cell_num: u64,
    fields: FxHashMap<String, TileData>,
    mbr: Mbr,
    bounds: Option<TileBounds>,
    stats: FxHashMap<String, TileStats>,
}

/// A fully materialized fragment. Built with [`MemFragmentBuilder`].
pub struct MemFragment {
    timestamp_range: (u64, u64),
    has_timestamps: bool,
    has_delete_meta: bool,
    tiles: Vec<MemTile>,
}

impl MemFragment {
    fn tile(&self, tile: TileIdx) -> Option<&MemTile> {
        self.tiles.get(tile as usize)
    }

    pub fn total_cells(&self) -> u64 {
        self.tiles.iter().map(|t| t.cell_num).sum()
    }
}

impl FragmentMetadata for MemFragment {
    fn tile_num(&self) -> u64 {
        self.tiles.len() as u64
    }

    fn cell_num(&self, tile: TileIdx) -> u64 {
        self.tile(tile).map_or(0, |t| t.cell_num)
    }

    fn timestamp_range(&self) -> (u64, u64) {
        self.timestamp_range
    }

    fn has_timestamps(&self) -> bool {
        self.has_timestamps
    }

    fn has_delete_meta(&self) -> bool {
        self.has_delete_meta
    }

    fn tile_mbr(&self, tile: TileIdx) -> Mbr {
        self.tile(tile).map(|t| t.mbr.clone()).unwrap_or_default()
    }

    fn tile_global_bounds(&self, tile: TileIdx) -> Option<TileBounds> {
        self.tile(tile).and_then(|t| t.bounds.clone())
    }

    fn field_tile_size(&self, tile: TileIdx, field: &str) -> u64 {
        self.tile(tile)
            .and_then(|t| t.fields.get(field))
            .map_or(0, TileData::size)
    }

    fn tile_stats(&self, tile: TileIdx, field: &str) -> Option<TileStats> {
        self.tile(tile).and_then(|t| t.stats.get(field).copied())
    }
}

/// Holds a list of in-memory fragments and serves their tiles.
#[derive(Default, Clone)]
pub struct MemFragmentStore {
    fragments: Vec<Arc<MemFragment>>,
}

impl MemFragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return its index.
    pub fn push(&mut self, fragment: MemFragment) -> FragmentIdx {
        self.fragments.push(Arc::new(fragment));
        self.fragments.len() - 1
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Metadata handles in fragment-index order, as a reader expects them.
    pub fn fragments(&self) -> Vec<Fragment> {
        self.fragments
            .iter()
            .map(|f| Arc::clone(f) as Fragment)
            .collect()
    }
}

impl TileLoader for MemFragmentStore {
    fn load(&self, fragment: FragmentIdx, tile: TileIdx, field: &str) -> Result<TileData> {
        let frag = self.fragments.get(fragment).ok_or_else(|| {
            Error::InvalidArgumentError(format!("fragment {fragment} does not exist"))
        })?;
        let t = frag.tile(tile).ok_or_else(|| {
            Error::InvalidArgumentError(format!("tile {tile} of fragment {fragment} does not exist"))
        })?;
        t.fields
            .get(field)
            .cloned()
            .ok_or_else(|| Error::tile_corrupt(fragment, tile, field, "field is not stored"))
    }
}

enum Column {
    Fixed(Vec<u8>),
    Var(Vec<Vec<u8>>),
}

type CoordsCmp = Box<dyn Fn(&[&[u8]], &[&[u8]]) -> Ordering>;

/// Columnar builder for [`MemFragment`].
///
/// Cells are split into tiles of `capacity` cells in the order they are
/// given, unless [`MemFragmentBuilder::sort_cells_by`] installs an ordering.
pub struct MemFragmentBuilder<'a> {
    schema: &'a ArraySchema,
    timestamp: u64,
    capacity: usize,
    columns: FxHashMap<String, Column>,
    validity: FxHashMap<String, Vec<bool>>,
    timestamps: Option<Vec<u64>>,
    delete_timestamps: Option<Vec<u64>>,
    record_bounds: bool,
    record_stats: bool,
    order: Option<CoordsCmp>,
}

impl<'a> MemFragmentBuilder<'a> {
    pub fn new(schema: &'a ArraySchema, timestamp: u64) -> Self {
        Self {
            schema,
            timestamp,
            capacity: 10_000,
            columns: FxHashMap::default(),
            validity: FxHashMap::default(),
            timestamps: None,
            delete_timestamps: None,
            record_bounds: true,
            record_stats: true,
            order: None,
        }
    }

    /// Cells per tile.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Coordinates (or values) of a fixed-size field.
    pub fn column<T: NativeType>(mut self, name: &str, values: &[T]) -> Self {
        self.columns
            .insert(name.to_string(), Column::Fixed(encode_native(values)));
        self
    }

    pub fn var_column<V: AsRef<[u8]>>(mut self, name: &str, values: &[V]) -> Self {
        self.columns.insert(
            name.to_string(),
            Column::Var(values.iter().map(|v| v.as_ref().to_vec()).collect()),
        );
        self
    }

    pub fn validity(mut self, name: &str, valid: &[bool]) -> Self {
        self.validity.insert(name.to_string(), valid.to_vec());
        self
    }

    /// Per-cell write timestamps. Marks the fragment as consolidated with
    /// timestamps; its timestamp range becomes the span of the values.
    pub fn timestamps(mut self, timestamps: &[u64]) -> Self {
        self.timestamps = Some(timestamps.to_vec());
        self
    }

    /// Per-cell delete timestamps, 0 meaning not deleted.
    pub fn delete_timestamps(mut self, delete_timestamps: &[u64]) -> Self {
        self.delete_timestamps = Some(delete_timestamps.to_vec());
        self
    }

    /// Do not record per-tile global bounds.
    pub fn without_bounds(mut self) -> Self {
        self.record_bounds = false;
        self
    }

    /// Do not record per-tile statistics.
    pub fn without_stats(mut self) -> Self {
        self.record_stats = false;
        self
    }

    /// Stable-sort cells by their coordinates before tiling.
    pub fn sort_cells_by<F>(mut self, cmp: F) -> Self
    where
        F: Fn(&[&[u8]], &[&[u8]]) -> Ordering + 'static,
    {
        self.order = Some(Box::new(cmp));
        self
    }

    pub fn build(mut self) -> Result<MemFragment> {
        let schema = self.schema;
        let cell_num = self.cell_count()?;

        // Pseudo-fields travel as ordinary fixed columns from here on.
        let has_timestamps = self.timestamps.is_some();
        let has_delete_meta = self.delete_timestamps.is_some();
        let timestamp_range = match &self.timestamps {
            Some(ts) if !ts.is_empty() => (
                ts.iter().copied().min().unwrap_or(self.timestamp),
                ts.iter().copied().max().unwrap_or(self.timestamp),
            ),
            _ => (self.timestamp, self.timestamp),
        };
        if let Some(ts) = self.timestamps.take() {
            self.columns
                .insert(TIMESTAMPS_FIELD.to_string(), Column::Fixed(encode_native(&ts)));
        }
        if let Some(ts) = self.delete_timestamps.take() {
            self.columns.insert(
                DELETE_TIMESTAMPS_FIELD.to_string(),
                Column::Fixed(encode_native(&ts)),
            );
        }
        for a in &schema.attributes {
            if a.nullable && !self.validity.contains_key(&a.name) {
                self.validity.insert(a.name.clone(), vec![true; cell_num]);
            }
        }

        let perm = self.permutation(cell_num);
        let mut tiles = Vec::with_capacity(cell_num.div_ceil(self.capacity));
        let mut start = 0;
        while start < cell_num {
            let end = (start + self.capacity).min(cell_num);
            tiles.push(self.build_tile(&perm[start..end])?);
            start = end;
        }

        tracing::trace!(
            cells = cell_num,
            tiles = tiles.len(),
            timestamp = self.timestamp,
            "built in-memory fragment"
        );

        Ok(MemFragment {
            timestamp_range,
            has_timestamps,
            has_delete_meta,
            tiles,
        })
    }

    fn cell_count(&self) -> Result<usize> {
        let dim0 = &self.schema.dimensions[0];
        let n = match self.columns.get(&dim0.name) {
            Some(Column::Fixed(bytes)) => bytes.len() / dim0.cell_size(),
            _ => {
                return Err(Error::InvalidArgumentError(format!(
                    "missing coordinates for dimension '{}'",
                    dim0.name
                )));
            }
        };
        let check = |name: &str, len: usize| -> Result<()> {
            if len != n {
                return Err(Error::InvalidArgumentError(format!(
                    "field '{name}' has {len} cells, expected {n}"
                )));
            }
            Ok(())
        };
        for d in &self.schema.dimensions {
            match self.columns.get(&d.name) {
                Some(Column::Fixed(bytes)) => check(&d.name, bytes.len() / d.cell_size())?,
                _ => {
                    return Err(Error::InvalidArgumentError(format!(
                        "missing coordinates for dimension '{}'",
                        d.name
                    )));
                }
            }
        }
        for a in &self.schema.attributes {
            match (self.columns.get(&a.name), a.var_sized) {
                (Some(Column::Fixed(bytes)), false) => {
                    check(&a.name, bytes.len() / a.datatype.size())?
                }
                (Some(Column::Var(cells)), true) => check(&a.name, cells.len())?,
                (None, _) => {
                    return Err(Error::InvalidArgumentError(format!(
                        "missing values for attribute '{}'",
                        a.name
                    )));
                }
                _ => {
                    return Err(Error::InvalidArgumentError(format!(
                        "attribute '{}' given with the wrong fixed/var shape",
                        a.name
                    )));
                }
            }
        }
        for (name, v) in &self.validity {
            check(name, v.len())?;
        }
        if let Some(ts) = &self.timestamps {
            check(TIMESTAMPS_FIELD, ts.len())?;
        }
        if let Some(ts) = &self.delete_timestamps {
            check(DELETE_TIMESTAMPS_FIELD, ts.len())?;
        }
        Ok(n)
    }

    fn coords_of(&self, cell: usize) -> Vec<&[u8]> {
        self.schema
            .dimensions
            .iter()
            .map(|d| match self.columns.get(&d.name) {
                Some(Column::Fixed(bytes)) => {
                    let sz = d.cell_size();
                    &bytes[cell * sz..(cell + 1) * sz]
                }
                _ => &[][..],
            })
            .collect()
    }

    fn permutation(&self, cell_num: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..cell_num).collect();
        if let Some(cmp) = &self.order {
            perm.sort_by(|&a, &b| cmp(&self.coords_of(a), &self.coords_of(b)));
        }
        perm
    }

    fn build_tile(&self, cells: &[usize]) -> Result<MemTile> {
        let schema = self.schema;
        let mut fields = FxHashMap::default();
        let mut stats = FxHashMap::default();

        for (name, column) in &self.columns {
            let validity = self
                .validity
                .get(name)
                .map(|v| cells.iter().map(|&c| u8::from(v[c])).collect::<Vec<u8>>());
            let data = match column {
                Column::Fixed(bytes) => {
                    let size = schema
                        .field(name)
                        .map(|f| f.cell_size())
                        .ok_or_else(|| {
                            Error::InvalidArgumentError(format!("unknown field '{name}'"))
                        })?;
                    let mut fixed = Vec::with_capacity(cells.len() * size);
                    for &c in cells {
                        fixed.extend_from_slice(&bytes[c * size..(c + 1) * size]);
                    }
                    TileData {
                        fixed,
                        var: None,
                        validity,
                    }
                }
                Column::Var(values) => {
                    let mut offsets = Vec::with_capacity(cells.len());
                    let mut var = Vec::new();
                    for &c in cells {
                        offsets.push(var.len() as u64);
                        var.extend_from_slice(&values[c]);
                    }
                    TileData {
                        fixed: encode_native(&offsets),
                        var: Some(var),
                        validity,
                    }
                }
            };
            if self.record_stats {
                if let Some(info) = schema.field(name) {
                    if !info.var_sized && info.datatype.is_numeric() {
                        stats.insert(name.clone(), compute_stats(info.datatype, &data));
                    }
                }
            }
            fields.insert(name.clone(), data);
        }

        let coords: Vec<CellCoords> = cells
            .iter()
            .map(|&c| self.coords_of(c).into_iter().map(<[u8]>::to_vec).collect())
            .collect();
        let mbr: Mbr = schema
            .dimensions
            .iter()
            .enumerate()
            .map(|(d, dim)| {
                let mut lo = coords[0][d].clone();
                let mut hi = coords[0][d].clone();
                for c in &coords[1..] {
                    if dim.datatype.compare(&c[d], &lo) == Ordering::Less {
                        lo = c[d].clone();
                    }
                    if dim.datatype.compare(&c[d], &hi) == Ordering::Greater {
                        hi = c[d].clone();
                    }
                }
                (lo, hi)
            })
            .collect();
        let bounds = if self.record_bounds {
            Some(TileBounds {
                first: coords[0].clone(),
                last: coords[coords.len() - 1].clone(),
            })
        } else {
            None
        };

        Ok(MemTile {
            cell_num: cells.len() as u64,
            fields,
            mbr,
            bounds,
            stats,
        })
    }
}

fn compute_stats(datatype: Datatype, data: &TileData) -> TileStats {
    let size = datatype.size();
    let cell_count = (data.fixed.len() / size) as u64;
    let mut out = TileStats {
        min: None,
        max: None,
        sum: None,
        null_count: 0,
        cell_count,
    };
    for (i, cell) in data.fixed.chunks_exact(size).enumerate() {
        let valid = data.validity.as_ref().is_none_or(|v| v[i] != 0);
        if !valid {
            out.null_count += 1;
            continue;
        }
        let Some(v) = ScalarValue::from_le_bytes(datatype, cell) else {
            continue;
        };
        out.min = Some(out.min.map_or(v, |m| m.min(v)));
        out.max = Some(out.max.map_or(v, |m| m.max(v)));
        out.sum = Some(out.sum.map_or(v, |s| s.add(v)));
    }
    out
}
