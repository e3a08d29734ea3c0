//! A fragment tile materialized for the merge.
//!
//! Coordinates, timestamps, delete metadata and condition fields are loaded
//! eagerly because ordering and visibility depend on them. Attribute data is
//! attached later, only for the tiles and fields a copy pass needs, and is
//! dropped again once the pass is done.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tilemerge_result::{Error, Result};
use tilemerge_storage::{FragmentMetadata, TileData, TileLoader};
use tilemerge_types::{
    ArraySchema, DELETE_TIMESTAMPS_FIELD, FieldInfo, FieldKind, FragmentIdx, NativeType,
    ResultTileId, TIMESTAMPS_FIELD, TileIdx,
};

use crate::bitmap::CellBitmap;
use crate::comparator::GlobalOrder;
use crate::condition::{DeleteCondition, QueryCondition};
use crate::options::ReadMode;
use crate::subarray::{Overlap, ResolvedSubarray};

/// Rules deciding which cells of a tile are visible to a read.
pub(crate) struct Visibility {
    pub window: (u64, u64),
    pub mode: ReadMode,
    pub allows_duplicates: bool,
    pub subarray: ResolvedSubarray,
    pub condition: Option<Arc<dyn QueryCondition>>,
    /// Only deletes issued inside the read window.
    pub delete_conditions: Vec<DeleteCondition>,
    /// Attribute fields the conditions read.
    pub condition_fields: Vec<String>,
}

impl Visibility {
    /// Whether deleted cells are excluded from the tile bitmap.
    pub fn drops_deleted(&self) -> bool {
        match self.mode {
            ReadMode::Standard => true,
            ReadMode::Consolidation { purge_deletes } => purge_deletes && self.allows_duplicates,
        }
    }

    pub fn tracks_deletes(&self, fragment: &dyn FragmentMetadata) -> bool {
        fragment.has_delete_meta() || !self.delete_conditions.is_empty()
    }

    fn window_contains(&self, ts: u64) -> bool {
        ts >= self.window.0 && ts <= self.window.1
    }
}

/// Shared inputs for loading result tiles.
pub(crate) struct TileLoadContext {
    pub schema: Arc<ArraySchema>,
    pub loader: Arc<dyn TileLoader>,
    pub order: Arc<GlobalOrder>,
    pub visibility: Arc<Visibility>,
}

impl TileLoadContext {
    /// Bytes a result tile of `tile` holds, charged to the coordinate budget.
    pub fn estimate_memory(&self, fragment: &dyn FragmentMetadata, tile: TileIdx) -> u64 {
        let cell_num = fragment.cell_num(tile);
        let mut bytes: u64 = self
            .schema
            .dimensions
            .iter()
            .map(|d| fragment.field_tile_size(tile, &d.name))
            .sum();
        if fragment.has_timestamps() {
            bytes += fragment.field_tile_size(tile, TIMESTAMPS_FIELD);
        }
        if fragment.has_delete_meta() {
            bytes += fragment.field_tile_size(tile, DELETE_TIMESTAMPS_FIELD);
        }
        if self.visibility.tracks_deletes(fragment) {
            bytes += 8 * cell_num;
        }
        for name in &self.visibility.condition_fields {
            bytes += fragment.field_tile_size(tile, name);
        }
        if self.order.is_hilbert() {
            bytes += 8 * cell_num;
        }
        bytes + cell_num
    }

    pub fn load(
        &self,
        fragment_idx: FragmentIdx,
        fragment: &dyn FragmentMetadata,
        tile: TileIdx,
        memory: u64,
    ) -> Result<ResultTile> {
        let schema = &self.schema;
        let cell_num = fragment.cell_num(tile);
        let id = ResultTileId::new(fragment_idx, tile);

        let mut coords = Vec::with_capacity(schema.dim_num());
        for d in &schema.dimensions {
            let data = self.loader.load(fragment_idx, tile, &d.name)?;
            let info = schema.require_field(&d.name)?;
            validate_tile_data(&info, &data, cell_num)
                .map_err(|reason| Error::tile_corrupt(fragment_idx, tile, &d.name, reason))?;
            coords.push(data.fixed);
        }

        let timestamps = if fragment.has_timestamps() {
            Some(self.load_u64_field(fragment_idx, tile, TIMESTAMPS_FIELD, cell_num)?)
        } else {
            None
        };
        let delete_meta = if fragment.has_delete_meta() {
            Some(self.load_u64_field(fragment_idx, tile, DELETE_TIMESTAMPS_FIELD, cell_num)?)
        } else {
            None
        };

        let mut fields = FxHashMap::default();
        for name in &self.visibility.condition_fields {
            let info = schema.require_field(name)?;
            let data = self.loader.load(fragment_idx, tile, name)?;
            validate_tile_data(&info, &data, cell_num)
                .map_err(|reason| Error::tile_corrupt(fragment_idx, tile, name, reason))?;
            fields.insert(name.clone(), data);
        }

        let mut rt = ResultTile {
            schema: Arc::clone(schema),
            id,
            cell_num,
            coords,
            timestamps,
            fragment_timestamp: fragment.timestamp_range().0,
            delete_meta,
            deleted_at: None,
            hilbert: None,
            bitmap: CellBitmap::live(cell_num),
            fields,
            copy_fields: Vec::new(),
            coords_memory: memory,
            attribute_memory: 0,
        };

        if self.order.is_hilbert() {
            let values: Vec<u64> = (0..cell_num)
                .map(|pos| {
                    let c: Vec<&[u8]> = (0..rt.coords.len()).map(|d| rt.coord(d, pos)).collect();
                    self.order.hilbert_value(&c)
                })
                .collect();
            rt.hilbert = Some(values);
        }

        let vis = &self.visibility;
        if vis.tracks_deletes(fragment) {
            rt.deleted_at = Some(rt.compute_deleted_at(vis));
        }

        let overlap = vis.subarray.overlap(&fragment.tile_mbr(tile));
        let (ts_first, ts_last) = fragment.timestamp_range();
        let window_covers = vis.window_contains(ts_first) && vis.window_contains(ts_last);
        let drops_deleted = vis.drops_deleted() && rt.deleted_at.is_some();
        if overlap != Overlap::Full || !window_covers || vis.condition.is_some() || drops_deleted {
            let marks: Vec<u8> = (0..cell_num)
                .map(|pos| u8::from(rt.cell_visible(vis, overlap, drops_deleted, pos)))
                .collect();
            rt.bitmap = CellBitmap::from_dense(marks);
        }

        tracing::trace!(
            fragment = fragment_idx,
            tile,
            cells = cell_num,
            live = rt.bitmap.count_live(),
            "created result tile"
        );
        Ok(rt)
    }

    fn load_u64_field(
        &self,
        fragment: FragmentIdx,
        tile: TileIdx,
        name: &str,
        cell_num: u64,
    ) -> Result<Vec<u8>> {
        let data = self.loader.load(fragment, tile, name)?;
        if data.fixed.len() as u64 != cell_num * 8 {
            return Err(Error::tile_corrupt(
                fragment,
                tile,
                name,
                format!("expected {} bytes, got {}", cell_num * 8, data.fixed.len()),
            ));
        }
        Ok(data.fixed)
    }
}

/// Check decoded tile bytes against the field shape and the tile cell count.
pub(crate) fn validate_tile_data(
    info: &FieldInfo,
    data: &TileData,
    cell_num: u64,
) -> std::result::Result<(), String> {
    let n = cell_num as usize;
    if info.var_sized {
        if data.fixed.len() != n * 8 {
            return Err(format!(
                "expected {} offset bytes, got {}",
                n * 8,
                data.fixed.len()
            ));
        }
        let Some(var) = &data.var else {
            return Err("missing var-sized payload".into());
        };
        let mut prev = 0u64;
        for chunk in data.fixed.chunks_exact(8) {
            let off = u64::read_le(chunk);
            if off < prev || off > var.len() as u64 {
                return Err(format!("offset {off} out of order or past payload end"));
            }
            prev = off;
        }
    } else if data.fixed.len() != n * info.cell_size() {
        return Err(format!(
            "expected {} bytes, got {}",
            n * info.cell_size(),
            data.fixed.len()
        ));
    }
    if info.nullable {
        match &data.validity {
            Some(v) if v.len() == n => {}
            Some(v) => return Err(format!("expected {n} validity bytes, got {}", v.len())),
            None => return Err("missing validity for nullable field".into()),
        }
    }
    Ok(())
}

/// One fragment tile held by the tile store.
pub struct ResultTile {
    schema: Arc<ArraySchema>,
    id: ResultTileId,
    cell_num: u64,
    coords: Vec<Vec<u8>>,
    timestamps: Option<Vec<u8>>,
    fragment_timestamp: u64,
    delete_meta: Option<Vec<u8>>,
    /// Effective delete timestamp per cell, 0 when not deleted.
    deleted_at: Option<Vec<u64>>,
    hilbert: Option<Vec<u64>>,
    bitmap: CellBitmap,
    fields: FxHashMap<String, TileData>,
    copy_fields: Vec<String>,
    coords_memory: u64,
    attribute_memory: u64,
}

impl ResultTile {
    #[inline]
    pub fn id(&self) -> ResultTileId {
        self.id
    }

    #[inline]
    pub fn fragment_idx(&self) -> FragmentIdx {
        self.id.fragment_idx
    }

    #[inline]
    pub fn tile_idx(&self) -> TileIdx {
        self.id.tile_idx
    }

    #[inline]
    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    /// Encoded value of dimension `dim` at `pos`.
    #[inline]
    pub fn coord(&self, dim: usize, pos: u64) -> &[u8] {
        let size = self.schema.dimensions[dim].cell_size();
        let start = pos as usize * size;
        &self.coords[dim][start..start + size]
    }

    #[inline]
    pub fn hilbert(&self, pos: u64) -> u64 {
        self.hilbert.as_ref().map_or(0, |h| h[pos as usize])
    }

    pub fn has_timestamps(&self) -> bool {
        self.timestamps.is_some()
    }

    /// Write timestamp of the cell.
    #[inline]
    pub fn timestamp(&self, pos: u64) -> u64 {
        match &self.timestamps {
            Some(ts) => u64::read_le(&ts[pos as usize * 8..]),
            None => self.fragment_timestamp,
        }
    }

    /// Effective delete timestamp of the cell, 0 when it is not deleted at
    /// the read timestamp.
    #[inline]
    pub fn delete_timestamp(&self, pos: u64) -> u64 {
        self.deleted_at.as_ref().map_or(0, |d| d[pos as usize])
    }

    #[inline]
    pub fn is_deleted(&self, pos: u64) -> bool {
        self.delete_timestamp(pos) != 0
    }

    pub fn bitmap(&self) -> &CellBitmap {
        &self.bitmap
    }

    /// Fixed-size value of `name` at `pos`: a dimension, an attribute that is
    /// currently loaded, or the timestamp pseudo-fields.
    pub fn fixed_value(&self, name: &str, pos: u64) -> Option<&[u8]> {
        let info = self.schema.field(name)?;
        if info.var_sized {
            return None;
        }
        let size = info.cell_size();
        let start = pos as usize * size;
        match info.kind {
            FieldKind::Dimension(d) => Some(self.coord(d, pos)),
            FieldKind::Timestamps => self.timestamps.as_deref().map(|t| &t[start..start + size]),
            FieldKind::DeleteTimestamps => {
                self.delete_meta.as_deref().map(|t| &t[start..start + size])
            }
            FieldKind::Attribute(_) => self
                .fields
                .get(name)
                .map(|data| &data.fixed[start..start + size]),
        }
    }

    /// Whether a nullable attribute is null at `pos`.
    pub fn is_null(&self, name: &str, pos: u64) -> bool {
        self.fields
            .get(name)
            .and_then(|d| d.validity.as_ref())
            .is_some_and(|v| v[pos as usize] == 0)
    }

    /// Typed read of a fixed-size numeric field.
    pub fn value<T: NativeType>(&self, name: &str, pos: u64) -> Option<T> {
        self.fixed_value(name, pos)
            .filter(|b| b.len() == T::SIZE)
            .map(T::read_le)
    }

    /// Contiguous fixed-size bytes of a dimension or loaded attribute.
    pub(crate) fn column(&self, info: &FieldInfo, name: &str) -> Option<&[u8]> {
        match info.kind {
            FieldKind::Dimension(d) => Some(&self.coords[d]),
            FieldKind::Attribute(_) => self.fields.get(name).map(|data| data.fixed.as_slice()),
            FieldKind::Timestamps | FieldKind::DeleteTimestamps => None,
        }
    }

    pub(crate) fn field_data(&self, name: &str) -> Option<&TileData> {
        self.fields.get(name)
    }

    pub(crate) fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub(crate) fn coords_memory(&self) -> u64 {
        self.coords_memory
    }

    /// Attach attribute data loaded for a copy pass.
    pub(crate) fn attach_copy_field(&mut self, name: String, data: TileData) {
        self.attribute_memory += data.size();
        self.copy_fields.push(name.clone());
        self.fields.insert(name, data);
    }

    /// Drop attribute data attached for a copy pass; returns the bytes freed.
    pub(crate) fn release_copy_fields(&mut self) -> u64 {
        for name in self.copy_fields.drain(..) {
            self.fields.remove(&name);
        }
        std::mem::take(&mut self.attribute_memory)
    }

    fn compute_deleted_at(&self, vis: &Visibility) -> Vec<u64> {
        let end = vis.window.1;
        (0..self.cell_num)
            .map(|pos| {
                let mut at = match &self.delete_meta {
                    Some(meta) => {
                        let d = u64::read_le(&meta[pos as usize * 8..]);
                        if d <= end { d } else { 0 }
                    }
                    None => 0,
                };
                let ts = self.timestamp(pos);
                for dc in &vis.delete_conditions {
                    if ts < dc.timestamp && dc.condition.evaluate(self, pos) {
                        at = if at == 0 { dc.timestamp } else { at.min(dc.timestamp) };
                    }
                }
                at
            })
            .collect()
    }

    fn cell_visible(&self, vis: &Visibility, overlap: Overlap, drops_deleted: bool, pos: u64) -> bool {
        if overlap != Overlap::Full && !vis.subarray.contains(|d| self.coord(d, pos)) {
            return false;
        }
        if !vis.window_contains(self.timestamp(pos)) {
            return false;
        }
        if drops_deleted && self.is_deleted(pos) {
            return false;
        }
        match &vis.condition {
            Some(c) => c.evaluate(self, pos),
            None => true,
        }
    }
}

/// Byte range of cell `pos` inside a var-sized payload of length `var_len`.
#[inline]
pub(crate) fn var_bounds(data: &TileData, var_len: usize, pos: u64) -> (usize, usize) {
    let i = pos as usize;
    let start = u64::read_le(&data.fixed[i * 8..]) as usize;
    let end = if (i + 1) * 8 < data.fixed.len() {
        u64::read_le(&data.fixed[(i + 1) * 8..]) as usize
    } else {
        var_len
    };
    (start, end)
}

impl std::fmt::Debug for ResultTile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultTile")
            .field("id", &self.id)
            .field("cell_num", &self.cell_num)
            .field("live", &self.bitmap.count_live())
            .finish_non_exhaustive()
    }
}
