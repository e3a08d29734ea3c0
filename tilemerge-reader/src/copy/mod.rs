//! Copy of merged cells into caller buffers.
//!
//! A copy pass runs in three steps. First the attribute tiles behind the
//! slabs are loaded, as far as the attribute budget allows. Then the cutoff
//! is computed, the number of leading cells that every buffer can hold.
//! Finally each field is copied, in parallel over disjoint output ranges.

pub mod aggregate;
mod fixed;
mod var;

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use tilemerge_result::{Error, Result};
use tilemerge_storage::{Fragment, TileData, TileLoader};
use tilemerge_types::{ArraySchema, FieldInfo, FieldKind, FragmentIdx, TileIdx};

use crate::buffers::{OffsetsFormat, QueryBuffer};
use crate::result_tile::{ResultTile, validate_tile_data};
use crate::slab::ResultCellSlab;
use crate::tile_store::{TileHandle, TileStore};

pub(crate) use fixed::copy_fixed;
pub(crate) use var::{cell_sizes, copy_var, fitting_cells};

/// Slabs copied by one worker into one contiguous output range.
#[derive(Debug, Default)]
pub(crate) struct CopyTask {
    pub slabs: Vec<ResultCellSlab>,
    pub cells: u64,
}

/// Partition the first `cells` emitted cells into tasks of at least
/// `min_cells` cells, splitting long slabs.
pub(crate) fn plan_tasks(slabs: &[ResultCellSlab], cells: u64, min_cells: usize) -> Vec<CopyTask> {
    let min_cells = min_cells.max(1) as u64;
    let mut tasks = Vec::new();
    let mut current = CopyTask::default();
    let mut left = cells;
    for slab in slabs {
        if left == 0 {
            break;
        }
        let mut rest = slab.split_at(left).0;
        left -= rest.length;
        while rest.length > 0 {
            let room = min_cells - current.cells.min(min_cells - 1);
            let (head, tail) = rest.split_at(room);
            current.cells += head.length;
            current.slabs.push(head);
            rest = tail;
            if current.cells >= min_cells {
                tasks.push(std::mem::take(&mut current));
            }
        }
    }
    if current.cells > 0 {
        tasks.push(current);
    }
    tasks
}

/// The slabs holding the first `cells` emitted cells.
pub(crate) fn take_cells(slabs: &[ResultCellSlab], cells: u64) -> Vec<ResultCellSlab> {
    let mut left = cells;
    let mut out = Vec::new();
    for slab in slabs {
        if left == 0 {
            break;
        }
        let head = slab.split_at(left).0;
        left -= head.length;
        out.push(head);
    }
    out
}

/// Split `buf` into consecutive chunks of the given lengths.
pub(crate) fn split_by(
    mut buf: &mut [u8],
    lengths: impl Iterator<Item = usize>,
) -> Vec<&mut [u8]> {
    let mut out = Vec::new();
    for len in lengths {
        let (head, tail) = std::mem::take(&mut buf).split_at_mut(len);
        out.push(head);
        buf = tail;
    }
    out
}

/// One requested output field.
#[derive(Debug, Clone)]
pub(crate) struct FieldCopy {
    pub name: String,
    pub info: FieldInfo,
    pub offsets: Option<OffsetsFormat>,
}

impl FieldCopy {
    pub fn is_attribute(&self) -> bool {
        matches!(self.info.kind, FieldKind::Attribute(_))
    }
}

/// Attribute tiles to load for one copy pass.
#[derive(Debug, Default)]
pub(crate) struct AttributePlan {
    pub loads: Vec<AttributeLoad>,
    /// Emitted cells whose tiles are covered by `loads`.
    pub cells: u64,
    pub bytes: u64,
}

#[derive(Debug)]
pub(crate) struct AttributeLoad {
    pub tile: TileHandle,
    pub fragment: FragmentIdx,
    pub tile_idx: TileIdx,
    pub fields: Vec<String>,
}

/// Walk slabs in output order admitting their tiles' attribute data until
/// the budget runs out. `fields_for` names the fields a slab's tile needs;
/// fields the tile already holds cost nothing.
pub(crate) fn plan_attribute_loads(
    store: &TileStore,
    fragments: &[Fragment],
    slabs: &[ResultCellSlab],
    cells: u64,
    available: u64,
    mut fields_for: impl FnMut(&ResultTile, &ResultCellSlab) -> Vec<String>,
) -> Result<AttributePlan> {
    let mut plan = AttributePlan::default();
    let mut admitted: Vec<(TileHandle, usize)> = Vec::new();
    let mut emitted = 0u64;
    for slab in slabs {
        if emitted >= cells {
            break;
        }
        let tile = store.get(slab.tile);
        let mut wanted: Vec<String> = fields_for(tile, slab)
            .into_iter()
            .filter(|f| !tile.has_field(f))
            .collect();
        let existing = admitted.iter().position(|(h, _)| *h == slab.tile);
        if let Some(i) = existing {
            let load = &plan.loads[admitted[i].1];
            wanted.retain(|f| !load.fields.contains(f));
        }
        wanted.sort();
        wanted.dedup();

        let meta = &fragments[tile.fragment_idx()];
        let bytes: u64 = wanted
            .iter()
            .map(|f| meta.field_tile_size(tile.tile_idx(), f))
            .sum();
        if plan.bytes + bytes > available {
            if emitted == 0 {
                return Err(Error::MemoryBudgetExceeded(format!(
                    "attribute tiles of fragment {} tile {} need {bytes} bytes, the copy budget is {available}",
                    tile.fragment_idx(),
                    tile.tile_idx()
                )));
            }
            break;
        }
        plan.bytes += bytes;
        match existing {
            Some(i) => plan.loads[admitted[i].1].fields.extend(wanted),
            None if !wanted.is_empty() => {
                admitted.push((slab.tile, plan.loads.len()));
                plan.loads.push(AttributeLoad {
                    tile: slab.tile,
                    fragment: tile.fragment_idx(),
                    tile_idx: tile.tile_idx(),
                    fields: wanted,
                });
            }
            None => {}
        }
        emitted += slab.length.min(cells - emitted);
    }
    plan.cells = emitted;
    Ok(plan)
}

/// Load every planned attribute tile in parallel; nothing is attached unless
/// all loads succeed. Returns the bytes attached.
pub(crate) fn load_attributes(
    store: &mut TileStore,
    schema: &ArraySchema,
    loader: &dyn TileLoader,
    fragments: &[Fragment],
    plan: &AttributePlan,
) -> Result<u64> {
    let loaded: Vec<Vec<(String, TileData)>> = plan
        .loads
        .par_iter()
        .map(|load| {
            let cell_num = fragments[load.fragment].cell_num(load.tile_idx);
            load.fields
                .iter()
                .map(|name| {
                    let info = schema.require_field(name)?;
                    let data = loader.load(load.fragment, load.tile_idx, name)?;
                    validate_tile_data(&info, &data, cell_num).map_err(|reason| {
                        Error::tile_corrupt(load.fragment, load.tile_idx, name, reason)
                    })?;
                    Ok((name.clone(), data))
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    let mut bytes = 0;
    for (load, fields) in plan.loads.iter().zip(loaded) {
        let tile = store.get_mut(load.tile).ok_or_else(|| {
            Error::Internal(format!("attribute load for evicted tile {:?}", load.tile))
        })?;
        for (name, data) in fields {
            bytes += data.size();
            tile.attach_copy_field(name, data);
        }
    }
    Ok(bytes)
}

/// Drop attribute data attached for a copy pass; returns the bytes freed.
pub(crate) fn release_attributes(store: &mut TileStore, plan: &AttributePlan) -> u64 {
    let handles: FxHashSet<TileHandle> = plan.loads.iter().map(|l| l.tile).collect();
    let handles: Vec<TileHandle> = handles.into_iter().collect();
    store
        .get_many_mut(&handles)
        .into_iter()
        .map(|t| t.release_copy_fields())
        .sum()
}

/// Copy the first `cells` emitted cells of every field into its buffer.
pub(crate) fn copy_fields(
    store: &TileStore,
    slabs: &[ResultCellSlab],
    cells: u64,
    fields: &[FieldCopy],
    buffers: &mut crate::buffers::QueryBuffers,
    var_sizes: &rustc_hash::FxHashMap<String, Vec<u64>>,
    min_cells_per_task: usize,
) -> Result<()> {
    let tasks = plan_tasks(slabs, cells, min_cells_per_task);
    for field in fields {
        let buffer: &mut QueryBuffer = buffers.get_mut(&field.name).ok_or_else(|| {
            Error::Internal(format!("no buffer for field '{}'", field.name))
        })?;
        match field.offsets {
            Some(format) => {
                let sizes = var_sizes.get(&field.name).ok_or_else(|| {
                    Error::Internal(format!("cell sizes of '{}' were not computed", field.name))
                })?;
                copy_var(store, &tasks, &field.name, format, sizes, buffer)?;
            }
            None => copy_fixed(store, &tasks, &field.name, &field.info, buffer)?,
        }
    }
    tracing::trace!(cells, tasks = tasks.len(), fields = fields.len(), "copied fields");
    Ok(())
}
