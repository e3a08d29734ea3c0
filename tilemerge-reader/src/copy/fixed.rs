//! Copy of fixed-size fields and validity bytes.

use rayon::prelude::*;
use tilemerge_result::{Error, Result};
use tilemerge_types::{FieldInfo, FieldKind};

use super::{CopyTask, split_by};
use crate::buffers::QueryBuffer;
use crate::tile_store::TileStore;

/// Write `cells` values of `name` into `buffer`, one task per output range.
pub(crate) fn copy_fixed(
    store: &TileStore,
    tasks: &[CopyTask],
    name: &str,
    info: &FieldInfo,
    buffer: &mut QueryBuffer,
) -> Result<()> {
    let cs = info.cell_size();
    let cells: u64 = tasks.iter().map(|t| t.cells).sum();
    let data_len = cells as usize * cs;
    let data_chunks = split_by(
        &mut buffer.data_mut()[..data_len],
        tasks.iter().map(|t| t.cells as usize * cs),
    );
    tasks
        .par_iter()
        .zip(data_chunks)
        .try_for_each(|(task, out)| copy_values(store, task, name, info, out))?;
    copy_validity(store, tasks, name, buffer);
    buffer.set_written(cells, data_len, 0);
    Ok(())
}

fn copy_values(
    store: &TileStore,
    task: &CopyTask,
    name: &str,
    info: &FieldInfo,
    out: &mut [u8],
) -> Result<()> {
    let cs = info.cell_size();
    let mut o = 0usize;
    for slab in &task.slabs {
        let tile = store.get(slab.tile);
        match info.kind {
            FieldKind::Timestamps => {
                for pos in slab.positions() {
                    out[o..o + cs].copy_from_slice(&tile.timestamp(pos).to_le_bytes());
                    o += cs;
                }
            }
            FieldKind::DeleteTimestamps => {
                for pos in slab.positions() {
                    out[o..o + cs].copy_from_slice(&tile.delete_timestamp(pos).to_le_bytes());
                    o += cs;
                }
            }
            FieldKind::Dimension(_) | FieldKind::Attribute(_) => {
                let column = tile.column(info, name).ok_or_else(|| {
                    Error::Internal(format!(
                        "field '{name}' is not loaded for tile {:?}",
                        tile.id()
                    ))
                })?;
                if slab.reversed {
                    for pos in slab.positions() {
                        let src = pos as usize * cs;
                        out[o..o + cs].copy_from_slice(&column[src..src + cs]);
                        o += cs;
                    }
                } else {
                    let src = slab.start as usize * cs;
                    let len = slab.length as usize * cs;
                    out[o..o + len].copy_from_slice(&column[src..src + len]);
                    o += len;
                }
            }
        }
    }
    Ok(())
}

/// Copy one validity byte per cell, if the buffer has a validity buffer.
pub(crate) fn copy_validity(store: &TileStore, tasks: &[CopyTask], name: &str, buffer: &mut QueryBuffer) {
    let Some(validity) = buffer.validity_mut() else {
        return;
    };
    let mut o = 0usize;
    for slab in tasks.iter().flat_map(|t| &t.slabs) {
        let tile = store.get(slab.tile);
        let source = tile.field_data(name).and_then(|d| d.validity.as_deref());
        for pos in slab.positions() {
            validity[o] = source.map_or(1, |v| v[pos as usize]);
            o += 1;
        }
    }
}
