//! Copy of var-sized fields: offsets first, then payloads.

use rayon::prelude::*;
use tilemerge_result::{Error, Result};

use super::{CopyTask, split_by};
use crate::buffers::{OffsetsFormat, QueryBuffer};
use crate::result_tile::var_bounds;
use crate::slab::ResultCellSlab;
use crate::tile_store::TileStore;

/// Payload bytes of each emitted cell, in output order.
pub(crate) fn cell_sizes(
    store: &TileStore,
    slabs: &[ResultCellSlab],
    name: &str,
) -> Result<Vec<u64>> {
    let mut sizes = Vec::new();
    for slab in slabs {
        let tile = store.get(slab.tile);
        let data = tile.field_data(name).ok_or_else(|| {
            Error::Internal(format!("field '{name}' is not loaded for tile {:?}", tile.id()))
        })?;
        let var_len = data.var.as_ref().map_or(0, Vec::len);
        sizes.extend(slab.positions().map(|pos| {
            let (start, end) = var_bounds(data, var_len, pos);
            (end - start) as u64
        }));
    }
    Ok(sizes)
}

/// Number of leading cells whose payloads fit `capacity` bytes.
pub(crate) fn fitting_cells(sizes: &[u64], capacity: u64) -> u64 {
    let mut total = 0u64;
    for (i, &s) in sizes.iter().enumerate() {
        total += s;
        if total > capacity {
            return i as u64;
        }
    }
    sizes.len() as u64
}

pub(crate) fn copy_var(
    store: &TileStore,
    tasks: &[CopyTask],
    name: &str,
    format: OffsetsFormat,
    sizes: &[u64],
    buffer: &mut QueryBuffer,
) -> Result<()> {
    let cells: usize = tasks.iter().map(|t| t.cells as usize).sum();
    let sizes = &sizes[..cells];
    let total: u64 = sizes.iter().sum();
    if format.size == 4 && format.encode(total) > u64::from(u32::MAX) {
        return Err(Error::OffsetOverflow {
            field: name.to_string(),
            total,
        });
    }

    let offsets = buffer.data_mut();
    let mut running = 0u64;
    let mut write = |i: usize, byte_offset: u64| {
        let v = format.encode(byte_offset);
        let at = i * format.size;
        if format.size == 4 {
            offsets[at..at + 4].copy_from_slice(&(v as u32).to_le_bytes());
        } else {
            offsets[at..at + 8].copy_from_slice(&v.to_le_bytes());
        }
    };
    for (i, &s) in sizes.iter().enumerate() {
        write(i, running);
        running += s;
    }
    let mut offset_slots = cells;
    if format.extra {
        write(cells, running);
        offset_slots += 1;
    }

    let task_bytes: Vec<usize> = {
        let mut start = 0usize;
        tasks
            .iter()
            .map(|t| {
                let end = start + t.cells as usize;
                let bytes = sizes[start..end].iter().sum::<u64>() as usize;
                start = end;
                bytes
            })
            .collect()
    };
    let var = buffer
        .var_mut()
        .ok_or_else(|| Error::InvalidArgumentError(format!("buffer '{name}' has no var part")))?;
    let chunks = split_by(&mut var[..total as usize], task_bytes.iter().copied());
    tasks
        .par_iter()
        .zip(chunks)
        .try_for_each(|(task, out)| copy_payloads(store, task, name, out))?;

    super::fixed::copy_validity(store, tasks, name, buffer);
    buffer.set_written(cells as u64, offset_slots * format.size, total as usize);
    Ok(())
}

fn copy_payloads(store: &TileStore, task: &CopyTask, name: &str, out: &mut [u8]) -> Result<()> {
    let mut o = 0usize;
    for slab in &task.slabs {
        let tile = store.get(slab.tile);
        let data = tile.field_data(name).ok_or_else(|| {
            Error::Internal(format!("field '{name}' is not loaded for tile {:?}", tile.id()))
        })?;
        let Some(var) = data.var.as_deref() else {
            return Err(Error::Internal(format!("field '{name}' has no payload")));
        };
        if !slab.reversed {
            // Payloads of consecutive cells are contiguous.
            let (start, _) = var_bounds(data, var.len(), slab.start);
            let (_, end) = var_bounds(data, var.len(), slab.start + slab.length - 1);
            out[o..o + end - start].copy_from_slice(&var[start..end]);
            o += end - start;
            continue;
        }
        for pos in slab.positions() {
            let (start, end) = var_bounds(data, var.len(), pos);
            out[o..o + end - start].copy_from_slice(&var[start..end]);
            o += end - start;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitting_cells_stops_before_the_first_overflow() {
        assert_eq!(fitting_cells(&[3, 0, 4, 2], 7), 3);
        assert_eq!(fitting_cells(&[3, 0, 4, 2], 9), 4);
        assert_eq!(fitting_cells(&[8], 7), 0);
        assert_eq!(fitting_cells(&[], 0), 0);
    }
}
