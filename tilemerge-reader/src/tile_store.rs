//! Slot arena owning every loaded result tile.
//!
//! Merge entries and cell slabs refer to tiles through [`TileHandle`]s, which
//! stay valid while the tile is held and are detected as stale afterwards.
//! Each fragment keeps its tiles in visit order; only the front may leave.

use std::collections::VecDeque;

use tilemerge_result::{Error, Result};
use tilemerge_types::{FragmentIdx, TileIdx};

use crate::result_tile::ResultTile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileHandle {
    slot: u32,
    generation: u32,
}

impl TileHandle {
    /// Handle that no store has issued, for unit tests of handle consumers.
    #[cfg(test)]
    pub(crate) fn detached(slot: u32) -> Self {
        Self {
            slot,
            generation: u32::MAX,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    tile: Option<ResultTile>,
}

#[derive(Debug)]
pub struct TileStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    per_fragment: Vec<VecDeque<TileHandle>>,
}

impl TileStore {
    pub fn new(fragment_count: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            per_fragment: vec![VecDeque::new(); fragment_count],
        }
    }

    /// Append a tile to the back of its fragment's list.
    pub fn insert(&mut self, tile: ResultTile) -> TileHandle {
        let fragment = tile.fragment_idx();
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.tile = Some(tile);
        let handle = TileHandle {
            slot,
            generation: entry.generation,
        };
        self.per_fragment[fragment].push_back(handle);
        handle
    }

    pub fn try_get(&self, handle: TileHandle) -> Option<&ResultTile> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.tile.as_ref())
    }

    /// # Panics
    ///
    /// Panics if `handle` refers to an evicted tile. Handles never outlive
    /// their tile, so this is a logic error.
    #[inline]
    pub fn get(&self, handle: TileHandle) -> &ResultTile {
        match self.try_get(handle) {
            Some(t) => t,
            None => panic!("dangling result tile handle {handle:?}"),
        }
    }

    pub fn get_mut(&mut self, handle: TileHandle) -> Option<&mut ResultTile> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.tile.as_mut())
    }

    /// Handle of the held tile `tile` of `fragment`, if loaded.
    pub fn find(&self, fragment: FragmentIdx, tile: TileIdx) -> Option<TileHandle> {
        self.per_fragment[fragment]
            .iter()
            .copied()
            .find(|&h| self.get(h).tile_idx() == tile)
    }

    pub fn front(&self, fragment: FragmentIdx) -> Option<TileHandle> {
        self.per_fragment[fragment].front().copied()
    }

    pub fn fragment_len(&self, fragment: FragmentIdx) -> usize {
        self.per_fragment[fragment].len()
    }

    pub fn len(&self) -> usize {
        self.per_fragment.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.per_fragment.iter().all(VecDeque::is_empty)
    }

    /// Remove the front tile of `fragment`, invalidating its handle.
    pub fn evict_front(&mut self, fragment: FragmentIdx) -> Result<ResultTile> {
        let handle = self.per_fragment[fragment].pop_front().ok_or_else(|| {
            Error::Internal(format!("evicting from fragment {fragment} with no tiles"))
        })?;
        let slot = &mut self.slots[handle.slot as usize];
        let tile = slot.tile.take().ok_or_else(|| {
            Error::Internal(format!("fragment {fragment} listed an empty tile slot"))
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);
        Ok(tile)
    }

    /// Mutable access to several distinct tiles at once.
    pub fn get_many_mut(&mut self, handles: &[TileHandle]) -> Vec<&mut ResultTile> {
        let mut wanted: Vec<(u32, u32)> = handles.iter().map(|h| (h.slot, h.generation)).collect();
        wanted.sort_unstable();
        wanted.dedup();
        let mut out = Vec::with_capacity(wanted.len());
        let mut it = wanted.iter().peekable();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let Some(&&(s, g)) = it.peek() else { break };
            if s as usize != i {
                continue;
            }
            it.next();
            if slot.generation == g {
                if let Some(t) = slot.tile.as_mut() {
                    out.push(t);
                }
            }
        }
        out
    }
}
