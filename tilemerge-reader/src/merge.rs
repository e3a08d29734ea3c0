//! K-way merge of held result tiles into global order.
//!
//! The only state that survives between merges is one read cursor per
//! fragment. A merge seeds a fresh queue from those cursors, pops cells in
//! global order and appends them to cell slabs until it runs out of output
//! space, out of loaded tiles, or reaches the merge bound.

use std::cmp::Ordering;

use tilemerge_types::{Direction, FragIdx, FragmentIdx};

use crate::comparator::{GlobalCoords, GlobalOrder};
use crate::options::ReadMode;
use crate::result_tile::ResultTile;
use crate::slab::{ResultCellSlab, SlabBuilder};
use crate::tile_order::TileOrder;
use crate::tile_store::{TileHandle, TileStore};

/// How cells sharing coordinates are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DupPolicy {
    /// Duplicates are allowed: every visible cell is returned. `versioned`
    /// when some fragment carries per-cell timestamps, so its versions of a
    /// coordinate interleave with other fragments' newest first.
    KeepAll { versioned: bool },
    /// Only the newest version of each coordinate is returned.
    Latest,
    /// Every version, newest first.
    AllVersions,
    /// Versions newest first, up to the first deleted one.
    PurgeDeleted,
}

impl DupPolicy {
    pub fn new(mode: ReadMode, allows_duplicates: bool, versioned: bool) -> Self {
        if allows_duplicates {
            return Self::KeepAll { versioned };
        }
        match mode {
            ReadMode::Standard => Self::Latest,
            ReadMode::Consolidation {
                purge_deletes: false,
            } => Self::AllVersions,
            ReadMode::Consolidation {
                purge_deletes: true,
            } => Self::PurgeDeleted,
        }
    }

    fn groups(self) -> bool {
        match self {
            Self::KeepAll { versioned } => versioned,
            _ => true,
        }
    }
}

/// Per-fragment read cursors. `cell_idx` counts cells of `tile_idx` already
/// consumed in visit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MergeState {
    cursors: Vec<FragIdx>,
    done: Vec<bool>,
}

impl MergeState {
    pub fn new(cursors: Vec<FragIdx>, done: Vec<bool>) -> Self {
        debug_assert_eq!(cursors.len(), done.len());
        Self { cursors, done }
    }

    /// Cursors at the first relevant tile of every fragment.
    pub fn initial(tiles: &TileOrder) -> Self {
        let n = tiles.fragment_count();
        Self {
            cursors: (0..n).map(|f| tiles.initial_cursor(f)).collect(),
            done: (0..n).map(|f| tiles.relevant_count(f) == 0).collect(),
        }
    }

    pub fn cursors(&self) -> &[FragIdx] {
        &self.cursors
    }

    #[inline]
    pub fn cursor(&self, fragment: FragmentIdx) -> FragIdx {
        self.cursors[fragment]
    }

    #[inline]
    pub fn is_done(&self, fragment: FragmentIdx) -> bool {
        self.done[fragment]
    }

    pub fn all_done(&self) -> bool {
        self.done.iter().all(|&d| d)
    }

    pub fn set_cursor(&mut self, fragment: FragmentIdx, cursor: FragIdx) {
        self.cursors[fragment] = cursor;
    }

    pub fn mark_done(&mut self, fragment: FragmentIdx) {
        self.done[fragment] = true;
    }
}

/// Why a merge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeStop {
    /// The cell limit was reached, or the next group does not fit.
    CellLimit,
    /// A fragment needs a tile that is not loaded.
    NeedMoreTiles,
    /// Every remaining loaded cell is at or past the merge bound.
    MergeBound,
    Done,
}

#[derive(Debug)]
pub(crate) struct MergeOutput {
    pub slabs: Vec<ResultCellSlab>,
    pub cells: u64,
    pub stop: MergeStop,
}

#[derive(Debug, Clone, Copy)]
struct MergeEntry {
    tile: TileHandle,
    fragment: FragmentIdx,
    pos: u64,
}

enum AddNextCell {
    Found(MergeEntry),
    NeedMoreTiles,
    MergeBound,
    Done,
}

/// Binary min-heap over merge entries with an external ordering.
#[derive(Default)]
struct MergeQueue {
    heap: Vec<MergeEntry>,
}

impl MergeQueue {
    fn peek(&self) -> Option<&MergeEntry> {
        self.heap.first()
    }

    fn push(&mut self, entry: MergeEntry, before: &impl Fn(&MergeEntry, &MergeEntry) -> bool) {
        self.heap.push(entry);
        let mut i = self.heap.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if !before(&self.heap[i], &self.heap[parent]) {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn pop(&mut self, before: &impl Fn(&MergeEntry, &MergeEntry) -> bool) -> Option<MergeEntry> {
        if self.heap.is_empty() {
            return None;
        }
        let top = self.heap.swap_remove(0);
        self.sift_down(0, before);
        Some(top)
    }

    fn sift_down(&mut self, mut i: usize, before: &impl Fn(&MergeEntry, &MergeEntry) -> bool) {
        let n = self.heap.len();
        loop {
            let l = 2 * i + 1;
            let r = l + 1;
            let mut best = i;
            if l < n && before(&self.heap[l], &self.heap[best]) {
                best = l;
            }
            if r < n && before(&self.heap[r], &self.heap[best]) {
                best = r;
            }
            if best == i {
                return;
            }
            self.heap.swap(i, best);
            i = best;
        }
    }

    fn remove_fragments(
        &mut self,
        fragments: &[FragmentIdx],
        before: &impl Fn(&MergeEntry, &MergeEntry) -> bool,
    ) {
        self.heap.retain(|e| !fragments.contains(&e.fragment));
        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i, before);
        }
    }
}

/// Cursor values to restore if a coordinate group has to be abandoned.
#[derive(Default)]
struct GroupUndo {
    saved: Vec<(FragmentIdx, FragIdx, bool)>,
    popped: Vec<MergeEntry>,
}

impl GroupUndo {
    fn save(&mut self, state: &MergeState, fragment: FragmentIdx) {
        if !self.saved.iter().any(|(f, _, _)| *f == fragment) {
            self.saved
                .push((fragment, state.cursors[fragment], state.done[fragment]));
        }
    }
}

#[derive(Default)]
struct Pending {
    need_tiles: bool,
    bound_hit: bool,
}

/// One merge pass over the tiles currently held.
pub(crate) struct Merger<'a> {
    pub store: &'a TileStore,
    pub order: &'a GlobalOrder,
    pub tiles: &'a TileOrder,
    pub direction: Direction,
    pub policy: DupPolicy,
    /// First cell of the next uncreated tile; preprocess mode only.
    pub bound: Option<&'a GlobalCoords>,
}

impl Merger<'_> {
    /// Merge up to `limit` cells, advancing `state`.
    pub fn merge(&self, state: &mut MergeState, limit: u64) -> MergeOutput {
        let per_fragment = !self.tiles.is_preprocess();
        let before = |a: &MergeEntry, b: &MergeEntry| self.cmp_entries(a, b) == Ordering::Less;
        let mut queue = MergeQueue::default();
        let mut out = SlabBuilder::new(self.direction.is_reverse());
        let mut pending = Pending::default();

        for f in 0..state.cursors.len() {
            match self.add_next_cell(state, f) {
                AddNextCell::Found(e) => queue.push(e, &before),
                AddNextCell::NeedMoreTiles => pending.need_tiles = true,
                AddNextCell::MergeBound => pending.bound_hit = true,
                AddNextCell::Done => {}
            }
        }
        if per_fragment && pending.need_tiles {
            return finish(out, MergeStop::NeedMoreTiles);
        }

        let mut stop = None;
        while queue.peek().is_some() {
            if out.cells() >= limit {
                stop = Some(MergeStop::CellLimit);
                break;
            }
            stop = if self.policy.groups() {
                self.step_group(state, &mut queue, &mut out, &mut pending, limit, &before)
            } else {
                self.step_single(state, &mut queue, &mut out, &mut pending, limit, &before)
            };
            if stop.is_some() {
                break;
            }
        }

        let stop = stop.unwrap_or(if state.all_done() {
            MergeStop::Done
        } else if pending.bound_hit && !pending.need_tiles && !per_fragment {
            MergeStop::MergeBound
        } else {
            MergeStop::NeedMoreTiles
        });
        tracing::trace!(cells = out.cells(), ?stop, "merge pass");
        finish(out, stop)
    }

    fn step_single(
        &self,
        state: &mut MergeState,
        queue: &mut MergeQueue,
        out: &mut SlabBuilder,
        pending: &mut Pending,
        limit: u64,
        before: &impl Fn(&MergeEntry, &MergeEntry) -> bool,
    ) -> Option<MergeStop> {
        let e = queue.pop(before)?;
        state.cursors[e.fragment].cell_idx += 1;
        out.push(e.tile, e.pos);
        self.extend_run(state, queue, out, &e, limit);
        self.refill(state, queue, e.fragment, pending, before)
    }

    fn step_group(
        &self,
        state: &mut MergeState,
        queue: &mut MergeQueue,
        out: &mut SlabBuilder,
        pending: &mut Pending,
        limit: u64,
        before: &impl Fn(&MergeEntry, &MergeEntry) -> bool,
    ) -> Option<MergeStop> {
        let per_fragment = !self.tiles.is_preprocess();
        let e = queue.pop(before)?;
        let tile = self.store.get(e.tile);

        // Without timestamps a fragment holds each coordinate once, so a
        // cell that differs from the queue top is alone in its group.
        let alone = !tile.has_timestamps()
            && queue.peek().is_none_or(|top| !self.same_coords(top, &e));
        if alone {
            state.cursors[e.fragment].cell_idx += 1;
            if !(self.policy == DupPolicy::PurgeDeleted && tile.is_deleted(e.pos)) {
                out.push(e.tile, e.pos);
            }
            self.extend_run(state, queue, out, &e, limit);
            return self.refill(state, queue, e.fragment, pending, before);
        }

        let mut undo = GroupUndo::default();
        let mut members = vec![e];
        let mut stop = None;
        undo.save(state, e.fragment);
        undo.popped.push(e);
        state.cursors[e.fragment].cell_idx += 1;
        let mut to_refill = vec![e.fragment];

        loop {
            while let Some(g) = to_refill.pop() {
                match self.add_next_cell(state, g) {
                    AddNextCell::Found(n) if self.same_coords(&n, &e) => {
                        members.push(n);
                        state.cursors[g].cell_idx += 1;
                        to_refill.push(g);
                    }
                    AddNextCell::Found(n) => queue.push(n, before),
                    AddNextCell::NeedMoreTiles if per_fragment => {
                        if self.group_may_continue(state, g, &e) {
                            self.rollback(state, queue, undo, before);
                            return Some(MergeStop::NeedMoreTiles);
                        }
                        stop = Some(MergeStop::NeedMoreTiles);
                    }
                    AddNextCell::NeedMoreTiles => pending.need_tiles = true,
                    AddNextCell::MergeBound => pending.bound_hit = true,
                    AddNextCell::Done => {}
                }
            }
            match queue.peek() {
                Some(top) if self.same_coords(top, &e) => {
                    let Some(m) = queue.pop(before) else { break };
                    undo.save(state, m.fragment);
                    undo.popped.push(m);
                    members.push(m);
                    state.cursors[m.fragment].cell_idx += 1;
                    to_refill.push(m.fragment);
                }
                _ => break,
            }
        }

        let emitted = self.resolve_group(members);
        if out.cells() + emitted.len() as u64 > limit {
            self.rollback(state, queue, undo, before);
            return Some(MergeStop::CellLimit);
        }
        for m in emitted {
            out.push(m.tile, m.pos);
        }
        stop
    }

    /// Emit the following cells of the same tile while they stay strictly
    /// ahead of every other queued cell.
    fn extend_run(
        &self,
        state: &mut MergeState,
        queue: &MergeQueue,
        out: &mut SlabBuilder,
        e: &MergeEntry,
        limit: u64,
    ) {
        let tile = self.store.get(e.tile);
        if self.policy.groups() && tile.has_timestamps() {
            return;
        }
        let top = queue.peek().map(|t| (self.store.get(t.tile), t.pos));
        let f = e.fragment;
        while out.cells() < limit {
            let cursor = state.cursors[f];
            if cursor.cell_idx >= tile.cell_num() {
                return;
            }
            let pos = self.visit_pos(tile, cursor.cell_idx);
            if !tile.bitmap().is_live(pos)
                || (self.policy == DupPolicy::PurgeDeleted && tile.is_deleted(pos))
                || !self.precedes_bound(tile, pos)
            {
                return;
            }
            if let Some((top_tile, top_pos)) = top {
                let ord = self.order.cmp_cells(tile, pos, top_tile, top_pos);
                if self.direction.apply(ord) != Ordering::Less {
                    return;
                }
            }
            state.cursors[f].cell_idx += 1;
            out.push(e.tile, pos);
        }
    }

    fn refill(
        &self,
        state: &mut MergeState,
        queue: &mut MergeQueue,
        fragment: FragmentIdx,
        pending: &mut Pending,
        before: &impl Fn(&MergeEntry, &MergeEntry) -> bool,
    ) -> Option<MergeStop> {
        match self.add_next_cell(state, fragment) {
            AddNextCell::Found(n) => queue.push(n, before),
            AddNextCell::NeedMoreTiles if !self.tiles.is_preprocess() => {
                return Some(MergeStop::NeedMoreTiles);
            }
            AddNextCell::NeedMoreTiles => pending.need_tiles = true,
            AddNextCell::MergeBound => pending.bound_hit = true,
            AddNextCell::Done => {}
        }
        None
    }

    /// Next live cell of a fragment, advancing its cursor past cells that
    /// are not visible and across held tiles.
    fn add_next_cell(&self, state: &mut MergeState, f: FragmentIdx) -> AddNextCell {
        loop {
            if state.done[f] {
                return AddNextCell::Done;
            }
            let cursor = state.cursors[f];
            let Some(handle) = self.store.find(f, cursor.tile_idx) else {
                return AddNextCell::NeedMoreTiles;
            };
            let tile = self.store.get(handle);
            if cursor.cell_idx >= tile.cell_num() {
                match self.tiles.next_after(f, cursor.tile_idx) {
                    None => {
                        state.done[f] = true;
                        return AddNextCell::Done;
                    }
                    Some(next) if self.store.find(f, next).is_some() => {
                        state.cursors[f] = FragIdx::new(next, 0);
                        continue;
                    }
                    Some(_) => return AddNextCell::NeedMoreTiles,
                }
            }
            let pos = self.visit_pos(tile, cursor.cell_idx);
            if !tile.bitmap().is_live(pos) {
                state.cursors[f].cell_idx += 1;
                continue;
            }
            if !self.precedes_bound(tile, pos) {
                return AddNextCell::MergeBound;
            }
            return AddNextCell::Found(MergeEntry {
                tile: handle,
                fragment: f,
                pos,
            });
        }
    }

    /// Whether a fragment that ran out of held tiles mid-group could hold
    /// more versions of the group's coordinates in its next tile.
    fn group_may_continue(&self, state: &MergeState, f: FragmentIdx, e: &MergeEntry) -> bool {
        let cursor = state.cursors[f];
        let Some(handle) = self.store.find(f, cursor.tile_idx) else {
            return true;
        };
        // Only timestamped fragments, or any fragment when duplicates are
        // allowed, repeat a coordinate.
        let repeats = self.store.get(handle).has_timestamps()
            || matches!(self.policy, DupPolicy::KeepAll { .. });
        if !repeats {
            return false;
        }
        let first = self
            .tiles
            .next_after(f, cursor.tile_idx)
            .and_then(|next| self.tiles.first_cell(f, next));
        match first {
            Some(first) => {
                let tile = self.store.get(e.tile);
                self.order.cmp_cell_to(tile, e.pos, first) == Ordering::Equal
            }
            None => true,
        }
    }

    fn rollback(
        &self,
        state: &mut MergeState,
        queue: &mut MergeQueue,
        undo: GroupUndo,
        before: &impl Fn(&MergeEntry, &MergeEntry) -> bool,
    ) {
        let fragments: Vec<FragmentIdx> = undo.saved.iter().map(|(f, _, _)| *f).collect();
        for (f, cursor, done) in undo.saved {
            state.cursors[f] = cursor;
            state.done[f] = done;
        }
        queue.remove_fragments(&fragments, before);
        for e in undo.popped {
            queue.push(e, before);
        }
    }

    /// Cells of one coordinate group to emit, in output order.
    fn resolve_group(&self, mut members: Vec<MergeEntry>) -> Vec<MergeEntry> {
        members.sort_by(|a, b| self.cmp_versions(a, b));
        match self.policy {
            DupPolicy::Latest => members.truncate(1),
            DupPolicy::PurgeDeleted => {
                let live = members
                    .iter()
                    .take_while(|m| !self.store.get(m.tile).is_deleted(m.pos))
                    .count();
                members.truncate(live);
            }
            DupPolicy::AllVersions | DupPolicy::KeepAll { .. } => {}
        }
        if self.direction.is_reverse() {
            members.reverse();
        }
        members
    }

    /// Newest first: higher timestamp, then higher fragment, then earlier
    /// tile and position.
    fn cmp_versions(&self, a: &MergeEntry, b: &MergeEntry) -> Ordering {
        let ta = self.store.get(a.tile);
        let tb = self.store.get(b.tile);
        tb.timestamp(b.pos)
            .cmp(&ta.timestamp(a.pos))
            .then_with(|| b.fragment.cmp(&a.fragment))
            .then_with(|| (ta.tile_idx(), a.pos).cmp(&(tb.tile_idx(), b.pos)))
    }

    fn cmp_entries(&self, a: &MergeEntry, b: &MergeEntry) -> Ordering {
        let ta = self.store.get(a.tile);
        let tb = self.store.get(b.tile);
        let ord = self
            .order
            .cmp_cells(ta, a.pos, tb, b.pos)
            .then_with(|| self.cmp_versions(a, b));
        self.direction.apply(ord)
    }

    fn same_coords(&self, a: &MergeEntry, b: &MergeEntry) -> bool {
        let ta = self.store.get(a.tile);
        let tb = self.store.get(b.tile);
        self.order.cmp_cells(ta, a.pos, tb, b.pos) == Ordering::Equal
    }

    #[inline]
    fn visit_pos(&self, tile: &ResultTile, cell_idx: u64) -> u64 {
        match self.direction {
            Direction::Forward => cell_idx,
            Direction::Reverse => tile.cell_num() - 1 - cell_idx,
        }
    }

    fn precedes_bound(&self, tile: &ResultTile, pos: u64) -> bool {
        match self.bound {
            Some(bound) => {
                self.direction.apply(self.order.cmp_cell_to(tile, pos, bound)) == Ordering::Less
            }
            None => true,
        }
    }
}

fn finish(out: SlabBuilder, stop: MergeStop) -> MergeOutput {
    MergeOutput {
        cells: out.cells(),
        slabs: out.finish(),
        stop,
    }
}
