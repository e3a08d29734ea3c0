//! Decides which tiles the reader loads next.
//!
//! In per-fragment mode every fragment walks its own relevant tiles and the
//! merge stops whenever one of them runs dry. In preprocess mode the tiles of
//! all fragments are merged once, in the background, into a single stream
//! ordered by each tile's first cell in visit order. Tiles are then created
//! strictly in stream order, and the first cell of the next uncreated tile
//! bounds what the merge may emit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use rayon::ThreadPool;
use rustc_hash::FxHashMap;
use tilemerge_types::{Direction, FragIdx, FragmentIdx, ResultTileId, TileIdx};

use crate::comparator::{GlobalCoords, GlobalOrder};

/// Entries published to waiters at a time by the final merge.
const PUBLISH_CHUNK: usize = 256;

#[derive(Debug, Clone)]
pub(crate) struct StreamEntry {
    pub id: ResultTileId,
    /// First cell of the tile in visit order.
    pub key: Arc<GlobalCoords>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    complete: bool,
}

struct StreamShared {
    state: Mutex<StreamState>,
    ready: Condvar,
}

/// Handle to the globally ordered tile stream being computed on the rayon
/// pool. Consumers can look at the prefix computed so far or block until a
/// given position exists.
#[derive(Clone)]
pub(crate) struct PreprocessStream {
    shared: Arc<StreamShared>,
}

impl PreprocessStream {
    /// Start merging the per-fragment lists, each already in visit order.
    pub fn spawn(
        lists: Vec<Vec<StreamEntry>>,
        order: Arc<GlobalOrder>,
        direction: Direction,
        pool: Option<Arc<ThreadPool>>,
    ) -> Self {
        let shared = Arc::new(StreamShared {
            state: Mutex::new(StreamState::default()),
            ready: Condvar::new(),
        });
        let task_shared = Arc::clone(&shared);
        let task = move || {
            let precedes = |a: &StreamEntry, b: &StreamEntry| {
                direction.apply(order.cmp_global(&a.key, &b.key)) == std::cmp::Ordering::Less
            };
            let mid = lists.len() / 2;
            let (left, right) = rayon::join(
                || merge_lists(&lists[..mid], &precedes),
                || merge_lists(&lists[mid..], &precedes),
            );
            merge_two(left, right, &precedes, |chunk| {
                let mut state = task_shared
                    .state
                    .lock()
                    .expect("tile stream lock poisoned");
                state.entries.extend_from_slice(chunk);
                task_shared.ready.notify_all();
            });
            let mut state = task_shared
                .state
                .lock()
                .expect("tile stream lock poisoned");
            state.complete = true;
            task_shared.ready.notify_all();
            tracing::debug!(tiles = state.entries.len(), "tile stream complete");
        };
        // A worker of the target pool would park on the stream while the
        // task waits in that pool's queue, so build it on this thread.
        let on_target_pool = match &pool {
            Some(pool) => pool.current_thread_index().is_some(),
            None => rayon::current_thread_index().is_some(),
        };
        if on_target_pool {
            tracing::debug!("building tile stream inline on a pool worker");
            task();
        } else {
            match pool {
                Some(pool) => pool.spawn(task),
                None => rayon::spawn(task),
            }
        }
        Self { shared }
    }

    /// Entries available so far and whether the stream is complete.
    pub fn poll(&self) -> (usize, bool) {
        let state = self.shared.state.lock().expect("tile stream lock poisoned");
        (state.entries.len(), state.complete)
    }

    /// Block until entry `index` exists or the stream is complete.
    pub fn wait_for(&self, index: usize) -> Option<StreamEntry> {
        let mut state = self.shared.state.lock().expect("tile stream lock poisoned");
        while state.entries.len() <= index && !state.complete {
            state = self
                .shared
                .ready
                .wait(state)
                .expect("tile stream lock poisoned");
        }
        state.entries.get(index).cloned()
    }

    /// Block until the stream is complete and return all of it.
    pub fn wait_all(&self) -> Vec<StreamEntry> {
        let mut state = self.shared.state.lock().expect("tile stream lock poisoned");
        while !state.complete {
            state = self
                .shared
                .ready
                .wait(state)
                .expect("tile stream lock poisoned");
        }
        state.entries.clone()
    }
}

fn merge_lists<F>(lists: &[Vec<StreamEntry>], precedes: &F) -> Vec<StreamEntry>
where
    F: Fn(&StreamEntry, &StreamEntry) -> bool + Sync,
{
    match lists.len() {
        0 => Vec::new(),
        1 => lists[0].clone(),
        n => {
            let (left, right) = rayon::join(
                || merge_lists(&lists[..n / 2], precedes),
                || merge_lists(&lists[n / 2..], precedes),
            );
            let mut out = Vec::with_capacity(left.len() + right.len());
            merge_two(left, right, precedes, |chunk| out.extend_from_slice(chunk));
            out
        }
    }
}

/// Stable two-way merge: on equal keys the left (lower fragment) goes first.
fn merge_two<F, E>(left: Vec<StreamEntry>, right: Vec<StreamEntry>, precedes: &F, mut emit: E)
where
    F: Fn(&StreamEntry, &StreamEntry) -> bool,
    E: FnMut(&[StreamEntry]),
{
    let mut buf = Vec::with_capacity(PUBLISH_CHUNK);
    let mut l = left.into_iter().peekable();
    let mut r = right.into_iter().peekable();
    loop {
        let take_right = match (l.peek(), r.peek()) {
            (Some(a), Some(b)) => precedes(b, a),
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { r.next() } else { l.next() };
        if let Some(e) = next {
            buf.push(e);
        }
        if buf.len() == PUBLISH_CHUNK {
            emit(&buf);
            buf.clear();
        }
    }
    if !buf.is_empty() {
        emit(&buf);
    }
}

/// Position in the preprocessed order: resume tiles taken, then stream index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct StreamCursor {
    pending_taken: usize,
    pos: usize,
}

enum Schedule {
    PerFragment {
        /// Visit index of the next tile to create, per fragment.
        next_create: Vec<usize>,
    },
    Preprocess {
        stream: PreprocessStream,
        cursor: StreamCursor,
        /// Tiles before the stream cursor that a resumed read still has to
        /// create, in stream order.
        pending: VecDeque<StreamEntry>,
    },
}

pub(crate) struct TileOrder {
    direction: Direction,
    /// Relevant tiles per fragment, ascending tile index.
    relevant: Vec<Vec<TileIdx>>,
    /// First cell in visit order of each relevant tile, when recorded.
    first_cells: Vec<Vec<Option<Arc<GlobalCoords>>>>,
    schedule: Schedule,
}

impl TileOrder {
    pub fn per_fragment(
        direction: Direction,
        relevant: Vec<Vec<TileIdx>>,
        first_cells: Vec<Vec<Option<Arc<GlobalCoords>>>>,
    ) -> Self {
        let next_create = vec![0; relevant.len()];
        Self {
            direction,
            relevant,
            first_cells,
            schedule: Schedule::PerFragment { next_create },
        }
    }

    /// Start the background merge. Every relevant tile must have a known
    /// first cell; callers fall back to [`TileOrder::per_fragment`] otherwise.
    pub fn preprocess(
        direction: Direction,
        relevant: Vec<Vec<TileIdx>>,
        first_cells: Vec<Vec<Option<Arc<GlobalCoords>>>>,
        order: Arc<GlobalOrder>,
        pool: Option<Arc<ThreadPool>>,
    ) -> Self {
        let mut this = Self {
            direction,
            relevant,
            first_cells,
            schedule: Schedule::PerFragment {
                next_create: Vec::new(),
            },
        };
        let lists: Vec<Vec<StreamEntry>> = (0..this.relevant.len())
            .map(|f| {
                (0..this.relevant[f].len())
                    .filter_map(|k| {
                        let t = this.visit_tile(f, k)?;
                        let key = this.first_cell(f, t)?.clone();
                        Some(StreamEntry {
                            id: ResultTileId::new(f, t),
                            key,
                        })
                    })
                    .collect()
            })
            .collect();
        let stream = PreprocessStream::spawn(lists, order, direction, pool);
        this.schedule = Schedule::Preprocess {
            stream,
            cursor: StreamCursor::default(),
            pending: VecDeque::new(),
        };
        this
    }

    pub fn is_preprocess(&self) -> bool {
        matches!(self.schedule, Schedule::Preprocess { .. })
    }

    pub fn fragment_count(&self) -> usize {
        self.relevant.len()
    }

    pub fn relevant_count(&self, fragment: FragmentIdx) -> usize {
        self.relevant[fragment].len()
    }

    /// The `k`-th tile of `fragment` in visit order.
    pub fn visit_tile(&self, fragment: FragmentIdx, k: usize) -> Option<TileIdx> {
        let list = &self.relevant[fragment];
        if k >= list.len() {
            return None;
        }
        match self.direction {
            Direction::Forward => Some(list[k]),
            Direction::Reverse => Some(list[list.len() - 1 - k]),
        }
    }

    /// Visit index of the first relevant tile at or after `tile` in visit order.
    pub fn visit_index_from(&self, fragment: FragmentIdx, tile: TileIdx) -> usize {
        let list = &self.relevant[fragment];
        match self.direction {
            Direction::Forward => list.partition_point(|&t| t < tile),
            Direction::Reverse => list.len() - list.partition_point(|&t| t <= tile),
        }
    }

    /// Relevant tile visited right after `tile`.
    pub fn next_after(&self, fragment: FragmentIdx, tile: TileIdx) -> Option<TileIdx> {
        let list = &self.relevant[fragment];
        match self.direction {
            Direction::Forward => {
                let i = list.partition_point(|&t| t <= tile);
                list.get(i).copied()
            }
            Direction::Reverse => {
                let i = list.partition_point(|&t| t < tile);
                i.checked_sub(1).map(|i| list[i])
            }
        }
    }

    /// Relevant tile visited right before `tile`.
    pub fn prev_before(&self, fragment: FragmentIdx, tile: TileIdx) -> Option<TileIdx> {
        let list = &self.relevant[fragment];
        match self.direction {
            Direction::Forward => {
                let i = list.partition_point(|&t| t < tile);
                i.checked_sub(1).map(|i| list[i])
            }
            Direction::Reverse => {
                let i = list.partition_point(|&t| t <= tile);
                list.get(i).copied()
            }
        }
    }

    /// First cell of `tile` in visit order, if the fragment recorded bounds.
    pub fn first_cell(&self, fragment: FragmentIdx, tile: TileIdx) -> Option<&Arc<GlobalCoords>> {
        let list = &self.relevant[fragment];
        let i = list.binary_search(&tile).ok()?;
        self.first_cells[fragment][i].as_ref()
    }

    /// Initial read cursor of a fragment: its first relevant tile.
    pub fn initial_cursor(&self, fragment: FragmentIdx) -> FragIdx {
        FragIdx::new(self.visit_tile(fragment, 0).unwrap_or(0), 0)
    }

    /// Position every schedule at the given read state.
    ///
    /// `exhausted(f, cursor)` tells whether the cursor's tile has no cells
    /// left. In preprocess mode this waits for the stream to complete.
    pub fn seek(&mut self, cursors: &[FragIdx], exhausted: impl Fn(FragmentIdx, FragIdx) -> bool) {
        let starts: Vec<usize> = cursors
            .iter()
            .enumerate()
            .map(|(f, &c)| {
                let k = self.visit_index_from(f, c.tile_idx);
                if exhausted(f, c) { k + 1 } else { k }
            })
            .collect();
        let resume = cursors.iter().any(|c| c.cell_idx > 0)
            || (0..cursors.len()).any(|f| starts[f] > 0);

        let computed = match &self.schedule {
            Schedule::Preprocess { stream, .. } if resume => {
                let entries = stream.wait_all();
                Some(self.compute_cursor_from_read_state(&entries, cursors, &starts))
            }
            _ => None,
        };

        match &mut self.schedule {
            Schedule::PerFragment { next_create } => *next_create = starts,
            Schedule::Preprocess {
                cursor, pending, ..
            } => match computed {
                Some((pos, resume_tiles)) => {
                    *cursor = StreamCursor {
                        pending_taken: 0,
                        pos,
                    };
                    *pending = resume_tiles;
                }
                None => {
                    *cursor = StreamCursor::default();
                    pending.clear();
                }
            },
        }
    }

    /// Recompute the stream position from per-fragment read cursors.
    ///
    /// The position is right after the last stream tile from which any
    /// fragment already emitted cells. Tiles before that position that are
    /// not yet fully consumed are returned so they get created first.
    fn compute_cursor_from_read_state(
        &self,
        entries: &[StreamEntry],
        cursors: &[FragIdx],
        starts: &[usize],
    ) -> (usize, VecDeque<StreamEntry>) {
        let position: FxHashMap<ResultTileId, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();

        let mut pos = 0;
        for (f, c) in cursors.iter().enumerate() {
            if self.relevant[f].is_empty() {
                continue;
            }
            let last_emitted = if c.cell_idx > 0 {
                Some(c.tile_idx)
            } else {
                self.prev_before(f, c.tile_idx)
            };
            if let Some(t) = last_emitted {
                if let Some(&i) = position.get(&ResultTileId::new(f, t)) {
                    pos = pos.max(i + 1);
                }
            }
        }

        let pending = entries[..pos]
            .iter()
            .filter(|e| {
                let f = e.id.fragment_idx;
                self.visit_index_from(f, e.id.tile_idx) >= starts[f]
            })
            .cloned()
            .collect();
        (pos, pending)
    }

    // --- per-fragment schedule ---

    pub fn next_create(&self, fragment: FragmentIdx) -> usize {
        match &self.schedule {
            Schedule::PerFragment { next_create } => next_create[fragment],
            Schedule::Preprocess { .. } => 0,
        }
    }

    pub fn advance_fragment(&mut self, fragment: FragmentIdx, created: usize) {
        if let Schedule::PerFragment { next_create } = &mut self.schedule {
            next_create[fragment] += created;
        }
    }

    // --- preprocess schedule ---

    pub fn stream_cursor(&self) -> StreamCursor {
        match &self.schedule {
            Schedule::Preprocess { cursor, .. } => *cursor,
            Schedule::PerFragment { .. } => StreamCursor::default(),
        }
    }

    /// Next uncreated tile at or after `at`, skipping tiles `skip` rejects.
    pub fn next_stream_tile(
        &self,
        at: StreamCursor,
        skip: impl Fn(ResultTileId) -> bool,
    ) -> Option<(StreamEntry, StreamCursor)> {
        let Schedule::Preprocess {
            stream, pending, ..
        } = &self.schedule
        else {
            return None;
        };
        let mut at = at;
        while let Some(e) = pending.get(at.pending_taken) {
            at.pending_taken += 1;
            if !skip(e.id) {
                return Some((e.clone(), at));
            }
        }
        while let Some(e) = stream.wait_for(at.pos) {
            at.pos += 1;
            if !skip(e.id) {
                return Some((e, at));
            }
        }
        None
    }

    pub fn commit_stream(&mut self, at: StreamCursor) {
        if let Schedule::Preprocess { cursor, .. } = &mut self.schedule {
            *cursor = at;
        }
    }

    /// First cell of the next uncreated tile, which no emitted cell may reach.
    pub fn merge_bound(&self, skip: impl Fn(ResultTileId) -> bool) -> Option<Arc<GlobalCoords>> {
        self.next_stream_tile(self.stream_cursor(), skip)
            .map(|(e, _)| e.key)
    }

    /// Stream entries known so far and whether the stream is complete.
    pub fn stream_progress(&self) -> Option<(usize, bool)> {
        match &self.schedule {
            Schedule::Preprocess { stream, .. } => Some(stream.poll()),
            Schedule::PerFragment { .. } => None,
        }
    }
}
