//! The sparse global-order reader.
//!
//! Each `execute()` runs iterations of load, merge, copy and evict until it
//! has produced results, the output buffers are full, or every fragment is
//! drained. The merge cursors are the only state carried between calls, so
//! a call that returns `Incomplete` resumes exactly where it stopped.

use std::sync::Arc;

use bitcode::{Decode, Encode};
use rayon::ThreadPool;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tilemerge_result::{Error, Result};
use tilemerge_storage::{Fragment, TileLoader};
use tilemerge_types::{
    ArraySchema, Direction, FieldKind, FragIdx, FragmentIdx, ResultTileId, ScalarValue, TileIdx,
};

use crate::budget::{BudgetTracker, BudgetUsage};
use crate::buffers::{OffsetsFormat, QueryBuffers};
use crate::comparator::GlobalCoords;
use crate::config::{OffsetsMode, ReaderConfig, TileOrderMode};
use crate::copy::aggregate::AggregateState;
use crate::copy::{self, AttributePlan, FieldCopy};
use crate::merge::{DupPolicy, MergeOutput, MergeState, MergeStop, Merger};
use crate::options::ReaderOptions;
use crate::result_tile::{ResultTile, TileLoadContext, Visibility};
use crate::slab::ResultCellSlab;
use crate::subarray::Overlap;
use crate::tile_order::TileOrder;
use crate::tile_store::TileStore;

/// Why a call returned before the read was complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
    /// The output buffers are full. Larger buffers return more per call.
    UserBufferSize,
    /// The memory budget limited this call. Larger buffers do not help.
    MemoryBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Completed,
    Incomplete(IncompleteReason),
    Failed,
}

impl QueryStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, QueryStatus::Completed)
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, QueryStatus::Incomplete(_))
    }
}

/// Resume point of a read: per fragment, the first cell not yet returned.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ReadState {
    pub cursors: Vec<FragIdx>,
    pub done: Vec<bool>,
}

impl ReadState {
    pub fn to_bytes(&self) -> Vec<u8> {
        bitcode::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bitcode::decode(bytes)
            .map_err(|e| Error::InvalidArgumentError(format!("malformed read state: {e}")))
    }
}

/// Mutable state of one pass over the fragments; rebuilt by `reset()`.
struct Run {
    tiles: TileOrder,
    store: TileStore,
    budget: BudgetTracker,
    state: MergeState,
}

struct CopyOutcome {
    reason: Option<IncompleteReason>,
    stop: MergeStop,
}

/// Reads the cells of many sparse fragments in one global order under a
/// fixed memory budget.
pub struct SparseGlobalOrderReader {
    schema: Arc<ArraySchema>,
    fragments: Vec<Fragment>,
    options: ReaderOptions,
    ctx: TileLoadContext,
    pool: Option<Arc<ThreadPool>>,
    policy: DupPolicy,
    relevant: Vec<Vec<TileIdx>>,
    first_cells: Vec<Vec<Option<Arc<GlobalCoords>>>>,
    preprocess: bool,
    run: Run,
    aggregates: Vec<AggregateState>,
    status: Option<QueryStatus>,
    failed: bool,
}

impl SparseGlobalOrderReader {
    pub fn new(
        schema: impl Into<Arc<ArraySchema>>,
        fragments: Vec<Fragment>,
        loader: Arc<dyn TileLoader>,
        options: ReaderOptions,
    ) -> Result<Self> {
        Self::build(schema.into(), fragments, loader, options, None)
    }

    /// A reader that continues a read from a state saved with
    /// [`SparseGlobalOrderReader::read_state`].
    pub fn with_read_state(
        schema: impl Into<Arc<ArraySchema>>,
        fragments: Vec<Fragment>,
        loader: Arc<dyn TileLoader>,
        options: ReaderOptions,
        state: &ReadState,
    ) -> Result<Self> {
        Self::build(schema.into(), fragments, loader, options, Some(state))
    }

    fn build(
        schema: Arc<ArraySchema>,
        fragments: Vec<Fragment>,
        loader: Arc<dyn TileLoader>,
        options: ReaderOptions,
        resume: Option<&ReadState>,
    ) -> Result<Self> {
        let config = &options.config;
        config.validate()?;
        if options.timestamp_start > options.timestamp_end {
            return Err(Error::InvalidArgumentError(format!(
                "timestamp window [{}, {}] is empty",
                options.timestamp_start, options.timestamp_end
            )));
        }
        let query_id = options.context.query_id;

        let end = options.timestamp_end;
        let delete_conditions: Vec<_> = options
            .delete_conditions
            .iter()
            .filter(|d| d.timestamp <= end)
            .cloned()
            .collect();
        let mut condition_fields: Vec<String> = Vec::new();
        let names = options
            .condition
            .iter()
            .flat_map(|c| c.field_names())
            .chain(delete_conditions.iter().flat_map(|d| d.condition.field_names()));
        for name in names {
            let info = schema.require_field(&name)?;
            if matches!(info.kind, FieldKind::Attribute(_)) && !condition_fields.contains(&name) {
                condition_fields.push(name);
            }
        }
        let visibility = Visibility {
            window: (options.timestamp_start, end),
            mode: options.mode,
            allows_duplicates: schema.allows_duplicates,
            subarray: options.subarray.resolve(&schema)?,
            condition: options.condition.clone(),
            delete_conditions,
            condition_fields,
        };
        let ctx = TileLoadContext {
            schema: Arc::clone(&schema),
            loader,
            order: Arc::new(crate::comparator::GlobalOrder::new(&schema)),
            visibility: Arc::new(visibility),
        };

        let pool = match config.num_threads {
            0 => None,
            n => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("tilemerge-worker-{i}"))
                    .build()
                    .map_err(|e| Error::Internal(format!("failed to build thread pool: {e}")))?,
            )),
        };

        let mut aggregates: Vec<AggregateState> = Vec::with_capacity(options.aggregates.len());
        for spec in &options.aggregates {
            if aggregates.iter().any(|a| a.alias() == spec.alias) {
                return Err(Error::InvalidArgumentError(format!(
                    "duplicate aggregate alias '{}'",
                    spec.alias
                )));
            }
            aggregates.push(AggregateState::new(spec.clone(), &schema)?);
        }

        let (relevant, first_cells) = relevant_tiles(&fragments, &ctx, config.direction)?;
        let mut preprocess = config.tile_order == TileOrderMode::Preprocess;
        if preprocess {
            let missing = first_cells
                .iter()
                .position(|firsts| firsts.iter().any(Option::is_none));
            if let Some(fragment) = missing {
                tracing::warn!(
                    query_id,
                    fragment,
                    "tile bounds missing, falling back to per-fragment tile order"
                );
                preprocess = false;
            }
        }

        let versioned = fragments.iter().any(|f| f.has_timestamps());
        let policy = DupPolicy::new(options.mode, schema.allows_duplicates, versioned);
        let placeholder = Run {
            tiles: TileOrder::per_fragment(config.direction, Vec::new(), Vec::new()),
            store: TileStore::new(0),
            budget: BudgetTracker::new(0, 0, 0, None),
            state: MergeState::new(Vec::new(), Vec::new()),
        };
        let mut reader = Self {
            schema,
            fragments,
            options,
            ctx,
            pool,
            policy,
            relevant,
            first_cells,
            preprocess,
            run: placeholder,
            aggregates,
            status: None,
            failed: false,
        };
        reader.run = reader.start_run(resume)?;

        tracing::debug!(
            query_id,
            fragments = reader.fragments.len(),
            relevant_tiles = reader.relevant.iter().map(Vec::len).sum::<usize>(),
            preprocess = reader.preprocess,
            direction = ?reader.options.config.direction,
            policy = ?reader.policy,
            resumed = resume.is_some(),
            "created sparse global order reader"
        );
        Ok(reader)
    }

    fn start_run(&self, resume: Option<&ReadState>) -> Result<Run> {
        let n = self.fragments.len();
        let config = &self.options.config;
        let mut tiles = if self.preprocess {
            TileOrder::preprocess(
                config.direction,
                self.relevant.clone(),
                self.first_cells.clone(),
                Arc::clone(&self.ctx.order),
                self.pool.clone(),
            )
        } else {
            TileOrder::per_fragment(config.direction, self.relevant.clone(), self.first_cells.clone())
        };

        let state = match resume {
            None => MergeState::initial(&tiles),
            Some(saved) => {
                let (cursors, done) = self.resume_cursors(&tiles, saved)?;
                let fragments = &self.fragments;
                tiles.seek(&cursors, |f, c| c.cell_idx >= fragments[f].cell_num(c.tile_idx));
                MergeState::new(cursors, done)
            }
        };

        let split = (!self.preprocess).then(|| self.relevant.iter().filter(|l| !l.is_empty()).count());
        Ok(Run {
            tiles,
            store: TileStore::new(n),
            budget: BudgetTracker::new(config.coords_budget(), config.attribute_budget(), n, split),
            state,
        })
    }

    /// Validate a saved state and move exhausted cursors to the next tile.
    fn resume_cursors(&self, tiles: &TileOrder, saved: &ReadState) -> Result<(Vec<FragIdx>, Vec<bool>)> {
        let n = self.fragments.len();
        if saved.cursors.len() != n || saved.done.len() != n {
            return Err(Error::InvalidArgumentError(format!(
                "read state covers {} fragments, the reader has {n}",
                saved.cursors.len()
            )));
        }
        let mut cursors = saved.cursors.clone();
        let mut done = saved.done.clone();
        for f in 0..n {
            if done[f] {
                continue;
            }
            let c = cursors[f];
            if self.relevant[f].binary_search(&c.tile_idx).is_err() {
                if c.cell_idx > 0 {
                    return Err(Error::InvalidArgumentError(format!(
                        "read state points into tile {} of fragment {f}, which this read does not visit",
                        c.tile_idx
                    )));
                }
                match tiles.visit_tile(f, tiles.visit_index_from(f, c.tile_idx)) {
                    Some(t) => cursors[f] = FragIdx::new(t, 0),
                    None => done[f] = true,
                }
                continue;
            }
            if c.cell_idx >= self.fragments[f].cell_num(c.tile_idx) {
                match tiles.next_after(f, c.tile_idx) {
                    Some(t) => cursors[f] = FragIdx::new(t, 0),
                    None => done[f] = true,
                }
            }
        }
        Ok((cursors, done))
    }

    pub fn name(&self) -> &'static str {
        "sparse_global_order"
    }

    /// Status of the last `execute()`, `None` before the first.
    pub fn status(&self) -> Option<QueryStatus> {
        self.status
    }

    pub fn incomplete_reason(&self) -> Option<IncompleteReason> {
        match self.status {
            Some(QueryStatus::Incomplete(reason)) => Some(reason),
            _ => None,
        }
    }

    pub fn budget_usage(&self) -> BudgetUsage {
        self.run.budget.usage()
    }

    /// Current value of the aggregate named `alias`.
    pub fn aggregate(&self, alias: &str) -> Option<ScalarValue> {
        self.aggregates
            .iter()
            .find(|a| a.alias() == alias)
            .and_then(AggregateState::value)
    }

    pub fn read_state(&self) -> ReadState {
        let state = &self.run.state;
        ReadState {
            cursors: state.cursors().to_vec(),
            done: (0..self.fragments.len()).map(|f| state.is_done(f)).collect(),
        }
    }

    /// Drop all progress and start the read again from the beginning.
    pub fn reset(&mut self) -> Result<()> {
        self.run = self.start_run(None)?;
        for a in &mut self.aggregates {
            a.reset();
        }
        self.status = None;
        self.failed = false;
        tracing::debug!(query_id = self.query_id(), "reader reset");
        Ok(())
    }

    /// Replace the memory budget between calls. Usage above a smaller budget
    /// is kept until the tiles holding it are evicted.
    pub fn refresh_budget(&mut self, config: &ReaderConfig) -> Result<()> {
        config.validate()?;
        let current = &mut self.options.config;
        current.memory_budget = config.memory_budget;
        current.coords_ratio = config.coords_ratio;
        let (coords, attributes) = (current.coords_budget(), current.attribute_budget());
        self.run.budget.set_limits(coords, attributes);
        tracing::debug!(
            query_id = self.query_id(),
            coords_limit = coords,
            attributes_limit = attributes,
            "refreshed memory budget"
        );
        Ok(())
    }

    /// Fill `buffers` with the next cells in global order.
    ///
    /// Buffers are written from position zero. A transient error leaves the
    /// reader as it was before the failing iteration, so the call can be
    /// retried. Any other error fails the reader until `reset()`.
    pub fn execute(&mut self, buffers: &mut QueryBuffers) -> Result<QueryStatus> {
        let query_id = self.query_id();
        if self.failed {
            return Err(Error::ReaderFailed);
        }
        match self.run_iterations(buffers) {
            Ok(status) => {
                tracing::debug!(
                    query_id,
                    ?status,
                    cells = buffers.result_cells(),
                    "execute finished"
                );
                self.status = Some(status);
                Ok(status)
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(query_id, error = %err, "transient failure, read state kept for retry");
                Err(err)
            }
            Err(err) => {
                tracing::error!(query_id, error = %err, "sparse global order reader failed");
                self.failed = true;
                self.status = Some(QueryStatus::Failed);
                Err(err)
            }
        }
    }

    #[inline]
    fn query_id(&self) -> u64 {
        self.options.context.query_id
    }

    fn run_iterations(&mut self, buffers: &mut QueryBuffers) -> Result<QueryStatus> {
        let query_id = self.query_id();
        let (fields, limit) = self.prepare_buffers(buffers)?;
        let aggregates_only = fields.is_empty();

        loop {
            if self
                .options
                .cancellation
                .as_ref()
                .is_some_and(|c| c.is_cancelled())
            {
                return Err(Error::Cancelled);
            }
            self.evict_consumed()?;
            if self.run.state.all_done() {
                return self.complete();
            }

            let loaded = self.load_tiles()?;
            let bound = self.merge_bound();
            let start = self.run.state.clone();
            let mut next = start.clone();
            let output = self.merger(bound.as_deref()).merge(&mut next, limit);
            tracing::debug!(
                query_id,
                tiles_loaded = loaded,
                tiles_held = self.run.store.len(),
                coords_used = self.run.budget.total(),
                cells = output.cells,
                stop = ?output.stop,
                "merge iteration"
            );

            if output.cells == 0 {
                let progressed = loaded > 0 || next != start;
                self.run.state = next;
                match output.stop {
                    MergeStop::Done => continue,
                    MergeStop::CellLimit => {
                        return Ok(QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
                    }
                    MergeStop::NeedMoreTiles | MergeStop::MergeBound => {
                        let evicted = self.evict_consumed()?;
                        if !progressed && evicted == 0 {
                            return Err(Error::MemoryBudgetExceeded(format!(
                                "no tile could be loaded into {} bytes of coordinate budget ({} held) while fragments remain",
                                self.run.budget.fragment_limit(),
                                self.run.budget.total()
                            )));
                        }
                        continue;
                    }
                }
            }

            let outcome = self.copy_pass(buffers, &fields, &start, next, output, bound.as_deref())?;
            if let Some(reason) = outcome.reason {
                return Ok(QueryStatus::Incomplete(reason));
            }
            self.evict_consumed()?;
            if self.run.state.all_done() {
                return self.complete();
            }
            match outcome.stop {
                MergeStop::CellLimit => {
                    return Ok(QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
                }
                _ if aggregates_only => continue,
                _ => return Ok(QueryStatus::Incomplete(IncompleteReason::MemoryBudget)),
            }
        }
    }

    /// Check buffers against the schema, reset them, and return the copy
    /// plan with the number of cells every buffer can hold.
    fn prepare_buffers(&self, buffers: &mut QueryBuffers) -> Result<(Vec<FieldCopy>, u64)> {
        let config = &self.options.config;
        let mut fields = Vec::with_capacity(buffers.len());
        let mut limit = u64::MAX;
        for name in buffers.names().to_vec() {
            let info = self.schema.require_field(&name)?;
            let buffer = buffers
                .get_mut(&name)
                .ok_or_else(|| Error::Internal(format!("buffer '{name}' vanished")))?;
            if buffer.is_var() != info.var_sized {
                return Err(Error::InvalidArgumentError(format!(
                    "field '{name}' is {} but its buffer is {}",
                    if info.var_sized { "var-sized" } else { "fixed-size" },
                    if buffer.is_var() { "var-sized" } else { "fixed-size" },
                )));
            }
            if info.nullable && !buffer.has_validity() {
                return Err(Error::InvalidArgumentError(format!(
                    "nullable field '{name}' needs a validity buffer"
                )));
            }
            let offsets = info.var_sized.then(|| OffsetsFormat {
                size: config.offset_size(),
                elements: config.offsets_mode == OffsetsMode::Elements,
                extra: config.offsets_extra_element,
                element_size: info.cell_size(),
            });
            buffer.prepare(offsets);
            limit = limit.min(buffer.cell_capacity(&info, offsets));
            fields.push(FieldCopy {
                name,
                info,
                offsets,
            });
        }
        Ok((fields, limit))
    }

    fn merger<'a>(&'a self, bound: Option<&'a GlobalCoords>) -> Merger<'a> {
        Merger {
            store: &self.run.store,
            order: &self.ctx.order,
            tiles: &self.run.tiles,
            direction: self.options.config.direction,
            policy: self.policy,
            bound,
        }
    }

    fn merge_bound(&self) -> Option<Arc<GlobalCoords>> {
        if !self.run.tiles.is_preprocess() {
            return None;
        }
        let direction = self.options.config.direction;
        self.run
            .tiles
            .merge_bound(|id| skip_stream_tile(&self.run, direction, id))
    }

    /// Create as many tiles as the coordinate budget admits, in schedule
    /// order. Nothing is registered unless every load succeeds.
    fn load_tiles(&mut self) -> Result<usize> {
        let direction = self.options.config.direction;
        let mut trial = self.run.budget.clone();
        let mut wanted: Vec<(FragmentIdx, TileIdx, u64)> = Vec::new();
        let mut stream_at = None;

        if self.run.tiles.is_preprocess() {
            let run = &self.run;
            let mut at = run.tiles.stream_cursor();
            while let Some((entry, after)) =
                run.tiles.next_stream_tile(at, |id| skip_stream_tile(run, direction, id))
            {
                let ResultTileId {
                    fragment_idx: f,
                    tile_idx: t,
                } = entry.id;
                let bytes = self.ctx.estimate_memory(self.fragments[f].as_ref(), t);
                if !trial.can_load(f, bytes) {
                    if run.store.is_empty() && wanted.is_empty() {
                        return Err(tile_too_large(f, t, bytes, trial.fragment_limit()));
                    }
                    break;
                }
                trial.account(f, bytes);
                wanted.push((f, t, bytes));
                at = after;
            }
            stream_at = Some(at);
        } else {
            for f in 0..self.fragments.len() {
                if self.run.state.is_done(f) {
                    continue;
                }
                let mut k = self.run.tiles.next_create(f);
                let mut created = 0;
                while let Some(t) = self.run.tiles.visit_tile(f, k) {
                    let bytes = self.ctx.estimate_memory(self.fragments[f].as_ref(), t);
                    if !trial.can_load(f, bytes) {
                        if created == 0 && self.run.store.fragment_len(f) == 0 {
                            return Err(tile_too_large(f, t, bytes, trial.fragment_limit()));
                        }
                        break;
                    }
                    trial.account(f, bytes);
                    wanted.push((f, t, bytes));
                    created += 1;
                    k += 1;
                }
            }
        }
        if wanted.is_empty() {
            return Ok(0);
        }

        let ctx = &self.ctx;
        let fragments = &self.fragments;
        let loaded: Vec<ResultTile> = in_pool(self.pool.as_deref(), || {
            wanted
                .par_iter()
                .map(|&(f, t, bytes)| ctx.load(f, fragments[f].as_ref(), t, bytes))
                .collect::<Result<Vec<_>>>()
        })?;

        let run = &mut self.run;
        for (&(f, _, bytes), tile) in wanted.iter().zip(loaded) {
            run.store.insert(tile);
            run.budget.account(f, bytes);
            if stream_at.is_none() {
                run.tiles.advance_fragment(f, 1);
            }
        }
        if let Some(at) = stream_at {
            run.tiles.commit_stream(at);
        }
        tracing::trace!(
            query_id = self.options.context.query_id,
            tiles = wanted.len(),
            coords_used = run.budget.total(),
            stream = ?run.tiles.stream_progress(),
            "created result tiles"
        );
        Ok(wanted.len())
    }

    /// Evict every front tile the cursors have moved past. An exhausted
    /// cursor tile moves its cursor to the fragment's next tile first.
    fn evict_consumed(&mut self) -> Result<usize> {
        let direction = self.options.config.direction;
        let run = &mut self.run;
        let mut evicted = 0;
        for f in 0..self.fragments.len() {
            while let Some(handle) = run.store.front(f) {
                let (t, cell_num) = {
                    let tile = run.store.get(handle);
                    (tile.tile_idx(), tile.cell_num())
                };
                let done = run.state.is_done(f);
                let cursor = run.state.cursor(f);
                let exhausted = t == cursor.tile_idx && cursor.cell_idx >= cell_num;
                if !(done || exhausted || direction.tile_precedes(t, cursor.tile_idx)) {
                    break;
                }
                if exhausted && !done {
                    match run.tiles.next_after(f, t) {
                        Some(next) => run.state.set_cursor(f, FragIdx::new(next, 0)),
                        None => run.state.mark_done(f),
                    }
                }
                let tile = run.store.evict_front(f)?;
                run.budget.release(f, tile.coords_memory())?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::trace!(
                query_id = self.options.context.query_id,
                evicted,
                coords_used = run.budget.total(),
                "evicted consumed tiles"
            );
        }
        Ok(evicted)
    }

    fn complete(&mut self) -> Result<QueryStatus> {
        self.evict_consumed()?;
        let budget = &self.run.budget;
        if !self.run.store.is_empty() || budget.total() != 0 {
            return Err(Error::Internal(format!(
                "read finished with {} tiles and {} bytes still held",
                self.run.store.len(),
                budget.total()
            )));
        }
        tracing::debug!(
            query_id = self.query_id(),
            coords_peak = budget.usage().coords_peak,
            "read completed"
        );
        Ok(QueryStatus::Completed)
    }

    /// Copy merged cells, then commit the merge. Attribute data attached for
    /// the copy is released whether or not it succeeds.
    fn copy_pass(
        &mut self,
        buffers: &mut QueryBuffers,
        fields: &[FieldCopy],
        start: &MergeState,
        mut next: MergeState,
        mut output: MergeOutput,
        bound: Option<&GlobalCoords>,
    ) -> Result<CopyOutcome> {
        let mut plans = Vec::new();
        let result = self.copy_with_attributes(
            buffers,
            fields,
            start,
            &mut next,
            &mut output,
            bound,
            &mut plans,
        );
        let freed: u64 = plans
            .iter()
            .map(|p| copy::release_attributes(&mut self.run.store, p))
            .sum();
        self.run.budget.release_attributes(freed)?;
        let outcome = result?;
        self.run.state = next;
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_with_attributes(
        &mut self,
        buffers: &mut QueryBuffers,
        fields: &[FieldCopy],
        start: &MergeState,
        next: &mut MergeState,
        output: &mut MergeOutput,
        bound: Option<&GlobalCoords>,
        plans: &mut Vec<AttributePlan>,
    ) -> Result<CopyOutcome> {
        let query_id = self.query_id();
        let mut cells = output.cells;
        let mut reason = None;
        let mut var_sizes: FxHashMap<String, Vec<u64>> = FxHashMap::default();

        // Each round loads what the current slabs still miss and finds the
        // cutoff; a smaller cutoff replays the merge and tries again.
        loop {
            let slabs = copy::take_cells(&output.slabs, cells);
            let usage = self.run.budget.usage();
            let available = usage.attributes_limit.saturating_sub(usage.attributes_used);
            let plan = copy::plan_attribute_loads(
                &self.run.store,
                &self.fragments,
                &slabs,
                cells,
                available,
                |tile, slab| self.attributes_needed(fields, tile, slab),
            )?;
            let store = &mut self.run.store;
            let (schema, loader, fragments) = (&self.schema, self.ctx.loader.as_ref(), &self.fragments);
            let attached = in_pool(self.pool.as_deref(), || {
                copy::load_attributes(store, schema, loader, fragments, &plan)
            })?;
            self.run.budget.account_attributes(attached);
            let mut cut = plan.cells;
            plans.push(plan);
            if cut < cells {
                reason = Some(IncompleteReason::MemoryBudget);
            }

            for field in fields.iter().filter(|f| f.offsets.is_some()) {
                let sizes = copy::cell_sizes(
                    &self.run.store,
                    &copy::take_cells(&output.slabs, cut),
                    &field.name,
                )?;
                let capacity = buffers.get(&field.name).map_or(0, |b| b.var_capacity());
                let fit = copy::fitting_cells(&sizes, capacity as u64);
                if fit < cut {
                    cut = fit;
                    reason = Some(IncompleteReason::UserBufferSize);
                }
                var_sizes.insert(field.name.clone(), sizes);
            }
            if cut == cells {
                break;
            }

            *next = start.clone();
            *output = self.merger(bound).merge(next, cut);
            tracing::debug!(query_id, cutoff = cut, cells = output.cells, ?reason, "truncated copy");
            cells = output.cells;
            if cells == 0 {
                break;
            }
        }

        if cells == 0 {
            if reason == Some(IncompleteReason::MemoryBudget) {
                return Err(Error::MemoryBudgetExceeded(format!(
                    "attribute budget of {} bytes cannot hold the tiles of the next cell group",
                    self.run.budget.attributes_limit()
                )));
            }
            return Ok(CopyOutcome {
                reason,
                stop: output.stop,
            });
        }

        let slabs = copy::take_cells(&output.slabs, cells);
        let min_cells = self.options.config.min_cells_per_copy_task;
        let store = &self.run.store;
        in_pool(self.pool.as_deref(), || {
            copy::copy_fields(store, &slabs, cells, fields, buffers, &var_sizes, min_cells)
        })?;
        self.update_aggregates(&slabs);
        tracing::trace!(query_id, cells, slabs = slabs.len(), "copied cells");
        Ok(CopyOutcome {
            reason,
            stop: output.stop,
        })
    }

    /// Attribute fields the copy of `slab` reads from its tile.
    fn attributes_needed(&self, fields: &[FieldCopy], tile: &ResultTile, slab: &ResultCellSlab) -> Vec<String> {
        let mut names: Vec<String> = fields
            .iter()
            .filter(|f| f.is_attribute())
            .map(|f| f.name.clone())
            .collect();
        let fragment = &self.fragments[tile.fragment_idx()];
        for agg in &self.aggregates {
            if let Some(name) = agg.attribute() {
                let has_stats = fragment.tile_stats(tile.tile_idx(), name).is_some();
                if agg.needs_cells(tile, slab, has_stats) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    fn update_aggregates(&mut self, slabs: &[ResultCellSlab]) {
        if self.aggregates.is_empty() {
            return;
        }
        for slab in slabs {
            let tile = self.run.store.get(slab.tile);
            let fragment = &self.fragments[tile.fragment_idx()];
            for agg in &mut self.aggregates {
                agg.update(tile, slab, |name| fragment.tile_stats(tile.tile_idx(), name));
            }
        }
    }
}

impl std::fmt::Debug for SparseGlobalOrderReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseGlobalOrderReader")
            .field("fragments", &self.fragments.len())
            .field("query_id", &self.query_id())
            .field("config", &self.options.config)
            .field("preprocess", &self.preprocess)
            .field("status", &self.status)
            .field("tiles_held", &self.run.store.len())
            .finish_non_exhaustive()
    }
}

/// Tiles per fragment that can hold visible cells, with their first cell in
/// visit order when the fragment records tile bounds.
#[allow(clippy::type_complexity)]
fn relevant_tiles(
    fragments: &[Fragment],
    ctx: &TileLoadContext,
    direction: Direction,
) -> Result<(Vec<Vec<TileIdx>>, Vec<Vec<Option<Arc<GlobalCoords>>>>)> {
    let vis = &ctx.visibility;
    let mut relevant = Vec::with_capacity(fragments.len());
    let mut first_cells = Vec::with_capacity(fragments.len());
    for (f, frag) in fragments.iter().enumerate() {
        let (first, last) = frag.timestamp_range();
        if last < vis.window.0 || first > vis.window.1 {
            relevant.push(Vec::new());
            first_cells.push(Vec::new());
            continue;
        }
        let mut tiles = Vec::new();
        let mut firsts = Vec::new();
        for t in 0..frag.tile_num() {
            if frag.cell_num(t) == 0 {
                continue;
            }
            let mbr = frag.tile_mbr(t);
            // An empty MBR means the fragment did not record one.
            if !mbr.is_empty() {
                let lows: Vec<&[u8]> = mbr.iter().map(|(lo, _)| lo.as_slice()).collect();
                let highs: Vec<&[u8]> = mbr.iter().map(|(_, hi)| hi.as_slice()).collect();
                check_coords(&ctx.schema, f, t, "mbr", &lows)?;
                check_coords(&ctx.schema, f, t, "mbr", &highs)?;
            }
            if vis.subarray.overlap(&mbr) == Overlap::None {
                continue;
            }
            let first_cell = match frag.tile_global_bounds(t) {
                Some(b) => {
                    let coords = match direction {
                        Direction::Forward => b.first,
                        Direction::Reverse => b.last,
                    };
                    let values: Vec<&[u8]> = coords.iter().map(Vec::as_slice).collect();
                    check_coords(&ctx.schema, f, t, "bounds", &values)?;
                    Some(Arc::new(ctx.order.global_coords(coords)))
                }
                None => None,
            };
            tiles.push(t);
            firsts.push(first_cell);
        }
        relevant.push(tiles);
        first_cells.push(firsts);
    }
    Ok((relevant, first_cells))
}

/// Reject tile metadata whose per-dimension values do not match the schema.
fn check_coords(
    schema: &ArraySchema,
    fragment: FragmentIdx,
    tile: TileIdx,
    what: &str,
    values: &[&[u8]],
) -> Result<()> {
    let corrupt = |reason: String| Error::TileCorrupt {
        fragment,
        tile,
        field: what.to_string(),
        reason,
    };
    if values.len() != schema.dim_num() {
        return Err(corrupt(format!(
            "{} dimensions recorded, the schema has {}",
            values.len(),
            schema.dim_num()
        )));
    }
    for (dim, value) in schema.dimensions.iter().zip(values) {
        if value.len() != dim.cell_size() {
            return Err(corrupt(format!(
                "value of dimension '{}' has {} bytes, expected {}",
                dim.name,
                value.len(),
                dim.cell_size()
            )));
        }
    }
    Ok(())
}

/// Stream tiles a read no longer needs: already created, or behind the
/// fragment's cursor.
fn skip_stream_tile(run: &Run, direction: Direction, id: ResultTileId) -> bool {
    let f = id.fragment_idx;
    run.state.is_done(f)
        || direction.tile_precedes(id.tile_idx, run.state.cursor(f).tile_idx)
        || run.store.find(f, id.tile_idx).is_some()
}

fn tile_too_large(fragment: FragmentIdx, tile: TileIdx, bytes: u64, limit: u64) -> Error {
    Error::MemoryBudgetExceeded(format!(
        "tile {tile} of fragment {fragment} needs {bytes} bytes, the coordinate budget allows {limit}"
    ))
}

/// Run `op` on the reader's pool, or on the global pool without one.
fn in_pool<R: Send>(pool: Option<&ThreadPool>, op: impl FnOnce() -> R + Send) -> R {
    match pool {
        Some(pool) => pool.install(op),
        None => op(),
    }
}
