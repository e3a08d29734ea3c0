use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::condition::{DeleteCondition, QueryCondition};
use crate::config::ReaderConfig;
use crate::copy::aggregate::AggregateSpec;
use crate::subarray::Subarray;

/// Which versions of a cell a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Latest visible version of each cell; deleted cells are dropped.
    #[default]
    Standard,
    /// Every visible version, newest first, as consolidation rewrites them.
    ///
    /// Without `purge_deletes` deleted cells are kept and their delete
    /// timestamp is reported. With it they are dropped, and when duplicates
    /// are not allowed every version older than a delete is dropped too.
    Consolidation { purge_deletes: bool },
}

/// Caller-supplied identity attached to every log line of a reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderContext {
    pub query_id: u64,
}

/// Shared flag checked before each reader iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything that shapes a read besides the array and its fragments.
#[derive(Clone)]
pub struct ReaderOptions {
    pub config: ReaderConfig,
    pub subarray: Subarray,
    /// Inclusive read window over write timestamps.
    pub timestamp_start: u64,
    pub timestamp_end: u64,
    pub mode: ReadMode,
    pub condition: Option<Arc<dyn QueryCondition>>,
    pub delete_conditions: Vec<DeleteCondition>,
    pub aggregates: Vec<AggregateSpec>,
    pub context: ReaderContext,
    pub cancellation: Option<CancellationToken>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            config: ReaderConfig::default(),
            subarray: Subarray::default(),
            timestamp_start: 0,
            timestamp_end: u64::MAX,
            mode: ReadMode::Standard,
            condition: None,
            delete_conditions: Vec::new(),
            aggregates: Vec::new(),
            context: ReaderContext::default(),
            cancellation: None,
        }
    }
}

impl ReaderOptions {
    pub fn with_config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_subarray(mut self, subarray: Subarray) -> Self {
        self.subarray = subarray;
        self
    }

    pub fn with_timestamps(mut self, start: u64, end: u64) -> Self {
        self.timestamp_start = start;
        self.timestamp_end = end;
        self
    }

    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn QueryCondition>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_delete_condition(mut self, delete: DeleteCondition) -> Self {
        self.delete_conditions.push(delete);
        self
    }

    pub fn with_aggregate(mut self, spec: AggregateSpec) -> Self {
        self.aggregates.push(spec);
        self
    }

    pub fn with_context(mut self, context: ReaderContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl std::fmt::Debug for ReaderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("config", &self.config)
            .field("subarray", &self.subarray)
            .field("timestamp_start", &self.timestamp_start)
            .field("timestamp_end", &self.timestamp_end)
            .field("mode", &self.mode)
            .field("condition", &self.condition.is_some())
            .field("delete_conditions", &self.delete_conditions)
            .field("aggregates", &self.aggregates)
            .field("context", &self.context)
            .finish()
    }
}
