//! Query conditions applied while building tile bitmaps.

use std::sync::Arc;

use crate::result_tile::ResultTile;

/// Evaluates a predicate on individual cells of a loaded result tile.
///
/// Fields named by [`QueryCondition::field_names`] are loaded together with
/// the coordinates and count against the coordinate budget.
pub trait QueryCondition: Send + Sync {
    fn field_names(&self) -> Vec<String>;

    /// Whether the cell at `cell` (tile position) satisfies the condition.
    fn evaluate(&self, tile: &ResultTile, cell: u64) -> bool;
}

type CellPredicate = dyn Fn(&ResultTile, u64) -> bool + Send + Sync;

/// A condition backed by a closure.
pub struct PredicateCondition {
    fields: Vec<String>,
    predicate: Box<CellPredicate>,
}

impl PredicateCondition {
    pub fn new<F>(fields: &[&str], predicate: F) -> Self
    where
        F: Fn(&ResultTile, u64) -> bool + Send + Sync + 'static,
    {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            predicate: Box::new(predicate),
        }
    }
}

impl QueryCondition for PredicateCondition {
    fn field_names(&self) -> Vec<String> {
        self.fields.clone()
    }

    fn evaluate(&self, tile: &ResultTile, cell: u64) -> bool {
        (self.predicate)(tile, cell)
    }
}

impl std::fmt::Debug for PredicateCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateCondition")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// A delete issued at `timestamp`: cells written strictly before it that
/// match `condition` are deleted.
#[derive(Clone)]
pub struct DeleteCondition {
    pub timestamp: u64,
    pub condition: Arc<dyn QueryCondition>,
}

impl DeleteCondition {
    pub fn new(timestamp: u64, condition: Arc<dyn QueryCondition>) -> Self {
        Self {
            timestamp,
            condition,
        }
    }
}

impl std::fmt::Debug for DeleteCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeleteCondition")
            .field("timestamp", &self.timestamp)
            .field("fields", &self.condition.field_names())
            .finish()
    }
}
