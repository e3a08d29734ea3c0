//! Column aggregates computed over merged cells.
//!
//! Aggregates see exactly the cells a copy would write, slab by slab. When a
//! slab spans a whole tile with no excluded cells, the fragment's tile
//! statistics answer the aggregate without touching cell data.

use tilemerge_result::{Error, Result};
use tilemerge_storage::TileStats;
use tilemerge_types::{ArraySchema, FieldInfo, FieldKind, ScalarValue};

use crate::result_tile::ResultTile;
use crate::slab::ResultCellSlab;

/// Specification for an aggregate operation
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub alias: String,
    pub kind: AggregateKind,
}

impl AggregateSpec {
    pub fn new(alias: impl Into<String>, kind: AggregateKind) -> Self {
        Self {
            alias: alias.into(),
            kind,
        }
    }
}

/// Type of aggregate operation
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateKind {
    /// Number of result cells.
    Count,
    NullCount { field: String },
    Sum { field: String },
    Min { field: String },
    Max { field: String },
    Mean { field: String },
}

impl AggregateKind {
    /// Get the field this aggregate reads, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            AggregateKind::Count => None,
            AggregateKind::NullCount { field }
            | AggregateKind::Sum { field }
            | AggregateKind::Min { field }
            | AggregateKind::Max { field }
            | AggregateKind::Mean { field } => Some(field),
        }
    }
}

/// Accumulator for incremental aggregate computation
#[derive(Debug, Clone, PartialEq)]
enum Accumulator {
    Count { value: u64 },
    NullCount { value: u64 },
    Sum { value: Option<ScalarValue> },
    Min { value: Option<ScalarValue> },
    Max { value: Option<ScalarValue> },
    Mean { sum: f64, count: u64 },
}

/// Runtime state of one aggregate across iterations and calls.
#[derive(Debug, Clone)]
pub(crate) struct AggregateState {
    spec: AggregateSpec,
    field: Option<FieldInfo>,
    accumulator: Accumulator,
    warned_missing_stats: bool,
}

impl AggregateState {
    pub fn new(spec: AggregateSpec, schema: &ArraySchema) -> Result<Self> {
        let field = match spec.kind.field() {
            Some(name) => {
                let info = schema.require_field(name)?;
                let numeric = !info.var_sized && info.datatype.is_numeric();
                if !numeric && !matches!(spec.kind, AggregateKind::NullCount { .. }) {
                    return Err(Error::InvalidArgumentError(format!(
                        "aggregate '{}' needs a fixed-size numeric field, '{name}' is {:?}",
                        spec.alias, info.datatype
                    )));
                }
                Some(info)
            }
            None => None,
        };
        let accumulator = Self::empty(&spec.kind);
        Ok(Self {
            spec,
            field,
            accumulator,
            warned_missing_stats: false,
        })
    }

    fn empty(kind: &AggregateKind) -> Accumulator {
        match kind {
            AggregateKind::Count => Accumulator::Count { value: 0 },
            AggregateKind::NullCount { .. } => Accumulator::NullCount { value: 0 },
            AggregateKind::Sum { .. } => Accumulator::Sum { value: None },
            AggregateKind::Min { .. } => Accumulator::Min { value: None },
            AggregateKind::Max { .. } => Accumulator::Max { value: None },
            AggregateKind::Mean { .. } => Accumulator::Mean { sum: 0.0, count: 0 },
        }
    }

    pub fn alias(&self) -> &str {
        &self.spec.alias
    }

    /// Attribute whose tiles must be loaded for cell-level evaluation.
    /// Dimensions live in the coordinate tiles already.
    pub fn attribute(&self) -> Option<&str> {
        match self.field?.kind {
            FieldKind::Attribute(_) => self.spec.kind.field(),
            _ => None,
        }
    }

    fn nullable(&self) -> bool {
        self.field.is_some_and(|f| f.nullable)
    }

    pub fn reset(&mut self) {
        self.accumulator = Self::empty(&self.spec.kind);
        self.warned_missing_stats = false;
    }

    /// Whether `slab` is eligible for the tile-statistics shortcut.
    pub fn fast_path_applies(tile: &ResultTile, slab: &ResultCellSlab) -> bool {
        slab.covers_tile(tile.cell_num()) && tile.bitmap().is_always_live()
    }

    /// Whether evaluating `slab` reads cell values.
    pub fn needs_cells(&self, tile: &ResultTile, slab: &ResultCellSlab, has_stats: bool) -> bool {
        match self.accumulator {
            Accumulator::Count { .. } => false,
            Accumulator::NullCount { .. } if !self.nullable() => false,
            _ => !(Self::fast_path_applies(tile, slab) && has_stats),
        }
    }

    /// Fold the cells of `slab` in. `stats` is consulted only when the slab
    /// qualifies for the shortcut.
    pub fn update(
        &mut self,
        tile: &ResultTile,
        slab: &ResultCellSlab,
        stats: impl FnOnce(&str) -> Option<TileStats>,
    ) {
        let nullable = self.nullable();
        match &mut self.accumulator {
            Accumulator::Count { value } => {
                *value += slab.length;
                return;
            }
            Accumulator::NullCount { .. } if !nullable => return,
            _ => {}
        }
        let Some(name) = self.spec.kind.field() else {
            return;
        };
        if Self::fast_path_applies(tile, slab) {
            match stats(name) {
                Some(s) => {
                    self.update_from_stats(&s);
                    return;
                }
                None if !self.warned_missing_stats => {
                    self.warned_missing_stats = true;
                    tracing::warn!(
                        aggregate = %self.spec.alias,
                        field = name,
                        fragment = tile.fragment_idx(),
                        "tile statistics missing, aggregating cell by cell"
                    );
                }
                None => {}
            }
        }
        let name = name.to_string();
        for pos in slab.positions() {
            self.update_cell(tile, &name, pos);
        }
    }

    fn update_from_stats(&mut self, s: &TileStats) {
        match &mut self.accumulator {
            Accumulator::Count { value } => *value += s.cell_count,
            Accumulator::NullCount { value } => *value += s.null_count,
            Accumulator::Sum { value } => {
                if let Some(sum) = s.sum {
                    *value = Some(value.map_or(sum, |v| v.add(sum)));
                }
            }
            Accumulator::Min { value } => {
                if let Some(m) = s.min {
                    *value = Some(value.map_or(m, |v| v.min(m)));
                }
            }
            Accumulator::Max { value } => {
                if let Some(m) = s.max {
                    *value = Some(value.map_or(m, |v| v.max(m)));
                }
            }
            Accumulator::Mean { sum, count } => {
                let valid = s.cell_count - s.null_count;
                if valid > 0 {
                    *sum += s.sum.map_or(0.0, ScalarValue::as_f64);
                    *count += valid;
                }
            }
        }
    }

    fn update_cell(&mut self, tile: &ResultTile, name: &str, pos: u64) {
        if tile.is_null(name, pos) {
            if let Accumulator::NullCount { value } = &mut self.accumulator {
                *value += 1;
            }
            return;
        }
        let Some(info) = self.field else { return };
        let Some(v) = tile
            .fixed_value(name, pos)
            .and_then(|b| ScalarValue::from_le_bytes(info.datatype, b))
        else {
            return;
        };
        match &mut self.accumulator {
            Accumulator::Count { value } => *value += 1,
            Accumulator::NullCount { .. } => {}
            Accumulator::Sum { value } => *value = Some(value.map_or(v, |s| s.add(v))),
            Accumulator::Min { value } => *value = Some(value.map_or(v, |m| m.min(v))),
            Accumulator::Max { value } => *value = Some(value.map_or(v, |m| m.max(v))),
            Accumulator::Mean { sum, count } => {
                *sum += v.as_f64();
                *count += 1;
            }
        }
    }

    /// Current result; `None` when no non-null value has been seen.
    pub fn value(&self) -> Option<ScalarValue> {
        match &self.accumulator {
            Accumulator::Count { value } | Accumulator::NullCount { value } => {
                Some(ScalarValue::UInt(*value as u128))
            }
            Accumulator::Sum { value } | Accumulator::Min { value } | Accumulator::Max { value } => {
                *value
            }
            Accumulator::Mean { sum, count } => {
                (*count > 0).then(|| ScalarValue::Float(*sum / *count as f64))
            }
        }
    }
}
