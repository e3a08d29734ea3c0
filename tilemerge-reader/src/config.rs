//! Run-time configuration of the reader (no hidden constants).

use rustc_hash::FxHashMap;
use tilemerge_result::{Error, Result};
use tilemerge_types::Direction;

pub const KEY_MEMORY_BUDGET: &str = "sm.mem.total_budget";
pub const KEY_COORDS_RATIO: &str = "sm.mem.reader.sparse_global_order.ratio_coords";
pub const KEY_PREPROCESS_TILE_MERGE: &str = "sm.query.sparse_global_order.preprocess_tile_merge";
pub const KEY_REVERSE: &str = "sm.query.sparse_global_order.reverse";
pub const KEY_OFFSETS_BITSIZE: &str = "sm.var_offsets.bitsize";
pub const KEY_OFFSETS_EXTRA_ELEMENT: &str = "sm.var_offsets.extra_element";
pub const KEY_OFFSETS_MODE: &str = "sm.var_offsets.mode";
pub const KEY_MIN_COPY_TASK_CELLS: &str = "sm.query.sparse_global_order.min_copy_task_cells";
pub const KEY_CONCURRENCY: &str = "sm.compute_concurrency_level";

/// How the reader decides which tiles to load next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileOrderMode {
    /// Each fragment walks its own tiles; the coordinate budget is split
    /// evenly across fragments.
    #[default]
    PerFragment,
    /// Tiles of all fragments are pre-merged into one stream ordered by
    /// their first cell and loaded from a single global budget.
    Preprocess,
}

/// Unit of var-sized offsets written to user buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetsMode {
    #[default]
    Bytes,
    Elements,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderConfig {
    /// Total memory the reader may hold in loaded tiles, in bytes.
    pub memory_budget: u64,
    /// Share of `memory_budget` reserved for coordinate tiles. The rest holds
    /// attribute tiles during copies.
    pub coords_ratio: f64,
    pub tile_order: TileOrderMode,
    pub direction: Direction,
    /// 32 or 64.
    pub offsets_bitsize: u8,
    pub offsets_extra_element: bool,
    pub offsets_mode: OffsetsMode,
    pub min_cells_per_copy_task: usize,
    /// Worker threads for loads and copies; 0 uses the global rayon pool.
    pub num_threads: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            memory_budget: 10 * 1024 * 1024,
            coords_ratio: 0.5,
            tile_order: TileOrderMode::PerFragment,
            direction: Direction::Forward,
            offsets_bitsize: 64,
            offsets_extra_element: false,
            offsets_mode: OffsetsMode::Bytes,
            min_cells_per_copy_task: 1024,
            num_threads: 0,
        }
    }
}

impl ReaderConfig {
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_coords_ratio(mut self, ratio: f64) -> Self {
        self.coords_ratio = ratio;
        self
    }

    pub fn with_tile_order(mut self, tile_order: TileOrderMode) -> Self {
        self.tile_order = tile_order;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_offsets_bitsize(mut self, bits: u8) -> Self {
        self.offsets_bitsize = bits;
        self
    }

    pub fn with_offsets_extra_element(mut self, extra: bool) -> Self {
        self.offsets_extra_element = extra;
        self
    }

    pub fn with_offsets_mode(mut self, mode: OffsetsMode) -> Self {
        self.offsets_mode = mode;
        self
    }

    pub fn with_min_cells_per_copy_task(mut self, cells: usize) -> Self {
        self.min_cells_per_copy_task = cells;
        self
    }

    pub fn with_num_threads(mut self, threads: usize) -> Self {
        self.num_threads = threads;
        self
    }

    /// Bytes available for coordinate tiles.
    pub fn coords_budget(&self) -> u64 {
        (self.memory_budget as f64 * self.coords_ratio) as u64
    }

    /// Bytes available for attribute tiles during a copy pass.
    pub fn attribute_budget(&self) -> u64 {
        self.memory_budget.saturating_sub(self.coords_budget())
    }

    pub fn offset_size(&self) -> usize {
        usize::from(self.offsets_bitsize / 8)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.coords_ratio > 0.0 && self.coords_ratio <= 1.0) {
            return Err(Error::InvalidArgumentError(format!(
                "coords ratio must be in (0, 1], got {}",
                self.coords_ratio
            )));
        }
        if self.offsets_bitsize != 32 && self.offsets_bitsize != 64 {
            return Err(Error::InvalidArgumentError(format!(
                "offsets bitsize must be 32 or 64, got {}",
                self.offsets_bitsize
            )));
        }
        if self.min_cells_per_copy_task == 0 {
            return Err(Error::InvalidArgumentError(
                "min cells per copy task must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Build a configuration from dotted `sm.*` parameters.
    ///
    /// Keys not listed in this module are ignored; malformed values of known
    /// keys are rejected.
    pub fn from_params(params: &FxHashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in params {
            let value = value.trim();
            match key.as_str() {
                KEY_MEMORY_BUDGET => config.memory_budget = parse(key, value)?,
                KEY_COORDS_RATIO => config.coords_ratio = parse(key, value)?,
                KEY_PREPROCESS_TILE_MERGE => {
                    config.tile_order = if parse_bool(key, value)? {
                        TileOrderMode::Preprocess
                    } else {
                        TileOrderMode::PerFragment
                    }
                }
                KEY_REVERSE => {
                    config.direction = if parse_bool(key, value)? {
                        Direction::Reverse
                    } else {
                        Direction::Forward
                    }
                }
                KEY_OFFSETS_BITSIZE => config.offsets_bitsize = parse(key, value)?,
                KEY_OFFSETS_EXTRA_ELEMENT => config.offsets_extra_element = parse_bool(key, value)?,
                KEY_OFFSETS_MODE => {
                    config.offsets_mode = match value {
                        "bytes" => OffsetsMode::Bytes,
                        "elements" => OffsetsMode::Elements,
                        other => return Err(bad_value(key, other)),
                    }
                }
                KEY_MIN_COPY_TASK_CELLS => config.min_cells_per_copy_task = parse(key, value)?,
                KEY_CONCURRENCY => config.num_threads = parse(key, value)?,
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn bad_value(key: &str, value: &str) -> Error {
    Error::InvalidArgumentError(format!("invalid value '{value}' for '{key}'"))
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| bad_value(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(bad_value(key, other)),
    }
}
