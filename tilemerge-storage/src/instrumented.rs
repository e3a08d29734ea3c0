use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tilemerge_result::Result;
use tilemerge_types::{FragmentIdx, TileIdx};

use crate::traits::{TileData, TileLoader};

/// Thread-safe tile load counters.
#[derive(Debug, Default)]
pub struct LoadStats {
    pub loads: AtomicU64,
    pub loaded_bytes: AtomicU64,
    pub failures: AtomicU64,
    per_field: Mutex<FxHashMap<String, u64>>,
}

impl LoadStats {
    fn record(&self, field: &str, outcome: &Result<TileData>) {
        match outcome {
            Ok(data) => {
                self.loads.fetch_add(1, Ordering::Relaxed);
                self.loaded_bytes.fetch_add(data.size(), Ordering::Relaxed);
                let mut per_field = self
                    .per_field
                    .lock()
                    .expect("LoadStats per-field lock poisoned");
                *per_field.entry(field.to_string()).or_default() += 1;
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Successful loads of `field` so far.
    pub fn field_loads(&self, field: &str) -> u64 {
        self.per_field
            .lock()
            .expect("LoadStats per-field lock poisoned")
            .get(field)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> LoadStatsSnapshot {
        LoadStatsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            loaded_bytes: self.loaded_bytes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.loads.store(0, Ordering::Relaxed);
        self.loaded_bytes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.per_field
            .lock()
            .expect("LoadStats per-field lock poisoned")
            .clear();
    }
}

/// Immutable copy of [`LoadStats`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStatsSnapshot {
    pub loads: u64,
    pub loaded_bytes: u64,
    pub failures: u64,
}

impl LoadStatsSnapshot {
    /// `self - older`, saturating at zero.
    pub fn delta_since(&self, older: &Self) -> Self {
        Self {
            loads: self.loads.saturating_sub(older.loads),
            loaded_bytes: self.loaded_bytes.saturating_sub(older.loaded_bytes),
            failures: self.failures.saturating_sub(older.failures),
        }
    }
}

/// Wraps a [`TileLoader`] and counts what passes through it.
pub struct InstrumentedLoader<L> {
    inner: L,
    stats: Arc<LoadStats>,
}

impl<L: TileLoader> InstrumentedLoader<L> {
    pub fn new(inner: L) -> (Self, Arc<LoadStats>) {
        let stats = Arc::new(LoadStats::default());
        (
            Self {
                inner,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }

    pub fn stats(&self) -> Arc<LoadStats> {
        Arc::clone(&self.stats)
    }
}

impl<L: TileLoader> TileLoader for InstrumentedLoader<L> {
    fn load(&self, fragment: FragmentIdx, tile: TileIdx, field: &str) -> Result<TileData> {
        let out = self.inner.load(fragment, tile, field);
        self.stats.record(field, &out);
        tracing::trace!(
            fragment,
            tile,
            field,
            ok = out.is_ok(),
            "tile load"
        );
        out
    }
}
