use std::cmp::Ordering;
use std::io;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tilemerge_result::Result;
use tilemerge_storage::{TileData, TileLoader};
use tilemerge_types::{ArraySchema, Datatype, FragmentIdx, TileIdx};

static INIT: Once = Once::new();

/// Initialize tracing for test binaries. Safe to call multiple times.
pub fn init_tracing_for_tests() {
    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;
        use tracing_subscriber::fmt;
        let filter = match std::env::var("RUST_LOG") {
            Ok(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            Err(_) => EnvFilter::new("info"),
        };
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .try_init();
    });
}

/// Row-major coordinate comparator for [`tilemerge_storage::MemFragmentBuilder::sort_cells_by`].
pub fn row_major_cmp(schema: &ArraySchema) -> impl Fn(&[&[u8]], &[&[u8]]) -> Ordering + 'static {
    let types: Vec<Datatype> = schema.dimensions.iter().map(|d| d.datatype).collect();
    move |a: &[&[u8]], b: &[&[u8]]| {
        for (d, dt) in types.iter().enumerate() {
            let ord = dt.compare(a[d], b[d]);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Column-major coordinate comparator.
pub fn col_major_cmp(schema: &ArraySchema) -> impl Fn(&[&[u8]], &[&[u8]]) -> Ordering + 'static {
    let types: Vec<Datatype> = schema.dimensions.iter().map(|d| d.datatype).collect();
    move |a: &[&[u8]], b: &[&[u8]]| {
        for (d, dt) in types.iter().enumerate().rev() {
            let ord = dt.compare(a[d], b[d]);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Loader wrapper that fails a configurable number of upcoming loads with a
/// transient I/O error.
pub struct FailingLoader {
    inner: Arc<dyn TileLoader>,
    fail_remaining: AtomicU64,
    skip_remaining: AtomicU64,
}

impl FailingLoader {
    pub fn new(inner: Arc<dyn TileLoader>) -> Self {
        Self {
            inner,
            fail_remaining: AtomicU64::new(0),
            skip_remaining: AtomicU64::new(0),
        }
    }

    /// Let `skip` loads through, then fail the following `fail` loads.
    pub fn fail_after(&self, skip: u64, fail: u64) {
        self.skip_remaining.store(skip, AtomicOrdering::SeqCst);
        self.fail_remaining.store(fail, AtomicOrdering::SeqCst);
    }
}

impl TileLoader for FailingLoader {
    fn load(&self, fragment: FragmentIdx, tile: TileIdx, field: &str) -> Result<TileData> {
        let skipped = self
            .skip_remaining
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if !skipped {
            let failed = self
                .fail_remaining
                .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                    n.checked_sub(1)
                })
                .is_ok();
            if failed {
                return Err(io::Error::other(format!(
                    "injected failure loading '{field}' of tile {tile} in fragment {fragment}"
                ))
                .into());
            }
        }
        self.inner.load(fragment, tile, field)
    }
}

/// Small deterministic PRNG for randomized tests.
#[derive(Debug, Clone)]
pub struct XorShift64(u64);

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `0..n`. `n` must be non-zero.
    pub fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }
}
