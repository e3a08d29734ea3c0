use std::{fmt, io};
use thiserror::Error;

/// Unified error type for the tilemerge read path.
///
/// The variants fall into four families that callers are expected to treat
/// differently:
///
/// - **Transient I/O** ([`Error::Io`]): a tile could not be fetched. The reader
///   leaves its merge state untouched, so the same `execute()` call can be
///   retried.
/// - **Fatal configuration** ([`Error::MemoryBudgetExceeded`],
///   [`Error::InvalidArgumentError`], [`Error::OffsetOverflow`]): retrying with
///   the same inputs fails again.
/// - **Fatal data** ([`Error::TileCorrupt`]): the tile loader returned bytes that
///   do not match the fragment metadata.
/// - **Logic invariants** ([`Error::Internal`]): a bug. Never silently ignored.
///
/// Output buffers that are too small are *not* an error; the reader reports an
/// incomplete status instead.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error raised by a tile loader.
    ///
    /// This is the only retryable variant (see [`Error::is_transient`]).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Arrow error while exporting result buffers as Arrow arrays.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Invalid user input or API parameter.
    ///
    /// Raised for unknown field names, buffers whose shape does not match the
    /// field (fixed vs. var-sized, missing validity for nullable fields),
    /// malformed configuration values, and similar caller mistakes.
    #[error("Invalid argument: {0}")]
    InvalidArgumentError(String),

    /// The tile loader produced data that disagrees with the fragment metadata.
    #[error("corrupt tile {tile} of fragment {fragment} (field '{field}'): {reason}")]
    TileCorrupt {
        fragment: usize,
        tile: u64,
        field: String,
        reason: String,
    },

    /// The configured memory budget cannot hold the minimum working set.
    ///
    /// Either a single coordinate tile does not fit the per-fragment (or global)
    /// coordinate budget, the attribute tiles backing a single result tile do
    /// not fit the copy budget, or an iteration could not load any tile while
    /// unconsumed fragments remain. Continuing would deadlock the merge.
    #[error("memory budget exceeded: {0}")]
    MemoryBudgetExceeded(String),

    /// Var-sized payload does not fit the configured 32-bit offsets.
    #[error("offsets overflow for field '{field}': {total} bytes exceed 32-bit offsets")]
    OffsetOverflow { field: String, total: u64 },

    /// A cancellation signal was observed before an iteration began.
    #[error("query cancelled")]
    Cancelled,

    /// The reader was poisoned by an earlier non-transient error.
    ///
    /// Call `reset()` to start the query again from scratch.
    #[error("reader is in a failed state; reset it before executing again")]
    ReaderFailed,

    /// Internal error indicating a bug or unexpected state.
    ///
    /// Heap underflow, a tile evicted while still referenced, or budget
    /// accounting going negative all land here.
    #[error("An internal operation failed: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Create an internal error from any displayable value.
    ///
    /// # Examples
    ///
    /// ```
    /// use tilemerge_result::Error;
    ///
    /// let err = Error::internal("heap underflow");
    /// assert!(matches!(err, Error::Internal(msg) if msg == "heap underflow"));
    /// ```
    #[inline]
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        Error::Internal(err.to_string())
    }

    /// Create a corrupt-tile error.
    #[inline]
    pub fn tile_corrupt(
        fragment: usize,
        tile: u64,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::TileCorrupt {
            fragment,
            tile,
            field: field.into(),
            reason: reason.into(),
        }
    }
}
