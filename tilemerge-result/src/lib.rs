//! Error types and result definitions for the tilemerge read path.
//!
//! Every tilemerge crate returns [`Result<T>`] with the single [`Error`] enum,
//! so failures propagate across crate boundaries with `?` and callers can
//! match on the variant to decide whether a retry makes sense
//! ([`Error::is_transient`]).

pub mod error;
pub mod result;

pub use error::Error;
pub use result::Result;
