use crate::error::Error;

/// Result type alias used throughout tilemerge.
pub type Result<T> = std::result::Result<T, Error>;
