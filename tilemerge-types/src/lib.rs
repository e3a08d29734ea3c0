//! Shared vocabulary of the tilemerge read path: identifiers, datatypes,
//! cell orders and the array schema.

pub mod datatype;
pub mod ids;
pub mod layout;
pub mod scalar;
pub mod schema;

pub use datatype::{Datatype, NativeType, decode_native, encode_native};
pub use ids::{FragIdx, FragmentIdx, ResultTileId, TileIdx};
pub use layout::{Direction, Layout};
pub use scalar::ScalarValue;
pub use schema::{
    ArraySchema, Attribute, DELETE_TIMESTAMPS_FIELD, Dimension, FieldInfo, FieldKind,
    TIMESTAMPS_FIELD,
};
