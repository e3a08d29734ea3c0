//! Array schema: the dimensions that form a cell's coordinates and the
//! attributes stored alongside them.

use tilemerge_result::{Error, Result};

use crate::datatype::{Datatype, NativeType};
use crate::layout::Layout;

/// Pseudo-field holding the per-cell write timestamp (`u64`).
pub const TIMESTAMPS_FIELD: &str = "__timestamps";

/// Pseudo-field holding the per-cell delete timestamp (`u64`, 0 = not deleted).
pub const DELETE_TIMESTAMPS_FIELD: &str = "__delete_timestamps";

const RESERVED_PREFIX: &str = "__";

#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub datatype: Datatype,
    /// Inclusive `(low, high)` bounds, little-endian encoded.
    pub domain: (Vec<u8>, Vec<u8>),
}

impl Dimension {
    pub fn new<T: NativeType>(name: impl Into<String>, low: T, high: T) -> Self {
        let mut lo = Vec::with_capacity(T::SIZE);
        let mut hi = Vec::with_capacity(T::SIZE);
        low.write_le(&mut lo);
        high.write_le(&mut hi);
        Self {
            name: name.into(),
            datatype: T::DATATYPE,
            domain: (lo, hi),
        }
    }

    #[inline]
    pub fn cell_size(&self) -> usize {
        self.datatype.size()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub var_sized: bool,
    pub nullable: bool,
}

impl Attribute {
    /// A fixed-size attribute holding one `datatype` element per cell.
    pub fn fixed(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            var_sized: false,
            nullable: false,
        }
    }

    /// A var-sized attribute holding any number of `datatype` elements per cell.
    pub fn var(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            var_sized: true,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// What a field name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A dimension, by position.
    Dimension(usize),
    /// An attribute, by position.
    Attribute(usize),
    Timestamps,
    DeleteTimestamps,
}

/// Resolved physical description of a readable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub kind: FieldKind,
    pub datatype: Datatype,
    pub var_sized: bool,
    pub nullable: bool,
}

impl FieldInfo {
    /// Bytes per cell in the fixed part of a buffer. For var-sized fields this
    /// is the element size of the payload.
    #[inline]
    pub fn cell_size(&self) -> usize {
        self.datatype.size()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArraySchema {
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub cell_order: Layout,
    pub allows_duplicates: bool,
}

impl ArraySchema {
    /// Build a row-major schema without duplicates.
    ///
    /// Fails if there are no dimensions, a dimension is not a fixed-size
    /// numeric type, names collide, or a name uses the reserved `__` prefix.
    pub fn new(dimensions: Vec<Dimension>, attributes: Vec<Attribute>) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(Error::InvalidArgumentError(
                "array schema needs at least one dimension".into(),
            ));
        }
        for d in &dimensions {
            if !d.datatype.is_numeric() {
                return Err(Error::InvalidArgumentError(format!(
                    "dimension '{}' must have a fixed-size numeric datatype, got {:?}",
                    d.name, d.datatype
                )));
            }
            if d.domain.0.len() != d.cell_size() || d.domain.1.len() != d.cell_size() {
                return Err(Error::InvalidArgumentError(format!(
                    "domain of dimension '{}' is not encoded as {:?}",
                    d.name, d.datatype
                )));
            }
        }
        let mut seen: Vec<&str> = Vec::with_capacity(dimensions.len() + attributes.len());
        let names = dimensions
            .iter()
            .map(|d| d.name.as_str())
            .chain(attributes.iter().map(|a| a.name.as_str()));
        for name in names {
            if name.starts_with(RESERVED_PREFIX) {
                return Err(Error::InvalidArgumentError(format!(
                    "field name '{name}' uses the reserved '{RESERVED_PREFIX}' prefix"
                )));
            }
            if seen.contains(&name) {
                return Err(Error::InvalidArgumentError(format!(
                    "duplicate field name '{name}'"
                )));
            }
            seen.push(name);
        }

        Ok(Self {
            dimensions,
            attributes,
            cell_order: Layout::RowMajor,
            allows_duplicates: false,
        })
    }

    pub fn with_cell_order(mut self, cell_order: Layout) -> Self {
        self.cell_order = cell_order;
        self
    }

    pub fn with_allows_duplicates(mut self, allows_duplicates: bool) -> Self {
        self.allows_duplicates = allows_duplicates;
        self
    }

    #[inline]
    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    /// Sum of the dimension cell sizes.
    pub fn coords_size(&self) -> usize {
        self.dimensions.iter().map(Dimension::cell_size).sum()
    }

    /// Resolve a field name, including the timestamp pseudo-fields.
    pub fn field(&self, name: &str) -> Option<FieldInfo> {
        if name == TIMESTAMPS_FIELD {
            return Some(FieldInfo {
                kind: FieldKind::Timestamps,
                datatype: Datatype::UInt64,
                var_sized: false,
                nullable: false,
            });
        }
        if name == DELETE_TIMESTAMPS_FIELD {
            return Some(FieldInfo {
                kind: FieldKind::DeleteTimestamps,
                datatype: Datatype::UInt64,
                var_sized: false,
                nullable: false,
            });
        }
        if let Some(i) = self.dimensions.iter().position(|d| d.name == name) {
            return Some(FieldInfo {
                kind: FieldKind::Dimension(i),
                datatype: self.dimensions[i].datatype,
                var_sized: false,
                nullable: false,
            });
        }
        self.attributes
            .iter()
            .position(|a| a.name == name)
            .map(|i| {
                let a = &self.attributes[i];
                FieldInfo {
                    kind: FieldKind::Attribute(i),
                    datatype: a.datatype,
                    var_sized: a.var_sized,
                    nullable: a.nullable,
                }
            })
    }

    /// Like [`ArraySchema::field`] but reports unknown names as an error.
    pub fn require_field(&self, name: &str) -> Result<FieldInfo> {
        self.field(name)
            .ok_or_else(|| Error::InvalidArgumentError(format!("unknown field '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ArraySchema {
        ArraySchema::new(
            vec![Dimension::new("d1", 1u64, 100), Dimension::new("d2", -5i32, 5)],
            vec![
                Attribute::fixed("a", Datatype::Int32),
                Attribute::var("s", Datatype::StringAscii).nullable(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn resolves_fields_and_pseudo_fields() {
        let s = schema();
        assert_eq!(s.coords_size(), 12);
        assert_eq!(s.field("d2").unwrap().kind, FieldKind::Dimension(1));
        let f = s.field("s").unwrap();
        assert!(f.var_sized && f.nullable);
        assert_eq!(s.field(TIMESTAMPS_FIELD).unwrap().kind, FieldKind::Timestamps);
        assert!(s.field("nope").is_none());
        assert!(matches!(
            s.require_field("nope"),
            Err(Error::InvalidArgumentError(_))
        ));
    }

    #[test]
    fn rejects_bad_schemas() {
        assert!(ArraySchema::new(vec![], vec![]).is_err());
        let dup = ArraySchema::new(
            vec![Dimension::new("x", 0u8, 9)],
            vec![Attribute::fixed("x", Datatype::Int8)],
        );
        assert!(dup.is_err());
        let reserved = ArraySchema::new(
            vec![Dimension::new("x", 0u8, 9)],
            vec![Attribute::fixed("__a", Datatype::Int8)],
        );
        assert!(reserved.is_err());
        let var_dim = ArraySchema::new(
            vec![Dimension {
                name: "s".into(),
                datatype: Datatype::StringAscii,
                domain: (vec![b'a'], vec![b'z']),
            }],
            vec![],
        );
        assert!(var_dim.is_err());
    }
}
