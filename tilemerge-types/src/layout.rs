use std::cmp::Ordering;

/// Cell order of an array; defines what "global order" means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    #[default]
    RowMajor,
    ColMajor,
    Hilbert,
}

/// Direction in which the global order is traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// Map an ascending-order comparison onto visit order.
    #[inline]
    pub fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Direction::Forward => ord,
            Direction::Reverse => ord.reverse(),
        }
    }

    /// Whether tile `a` is visited before tile `b` within one fragment.
    #[inline]
    pub fn tile_precedes(self, a: u64, b: u64) -> bool {
        match self {
            Direction::Forward => a < b,
            Direction::Reverse => a > b,
        }
    }

    #[inline]
    pub fn is_reverse(self) -> bool {
        matches!(self, Direction::Reverse)
    }
}
