/// Per-cell inclusion marks of a result tile.
///
/// Tiles whose every cell is known to be visible skip the allocation
/// entirely. Excluding a cell of such a tile materializes the dense form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellBitmap {
    AlwaysLive(u64),
    Dense(Vec<u8>),
}

impl CellBitmap {
    pub fn live(cell_num: u64) -> Self {
        CellBitmap::AlwaysLive(cell_num)
    }

    /// Build from a dense vector, collapsing to `AlwaysLive` when nothing is
    /// excluded.
    pub fn from_dense(marks: Vec<u8>) -> Self {
        if marks.iter().all(|&m| m != 0) {
            CellBitmap::AlwaysLive(marks.len() as u64)
        } else {
            CellBitmap::Dense(marks)
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        match self {
            CellBitmap::AlwaysLive(n) => *n,
            CellBitmap::Dense(v) => v.len() as u64,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_always_live(&self) -> bool {
        matches!(self, CellBitmap::AlwaysLive(_))
    }

    #[inline]
    pub fn is_live(&self, cell: u64) -> bool {
        match self {
            CellBitmap::AlwaysLive(n) => cell < *n,
            CellBitmap::Dense(v) => v.get(cell as usize).is_some_and(|&m| m != 0),
        }
    }

    pub fn exclude(&mut self, cell: u64) {
        if let CellBitmap::AlwaysLive(n) = *self {
            *self = CellBitmap::Dense(vec![1; n as usize]);
        }
        if let CellBitmap::Dense(v) = self {
            if let Some(m) = v.get_mut(cell as usize) {
                *m = 0;
            }
        }
    }

    pub fn count_live(&self) -> u64 {
        match self {
            CellBitmap::AlwaysLive(n) => *n,
            CellBitmap::Dense(v) => v.iter().filter(|&&m| m != 0).count() as u64,
        }
    }

    /// In-memory footprint charged against the coordinate budget.
    pub fn memory(&self) -> u64 {
        match self {
            CellBitmap::AlwaysLive(_) => 0,
            CellBitmap::Dense(v) => v.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_materializes_dense() {
        let mut b = CellBitmap::live(4);
        assert!(b.is_live(3));
        assert!(!b.is_live(4));
        b.exclude(1);
        assert!(!b.is_always_live());
        assert!(!b.is_live(1));
        assert_eq!(b.count_live(), 3);
    }

    #[test]
    fn fully_live_dense_collapses() {
        assert!(CellBitmap::from_dense(vec![1, 1, 1]).is_always_live());
        assert_eq!(CellBitmap::from_dense(vec![1, 0]).count_live(), 1);
    }
}
