//! Coordinate tile memory accounting.

use tilemerge_result::{Error, Result};
use tilemerge_types::FragmentIdx;

/// Point-in-time view of the reader's memory accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetUsage {
    pub coords_used: u64,
    pub coords_limit: u64,
    pub coords_peak: u64,
    pub attributes_used: u64,
    pub attributes_limit: u64,
}

/// Tracks bytes held by loaded result tiles, per fragment and in total.
///
/// With a per-fragment split the coordinate budget is divided evenly across
/// the fragments that have tiles to read; otherwise a single global counter
/// gates admission.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    coords_limit: u64,
    split: Option<u64>,
    per_fragment: Vec<u64>,
    total: u64,
    peak: u64,
    attributes_limit: u64,
    attributes: u64,
}

impl BudgetTracker {
    /// `split_across` is the number of fragments sharing the budget evenly,
    /// or `None` for a single global counter.
    pub fn new(
        coords_limit: u64,
        attributes_limit: u64,
        fragment_count: usize,
        split_across: Option<usize>,
    ) -> Self {
        Self {
            coords_limit,
            split: split_across.map(|n| n.max(1) as u64),
            per_fragment: vec![0; fragment_count],
            total: 0,
            peak: 0,
            attributes_limit,
            attributes: 0,
        }
    }

    /// Replace the limits. Usage above the new limits is kept; it only blocks
    /// further admission until released.
    pub fn set_limits(&mut self, coords_limit: u64, attributes_limit: u64) {
        self.coords_limit = coords_limit;
        self.attributes_limit = attributes_limit;
    }

    /// Budget of one fragment, or the global limit without a split.
    pub fn fragment_limit(&self) -> u64 {
        match self.split {
            Some(n) => self.coords_limit / n,
            None => self.coords_limit,
        }
    }

    pub fn can_load(&self, fragment: FragmentIdx, bytes: u64) -> bool {
        if self.total.saturating_add(bytes) > self.coords_limit {
            return false;
        }
        match self.split {
            Some(_) => self.per_fragment[fragment].saturating_add(bytes) <= self.fragment_limit(),
            None => true,
        }
    }

    pub fn account(&mut self, fragment: FragmentIdx, bytes: u64) {
        self.per_fragment[fragment] += bytes;
        self.total += bytes;
        self.peak = self.peak.max(self.total);
    }

    pub fn release(&mut self, fragment: FragmentIdx, bytes: u64) -> Result<()> {
        let held = self.per_fragment[fragment];
        if held < bytes || self.total < bytes {
            return Err(Error::Internal(format!(
                "coordinate budget underflow: releasing {bytes} bytes from fragment {fragment} holding {held}"
            )));
        }
        self.per_fragment[fragment] -= bytes;
        self.total -= bytes;
        Ok(())
    }

    pub fn attributes_limit(&self) -> u64 {
        self.attributes_limit
    }

    pub fn account_attributes(&mut self, bytes: u64) {
        self.attributes += bytes;
    }

    pub fn release_attributes(&mut self, bytes: u64) -> Result<()> {
        if self.attributes < bytes {
            return Err(Error::Internal(format!(
                "attribute budget underflow: releasing {bytes} of {} bytes",
                self.attributes
            )));
        }
        self.attributes -= bytes;
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            coords_used: self.total,
            coords_limit: self.coords_limit,
            coords_peak: self.peak,
            attributes_used: self.attributes,
            attributes_limit: self.attributes_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_fragment_split_gates_each_fragment() {
        let mut b = BudgetTracker::new(100, 0, 2, Some(2));
        assert_eq!(b.fragment_limit(), 50);
        assert!(b.can_load(0, 50));
        assert!(!b.can_load(0, 51));
        b.account(0, 40);
        assert!(!b.can_load(0, 20));
        assert!(b.can_load(1, 50));
        b.release(0, 40).unwrap();
        assert_eq!(b.total(), 0);
        assert_eq!(b.usage().coords_peak, 40);
    }

    #[test]
    fn release_below_zero_is_internal() {
        let mut b = BudgetTracker::new(100, 10, 1, None);
        b.account(0, 5);
        assert!(matches!(b.release(0, 6), Err(Error::Internal(_))));
        assert!(matches!(b.release_attributes(1), Err(Error::Internal(_))));
    }

    #[test]
    fn shrinking_limits_blocks_admission() {
        let mut b = BudgetTracker::new(100, 10, 1, None);
        b.account(0, 80);
        b.set_limits(50, 10);
        assert!(!b.can_load(0, 1));
        b.release(0, 60).unwrap();
        assert!(b.can_load(0, 30));
    }
}
