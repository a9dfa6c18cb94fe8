//! Sections excluded from alignment
//!
//! A skipped section is never a compute-field source or target. Offsets that
//! would land on one are extended past it in the direction of the offset.

use bitvec::prelude::{BitVec, bitvec};

/// Bitmask of unusable sections over a z range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipList {
    z_start: i64,
    mask: BitVec,
}

impl SkipList {
    /// Build a skip list over `z_start..z_stop`; sections outside the range are ignored
    pub fn new(z_start: i64, z_stop: i64, skipped: impl IntoIterator<Item = i64>) -> Self {
        let len = (z_stop - z_start).max(0) as usize;
        let mut mask = bitvec![0; len];
        for z in skipped {
            if z >= z_start
                && let Some(mut bit) = mask.get_mut((z - z_start) as usize)
            {
                *bit = true;
            }
        }
        Self { z_start, mask }
    }

    /// Whether section `z` must not be used
    pub fn contains(&self, z: i64) -> bool {
        z >= self.z_start
            && self
                .mask
                .get((z - self.z_start) as usize)
                .is_some_and(|bit| *bit)
    }

    /// Number of skipped sections
    pub fn count(&self) -> usize {
        self.mask.count_ones()
    }

    /// Usable sections of `range`, in increasing order
    pub fn usable(&self, range: std::ops::Range<i64>) -> Vec<i64> {
        range.filter(|z| !self.contains(*z)).collect()
    }

    /// First usable section at or after `z`
    pub fn next_usable(&self, z: i64, limit: i64) -> Option<i64> {
        (z..limit).find(|candidate| !self.contains(*candidate))
    }

    /// Extend each offset past skipped sections
    ///
    /// Offsets are walked in order and any extension carries over to the
    /// later offsets of the same sign, so the results stay distinct and keep
    /// their order:
    /// with section 5 skipped, offsets `[-1, -2, -3]` from `z = 6` become
    /// `[-2, -3, -4]`.
    pub fn extend_offsets(&self, z: i64, offsets: &[i64]) -> Vec<i64> {
        let (mut backward, mut forward) = (0, 0);
        offsets
            .iter()
            .map(|&offset| {
                let (shift, step) = if offset < 0 {
                    (&mut backward, -1)
                } else {
                    (&mut forward, 1)
                };
                while self.contains(z + offset + *shift) {
                    *shift += step;
                }
                offset + *shift
            })
            .collect()
    }
}
