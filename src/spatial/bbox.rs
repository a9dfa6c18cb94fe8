//! Mip-aware bounding boxes
//!
//! Boxes are defined once at mip 0 and queried at any coarser level by
//! bit-shifting, so a box stays an immutable value type that every task can
//! carry and serialize without losing integer precision.

use crate::io::error::{Result, invalid_parameter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Axis-aligned rectangle in mip 0 pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Minimum `[x, y]` coordinates (inclusive)
    pub min: [i64; 2],
    /// Maximum `[x, y]` coordinates (exclusive)
    pub max: [i64; 2],
}

impl BoundingBox {
    /// Create a box from mip 0 ranges
    pub const fn new(x_range: Range<i64>, y_range: Range<i64>) -> Self {
        Self {
            min: [x_range.start, y_range.start],
            max: [x_range.end, y_range.end],
        }
    }

    /// Create a box from ranges expressed at `mip`
    pub const fn from_mip(x_range: Range<i64>, y_range: Range<i64>, mip: u32) -> Self {
        Self {
            min: [x_range.start << mip, y_range.start << mip],
            max: [x_range.end << mip, y_range.end << mip],
        }
    }

    /// The box in grid cells at `mip`, reinterpreted as a mip 0 box
    ///
    /// Used to intersect with regions defined on a storage grid.
    pub const fn at_grid(&self, mip: u32) -> Self {
        Self::new(self.x_range(mip), self.y_range(mip))
    }

    /// Horizontal extent at `mip`
    pub const fn x_range(&self, mip: u32) -> Range<i64> {
        (self.min[0] >> mip)..(self.max[0] >> mip)
    }

    /// Vertical extent at `mip`
    pub const fn y_range(&self, mip: u32) -> Range<i64> {
        (self.min[1] >> mip)..(self.max[1] >> mip)
    }

    /// Width in pixels at `mip`
    pub const fn x_size(&self, mip: u32) -> usize {
        let range = self.x_range(mip);
        if range.end > range.start {
            (range.end - range.start) as usize
        } else {
            0
        }
    }

    /// Height in pixels at `mip`
    pub const fn y_size(&self, mip: u32) -> usize {
        let range = self.y_range(mip);
        if range.end > range.start {
            (range.end - range.start) as usize
        } else {
            0
        }
    }

    /// Array shape `(rows, cols)` of the box at `mip`
    pub const fn shape(&self, mip: u32) -> (usize, usize) {
        (self.y_size(mip), self.x_size(mip))
    }

    /// True when the box covers no pixels at mip 0
    pub const fn is_empty(&self) -> bool {
        self.max[0] <= self.min[0] || self.max[1] <= self.min[1]
    }

    /// Check that every corner is a whole pixel at `mip`
    ///
    /// # Errors
    ///
    /// Returns an invalid parameter error if a coordinate is not divisible by `2^mip`
    pub fn check_integral(&self, mip: u32) -> Result<()> {
        let scale = 1_i64 << mip;
        let corners = [self.min[0], self.min[1], self.max[0], self.max[1]];
        if corners.iter().all(|c| c.rem_euclid(scale) == 0) {
            Ok(())
        } else {
            Err(invalid_parameter(
                "bbox",
                self,
                &format!("corners must be multiples of 2^{mip} = {scale}"),
            ))
        }
    }

    /// Grow the box by `pad` mip 0 pixels on every side
    pub const fn uncrop(&self, pad: i64) -> Self {
        Self {
            min: [self.min[0] - pad, self.min[1] - pad],
            max: [self.max[0] + pad, self.max[1] + pad],
        }
    }

    /// Shrink the box by `pad` mip 0 pixels on every side
    pub const fn crop(&self, pad: i64) -> Self {
        self.uncrop(-pad)
    }

    /// Move the box by `[dx, dy]` mip 0 pixels
    pub const fn translate(&self, shift: [i64; 2]) -> Self {
        Self {
            min: [self.min[0] + shift[0], self.min[1] + shift[1]],
            max: [self.max[0] + shift[0], self.max[1] + shift[1]],
        }
    }

    /// Overlapping region of two boxes
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let candidate = Self {
            min: [self.min[0].max(other.min[0]), self.min[1].max(other.min[1])],
            max: [self.max[0].min(other.max[0]), self.max[1].min(other.max[1])],
        };
        (!candidate.is_empty()).then_some(candidate)
    }

    /// Whether `other` lies entirely inside this box
    pub const fn contains(&self, other: &Self) -> bool {
        other.min[0] >= self.min[0]
            && other.min[1] >= self.min[1]
            && other.max[0] <= self.max[0]
            && other.max[1] <= self.max[1]
    }

    /// Stable key for a chunk of section `z`, used in marker paths
    pub fn stringify(&self, z: i64) -> String {
        format!(
            "{}_{}_{}_{}_{z}",
            self.min[0], self.max[0], self.min[1], self.max[1]
        )
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[x {}..{}, y {}..{}]",
            self.min[0], self.max[0], self.min[1], self.max[1]
        )
    }
}
