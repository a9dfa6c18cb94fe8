//! Storage-aligned chunk partitioning
//!
//! Every chunk-wise operation splits its region through [`ChunkGrid`], so chunks
//! from different phases line up with each other and with storage chunks, and
//! concurrent writers never touch the same tile.

use crate::io::error::{Result, invalid_parameter};
use crate::spatial::bbox::BoundingBox;

/// Tiling of a resolution level into processing chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGrid {
    /// Processing chunk edge `[x, y]` in pixels at `mip`
    pub chunk_size: [u32; 2],
    /// Storage chunk edge `[x, y]` in pixels at `mip`
    pub storage_chunk: [u32; 2],
    /// Origin of the storage grid `[x, y]` in pixels at `mip`
    pub grid_offset: [i64; 2],
    /// Resolution level the grid is defined at
    pub mip: u32,
}

impl ChunkGrid {
    /// Create a chunk grid, checking processing chunks stack on storage chunks
    ///
    /// # Errors
    ///
    /// Returns an invalid parameter error if a chunk edge is zero or the
    /// processing chunk is not a multiple of the storage chunk
    pub fn new(
        chunk_size: [u32; 2],
        storage_chunk: [u32; 2],
        grid_offset: [i64; 2],
        mip: u32,
    ) -> Result<Self> {
        if chunk_size.contains(&0) || storage_chunk.contains(&0) {
            return Err(invalid_parameter(
                "chunk_size",
                &format!("{chunk_size:?}"),
                &"chunk edges must be positive",
            ));
        }
        if chunk_size[0] % storage_chunk[0] != 0 || chunk_size[1] % storage_chunk[1] != 0 {
            return Err(invalid_parameter(
                "chunk_size",
                &format!("{chunk_size:?}"),
                &format!("not aligned to storage granularity {storage_chunk:?}"),
            ));
        }
        Ok(Self {
            chunk_size,
            storage_chunk,
            grid_offset,
            mip,
        })
    }

    /// Region actually tiled for `bbox`: start snapped down to the storage
    /// grid, end extended to a whole number of processing chunks
    pub fn covering_region(&self, bbox: &BoundingBox) -> BoundingBox {
        let x = self.axis_cover(bbox.x_range(self.mip), 0);
        let y = self.axis_cover(bbox.y_range(self.mip), 1);
        BoundingBox::from_mip(x.0..x.1, y.0..y.1, self.mip)
    }

    /// Split `bbox` into disjoint chunks that exactly tile its covering region
    pub fn break_into_chunks(&self, bbox: &BoundingBox) -> Vec<BoundingBox> {
        let region = self.covering_region(bbox);
        let x_range = region.x_range(self.mip);
        let y_range = region.y_range(self.mip);
        let step_x = i64::from(self.chunk_size[0]);
        let step_y = i64::from(self.chunk_size[1]);

        let mut chunks = Vec::new();
        let mut y = y_range.start;
        while y < y_range.end {
            let mut x = x_range.start;
            while x < x_range.end {
                chunks.push(BoundingBox::from_mip(
                    x..x + step_x,
                    y..y + step_y,
                    self.mip,
                ));
                x += step_x;
            }
            y += step_y;
        }
        chunks
    }

    /// Same tiling at a coarser level, as used when downsampling
    ///
    /// Chunk edges stay the same in pixels, so each coarser chunk covers
    /// twice the mip 0 extent.
    pub const fn at_mip(&self, mip: u32) -> Self {
        let shift = mip.saturating_sub(self.mip);
        Self {
            chunk_size: self.chunk_size,
            storage_chunk: self.storage_chunk,
            grid_offset: [self.grid_offset[0] >> shift, self.grid_offset[1] >> shift],
            mip,
        }
    }

    fn axis_cover(&self, range: std::ops::Range<i64>, axis: usize) -> (i64, i64) {
        let (storage, step, offset) = match axis {
            0 => (
                i64::from(self.storage_chunk[0]),
                i64::from(self.chunk_size[0]),
                self.grid_offset[0],
            ),
            _ => (
                i64::from(self.storage_chunk[1]),
                i64::from(self.chunk_size[1]),
                self.grid_offset[1],
            ),
        };
        let start = range.start - (range.start - offset).rem_euclid(storage);
        let span = (range.end - start).max(0);
        let count = (span + step - 1) / step;
        (start, start + count * step)
    }
}
