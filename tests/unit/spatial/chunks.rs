//! Tests for storage-aligned chunk partitioning

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use stackalign::spatial::bbox::BoundingBox;
    use stackalign::spatial::chunks::ChunkGrid;

    // Tests chunk sizes must be positive multiples of the storage chunk
    // Verified by accepting misaligned chunk sizes
    #[test]
    fn test_new_validates_sizes() {
        assert!(ChunkGrid::new([64, 64], [32, 32], [0, 0], 0).is_ok());
        assert!(ChunkGrid::new([48, 64], [32, 32], [0, 0], 0).is_err());
        assert!(ChunkGrid::new([0, 64], [32, 32], [0, 0], 0).is_err());
        assert!(ChunkGrid::new([64, 64], [0, 32], [0, 0], 0).is_err());
    }

    // Tests the covering region starts on the storage grid and spans whole chunks
    // Verified by starting the region at the box corner
    #[test]
    fn test_covering_region() {
        let grid = ChunkGrid::new([64, 64], [32, 32], [0, 0], 0).expect("aligned sizes");
        let bbox = BoundingBox::new(40..100, 0..64);
        assert_eq!(grid.covering_region(&bbox), BoundingBox::new(32..160, 0..64));

        let coarse = grid.at_mip(1);
        assert_eq!(coarse.mip, 1);
        assert_eq!(coarse.covering_region(&BoundingBox::new(0..128, 0..128)), BoundingBox::new(0..128, 0..128));
    }

    // Tests chunks are reported row by row at mip 0 coordinates
    // Verified by emitting chunks in grid cell coordinates
    #[test]
    fn test_break_into_chunks_at_mip() {
        let grid = ChunkGrid::new([16, 16], [16, 16], [0, 0], 2).expect("aligned sizes");
        let chunks = grid.break_into_chunks(&BoundingBox::new(0..128, 0..64));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.first(), Some(&BoundingBox::new(0..64, 0..64)));
        assert_eq!(chunks.last(), Some(&BoundingBox::new(64..128, 0..64)));
    }

    // Tests the grid offset shifts chunk boundaries
    // Verified by ignoring the offset
    #[test]
    fn test_grid_offset() {
        let grid = ChunkGrid::new([32, 32], [16, 16], [8, 0], 0).expect("aligned sizes");
        let region = grid.covering_region(&BoundingBox::new(10..20, 0..16));
        assert_eq!(region.min, [8, 0]);
    }

    proptest! {
        // Tests chunks tile the covering region without overlap and on storage boundaries
        // Verified by stepping chunks by the storage size
        #[test]
        fn test_chunks_partition_region(
            x0 in -200_i64..200,
            y0 in -200_i64..200,
            width in 1_i64..300,
            height in 1_i64..300,
            chunk_factor in 1_u32..4
        ) {
            let grid = ChunkGrid::new([16 * chunk_factor, 16 * chunk_factor], [16, 16], [0, 0], 0)
                .expect("aligned sizes");
            let bbox = BoundingBox::new(x0..x0 + width, y0..y0 + height);
            let region = grid.covering_region(&bbox);
            let chunks = grid.break_into_chunks(&bbox);

            prop_assert!(region.contains(&bbox));
            let area: usize = chunks.iter().map(|c| c.x_size(0) * c.y_size(0)).sum();
            prop_assert_eq!(area, region.x_size(0) * region.y_size(0));
            for (i, a) in chunks.iter().enumerate() {
                prop_assert!(region.contains(a));
                prop_assert_eq!(a.min[0].rem_euclid(16), 0);
                prop_assert_eq!(a.min[1].rem_euclid(16), 0);
                for b in chunks.iter().skip(i + 1) {
                    prop_assert!(a.intersect(b).is_none());
                }
            }
        }
    }
}
