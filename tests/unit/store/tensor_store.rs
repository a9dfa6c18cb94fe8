//! Tests for layer handles, chunk addressing and box reads and writes

#[cfg(test)]
mod tests {
    use ndarray::{Array3, s};
    use stackalign::AlignError;
    use stackalign::spatial::bbox::BoundingBox;
    use stackalign::store::memory::MemoryStore;
    use stackalign::store::tensor_store::{ChunkKey, DataType, LayerHandle, TensorStore};

    // Tests chunk spans use floor division for negative coordinates
    // Verified by using truncating division
    #[test]
    fn test_chunk_span_with_negative_coordinates() {
        let layer = LayerHandle::image("img", [8, 8]);
        let [xs, ys] = layer
            .chunk_span(&BoundingBox::new(-4..12, 0..8), 0)
            .expect("non-empty chunks");
        assert_eq!(xs, -1..=1);
        assert_eq!(ys, 0..=0);

        let [xs, _] = layer
            .chunk_span(&BoundingBox::new(0..32, 0..32), 1)
            .expect("non-empty chunks");
        assert_eq!(xs, 0..=1);
        assert_eq!(layer.chunk_region([-1, 2]), BoundingBox::new(-8..0, 16..24));
    }

    // Tests zero sized chunks are rejected
    // Verified by dividing by the chunk size unchecked
    #[test]
    fn test_chunk_span_zero_chunk() {
        let layer = LayerHandle::image("img", [0, 8]);
        assert!(layer.chunk_span(&BoundingBox::new(0..8, 0..8), 0).is_err());
    }

    // Tests chunk keys name their mip, section and index
    // Verified by swapping the index order
    #[test]
    fn test_chunk_key_name() {
        let key = ChunkKey {
            mip: 2,
            z: 5,
            index: [-1, 3],
        };
        assert_eq!(key.name(), "2/5/-1_3");
    }

    // Tests handles pick type and channel count by role
    // Verified by giving field layers one channel
    #[test]
    fn test_layer_handle_constructors() {
        assert_eq!(LayerHandle::image("a", [4, 4]).dtype, DataType::U8);
        let field = LayerHandle::field("b", [4, 4]);
        assert_eq!((field.dtype, field.channels), (DataType::I16, 2));
        let scalar = LayerHandle::scalar("c", [4, 4]);
        assert_eq!((scalar.dtype, scalar.channels), (DataType::F32, 1));
        assert_eq!(DataType::I16.size(), 2);
    }

    // Tests values are rounded and clamped to the stored type
    // Verified by truncating u8 values
    #[test]
    fn test_data_type_quantize() {
        assert!((DataType::U8.quantize(3.6) - 4.0).abs() < f32::EPSILON);
        assert!((DataType::U8.quantize(300.0) - 255.0).abs() < f32::EPSILON);
        assert!(DataType::U8.quantize(-2.0).abs() < f32::EPSILON);
        assert!((DataType::I16.quantize(40_000.0) - 32_767.0).abs() < f32::EPSILON);
        assert!((DataType::F32.quantize(1.25) - 1.25).abs() < f32::EPSILON);
    }

    // Tests unwritten regions read back as zeros of the right shape
    // Verified by returning an error for missing chunks
    #[test]
    fn test_unwritten_reads_zero() {
        let store = MemoryStore::in_memory();
        let layer = LayerHandle::field("f", [8, 8]);
        let data = store
            .read(&layer, 1, &BoundingBox::new(0..32, 0..16), 4)
            .expect("integral box");
        assert_eq!(data.dim(), (8, 16, 2));
        assert!(data.iter().all(|v| *v == 0.0));
    }

    // Tests partial chunk writes merge with what is already stored
    // Verified by always starting partial chunks from zeros
    #[test]
    fn test_partial_writes_merge() {
        let store = MemoryStore::in_memory();
        let layer = LayerHandle::image("img", [8, 8]);
        let left = Array3::from_elem((4, 4, 1), 10.0_f32);
        let right = Array3::from_elem((4, 4, 1), 20.0_f32);
        store
            .write(&layer, 0, &BoundingBox::new(0..4, 0..4), 0, &left.view())
            .expect("shape matches");
        store
            .write(&layer, 0, &BoundingBox::new(4..8, 0..4), 0, &right.view())
            .expect("shape matches");

        let merged = store
            .read(&layer, 0, &BoundingBox::new(0..8, 0..4), 0)
            .expect("integral box");
        assert!(merged.slice(s![.., 0..4, 0]).iter().all(|v| *v == 10.0));
        assert!(merged.slice(s![.., 4..8, 0]).iter().all(|v| *v == 20.0));
        assert_eq!(store.backend().chunk_count().ok(), Some(1));
    }

    // Tests reads and writes spanning several chunks reassemble the box
    // Verified by offsetting the chunk origin by one chunk
    #[test]
    fn test_box_spanning_chunks() {
        let store = MemoryStore::in_memory();
        let layer = LayerHandle::scalar("s", [4, 4]);
        let data = Array3::from_shape_fn((6, 10, 1), |(r, c, _)| (r * 10 + c) as f32);
        let bbox = BoundingBox::new(-3..7, 2..8);
        store.write(&layer, 0, &bbox, 1, &data.view()).expect("shape matches");

        let back = store.read(&layer, 0, &bbox, 1).expect("integral box");
        assert_eq!(back, data);
        let inner = store
            .read(&layer, 0, &BoundingBox::new(0..2, 4..5), 1)
            .expect("integral box");
        assert_eq!(inner.get([0, 0, 0]).copied(), Some(23.0));
        assert!(store.read(&layer, 0, &bbox, 2).expect("integral box").iter().all(|v| *v == 0.0));
    }

    // Tests shape and alignment errors on writes and reads
    // Verified by skipping the shape check on write
    #[test]
    fn test_shape_and_integrality_errors() {
        let store = MemoryStore::in_memory();
        let layer = LayerHandle::image("img", [8, 8]);
        let wrong = Array3::<f32>::zeros((3, 4, 1));
        let result = store.write(&layer, 0, &BoundingBox::new(0..4, 0..4), 0, &wrong.view());
        assert!(matches!(result, Err(AlignError::ShapeMismatch { .. })));
        assert!(store.read(&layer, 1, &BoundingBox::new(1..5, 0..4), 0).is_err());
    }

    // Tests layer metadata is recorded by path
    // Verified by looking layers up by type instead of path
    #[test]
    fn test_create_and_lookup_layer() {
        let store = MemoryStore::in_memory();
        let layer = LayerHandle::field("dst/field", [16, 16]);
        assert_eq!(store.layer_info("dst/field").ok().flatten(), None);
        store.create_layer(&layer).expect("memory store");
        assert_eq!(store.layer_info("dst/field").ok().flatten(), Some(layer));
    }
}
