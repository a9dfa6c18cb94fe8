//! Tests for the in-memory tensor and marker stores

#[cfg(test)]
mod tests {
    use ndarray::Array3;
    use stackalign::spatial::bbox::BoundingBox;
    use stackalign::store::markers::MarkerStore;
    use stackalign::store::memory::{MemoryMarkers, MemoryStore};
    use stackalign::store::tensor_store::{LayerHandle, TensorStore};
    use std::sync::Arc;

    // Tests each touched chunk is stored once per section
    // Verified by keying chunks without the section index
    #[test]
    fn test_chunk_count() {
        let store = MemoryStore::in_memory();
        let layer = LayerHandle::image("img", [8, 8]);
        let data = Array3::from_elem((16, 16, 1), 1.0_f32);
        let bbox = BoundingBox::new(0..16, 0..16);
        store.write(&layer, 0, &bbox, 0, &data.view()).expect("shape matches");
        store.write(&layer, 0, &bbox, 1, &data.view()).expect("shape matches");
        assert_eq!(store.backend().chunk_count().ok(), Some(8));
    }

    // Tests layers with a shared name prefix are kept apart
    // Verified by keying chunks by prefix match
    #[test]
    fn test_layers_are_isolated() {
        let store = Arc::new(MemoryStore::in_memory());
        let a = LayerHandle::image("a", [4, 4]);
        let ab = LayerHandle::image("ab", [4, 4]);
        let bbox = BoundingBox::new(0..4, 0..4);
        store
            .write(&a, 0, &bbox, 0, &Array3::from_elem((4, 4, 1), 5.0).view())
            .expect("shape matches");
        let other = store.read(&ab, 0, &bbox, 0).expect("integral box");
        assert!(other.iter().all(|v| *v == 0.0));
    }

    // Tests markers are counted per directory, not per string prefix
    // Verified by counting keys that merely start with the prefix
    #[test]
    fn test_marker_prefix_separation() {
        let markers = MemoryMarkers::default();
        markers.put_marker("a/b/1").expect("memory markers");
        markers.put_marker("a/b/2").expect("memory markers");
        markers.put_marker("a/bc/1").expect("memory markers");
        assert_eq!(markers.count_markers("a/b").ok(), Some(2));
        assert_eq!(markers.count_markers("a/b/").ok(), Some(2));
        assert_eq!(markers.count_markers("a/bc").ok(), Some(1));
        assert_eq!(markers.count_markers("a").ok(), Some(3));
        assert!(markers.has_marker("a/bc/1").unwrap_or(false));
        assert!(!markers.has_marker("a/bc").unwrap_or(true));
    }
}
