//! Tests for per-offset pairwise field volumes

#[cfg(test)]
mod tests {
    use stackalign::AlignError;
    use stackalign::field::tensor::Field;
    use stackalign::spatial::bbox::BoundingBox;
    use stackalign::store::memory::MemoryStore;
    use stackalign::store::pairwise::PairwiseFields;
    use stackalign::store::volumes::read_field;

    // Tests offset zero is dropped and offsets are sorted
    // Verified by keeping a volume for offset zero
    #[test]
    fn test_offsets_registry() {
        let fields = PairwiseFields::new("pairs", [2, -1, 0, 1], [8, 8], 0, 0);
        assert_eq!(fields.offsets(), vec![-1, 1, 2]);
        assert_eq!(fields.layers().count(), 3);
        assert_eq!(
            fields.volume(-1).map(|layer| layer.path.clone()).ok(),
            Some("pairs/-1".to_string())
        );
        match fields.volume(5) {
            Err(AlignError::MissingOffset { offset, available }) => {
                assert_eq!(offset, 5);
                assert_eq!(available, vec![-1, 1, 2]);
            }
            other => panic!("Expected a missing offset, got {other:?}"),
        }
    }

    // Tests fields are keyed by source section in the volume of their offset
    // Verified by keying fields by target section
    #[test]
    fn test_write_keys_by_source() {
        let store = MemoryStore::in_memory();
        let fields = PairwiseFields::new("pairs", [-1], [8, 8], 0, 0);
        let bbox = BoundingBox::new(0..8, 0..8);
        fields
            .write(&store, 4, 5, &bbox, &Field::uniform(8, 8, 0, [1.5, 0.0]))
            .expect("offset registered");

        let layer = fields.volume(-1).expect("offset registered");
        let stored = read_field(&store, layer, 0, &bbox, 5).expect("field layer");
        assert_eq!(stored.at(0, 0), [1.5, 0.0]);
        assert!(read_field(&store, layer, 0, &bbox, 4).expect("field layer").is_identity());
        assert!(fields.write(&store, 7, 5, &bbox, &stored).is_err());
    }

    // Tests two hops compose into the path field
    // Verified by composing the hops in path order
    #[test]
    fn test_compose_path_two_hops() {
        let store = MemoryStore::in_memory();
        let fields = PairwiseFields::new("pairs", [1, 2], [8, 8], 0, 4);
        let bbox = BoundingBox::new(0..8, 0..8);
        let padded = bbox.uncrop(4);
        let (rows, cols) = padded.shape(0);
        fields
            .write(&store, 1, 0, &padded, &Field::uniform(rows, cols, 0, [0.0, 2.0]))
            .expect("offset registered");
        fields
            .write(&store, 2, 1, &padded, &Field::uniform(rows, cols, 0, [1.0, 0.0]))
            .expect("offset registered");

        let path = fields.compose_path(&store, &[2, 1, 0], &bbox).expect("hops registered");
        assert_eq!(path.dim(), (8, 8));
        assert_eq!(path.at(4, 4), [1.0, 2.0]);

        let direct = fields.compose_path(&store, &[1, 0], &bbox).expect("hop registered");
        assert_eq!(direct.at(0, 0), [0.0, 2.0]);
    }

    // Tests malformed paths and missing hops fail up front
    // Verified by reading hops before checking their offsets
    #[test]
    fn test_compose_path_errors() {
        let store = MemoryStore::in_memory();
        let fields = PairwiseFields::new("pairs", [1], [8, 8], 0, 0);
        let bbox = BoundingBox::new(0..8, 0..8);
        assert!(fields.compose_path(&store, &[3], &bbox).is_err());
        assert!(matches!(
            fields.compose_path(&store, &[3, 2, 0], &bbox),
            Err(AlignError::MissingOffset { offset: 2, .. })
        ));
    }
}
