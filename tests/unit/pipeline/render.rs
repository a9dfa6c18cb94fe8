//! Tests for warping, missing-data substitution and downsampling

#[cfg(test)]
mod tests {
    use ndarray::{Array2, array};
    use stackalign::field::tensor::{Convention, Field};
    use stackalign::pipeline::render::{
        downsample, fill_missing, is_missing, missing_data_mask, render, warp_image,
    };
    use stackalign::spatial::bbox::BoundingBox;
    use stackalign::store::memory::MemoryStore;
    use stackalign::store::tensor_store::LayerHandle;
    use stackalign::store::volumes::{ImageRef, write_plane};

    fn ramp_store() -> (MemoryStore, ImageRef) {
        let store = MemoryStore::in_memory();
        let layer = LayerHandle::image("src/image", [16, 16]);
        let plane = Array2::from_shape_fn((64, 64), |(r, c)| 10.0 + c as f32 + 2.0 * r as f32);
        write_plane(&store, &layer, 0, &BoundingBox::new(0..64, 0..64), 0, &plane.view())
            .expect("plane written");
        (store, ImageRef::new(layer, 0))
    }

    // Tests a render reads the source at the displaced position
    // Verified by subtracting the displacement in warp_image
    #[test]
    fn test_render_integer_and_fractional_shift() {
        let (store, image) = ramp_store();
        let bbox = BoundingBox::new(16..32, 16..32);

        let shift = Field::uniform(16, 16, 0, [3.0, -2.0]);
        let shifted = render(&store, &image, Some(&shift), &bbox, 0, 8).expect("render succeeds");
        // Pixel (x, y) = (16 + c, 16 + r) samples (x + 3, y - 2)
        assert_eq!(shifted.get([0, 0]).copied(), Some(10.0 + 19.0 + 2.0 * 14.0));
        assert_eq!(shifted.get([5, 7]).copied(), Some(10.0 + 26.0 + 2.0 * 19.0));

        let half = Field::uniform(16, 16, 0, [0.5, 0.0]);
        let blended = render(&store, &image, Some(&half), &bbox, 0, 8).expect("render succeeds");
        let value = blended.get([2, 2]).copied().unwrap_or_default();
        assert!((value - (10.0 + 18.5 + 36.0)).abs() < 1e-4, "got {value}");
    }

    // Tests an identity field reads the chunk directly
    // Verified by warping identity fields with a zero-padded window
    #[test]
    fn test_render_identity_is_a_read() {
        let (store, image) = ramp_store();
        let bbox = BoundingBox::new(0..16, 0..16);
        let zero = Field::identity(16, 16, 0, Convention::Absolute);
        let direct = render(&store, &image, None, &bbox, 0, 8).expect("render succeeds");
        let through_zero = render(&store, &image, Some(&zero), &bbox, 0, 8).expect("render succeeds");
        assert_eq!(direct, through_zero);
        assert_eq!(direct.get([0, 0]).copied(), Some(10.0));
    }

    // Tests warping outside the source reads zeros
    // Verified by clamping to the border instead
    #[test]
    fn test_warp_image_zero_padding() {
        let image = Array2::from_elem((4, 4), 7.0_f32);
        let field = Field::uniform(4, 4, 0, [10.0, 0.0]);
        let warped = warp_image(&image.view(), &field, [0.0, 0.0], (4, 4)).expect("shapes agree");
        assert!(warped.iter().all(|v| *v == 0.0));
        assert!(warp_image(&image.view(), &field, [0.0, 0.0], (3, 4)).is_err());
    }

    // Tests zero and saturated pixels count as missing inside the imaged area only
    // Verified by ignoring the reference box
    #[test]
    fn test_missing_data_mask() {
        assert!(is_missing(0.0) && is_missing(253.0) && is_missing(255.0));
        assert!(!is_missing(1.0) && !is_missing(252.0));

        let image = array![
            [0.0, 20.0, 30.0, 255.0],
            [40.0, 0.0, 60.0, 70.0],
            [80.0, 90.0, 100.0, 110.0],
        ];
        let tile = BoundingBox::new(0..4, 0..3);
        let reference = BoundingBox::new(0..2, 0..3);
        let mask = missing_data_mask(&image.view(), &tile, &reference, 0);
        let missing: Vec<_> = mask.indexed_iter().filter(|(_, m)| **m).map(|(i, _)| i).collect();
        assert_eq!(missing, vec![(0, 0), (1, 1)]);
    }

    // Tests only missing pixels are replaced, and only by usable backup values
    // Verified by copying missing backup values too
    #[test]
    fn test_fill_missing() {
        let mut primary = array![[0.0, 5.0], [0.0, 7.0]];
        let backup = array![[50.0, 60.0], [0.0, 70.0]];
        let mask = array![[true, false], [true, false]];
        let filled = fill_missing(&mut primary, &backup.view(), &mask).expect("shapes agree");
        assert_eq!(filled, 1);
        assert_eq!(primary, array![[50.0, 5.0], [0.0, 7.0]]);

        let wrong = Array2::<f32>::zeros((3, 2));
        assert!(fill_missing(&mut primary, &wrong.view(), &mask).is_err());
    }

    // Tests downsampling averages 2x2 blocks
    // Verified by taking the top-left sample of each block
    #[test]
    fn test_downsample() {
        let plane = array![
            [1.0, 3.0, 10.0, 10.0],
            [5.0, 7.0, 20.0, 20.0],
        ];
        assert_eq!(downsample(&plane.view()), array![[4.0, 15.0]]);
    }
}
