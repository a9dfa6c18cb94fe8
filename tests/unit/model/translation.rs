//! Tests for the exhaustive translation search

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use stackalign::field::tensor::Convention;
    use stackalign::model::predictor::FieldPredictor;
    use stackalign::model::translation::TranslationSearch;

    fn texture(x: i64, y: i64) -> f32 {
        let (x, y) = (x as f32, y as f32);
        60.0f32.mul_add((0.3 * x + 0.1 * y).sin(), 128.0) + 40.0 * (0.23 * y - 0.17 * x).cos()
    }

    fn shifted_pair(dx: i64, dy: i64, size: usize) -> (Array2<f32>, Array2<f32>) {
        let target = Array2::from_shape_fn((size, size), |(r, c)| texture(c as i64, r as i64));
        let source =
            Array2::from_shape_fn((size, size), |(r, c)| texture(c as i64 - dx, r as i64 - dy));
        (source, target)
    }

    // Tests the search recovers an integer translation exactly
    // Verified by negating the shift in the cost function
    #[test]
    fn test_best_shift_recovers_translation() {
        let (source, target) = shifted_pair(3, -2, 48);
        let search = TranslationSearch::new(5);
        assert_eq!(search.best_shift(&source.view(), &target.view()), Some([3.0, -2.0]));
    }

    // Tests the predicted field is relative and uniform in grid cells
    // Verified by returning the shift in pixels as relative values
    #[test]
    fn test_predict_field_is_relative() {
        let (source, target) = shifted_pair(-4, 1, 48);
        let field = TranslationSearch::new(6)
            .predict_field(2, &source.view(), &target.view())
            .expect("shapes match");
        assert_eq!(field.convention(), Convention::Relative);
        assert_eq!(field.mip(), 2);
        let (x, y) = field.to_grid_cells();
        assert!(x.iter().all(|v| (*v + 4.0).abs() < 1e-4));
        assert!(y.iter().all(|v| (*v - 1.0).abs() < 1e-4));
    }

    // Tests tiles without valid data predict the identity
    // Verified by scoring saturated pixels as data
    #[test]
    fn test_missing_data_predicts_identity() {
        let empty = Array2::<f32>::zeros((16, 16));
        let saturated = Array2::from_elem((16, 16), 255.0_f32);
        let search = TranslationSearch::new(3);
        assert_eq!(search.best_shift(&empty.view(), &saturated.view()), None);
        let field = search
            .predict_field(0, &empty.view(), &saturated.view())
            .expect("shapes match");
        assert!(field.is_identity());
    }

    // Tests differently sized tiles are rejected
    // Verified by removing the shape check
    #[test]
    fn test_shape_mismatch() {
        let a = Array2::from_elem((8, 8), 10.0_f32);
        let b = Array2::from_elem((8, 9), 10.0_f32);
        assert!(TranslationSearch::new(1).predict_field(0, &a.view(), &b.view()).is_err());
    }
}
