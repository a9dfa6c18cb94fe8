//! Separable smoothing, area pooling and block correlation over 2D planes

use ndarray::{Array2, ArrayView2, Axis};

/// Normalized 1D Gaussian kernel covering three standard deviations
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 || !sigma.is_finite() {
        return vec![1.0];
    }
    let radius = (3.0 * sigma).ceil() as i64;
    let denom = 2.0 * sigma * sigma;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|offset| {
            let d = offset as f32;
            (-(d * d) / denom).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Gaussian blur with edge replication, separable along rows then columns
pub fn gaussian_blur(plane: &ArrayView2<'_, f32>, sigma: f32) -> Array2<f32> {
    let kernel = gaussian_kernel(sigma);
    if kernel.len() == 1 {
        return plane.to_owned();
    }
    let horizontal = convolve_axis(plane, &kernel, Axis(1));
    convolve_axis(&horizontal.view(), &kernel, Axis(0))
}

fn convolve_axis(plane: &ArrayView2<'_, f32>, kernel: &[f32], axis: Axis) -> Array2<f32> {
    let (rows, cols) = plane.dim();
    let radius = (kernel.len() / 2) as i64;
    let len = (if axis == Axis(0) { rows } else { cols }) as i64;

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, weight)| {
                let shift = k as i64 - radius;
                let (row, col) = if axis == Axis(0) {
                    ((r as i64 + shift).clamp(0, len - 1) as usize, c)
                } else {
                    (r, (c as i64 + shift).clamp(0, len - 1) as usize)
                };
                plane.get([row, col]).copied().unwrap_or(0.0) * weight
            })
            .sum()
    })
}

/// Area-average pooling by an integer factor
///
/// Trailing rows and columns that do not fill a whole window are dropped.
pub fn average_pool(plane: &ArrayView2<'_, f32>, factor: usize) -> Array2<f32> {
    if factor <= 1 {
        return plane.to_owned();
    }
    let (rows, cols) = plane.dim();
    let out_rows = rows / factor;
    let out_cols = cols / factor;
    let area = (factor * factor) as f32;

    Array2::from_shape_fn((out_rows, out_cols), |(r, c)| {
        let mut total = 0.0;
        for dr in 0..factor {
            for dc in 0..factor {
                total += plane
                    .get([r * factor + dr, c * factor + dc])
                    .copied()
                    .unwrap_or(0.0);
            }
        }
        total / area
    })
}

/// Pearson correlation of every `block x block` window of two equally sized planes
///
/// Windows where either plane is constant have no defined correlation and
/// report zero.
pub fn block_correlation(
    a: &ArrayView2<'_, f32>,
    b: &ArrayView2<'_, f32>,
    block: usize,
) -> Array2<f32> {
    let block = block.max(1);
    let (rows, cols) = a.dim();
    let out_rows = rows / block;
    let out_cols = cols / block;
    let n = (block * block) as f64;

    Array2::from_shape_fn((out_rows, out_cols), |(r, c)| {
        let mut sum_a = 0.0_f64;
        let mut sum_b = 0.0_f64;
        let mut sum_aa = 0.0_f64;
        let mut sum_bb = 0.0_f64;
        let mut sum_ab = 0.0_f64;
        for dr in 0..block {
            for dc in 0..block {
                let index = [r * block + dr, c * block + dc];
                let va = f64::from(a.get(index).copied().unwrap_or(0.0));
                let vb = f64::from(b.get(index).copied().unwrap_or(0.0));
                sum_a += va;
                sum_b += vb;
                sum_aa = va.mul_add(va, sum_aa);
                sum_bb = vb.mul_add(vb, sum_bb);
                sum_ab = va.mul_add(vb, sum_ab);
            }
        }
        let cov = sum_ab - sum_a * sum_b / n;
        let var_a = sum_aa - sum_a * sum_a / n;
        let var_b = sum_bb - sum_b * sum_b / n;
        let denom = (var_a * var_b).sqrt();
        if denom > f64::EPSILON {
            (cov / denom) as f32
        } else {
            0.0
        }
    })
}
