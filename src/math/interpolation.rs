//! Bilinear sampling of 2D planes
//!
//! Coordinates are in pixel units with pixel `i` centred on `i`, so the outer
//! edges of a plane of `n` pixels sit at `-0.5` and `n - 0.5`. This is the
//! edge-aligned convention: relative coordinates `-1` and `+1` map to those
//! edges rather than to the first and last pixel centres.

use ndarray::{Array2, ArrayView2};
use num_traits::Float;

/// How samples outside the plane are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Out-of-bounds neighbours contribute zero (images)
    Zeros,
    /// Coordinates are clamped to the plane (displacement fields)
    Border,
}

/// One neighbour of a bilinear sample with its weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tap<T> {
    /// Row index of the neighbour
    pub row: usize,
    /// Column index of the neighbour
    pub col: usize,
    /// Interpolation weight
    pub weight: T,
}

/// Neighbours and weights of a bilinear sample at `(x, y)`
///
/// Neighbours outside the plane are `None`, which is exactly zero padding.
/// With border padding the coordinate is clamped first, so every present
/// neighbour is in bounds and the weights sum to one.
pub fn taps<T: Float>(
    x: T,
    y: T,
    rows: usize,
    cols: usize,
    padding: Padding,
) -> [Option<Tap<T>>; 4] {
    if rows == 0 || cols == 0 || !x.is_finite() || !y.is_finite() {
        return [None; 4];
    }
    let (x, y) = match padding {
        Padding::Zeros => (x, y),
        Padding::Border => (clamp_to(x, cols), clamp_to(y, rows)),
    };

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let one = T::one();

    let (Some(x0), Some(y0)) = (x0.to_i64(), y0.to_i64()) else {
        return [None; 4];
    };

    let corners = [
        (y0, x0, (one - fy) * (one - fx)),
        (y0, x0 + 1, (one - fy) * fx),
        (y0 + 1, x0, fy * (one - fx)),
        (y0 + 1, x0 + 1, fy * fx),
    ];

    corners.map(|(row, col, weight)| {
        if weight == T::zero() {
            return None;
        }
        let row = usize::try_from(row).ok().filter(|r| *r < rows)?;
        let col = usize::try_from(col).ok().filter(|c| *c < cols)?;
        Some(Tap { row, col, weight })
    })
}

/// Bilinear sample of `plane` at `(x, y)`
///
/// Sampling exactly on a pixel centre returns that pixel bit for bit.
pub fn bilinear<T: Float>(plane: &ArrayView2<'_, T>, x: T, y: T, padding: Padding) -> T {
    let (rows, cols) = plane.dim();
    taps(x, y, rows, cols, padding)
        .iter()
        .flatten()
        .fold(T::zero(), |acc, tap| {
            let value = plane
                .get([tap.row, tap.col])
                .copied()
                .unwrap_or_else(T::zero);
            acc + value * tap.weight
        })
}

/// Bilinear sample with its spatial derivatives `(value, d/dx, d/dy)`
///
/// Uses border padding; along an axis where the coordinate was clamped the
/// derivative is zero.
pub fn bilinear_with_gradient<T: Float>(plane: &ArrayView2<'_, T>, x: T, y: T) -> (T, T, T) {
    let (rows, cols) = plane.dim();
    if rows == 0 || cols == 0 || !x.is_finite() || !y.is_finite() {
        return (T::zero(), T::zero(), T::zero());
    }
    let cx = clamp_to(x, cols);
    let cy = clamp_to(y, rows);
    let x_free = cx == x;
    let y_free = cy == y;

    let x0 = cx.floor();
    let y0 = cy.floor();
    let fx = cx - x0;
    let fy = cy - y0;
    let one = T::one();

    let at = |r: T, c: T| -> T {
        let row = r.to_usize().unwrap_or(0).min(rows - 1);
        let col = c.to_usize().unwrap_or(0).min(cols - 1);
        plane.get([row, col]).copied().unwrap_or_else(T::zero)
    };
    let v00 = at(y0, x0);
    let v01 = at(y0, x0 + one);
    let v10 = at(y0 + one, x0);
    let v11 = at(y0 + one, x0 + one);

    let top = v00 + (v01 - v00) * fx;
    let bottom = v10 + (v11 - v10) * fx;
    let value = top + (bottom - top) * fy;

    let dx = if x_free {
        (v01 - v00) * (one - fy) + (v11 - v10) * fy
    } else {
        T::zero()
    };
    let dy = if y_free { bottom - top } else { T::zero() };
    (value, dx, dy)
}

/// Resize a plane with edge-aligned bilinear interpolation
pub fn resize_bilinear<T: Float>(
    plane: &ArrayView2<'_, T>,
    rows: usize,
    cols: usize,
) -> Array2<T> {
    let (src_rows, src_cols) = plane.dim();
    if src_rows == 0 || src_cols == 0 {
        return Array2::from_elem((rows, cols), T::zero());
    }
    let half = T::from(0.5).unwrap_or_else(T::zero);
    let scale_y = T::from(src_rows as f64 / rows.max(1) as f64).unwrap_or_else(T::one);
    let scale_x = T::from(src_cols as f64 / cols.max(1) as f64).unwrap_or_else(T::one);

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let y = (T::from(r).unwrap_or_else(T::zero) + half) * scale_y - half;
        let x = (T::from(c).unwrap_or_else(T::zero) + half) * scale_x - half;
        bilinear(plane, x, y, Padding::Border)
    })
}

fn clamp_to<T: Float>(value: T, len: usize) -> T {
    let upper = T::from(len.saturating_sub(1)).unwrap_or_else(T::zero);
    value.max(T::zero()).min(upper)
}
