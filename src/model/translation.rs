//! Exhaustive translation search
//!
//! Built-in stand-in for a learned predictor: every integer shift within the
//! search radius is scored by the mean squared difference over pixels where
//! both images hold data, and the best shift is refined to sub-pixel
//! precision with a parabola through its neighbours. The result is a uniform
//! field.

use crate::field::tensor::{Convention, Field};
use crate::io::configuration::MISSING_DATA_HIGH;
use crate::io::error::{Result, ensure_shape};
use crate::model::predictor::FieldPredictor;
use ndarray::{Array2, ArrayView2};
use tracing::trace;

/// Fraction of the tile that must overlap with valid data for a shift to count
const MIN_OVERLAP_FRACTION: f32 = 0.25;

/// Brute-force search over integer shifts in grid cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationSearch {
    /// Largest shift tried along each axis, in grid cells
    pub radius: usize,
}

impl TranslationSearch {
    /// Search shifts up to `radius` cells
    pub const fn new(radius: usize) -> Self {
        Self { radius }
    }

    /// Best shift `[dx, dy]` in grid cells such that `source(x + d) ≈ target(x)`
    ///
    /// Returns `None` if no shift overlaps enough valid pixels.
    pub fn best_shift(&self, source: &ArrayView2<'_, f32>, target: &ArrayView2<'_, f32>) -> Option<[f32; 2]> {
        let radius = self.radius as i64;
        let side = 2 * self.radius + 1;
        let mut costs = Array2::from_elem((side, side), f32::INFINITY);
        let mut best: Option<(f32, usize, usize)> = None;

        for (iy, dy) in (-radius..=radius).enumerate() {
            for (ix, dx) in (-radius..=radius).enumerate() {
                let Some(cost) = shift_cost(source, target, dx, dy) else {
                    continue;
                };
                if let Some(slot) = costs.get_mut([iy, ix]) {
                    *slot = cost;
                }
                if best.is_none_or(|(lowest, _, _)| cost < lowest) {
                    best = Some((cost, iy, ix));
                }
            }
        }

        let (lowest, iy, ix) = best?;
        let [fx, fy] = if lowest <= f32::EPSILON {
            [0.0, 0.0]
        } else {
            let at = |r: Option<usize>, c: Option<usize>| {
                r.zip(c).and_then(|(r, c)| costs.get([r, c]).copied())
            };
            [
                parabolic_offset(at(Some(iy), ix.checked_sub(1)), lowest, at(Some(iy), Some(ix + 1))),
                parabolic_offset(at(iy.checked_sub(1), Some(ix)), lowest, at(Some(iy + 1), Some(ix))),
            ]
        };
        Some([
            ix as f32 - self.radius as f32 + fx,
            iy as f32 - self.radius as f32 + fy,
        ])
    }
}

const fn is_valid(value: f32) -> bool {
    value > 0.0 && value < MISSING_DATA_HIGH
}

fn shift_cost(source: &ArrayView2<'_, f32>, target: &ArrayView2<'_, f32>, dx: i64, dy: i64) -> Option<f32> {
    let (rows, cols) = target.dim();
    let mut total = 0.0_f64;
    let mut count = 0_usize;
    for ((r, c), t) in target.indexed_iter() {
        if !is_valid(*t) {
            continue;
        }
        let sr = r as i64 + dy;
        let sc = c as i64 + dx;
        if sr < 0 || sc < 0 {
            continue;
        }
        let Some(s) = source.get([sr as usize, sc as usize]) else {
            continue;
        };
        if is_valid(*s) {
            let diff = f64::from(s - t);
            total += diff * diff;
            count += 1;
        }
    }
    let required = ((rows * cols) as f32 * MIN_OVERLAP_FRACTION) as usize;
    (count > 0 && count >= required).then(|| (total / count as f64) as f32)
}

/// Vertex of the parabola through three equally spaced costs, relative to the middle
fn parabolic_offset(before: Option<f32>, middle: f32, after: Option<f32>) -> f32 {
    match (before, after) {
        (Some(b), Some(a)) if b.is_finite() && a.is_finite() => {
            let curvature = 2.0f32.mul_add(-middle, b + a);
            if curvature > f32::EPSILON {
                (0.5 * (b - a) / curvature).clamp(-0.5, 0.5)
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

impl FieldPredictor for TranslationSearch {
    fn predict_field(
        &self,
        mip: u32,
        source: &ArrayView2<'_, f32>,
        target: &ArrayView2<'_, f32>,
    ) -> Result<Field> {
        ensure_shape(
            "TranslationSearch",
            &[target.nrows(), target.ncols()],
            &[source.nrows(), source.ncols()],
        )?;
        let (rows, cols) = target.dim();
        let Some([dx, dy]) = self.best_shift(source, target) else {
            trace!(rows, cols, "no valid overlap, predicting identity");
            return Ok(Field::identity(rows, cols, mip, Convention::Relative));
        };
        trace!(dx, dy, "translation search result");
        let x = Array2::from_elem((rows, cols), dx);
        let y = Array2::from_elem((rows, cols), dy);
        Field::from_grid_cells(&x.view(), &y.view(), mip, Convention::Relative)
    }
}
