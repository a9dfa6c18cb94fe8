//! Field inversion
//!
//! The optimizer searches for `g` with `compose(f, g) ≈ 0` and
//! `compose(g, f) ≈ 0` by gradient descent on
//! `0.5 * mean|f∘g|² + 0.5 * mean|g∘f|²`, starting from `-f`. The gradient is
//! derived by hand from the bilinear sampling weights, so the loop runs on
//! plain arrays in grid-cell units.

use crate::field::tensor::Field;
use crate::io::configuration::{
    INVERT_CURRENT_WINDOW, INVERT_EPSILON, INVERT_HISTORY_WINDOW, INVERT_LEARNING_RATE,
    INVERT_MAX_ITERATIONS,
};
use crate::io::error::{Result, computation_error};
use crate::math::interpolation::{Padding, Tap, bilinear_with_gradient, taps};
use ndarray::Array2;
use tracing::debug;

/// Strategy for inverting a displacement field
///
/// Implemented by the built-in optimizer and by learned inversion models.
pub trait FieldInverter: Send + Sync {
    /// Produce `g` with `compose(f, g)` and `compose(g, f)` close to zero
    ///
    /// # Errors
    ///
    /// Returns an error if inversion fails or degenerates numerically
    fn invert(&self, field: &Field) -> Result<Field>;
}

/// Optimizer settings for [`invert_field`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InversionConfig {
    /// Gradient descent step size
    pub learning_rate: f32,
    /// Hard cap on optimizer steps
    pub max_iterations: usize,
    /// Trailing costs averaged as the early stopping reference
    pub history_window: usize,
    /// Most recent costs averaged as the current value
    pub current_window: usize,
    /// Relative improvement below which the optimizer stops
    pub epsilon: f32,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            learning_rate: INVERT_LEARNING_RATE,
            max_iterations: INVERT_MAX_ITERATIONS,
            history_window: INVERT_HISTORY_WINDOW,
            current_window: INVERT_CURRENT_WINDOW,
            epsilon: INVERT_EPSILON,
        }
    }
}

/// Result of an optimizer run
#[derive(Debug, Clone)]
pub struct Inversion {
    /// The inverse field, in the input's convention
    pub field: Field,
    /// Cost of the starting guess `-f`
    pub initial_cost: f32,
    /// Cost of the returned field
    pub final_cost: f32,
    /// Optimizer steps taken
    pub iterations: usize,
}

/// Gradient descent inverter
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientInverter {
    /// Optimizer settings
    pub config: InversionConfig,
}

impl FieldInverter for GradientInverter {
    fn invert(&self, field: &Field) -> Result<Field> {
        invert_field(field, &self.config).map(|inversion| inversion.field)
    }
}

/// Invert `field` by gradient descent
///
/// Stops when the cost reaches exactly zero, when the mean of the last
/// `current_window` costs improves on the mean of the `history_window` costs
/// before them by less than `epsilon` relative, or after `max_iterations`.
///
/// # Errors
///
/// Returns a computation error if the cost ever becomes NaN
pub fn invert_field(field: &Field, config: &InversionConfig) -> Result<Inversion> {
    if field.is_identity() {
        return Ok(Inversion {
            field: field.clone(),
            initial_cost: 0.0,
            final_cost: 0.0,
            iterations: 0,
        });
    }
    if field.has_non_finite() {
        return Err(computation_error(
            "invert_field",
            &"input field contains non-finite values",
        ));
    }

    let (ux, uy) = field.to_grid_cells();
    let (rows, cols) = field.dim();
    let mut vx = ux.mapv(|v| -v);
    let mut vy = uy.mapv(|v| -v);

    // f∘g samples g at x + f(x), which does not move while g changes
    let forward_taps: Vec<[Option<Tap<f32>>; 4]> = ux
        .indexed_iter()
        .map(|((r, c), dx)| {
            let dy = uy.get([r, c]).copied().unwrap_or(0.0);
            taps(c as f32 + dx, r as f32 + dy, rows, cols, Padding::Border)
        })
        .collect();

    let mut costs: Vec<f32> = Vec::with_capacity(config.max_iterations);
    let mut initial_cost = None;
    let mut iterations = 0;

    loop {
        let step = Step::evaluate(&ux, &uy, &vx, &vy, &forward_taps);
        if step.cost.is_nan() {
            return Err(computation_error(
                "invert_field",
                &format!("cost became NaN after {iterations} iterations"),
            ));
        }
        initial_cost.get_or_insert(step.cost);
        costs.push(step.cost);

        if step.cost == 0.0 || iterations >= config.max_iterations || converged(&costs, config) {
            debug!(iterations, cost = step.cost, "field inversion finished");
            let inverse =
                Field::from_grid_cells(&vx.view(), &vy.view(), field.mip(), field.convention())?;
            return Ok(Inversion {
                field: inverse,
                initial_cost: initial_cost.unwrap_or(step.cost),
                final_cost: step.cost,
                iterations,
            });
        }

        // Per-pixel gradient of the mean cost
        let rate = config.learning_rate * 0.5;
        vx.zip_mut_with(&step.grad_x, |v, g| *v -= rate * g);
        vy.zip_mut_with(&step.grad_y, |v, g| *v -= rate * g);
        iterations += 1;
    }
}

fn converged(costs: &[f32], config: &InversionConfig) -> bool {
    let window = config.history_window + config.current_window;
    if config.current_window == 0 || costs.len() <= window {
        return false;
    }
    let Some(recent) = costs.get(costs.len() - window..) else {
        return false;
    };
    let (history, current) = recent.split_at(config.history_window);
    let mean = |values: &[f32]| values.iter().sum::<f32>() / values.len().max(1) as f32;
    let hist = mean(history);
    let curr = mean(current);
    hist > 0.0 && ((hist - curr) / hist).abs() < config.epsilon
}

struct Step {
    cost: f32,
    grad_x: Array2<f32>,
    grad_y: Array2<f32>,
}

impl Step {
    fn evaluate(
        ux: &Array2<f32>,
        uy: &Array2<f32>,
        vx: &Array2<f32>,
        vy: &Array2<f32>,
        forward_taps: &[[Option<Tap<f32>>; 4]],
    ) -> Self {
        let dim = ux.dim();
        let mut grad_x = Array2::<f32>::zeros(dim);
        let mut grad_y = Array2::<f32>::zeros(dim);
        let mut total = 0.0_f64;
        let ux_view = ux.view();
        let uy_view = uy.view();

        for (((r, c), u_x), pixel_taps) in ux.indexed_iter().zip(forward_taps) {
            let u_y = uy.get([r, c]).copied().unwrap_or(0.0);
            let v_x = vx.get([r, c]).copied().unwrap_or(0.0);
            let v_y = vy.get([r, c]).copied().unwrap_or(0.0);

            // f∘g(x) = f(x) + g(x + f(x))
            let mut a_x = *u_x;
            let mut a_y = u_y;
            for tap in pixel_taps.iter().flatten() {
                a_x += vx.get([tap.row, tap.col]).copied().unwrap_or(0.0) * tap.weight;
                a_y += vy.get([tap.row, tap.col]).copied().unwrap_or(0.0) * tap.weight;
            }
            for tap in pixel_taps.iter().flatten() {
                if let Some(g) = grad_x.get_mut([tap.row, tap.col]) {
                    *g += a_x * tap.weight;
                }
                if let Some(g) = grad_y.get_mut([tap.row, tap.col]) {
                    *g += a_y * tap.weight;
                }
            }

            // g∘f(x) = g(x) + f(x + g(x)), which moves with g
            let px = c as f32 + v_x;
            let py = r as f32 + v_y;
            let (fx, dfx_dx, dfx_dy) = bilinear_with_gradient(&ux_view, px, py);
            let (fy, dfy_dx, dfy_dy) = bilinear_with_gradient(&uy_view, px, py);
            let b_x = v_x + fx;
            let b_y = v_y + fy;
            if let Some(g) = grad_x.get_mut([r, c]) {
                *g += b_x + b_x * dfx_dx + b_y * dfy_dx;
            }
            if let Some(g) = grad_y.get_mut([r, c]) {
                *g += b_y + b_x * dfx_dy + b_y * dfy_dy;
            }

            total += f64::from(a_x.mul_add(a_x, a_y * a_y) + b_x.mul_add(b_x, b_y * b_y));
        }

        let elements = (ux.len() * 2).max(1) as f64;
        Self {
            cost: (0.5 * total / elements) as f32,
            grad_x,
            grad_y,
        }
    }
}
