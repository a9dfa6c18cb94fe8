//! Displacement field tiles
//!
//! A field is stored as `(1, H, W, 2)`: axis 1 runs over rows (y), axis 2 over
//! columns (x), and the last axis holds the x then y displacement. Values are
//! interpreted through the field's [`Convention`].

use crate::io::error::{Result, ensure_shape};
use ndarray::{Array2, Array4, ArrayView2, Axis, Slice};
use serde::{Deserialize, Serialize};

/// Units of the displacement values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Convention {
    /// Pixels at mip 0, independent of the grid resolution
    Absolute,
    /// Fractions of the tile half-extent, so `[-1, 1]` spans the tile
    Relative,
}

/// Displacement field over a tile at one mip level
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    data: Array4<f32>,
    mip: u32,
    convention: Convention,
}

impl Field {
    /// Wrap a `(1, H, W, 2)` array
    ///
    /// # Errors
    ///
    /// Returns a shape mismatch if the batch or channel axis is not as required
    pub fn new(data: Array4<f32>, mip: u32, convention: Convention) -> Result<Self> {
        let (batch, rows, cols, channels) = data.dim();
        ensure_shape("Field::new", &[1, rows, cols, 2], &[batch, rows, cols, channels])?;
        Ok(Self {
            data,
            mip,
            convention,
        })
    }

    /// The zero field, which leaves every image unchanged
    pub fn identity(rows: usize, cols: usize, mip: u32, convention: Convention) -> Self {
        Self {
            data: Array4::zeros((1, rows, cols, 2)),
            mip,
            convention,
        }
    }

    /// Constant absolute displacement `[dx, dy]` in mip 0 pixels
    pub fn uniform(rows: usize, cols: usize, mip: u32, displacement: [f32; 2]) -> Self {
        let data = Array4::from_shape_fn((1, rows, cols, 2), |(_, _, _, c)| {
            displacement.get(c).copied().unwrap_or(0.0)
        });
        Self {
            data,
            mip,
            convention: Convention::Absolute,
        }
    }

    /// Assemble a field from its x and y planes
    ///
    /// # Errors
    ///
    /// Returns a shape mismatch if the planes differ in shape
    pub fn from_components(
        x: &ArrayView2<'_, f32>,
        y: &ArrayView2<'_, f32>,
        mip: u32,
        convention: Convention,
    ) -> Result<Self> {
        let (rows, cols) = x.dim();
        ensure_shape("Field::from_components", &[rows, cols], &[y.nrows(), y.ncols()])?;
        let data = Array4::from_shape_fn((1, rows, cols, 2), |(_, r, c, channel)| {
            let value = if channel == 0 {
                x.get([r, c]).copied()
            } else {
                y.get([r, c]).copied()
            };
            value.unwrap_or(0.0)
        });
        Ok(Self {
            data,
            mip,
            convention,
        })
    }

    /// Number of rows (y extent)
    pub fn rows(&self) -> usize {
        self.data.dim().1
    }

    /// Number of columns (x extent)
    pub fn cols(&self) -> usize {
        self.data.dim().2
    }

    /// Grid shape `(rows, cols)`
    pub fn dim(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }

    /// Resolution level of the grid
    pub const fn mip(&self) -> u32 {
        self.mip
    }

    /// Units of the values
    pub const fn convention(&self) -> Convention {
        self.convention
    }

    /// Raw `(1, H, W, 2)` array
    pub const fn data(&self) -> &Array4<f32> {
        &self.data
    }

    /// Consume the field, returning the raw array
    pub fn into_data(self) -> Array4<f32> {
        self.data
    }

    /// View of the x (`0`) or y (`1`) displacement plane
    pub fn component(&self, channel: usize) -> ArrayView2<'_, f32> {
        self.data
            .view()
            .index_axis_move(Axis(0), 0)
            .index_axis_move(Axis(2), channel.min(1))
    }

    /// Displacement `[dx, dy]` at a grid position
    pub fn at(&self, row: usize, col: usize) -> [f32; 2] {
        [
            self.data.get([0, row, col, 0]).copied().unwrap_or(0.0),
            self.data.get([0, row, col, 1]).copied().unwrap_or(0.0),
        ]
    }

    /// True iff every element is exactly zero
    pub fn is_identity(&self) -> bool {
        self.data.iter().all(|v| *v == 0.0)
    }

    /// True if any element is NaN or infinite
    pub fn has_non_finite(&self) -> bool {
        self.data.iter().any(|v| !v.is_finite())
    }

    /// Multipliers `[x, y]` turning stored values into grid cells
    pub fn cell_scale(&self) -> [f32; 2] {
        match self.convention {
            Convention::Absolute => {
                let cells = 1.0 / (1_u64 << self.mip) as f32;
                [cells, cells]
            }
            Convention::Relative => [self.cols() as f32 / 2.0, self.rows() as f32 / 2.0],
        }
    }

    /// Displacement planes `(x, y)` measured in grid cells
    ///
    /// Unlike the stored values, cell displacements scale with the grid: the
    /// same physical shift spans twice the cells one mip finer.
    pub fn to_grid_cells(&self) -> (Array2<f32>, Array2<f32>) {
        let [sx, sy] = self.cell_scale();
        (
            self.component(0).mapv(|v| v * sx),
            self.component(1).mapv(|v| v * sy),
        )
    }

    /// Build a field in `convention` from planes measured in grid cells
    ///
    /// # Errors
    ///
    /// Returns a shape mismatch if the planes differ in shape
    pub fn from_grid_cells(
        x: &ArrayView2<'_, f32>,
        y: &ArrayView2<'_, f32>,
        mip: u32,
        convention: Convention,
    ) -> Result<Self> {
        let template = Self::identity(x.nrows(), x.ncols(), mip, convention);
        let [sx, sy] = template.cell_scale();
        Self::from_components(
            &x.mapv(|v| v / sx).view(),
            &y.mapv(|v| v / sy).view(),
            mip,
            convention,
        )
    }

    /// Mean of the squared elements
    pub fn mean_squared(&self) -> f32 {
        let n = self.data.len();
        if n == 0 {
            return 0.0;
        }
        self.data.iter().map(|v| v * v).sum::<f32>() / n as f32
    }

    /// Largest absolute elementwise difference to another field of the same shape
    pub fn max_abs_diff(&self, other: &Self) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }

    /// Remove `margin` cells from every side
    pub fn crop(&self, margin: usize) -> Self {
        let (rows, cols) = self.dim();
        let row_start = margin.min(rows);
        let col_start = margin.min(cols);
        let row_end = rows.saturating_sub(margin).max(row_start);
        let col_end = cols.saturating_sub(margin).max(col_start);
        Self {
            data: self
                .data
                .slice_each_axis(|axis| match axis.axis.index() {
                    1 => Slice::from(row_start..row_end),
                    2 => Slice::from(col_start..col_end),
                    _ => Slice::from(..),
                })
                .to_owned(),
            mip: self.mip,
            convention: self.convention,
        }
    }

    /// Rotate the grid by 180 degrees and negate the displacements
    ///
    /// This is the field a rotation-equivariant predictor returns for the
    /// rotated image pair, so applying it twice gives the original field.
    pub fn rotate_half_turn(&self) -> Self {
        let mut data = self.data.clone();
        data.invert_axis(Axis(1));
        data.invert_axis(Axis(2));
        data.mapv_inplace(|v| -v);
        Self {
            data,
            mip: self.mip,
            convention: self.convention,
        }
    }

    /// Same values reinterpreted at another mip
    pub fn with_mip(self, mip: u32) -> Self {
        Self { mip, ..self }
    }

    /// Multiply each channel by its factor and tag the result with `convention`
    pub(crate) fn scaled(&self, factors: [f32; 2], convention: Convention) -> Self {
        let mut data = self.data.clone();
        for (channel, factor) in factors.iter().enumerate() {
            data.index_axis_mut(Axis(3), channel)
                .mapv_inplace(|v| v * factor);
        }
        Self {
            data,
            mip: self.mip,
            convention,
        }
    }
}
