//! Pure operations over displacement fields
//!
//! All functions take fields by reference and return new fields. Composition
//! follows the resampling order: `compose_fields(f, g)` resamples through `g`
//! first and `f` second, so a chain of pairwise fields is composed with the
//! hop nearest the target on the left.

use crate::field::tensor::{Convention, Field};
use crate::io::error::{Result, ensure_shape, invalid_parameter};
use crate::math::filters::average_pool;
use crate::math::interpolation::{Padding, bilinear, resize_bilinear};
use crate::spatial::bbox::BoundingBox;
use ndarray::Array2;

/// Convert an absolute field over `bbox` to the relative convention
///
/// The x channel is divided by half the box width at mip 0 and the y channel
/// by half its height.
///
/// # Errors
///
/// Returns an error if the field is not absolute or its grid does not match
/// the box at `mip`
pub fn abs_to_rel(field: &Field, bbox: &BoundingBox, mip: u32) -> Result<Field> {
    check_convention("abs_to_rel", field, Convention::Absolute)?;
    let [half_x, half_y] = half_extent(field, bbox, mip)?;
    Ok(field.scaled([1.0 / half_x, 1.0 / half_y], Convention::Relative))
}

/// Convert a relative field over `bbox` to the absolute convention
///
/// Exact inverse of [`abs_to_rel`].
///
/// # Errors
///
/// Returns an error if the field is not relative or its grid does not match
/// the box at `mip`
pub fn rel_to_abs(field: &Field, bbox: &BoundingBox, mip: u32) -> Result<Field> {
    check_convention("rel_to_abs", field, Convention::Relative)?;
    let [half_x, half_y] = half_extent(field, bbox, mip)?;
    Ok(field.scaled([half_x, half_y], Convention::Absolute))
}

fn half_extent(field: &Field, bbox: &BoundingBox, mip: u32) -> Result<[f32; 2]> {
    let (rows, cols) = bbox.shape(mip);
    ensure_shape("field over bbox", &[rows, cols], &[field.rows(), field.cols()])?;
    Ok([bbox.x_size(0) as f32 / 2.0, bbox.y_size(0) as f32 / 2.0])
}

fn check_convention(operation: &'static str, field: &Field, expected: Convention) -> Result<()> {
    if field.convention() == expected {
        Ok(())
    } else {
        Err(invalid_parameter(
            "convention",
            &format!("{:?}", field.convention()),
            &format!("{operation} expects a {expected:?} field"),
        ))
    }
}

/// Resample a field grid from `src_mip` to `dst_mip`
///
/// Going finer uses edge-aligned bilinear interpolation, going coarser uses
/// area averaging. Stored values are unchanged in both conventions: absolute
/// values are measured in mip 0 pixels and relative values in tile extents,
/// neither of which depends on the grid. Displacements in grid cells (see
/// [`Field::to_grid_cells`]) do scale by `2^(src_mip - dst_mip)`.
///
/// # Errors
///
/// Returns an error if the field is not at `src_mip`
pub fn upsample_field(field: &Field, src_mip: u32, dst_mip: u32) -> Result<Field> {
    if field.mip() != src_mip {
        return Err(invalid_parameter(
            "src_mip",
            &src_mip,
            &format!("field is at mip {}", field.mip()),
        ));
    }
    if src_mip == dst_mip {
        return Ok(field.clone());
    }

    let (x, y) = if src_mip > dst_mip {
        let factor = 1_usize << (src_mip - dst_mip);
        let rows = field.rows() * factor;
        let cols = field.cols() * factor;
        (
            resize_bilinear(&field.component(0), rows, cols),
            resize_bilinear(&field.component(1), rows, cols),
        )
    } else {
        let factor = 1_usize << (dst_mip - src_mip);
        (
            average_pool(&field.component(0), factor),
            average_pool(&field.component(1), factor),
        )
    };
    Field::from_components(&x.view(), &y.view(), dst_mip, field.convention())
}

/// Compose two fields so that resampling through `g` then `f` equals
/// resampling through the result
///
/// `h(x) = f(x) + g(x + f(x))`, with `g` looked up bilinearly and clamped at
/// the border. Composing with the zero field on either side is exact.
///
/// # Errors
///
/// Returns an error if the fields differ in grid, mip or convention
pub fn compose_fields(f: &Field, g: &Field) -> Result<Field> {
    ensure_shape(
        "compose_fields",
        &[f.rows(), f.cols()],
        &[g.rows(), g.cols()],
    )?;
    if f.mip() != g.mip() || f.convention() != g.convention() {
        return Err(invalid_parameter(
            "compose_fields",
            &format!(
                "f: mip {} {:?}, g: mip {} {:?}",
                f.mip(),
                f.convention(),
                g.mip(),
                g.convention()
            ),
            &"both fields must share mip and convention",
        ));
    }

    let (f_cells_x, f_cells_y) = f.to_grid_cells();
    let gx = g.component(0);
    let gy = g.component(1);
    let fx = f.component(0);
    let fy = f.component(1);

    let mut hx = Array2::zeros(f.dim());
    let mut hy = Array2::zeros(f.dim());
    for ((r, c), out) in hx.indexed_iter_mut() {
        let dx = f_cells_x.get([r, c]).copied().unwrap_or(0.0);
        let dy = f_cells_y.get([r, c]).copied().unwrap_or(0.0);
        let px = c as f32 + dx;
        let py = r as f32 + dy;
        *out = fx.get([r, c]).copied().unwrap_or(0.0) + bilinear(&gx, px, py, Padding::Border);
        if let Some(target) = hy.get_mut([r, c]) {
            *target =
                fy.get([r, c]).copied().unwrap_or(0.0) + bilinear(&gy, px, py, Padding::Border);
        }
    }
    Field::from_components(&hx.view(), &hy.view(), f.mip(), f.convention())
}

/// Compose a chain of fields ordered from the last hop to the first
///
/// # Errors
///
/// Returns an error if the chain is empty or the fields are incompatible
pub fn compose_chain(fields: &[Field]) -> Result<Field> {
    let mut iter = fields.iter().rev();
    let first = iter
        .next()
        .ok_or_else(|| invalid_parameter("fields", &0, &"cannot compose an empty chain"))?;
    iter.try_fold(first.clone(), |acc, next| compose_fields(next, &acc))
}

/// Average nonzero displacement of a field in mip 0 pixels, quantized down
/// to a multiple of `2^mip`
///
/// Used to pre-shift a read window by bulk drift so padding only has to cover
/// the residual. Returns `[0, 0]` for the identity field.
pub fn profile_field(field: &Field) -> [i64; 2] {
    let (cells_x, cells_y) = field.to_grid_cells();
    let scale = (1_u64 << field.mip()) as f64;
    let mut sum = [0.0_f64; 2];
    let mut count = 0_usize;
    for (vx, vy) in cells_x.iter().zip(cells_y.iter()) {
        if *vx != 0.0 || *vy != 0.0 {
            sum[0] += f64::from(*vx);
            sum[1] += f64::from(*vy);
            count += 1;
        }
    }
    if count == 0 {
        return [0, 0];
    }
    sum.map(|total| {
        let cells = (total / count as f64).floor();
        (cells * scale) as i64
    })
}

/// Subtract a mip 0 pixel translation from every displacement
///
/// # Errors
///
/// Returns an error if the rebuilt field has inconsistent planes
pub fn shift_field(field: &Field, shift: [i64; 2]) -> Result<Field> {
    let (cells_x, cells_y) = field.to_grid_cells();
    let scale = (1_u64 << field.mip()) as f32;
    let dx = shift[0] as f32 / scale;
    let dy = shift[1] as f32 / scale;
    Field::from_grid_cells(
        &cells_x.mapv(|v| v - dx).view(),
        &cells_y.mapv(|v| v - dy).view(),
        field.mip(),
        field.convention(),
    )
}

/// True iff every element of the field is exactly zero
pub fn is_identity(field: &Field) -> bool {
    field.is_identity()
}
