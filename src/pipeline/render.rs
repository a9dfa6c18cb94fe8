//! Image-level chunk operations
//!
//! Warping an image through a field, missing-data substitution, and the
//! two-fold area downsampling used to build the output pyramid.

use crate::field::algebra::{profile_field, shift_field};
use crate::field::tensor::Field;
use crate::io::configuration::MISSING_DATA_HIGH;
use crate::io::error::{Result, ensure_shape};
use crate::math::filters::average_pool;
use crate::math::interpolation::{Padding, bilinear};
use crate::spatial::bbox::BoundingBox;
use crate::store::tensor_store::TensorStore;
use crate::store::volumes::ImageRef;
use ndarray::{Array2, ArrayView2, Zip};
use tracing::trace;

/// Sample `image` at every output pixel displaced by `field`
///
/// `origin` is the position `[x, y]` of the output grid's first pixel inside
/// the image, in grid cells. Samples outside the image are zero.
///
/// # Errors
///
/// Returns an error if the field is not defined on the output grid
pub fn warp_image(image: &ArrayView2<'_, f32>, field: &Field, origin: [f32; 2], out: (usize, usize)) -> Result<Array2<f32>> {
    ensure_shape("warp_image", &[out.0, out.1], &[field.rows(), field.cols()])?;
    let (cells_x, cells_y) = field.to_grid_cells();
    let mut warped = Array2::zeros(out);
    Zip::indexed(&mut warped)
        .and(&cells_x)
        .and(&cells_y)
        .for_each(|(r, c), value, dx, dy| {
            let x = origin[0] + c as f32 + dx;
            let y = origin[1] + r as f32 + dy;
            *value = bilinear(image, x, y, Padding::Zeros);
        });
    Ok(warped)
}

/// Render one chunk of `image` through an optional field at `mip`
///
/// Identity and absent fields read the box directly. Otherwise the read
/// window is pre-shifted by the field's bulk drift, so `pad` only has to
/// cover the residual displacement.
///
/// # Errors
///
/// Returns an error if the field grid does not match the box or a read fails
pub fn render(
    store: &dyn TensorStore,
    image: &ImageRef,
    field: Option<&Field>,
    bbox: &BoundingBox,
    mip: u32,
    pad: i64,
) -> Result<Array2<f32>> {
    let Some(field) = field.filter(|f| !f.is_identity()) else {
        return image.read(store, mip, bbox);
    };
    let drift = profile_field(field);
    let residual = shift_field(field, drift)?;
    let window = bbox.uncrop(pad).translate(drift);
    trace!(?drift, %window, z = image.z, "rendering chunk");
    let source = image.read(store, mip, &window)?;
    let margin = (pad >> mip) as f32;
    warp_image(&source.view(), &residual, [margin, margin], bbox.shape(mip))
}

/// Whether a raw 8-bit value marks missing data
pub const fn is_missing(value: f32) -> bool {
    value == 0.0 || value >= MISSING_DATA_HIGH
}

/// Pixels of a tile that are missing and lie inside the reference field of view
///
/// `tile` is the box the image was read over at `mip`; pixels outside
/// `reference` are outside the imaged area and never count as missing.
pub fn missing_data_mask(image: &ArrayView2<'_, f32>, tile: &BoundingBox, reference: &BoundingBox, mip: u32) -> Array2<bool> {
    let x0 = tile.x_range(mip).start;
    let y0 = tile.y_range(mip).start;
    let fov_x = reference.x_range(mip);
    let fov_y = reference.y_range(mip);
    Array2::from_shape_fn(image.dim(), |(r, c)| {
        let inside = fov_x.contains(&(x0 + c as i64)) && fov_y.contains(&(y0 + r as i64));
        inside && image.get([r, c]).copied().is_some_and(is_missing)
    })
}

/// Replace masked pixels of `primary` by valid pixels of `backup`
///
/// Returns how many pixels changed.
///
/// # Errors
///
/// Returns a shape mismatch if the three planes differ in shape
pub fn fill_missing(primary: &mut Array2<f32>, backup: &ArrayView2<'_, f32>, mask: &Array2<bool>) -> Result<usize> {
    ensure_shape("fill_missing", primary.shape(), backup.shape())?;
    ensure_shape("fill_missing", primary.shape(), mask.shape())?;
    let mut filled = 0;
    Zip::from(primary)
        .and(backup)
        .and(mask)
        .for_each(|value, substitute, missing| {
            if *missing && !is_missing(*substitute) {
                *value = *substitute;
                filled += 1;
            }
        });
    Ok(filled)
}

/// Halve a plane's resolution by averaging 2x2 blocks
pub fn downsample(plane: &ArrayView2<'_, f32>) -> Array2<f32> {
    average_pool(plane, 2)
}
