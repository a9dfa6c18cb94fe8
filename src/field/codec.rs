//! Fixed-point int16 encoding of absolute fields for storage

use crate::field::tensor::{Convention, Field};
use crate::io::configuration::{FIELD_INT16_MAX, FIELD_INT16_MIN, FIELD_INT16_SCALE};
use crate::io::error::{Result, invalid_parameter};
use ndarray::Array4;
use tracing::warn;

/// Quantize an absolute field to int16 with scale [`FIELD_INT16_SCALE`]
///
/// Values outside `[FIELD_INT16_MIN, FIELD_INT16_MAX]` are clamped and logged:
/// they mean the padding budget was too small for the actual drift.
///
/// # Errors
///
/// Returns an error for relative fields, which would lose all precision
pub fn quantize(field: &Field) -> Result<Array4<i16>> {
    if field.convention() != Convention::Absolute {
        return Err(invalid_parameter(
            "convention",
            &format!("{:?}", field.convention()),
            &"only absolute fields are stored as int16",
        ));
    }
    let out_of_range = field
        .data()
        .iter()
        .filter(|v| **v < FIELD_INT16_MIN || **v > FIELD_INT16_MAX || v.is_nan())
        .count();
    if out_of_range > 0 {
        warn!(
            out_of_range,
            min = FIELD_INT16_MIN,
            max = FIELD_INT16_MAX,
            "field values exceed the int16 range, increase the pad"
        );
    }
    Ok(field.data().mapv(|v| {
        if v.is_nan() {
            0
        } else {
            (v * FIELD_INT16_SCALE)
                .round()
                .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
        }
    }))
}

/// Decode an int16 array back to an absolute field at `mip`
///
/// # Errors
///
/// Returns a shape mismatch if the array is not `(1, H, W, 2)`
pub fn dequantize(data: &Array4<i16>, mip: u32) -> Result<Field> {
    Field::new(
        data.mapv(|v| f32::from(v) / FIELD_INT16_SCALE),
        mip,
        Convention::Absolute,
    )
}
