//! Typed access to image, field and scalar layers
//!
//! Images travel as `f32` planes holding raw `0..=255` intensities. Fields
//! are absolute and pass through the int16 codec when their layer is `i16`.

use crate::field::codec::{dequantize, quantize};
use crate::field::tensor::{Convention, Field};
use crate::io::error::{Result, ensure_shape, invalid_parameter};
use crate::spatial::bbox::BoundingBox;
use crate::store::tensor_store::{DataType, LayerHandle, TensorStore};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Read the first channel of an image layer
///
/// # Errors
///
/// Propagates store failures
pub fn read_image(
    store: &dyn TensorStore,
    layer: &LayerHandle,
    mip: u32,
    bbox: &BoundingBox,
    z: i64,
) -> Result<Array2<f32>> {
    let data = store.read(layer, mip, bbox, z)?;
    Ok(data.index_axis(Axis(2), 0).to_owned())
}

/// Write a single channel plane into an image or scalar layer
///
/// # Errors
///
/// Returns an error if the plane does not match the box or the layer has
/// more than one channel
pub fn write_plane(
    store: &dyn TensorStore,
    layer: &LayerHandle,
    mip: u32,
    bbox: &BoundingBox,
    z: i64,
    plane: &ArrayView2<'_, f32>,
) -> Result<()> {
    if layer.channels != 1 {
        return Err(invalid_parameter(
            "layer",
            &layer.path,
            &"planes can only be written to single channel layers",
        ));
    }
    let data = plane.insert_axis(Axis(2));
    store.write(layer, mip, bbox, z, &data)
}

/// Read a field layer as an absolute field at `mip`
///
/// # Errors
///
/// Returns an error if the layer is not a two channel field layer
pub fn read_field(
    store: &dyn TensorStore,
    layer: &LayerHandle,
    mip: u32,
    bbox: &BoundingBox,
    z: i64,
) -> Result<Field> {
    check_field_layer(layer)?;
    let data = store.read(layer, mip, bbox, z)?;
    let (rows, cols, _) = data.dim();
    let batched = data.insert_axis(Axis(0));
    match layer.dtype {
        DataType::I16 => dequantize(&batched.mapv(|v| v as i16), mip),
        DataType::F32 | DataType::U8 => {
            ensure_shape("read_field", &[1, rows, cols, 2], batched.shape())?;
            Field::new(batched, mip, Convention::Absolute)
        }
    }
}

/// Write an absolute field at its own mip
///
/// # Errors
///
/// Returns an error for relative fields, non-field layers, or a grid that
/// does not match the box
pub fn write_field(
    store: &dyn TensorStore,
    layer: &LayerHandle,
    bbox: &BoundingBox,
    z: i64,
    field: &Field,
) -> Result<()> {
    check_field_layer(layer)?;
    let mip = field.mip();
    let planar: Array3<f32> = match layer.dtype {
        DataType::I16 => quantize(field)?.mapv(f32::from).index_axis_move(Axis(0), 0),
        DataType::F32 | DataType::U8 => {
            if field.convention() != Convention::Absolute {
                return Err(invalid_parameter(
                    "convention",
                    &format!("{:?}", field.convention()),
                    &"stored fields are absolute",
                ));
            }
            field.data().index_axis(Axis(0), 0).to_owned()
        }
    };
    store.write(layer, mip, bbox, z, &planar.view())
}

fn check_field_layer(layer: &LayerHandle) -> Result<()> {
    if layer.channels == 2 {
        Ok(())
    } else {
        Err(invalid_parameter(
            "layer",
            &layer.path,
            &format!("field layers have 2 channels, found {}", layer.channels),
        ))
    }
}

/// One section of an image layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Layer holding the image
    pub layer: LayerHandle,
    /// Section index
    pub z: i64,
}

impl ImageRef {
    /// Reference section `z` of `layer`
    pub const fn new(layer: LayerHandle, z: i64) -> Self {
        Self { layer, z }
    }

    /// Read the box at `mip`
    ///
    /// # Errors
    ///
    /// Propagates store failures
    pub fn read(&self, store: &dyn TensorStore, mip: u32, bbox: &BoundingBox) -> Result<Array2<f32>> {
        read_image(store, &self.layer, mip, bbox, self.z)
    }
}

/// One section of a field layer at a fixed mip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    /// Layer holding the field
    pub layer: LayerHandle,
    /// Section index
    pub z: i64,
    /// Resolution the field was computed at
    pub mip: u32,
}

impl FieldRef {
    /// Reference section `z` of `layer` at `mip`
    pub const fn new(layer: LayerHandle, z: i64, mip: u32) -> Self {
        Self { layer, z, mip }
    }

    /// Read the box at the field's own mip
    ///
    /// # Errors
    ///
    /// Propagates store failures
    pub fn read(&self, store: &dyn TensorStore, bbox: &BoundingBox) -> Result<Field> {
        read_field(store, &self.layer, self.mip, bbox, self.z)
    }
}
