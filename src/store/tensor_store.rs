//! Chunked tensor storage
//!
//! Every layer is a stack of sections addressed by `(mip, z)`, each cut into
//! storage chunks on a fixed grid. [`ChunkedStore`] turns arbitrary box reads
//! and writes into whole-chunk operations on a [`ChunkBackend`]; backends
//! only ever see aligned chunks.

use crate::io::error::{Result, ensure_shape, invalid_parameter};
use crate::spatial::bbox::BoundingBox;
use ndarray::{Array3, ArrayView3, AxisDescription, Slice};
use serde::{Deserialize, Serialize};
use std::ops::{Range, RangeInclusive};

/// Element type of a stored layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Greyscale image intensities
    U8,
    /// Fixed-point field values
    I16,
    /// Unquantized floating point values
    F32,
}

impl DataType {
    /// Round and clamp a value to what the type can hold
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            Self::U8 => value.round().clamp(0.0, 255.0),
            Self::I16 => value
                .round()
                .clamp(f32::from(i16::MIN), f32::from(i16::MAX)),
            Self::F32 => value,
        }
    }

    /// Bytes per element
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Serializable description of one layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerHandle {
    /// Layer path, unique within a store
    pub path: String,
    /// Element type
    pub dtype: DataType,
    /// Values per pixel
    pub channels: usize,
    /// Storage chunk size `[x, y]` in grid cells, identical at every mip
    pub chunk: [u32; 2],
}

impl LayerHandle {
    /// Describe a layer
    pub fn new(path: impl Into<String>, dtype: DataType, channels: usize, chunk: [u32; 2]) -> Self {
        Self {
            path: path.into(),
            dtype,
            channels,
            chunk,
        }
    }

    /// Single channel `u8` image layer
    pub fn image(path: impl Into<String>, chunk: [u32; 2]) -> Self {
        Self::new(path, DataType::U8, 1, chunk)
    }

    /// Two channel `i16` field layer
    pub fn field(path: impl Into<String>, chunk: [u32; 2]) -> Self {
        Self::new(path, DataType::I16, 2, chunk)
    }

    /// Single channel `f32` layer for confidences and scores
    pub fn scalar(path: impl Into<String>, chunk: [u32; 2]) -> Self {
        Self::new(path, DataType::F32, 1, chunk)
    }

    /// Indices of the chunks a box at some mip touches, as inclusive ranges
    ///
    /// # Errors
    ///
    /// Returns an error if the layer has a zero chunk size
    pub fn chunk_span(&self, bbox: &BoundingBox, mip: u32) -> Result<[RangeInclusive<i64>; 2]> {
        let [cx, cy] = self.chunk;
        if cx == 0 || cy == 0 {
            return Err(invalid_parameter(
                "chunk",
                &format!("{cx}x{cy}"),
                &"storage chunks must be non-empty",
            ));
        }
        let xs = bbox.x_range(mip);
        let ys = bbox.y_range(mip);
        let (cx, cy) = (i64::from(cx), i64::from(cy));
        Ok([
            xs.start.div_euclid(cx)..=(xs.end - 1).div_euclid(cx),
            ys.start.div_euclid(cy)..=(ys.end - 1).div_euclid(cy),
        ])
    }

    /// Region in grid cells covered by one chunk
    pub fn chunk_region(&self, index: [i64; 2]) -> BoundingBox {
        let [cx, cy] = self.chunk.map(i64::from);
        let [ix, iy] = index;
        BoundingBox::new(ix * cx..(ix + 1) * cx, iy * cy..(iy + 1) * cy)
    }
}

/// Address of one storage chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    /// Resolution level
    pub mip: u32,
    /// Section index
    pub z: i64,
    /// Chunk index `[x, y]` on the storage grid
    pub index: [i64; 2],
}

impl ChunkKey {
    /// File-system friendly name of the chunk
    pub fn name(&self) -> String {
        let [ix, iy] = self.index;
        format!("{}/{}/{ix}_{iy}", self.mip, self.z)
    }
}

/// Random access to layers of `(rows, cols, channels)` tensors
///
/// Unwritten regions read as zeros.
pub trait TensorStore: Send + Sync {
    /// Record a layer so its description can be looked up by path
    ///
    /// # Errors
    ///
    /// Returns a storage error if the metadata cannot be written
    fn create_layer(&self, layer: &LayerHandle) -> Result<()>;

    /// Description of a previously created layer
    ///
    /// # Errors
    ///
    /// Returns a storage error if the metadata exists but cannot be read
    fn layer_info(&self, path: &str) -> Result<Option<LayerHandle>>;

    /// Read the box, given in mip 0 pixels, of section `z` at `mip`
    ///
    /// # Errors
    ///
    /// Returns an error if the box is not integral at `mip` or a chunk
    /// cannot be read
    fn read(&self, layer: &LayerHandle, mip: u32, bbox: &BoundingBox, z: i64) -> Result<Array3<f32>>;

    /// Write a `(rows, cols, channels)` tensor into the box of section `z`
    ///
    /// # Errors
    ///
    /// Returns an error if the data shape does not match the box or a chunk
    /// cannot be written
    fn write(
        &self,
        layer: &LayerHandle,
        mip: u32,
        bbox: &BoundingBox,
        z: i64,
        data: &ArrayView3<'_, f32>,
    ) -> Result<()>;
}

/// Whole-chunk persistence behind a [`ChunkedStore`]
pub trait ChunkBackend: Send + Sync {
    /// Load a chunk, `None` if it was never written
    ///
    /// # Errors
    ///
    /// Returns a storage error if the chunk exists but cannot be decoded
    fn load_chunk(&self, layer: &LayerHandle, key: &ChunkKey) -> Result<Option<Array3<f32>>>;

    /// Persist a full chunk
    ///
    /// # Errors
    ///
    /// Returns a storage error if the chunk cannot be written
    fn store_chunk(&self, layer: &LayerHandle, key: &ChunkKey, data: &Array3<f32>) -> Result<()>;

    /// Persist layer metadata
    ///
    /// # Errors
    ///
    /// Returns a storage error if the metadata cannot be written
    fn save_layer(&self, layer: &LayerHandle) -> Result<()>;

    /// Load layer metadata
    ///
    /// # Errors
    ///
    /// Returns a storage error if the metadata cannot be parsed
    fn load_layer(&self, path: &str) -> Result<Option<LayerHandle>>;
}

/// [`TensorStore`] assembling box reads and writes from aligned chunks
#[derive(Debug, Default)]
pub struct ChunkedStore<B> {
    backend: B,
}

impl<B: ChunkBackend> ChunkedStore<B> {
    /// Wrap a chunk backend
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    /// The wrapped backend
    pub const fn backend(&self) -> &B {
        &self.backend
    }
}

/// Overlap of a chunk and a box in local coordinates of both
struct Overlap {
    chunk_rows: Range<usize>,
    chunk_cols: Range<usize>,
    box_rows: Range<usize>,
    box_cols: Range<usize>,
}

/// Selects `rows` and `cols` of a `(rows, cols, channels)` array, every channel
fn window(rows: &Range<usize>, cols: &Range<usize>) -> impl FnMut(AxisDescription) -> Slice {
    let (rows, cols) = (rows.clone(), cols.clone());
    move |axis| match axis.axis.index() {
        0 => Slice::from(rows.clone()),
        1 => Slice::from(cols.clone()),
        _ => Slice::from(..),
    }
}

fn overlap(chunk: &BoundingBox, region: &BoundingBox) -> Option<Overlap> {
    let shared = chunk.intersect(region)?;
    let local = |value: i64, origin: i64| (value - origin).max(0) as usize;
    Some(Overlap {
        chunk_rows: local(shared.min[1], chunk.min[1])..local(shared.max[1], chunk.min[1]),
        chunk_cols: local(shared.min[0], chunk.min[0])..local(shared.max[0], chunk.min[0]),
        box_rows: local(shared.min[1], region.min[1])..local(shared.max[1], region.min[1]),
        box_cols: local(shared.min[0], region.min[0])..local(shared.max[0], region.min[0]),
    })
}

impl<B: ChunkBackend> TensorStore for ChunkedStore<B> {
    fn create_layer(&self, layer: &LayerHandle) -> Result<()> {
        self.backend.save_layer(layer)
    }

    fn layer_info(&self, path: &str) -> Result<Option<LayerHandle>> {
        self.backend.load_layer(path)
    }

    fn read(&self, layer: &LayerHandle, mip: u32, bbox: &BoundingBox, z: i64) -> Result<Array3<f32>> {
        bbox.check_integral(mip)?;
        let (rows, cols) = bbox.shape(mip);
        let mut out = Array3::<f32>::zeros((rows, cols, layer.channels));
        if bbox.is_empty() {
            return Ok(out);
        }
        let region = bbox.at_grid(mip);
        let [xs, ys] = layer.chunk_span(bbox, mip)?;
        for iy in ys {
            for ix in xs.clone() {
                let key = ChunkKey { mip, z, index: [ix, iy] };
                let Some(chunk) = self.backend.load_chunk(layer, &key)? else {
                    continue;
                };
                let Some(o) = overlap(&layer.chunk_region(key.index), &region) else {
                    continue;
                };
                out.slice_each_axis_mut(window(&o.box_rows, &o.box_cols))
                    .assign(&chunk.slice_each_axis(window(&o.chunk_rows, &o.chunk_cols)));
            }
        }
        Ok(out)
    }

    fn write(
        &self,
        layer: &LayerHandle,
        mip: u32,
        bbox: &BoundingBox,
        z: i64,
        data: &ArrayView3<'_, f32>,
    ) -> Result<()> {
        bbox.check_integral(mip)?;
        let (rows, cols) = bbox.shape(mip);
        ensure_shape("TensorStore::write", &[rows, cols, layer.channels], data.shape())?;
        if bbox.is_empty() {
            return Ok(());
        }
        let region = bbox.at_grid(mip);
        let [cx, cy] = layer.chunk.map(|v| v as usize);
        let [xs, ys] = layer.chunk_span(bbox, mip)?;
        for iy in ys {
            for ix in xs.clone() {
                let key = ChunkKey { mip, z, index: [ix, iy] };
                let chunk_box = layer.chunk_region(key.index);
                let Some(o) = overlap(&chunk_box, &region) else {
                    continue;
                };
                let full = o.chunk_rows.len() == cy && o.chunk_cols.len() == cx;
                let mut chunk = if full {
                    Array3::zeros((cy, cx, layer.channels))
                } else {
                    self.backend
                        .load_chunk(layer, &key)?
                        .unwrap_or_else(|| Array3::zeros((cy, cx, layer.channels)))
                };
                chunk
                    .slice_each_axis_mut(window(&o.chunk_rows, &o.chunk_cols))
                    .assign(&data.slice_each_axis(window(&o.box_rows, &o.box_cols)));
                chunk.mapv_inplace(|v| layer.dtype.quantize(v));
                self.backend.store_chunk(layer, &key, &chunk)?;
            }
        }
        Ok(())
    }
}

impl<S: TensorStore + ?Sized> TensorStore for std::sync::Arc<S> {
    fn create_layer(&self, layer: &LayerHandle) -> Result<()> {
        (**self).create_layer(layer)
    }

    fn layer_info(&self, path: &str) -> Result<Option<LayerHandle>> {
        (**self).layer_info(path)
    }

    fn read(&self, layer: &LayerHandle, mip: u32, bbox: &BoundingBox, z: i64) -> Result<Array3<f32>> {
        (**self).read(layer, mip, bbox, z)
    }

    fn write(
        &self,
        layer: &LayerHandle,
        mip: u32,
        bbox: &BoundingBox,
        z: i64,
        data: &ArrayView3<'_, f32>,
    ) -> Result<()> {
        (**self).write(layer, mip, bbox, z, data)
    }
}
