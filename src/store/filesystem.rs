//! Directory-backed stores
//!
//! Layout under the root:
//! - `<layer>/info.json` holds the serialized [`LayerHandle`]
//! - `<layer>/<mip>/<z>/<ix>_<iy>.png` for single channel `u8` chunks
//! - `<layer>/<mip>/<z>/<ix>_<iy>.bin` for everything else, little endian
//! - `markers/<prefix>/<leaf>` for completion markers
//!
//! Chunks are written to a temporary sibling and renamed into place so a
//! reader never sees a half-written chunk.

use crate::io::error::{AlignError, Result, fs_error, storage_error};
use crate::store::markers::MarkerStore;
use crate::store::tensor_store::{ChunkBackend, ChunkKey, ChunkedStore, DataType, LayerHandle};
use image::{GrayImage, ImageFormat};
use ndarray::Array3;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Chunk backend writing one file per chunk
#[derive(Debug, Clone)]
pub struct FileChunks {
    root: PathBuf,
}

/// Tensor store persisted under a directory
pub type FileStore = ChunkedStore<FileChunks>;

impl FileStore {
    /// Open or create a store rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns a file system error if the root cannot be created
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| fs_error(&root, "create store root", e))?;
        Ok(Self::new(FileChunks { root }))
    }
}

impl FileChunks {
    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, layer: &str) -> PathBuf {
        self.root.join(layer.trim_start_matches('/'))
    }

    fn chunk_path(&self, layer: &LayerHandle, key: &ChunkKey) -> PathBuf {
        let extension = if uses_png(layer) { "png" } else { "bin" };
        self.layer_dir(&layer.path)
            .join(format!("{}.{extension}", key.name()))
    }
}

const fn uses_png(layer: &LayerHandle) -> bool {
    matches!(layer.dtype, DataType::U8) && layer.channels == 1
}

/// Map an I/O failure to a retryable or fatal store error
fn io_failure(operation: &'static str, path: &Path, err: &std::io::Error) -> AlignError {
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            AlignError::Transient {
                operation,
                path: path.display().to_string(),
                reason: err.to_string(),
            }
        }
        _ => storage_error(operation, &path.display().to_string(), err),
    }
}

fn write_atomically(path: &Path, bytes: &[u8], operation: &'static str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_failure(operation, parent, &e))?;
    }
    let staging = path.with_extension("partial");
    fs::write(&staging, bytes).map_err(|e| io_failure(operation, &staging, &e))?;
    fs::rename(&staging, path).map_err(|e| io_failure(operation, path, &e))
}

fn read_optional(path: &Path, operation: &'static str) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_failure(operation, path, &e)),
    }
}

fn encode_raw(dtype: DataType, data: &Array3<f32>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() * dtype.size());
    for value in data {
        match dtype {
            DataType::U8 => bytes.push(*value as u8),
            DataType::I16 => bytes.extend_from_slice(&(*value as i16).to_le_bytes()),
            DataType::F32 => bytes.extend_from_slice(&value.to_le_bytes()),
        }
    }
    bytes
}

fn decode_raw(dtype: DataType, bytes: &[u8]) -> Vec<f32> {
    match dtype {
        DataType::U8 => bytes.iter().map(|b| f32::from(*b)).collect(),
        DataType::I16 => bytes
            .chunks_exact(2)
            .map(|pair| <[u8; 2]>::try_from(pair).map_or(0.0, |b| f32::from(i16::from_le_bytes(b))))
            .collect(),
        DataType::F32 => bytes
            .chunks_exact(4)
            .map(|quad| <[u8; 4]>::try_from(quad).map_or(0.0, f32::from_le_bytes))
            .collect(),
    }
}

impl ChunkBackend for FileChunks {
    fn load_chunk(&self, layer: &LayerHandle, key: &ChunkKey) -> Result<Option<Array3<f32>>> {
        let path = self.chunk_path(layer, key);
        let Some(bytes) = read_optional(&path, "load_chunk")? else {
            return Ok(None);
        };
        let [cx, cy] = layer.chunk.map(|v| v as usize);
        let values = if uses_png(layer) {
            let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
                .map_err(|e| storage_error("load_chunk", &path.display().to_string(), &e))?;
            decoded
                .to_luma8()
                .into_raw()
                .into_iter()
                .map(f32::from)
                .collect()
        } else {
            decode_raw(layer.dtype, &bytes)
        };
        Array3::from_shape_vec((cy, cx, layer.channels), values)
            .map(Some)
            .map_err(|e| storage_error("load_chunk", &path.display().to_string(), &e))
    }

    fn store_chunk(&self, layer: &LayerHandle, key: &ChunkKey, data: &Array3<f32>) -> Result<()> {
        let path = self.chunk_path(layer, key);
        let bytes = if uses_png(layer) {
            let [cx, cy] = layer.chunk;
            let raw: Vec<u8> = data.iter().map(|v| *v as u8).collect();
            let image = GrayImage::from_raw(cx, cy, raw).ok_or_else(|| {
                storage_error("store_chunk", &path.display().to_string(), &"chunk size mismatch")
            })?;
            let mut encoded = std::io::Cursor::new(Vec::new());
            image
                .write_to(&mut encoded, ImageFormat::Png)
                .map_err(|e| storage_error("store_chunk", &path.display().to_string(), &e))?;
            encoded.into_inner()
        } else {
            encode_raw(layer.dtype, &data.as_standard_layout().to_owned())
        };
        write_atomically(&path, &bytes, "store_chunk")
    }

    fn save_layer(&self, layer: &LayerHandle) -> Result<()> {
        let path = self.layer_dir(&layer.path).join("info.json");
        let json = serde_json::to_vec_pretty(layer).map_err(|source| AlignError::Serialization {
            context: "layer info",
            source,
        })?;
        write_atomically(&path, &json, "save_layer")
    }

    fn load_layer(&self, path: &str) -> Result<Option<LayerHandle>> {
        let info = self.layer_dir(path).join("info.json");
        read_optional(&info, "load_layer")?
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|source| AlignError::Serialization {
                    context: "layer info",
                    source,
                })
            })
            .transpose()
    }
}

/// Markers stored as empty files
#[derive(Debug, Clone)]
pub struct FileMarkers {
    root: PathBuf,
}

impl FileMarkers {
    /// Markers under `<root>/markers`
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().join("markers"),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl MarkerStore for FileMarkers {
    fn put_marker(&self, key: &str) -> Result<()> {
        write_atomically(&self.path(key), &[], "put_marker")
    }

    fn has_marker(&self, key: &str) -> Result<bool> {
        let path = self.path(key);
        path.try_exists()
            .map_err(|e| io_failure("has_marker", &path, &e))
    }

    fn count_markers(&self, prefix: &str) -> Result<usize> {
        let directory = self.path(prefix.trim_end_matches('/'));
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_failure("count_markers", &directory, &e)),
        };
        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| io_failure("count_markers", &directory, &e))?;
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(".partial") {
                count += 1;
            }
        }
        Ok(count)
    }
}
