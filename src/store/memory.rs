//! In-process stores used by tests, dry runs and single-machine runs
//!
//! Everything lives in mutex-guarded maps. A poisoned lock means a writer
//! panicked mid-update, which is reported as a fatal storage error.

use crate::io::error::{Result, storage_error};
use crate::store::markers::MarkerStore;
use crate::store::tensor_store::{ChunkBackend, ChunkKey, ChunkedStore, LayerHandle};
use ndarray::Array3;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Chunk backend keeping every chunk in memory
#[derive(Debug, Default)]
pub struct MemoryChunks {
    chunks: Mutex<HashMap<(String, ChunkKey), Array3<f32>>>,
    layers: Mutex<HashMap<String, LayerHandle>>,
}

/// Tensor store holding all data in memory
pub type MemoryStore = ChunkedStore<MemoryChunks>;

impl MemoryStore {
    /// Empty in-memory store
    pub fn in_memory() -> Self {
        Self::new(MemoryChunks::default())
    }
}

impl MemoryChunks {
    /// Number of chunks written so far across all layers
    ///
    /// # Errors
    ///
    /// Returns a storage error if the chunk map lock is poisoned
    pub fn chunk_count(&self) -> Result<usize> {
        Ok(lock(&self.chunks, "chunk_count")?.len())
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, operation: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|e| storage_error(operation, "<memory>", &e))
}

impl ChunkBackend for MemoryChunks {
    fn load_chunk(&self, layer: &LayerHandle, key: &ChunkKey) -> Result<Option<Array3<f32>>> {
        let chunks = lock(&self.chunks, "load_chunk")?;
        Ok(chunks.get(&(layer.path.clone(), *key)).cloned())
    }

    fn store_chunk(&self, layer: &LayerHandle, key: &ChunkKey, data: &Array3<f32>) -> Result<()> {
        let mut chunks = lock(&self.chunks, "store_chunk")?;
        chunks.insert((layer.path.clone(), *key), data.clone());
        Ok(())
    }

    fn save_layer(&self, layer: &LayerHandle) -> Result<()> {
        let mut layers = lock(&self.layers, "save_layer")?;
        layers.insert(layer.path.clone(), layer.clone());
        Ok(())
    }

    fn load_layer(&self, path: &str) -> Result<Option<LayerHandle>> {
        Ok(lock(&self.layers, "load_layer")?.get(path).cloned())
    }
}

/// Marker set kept in memory
#[derive(Debug, Default)]
pub struct MemoryMarkers {
    keys: Mutex<BTreeSet<String>>,
}

impl MarkerStore for MemoryMarkers {
    fn put_marker(&self, key: &str) -> Result<()> {
        lock(&self.keys, "put_marker")?.insert(key.to_string());
        Ok(())
    }

    fn has_marker(&self, key: &str) -> Result<bool> {
        Ok(lock(&self.keys, "has_marker")?.contains(key))
    }

    fn count_markers(&self, prefix: &str) -> Result<usize> {
        let directory = format!("{}/", prefix.trim_end_matches('/'));
        let keys = lock(&self.keys, "count_markers")?;
        Ok(keys
            .range(directory.clone()..)
            .take_while(|key| key.starts_with(&directory))
            .count())
    }
}
