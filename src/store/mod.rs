//! Storage of images, fields and completion markers
//!
//! This module contains storage-related functionality including:
//! - Chunked tensor layers behind the `TensorStore` trait
//! - In-memory and directory-backed implementations
//! - Retry of transient backend failures
//! - Typed image and field volumes, and the pairwise field store

/// Directory-backed tensor and marker stores
pub mod filesystem;
/// Completion marker trait
pub mod markers;
/// In-memory tensor and marker stores
pub mod memory;
/// Per-offset pairwise field volumes
pub mod pairwise;
/// Bounded retry with exponential backoff
pub mod retry;
/// Layer handles, chunk addressing and the tensor store trait
pub mod tensor_store;
/// Typed image and field access
pub mod volumes;

pub use markers::MarkerStore;
pub use tensor_store::{DataType, LayerHandle, TensorStore};
