//! Spatial data structures for regions, chunks and sections
//!
//! This module contains spatial-related functionality including:
//! - Mip-aware bounding boxes
//! - Storage-aligned chunk partitioning
//! - Skip lists of unusable sections

/// Bounding boxes defined at mip 0 and queried at any level
pub mod bbox;
/// Deterministic chunk partitioning aligned to the storage grid
pub mod chunks;
/// Sections excluded from being alignment sources or targets
pub mod skip;

pub use bbox::BoundingBox;
pub use chunks::ChunkGrid;
pub use skip::SkipList;
