//! Block-wise alignment of serial-section image stacks
//!
//! Sections are aligned pairwise by a field predictor, the candidate fields
//! of each section are combined by softmin vector voting, and blocks of
//! sections aligned independently are stitched into one frame by composing
//! their voted corrections. All work is cut into storage-aligned chunk tasks
//! that run locally or through a task queue.

#![forbid(unsafe_code)]

/// Displacement fields: conventions, composition, inversion and encoding
pub mod field;
/// Input/output, configuration, error handling and the command line
pub mod io;
/// Interpolation, filtering and correlation on 2D planes
pub mod math;
/// Field predictors and the model registry
pub mod model;
/// Block planning, chunk tasks, scheduling and execution
pub mod pipeline;
/// Bounding boxes, chunk partitioning and skip lists
pub mod spatial;
/// Tensor stores, completion markers and pairwise field volumes
pub mod store;
/// Vector voting consensus and pairwise triangle voting
pub mod voting;

pub use io::error::{AlignError, Result};
